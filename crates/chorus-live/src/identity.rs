/// Who the local client is: the signed-in profile joining rooms.
#[derive(Clone)]
pub struct Identity {
    pub profile_id: String,
    pub display_name: String,
    /// Supabase Auth JWT, when signed in against a hosted project.
    pub access_token: Option<String>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("profile_id", &self.profile_id)
            .field("display_name", &self.display_name)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl Identity {
    /// A local identity without credentials.
    pub fn local(profile_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            display_name: display_name.into(),
            access_token: None,
        }
    }

    /// An identity from a Supabase Auth session.
    pub fn from_supabase_auth(profile_id: String, display_name: String, access_token: String) -> Self {
        Self {
            profile_id,
            display_name,
            access_token: Some(access_token),
        }
    }
}
