//! Supabase project and realtime connection settings.

use serde::{Deserialize, Serialize};

/// Supabase project settings shared by the directory and signaling backends.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupabaseConfig {
    /// Project reference, the subdomain of `*.supabase.co`.
    pub project_ref: String,
    /// Publishable anon key.
    pub api_key: String,
    /// Optional user JWT for row-level security.
    pub access_token: Option<String>,
    /// Realtime heartbeat interval in seconds.
    pub heartbeat_interval: u64,
    /// Base reconnect delay in seconds.
    pub reconnect_delay: u64,
    /// Maximum reconnect delay in seconds.
    pub max_reconnect_delay: u64,
}

impl std::fmt::Debug for SupabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseConfig")
            .field("project_ref", &self.project_ref)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("max_reconnect_delay", &self.max_reconnect_delay)
            .finish()
    }
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            project_ref: String::new(),
            api_key: String::new(),
            access_token: None,
            heartbeat_interval: 25,
            reconnect_delay: 1,
            max_reconnect_delay: 30,
        }
    }
}

impl SupabaseConfig {
    /// True once a project and key are set.
    pub fn is_configured(&self) -> bool {
        !self.project_ref.is_empty() && !self.api_key.is_empty()
    }
}
