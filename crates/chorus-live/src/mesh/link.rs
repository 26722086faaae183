use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::media::{MediaConnection, RemoteStream};
use crate::protocol::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    Answering,
    Connected,
    Failed,
    Closing,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::Answering => "answering",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// The local side's part in one negotiation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Offerer,
    Answerer,
}

/// Which side offers for `attempt`.
///
/// On even attempts the smaller profile id offers; odd attempts (retries)
/// swap the roles. Both ends evaluate this with the arguments swapped and
/// always reach complementary answers, so at most one side ever offers.
pub fn offerer_for(local_profile: &str, remote_profile: &str, attempt: u32) -> LinkRole {
    let local_smaller = local_profile < remote_profile;
    if local_smaller == (attempt % 2 == 0) {
        LinkRole::Offerer
    } else {
        LinkRole::Answerer
    }
}

/// One audio connection between the local participant and a remote
/// transmitter.
pub struct PeerLink {
    pub local_participant_id: String,
    pub remote_participant_id: String,
    pub remote_profile_id: String,
    pub state: NegotiationState,
    /// Negotiation generation; 0 for the first attempt.
    pub attempt: u32,
    pub role: LinkRole,
    pub(crate) started: bool,
    pub(crate) deadline: Option<Instant>,
    pub(crate) connection: Option<Arc<dyn MediaConnection>>,
    pub(crate) remote_stream: Option<RemoteStream>,
    pub(crate) remote_description_set: bool,
    /// An answer is being applied.
    pub(crate) applying_remote: bool,
    pub(crate) pending_offer: Option<String>,
    pub(crate) pending_candidates: Vec<IceCandidate>,
    pub(crate) cancel: CancellationToken,
}

impl PeerLink {
    pub(crate) fn new(
        local_participant_id: &str,
        local_profile_id: &str,
        remote_participant_id: &str,
        remote_profile_id: &str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local_participant_id: local_participant_id.to_string(),
            remote_participant_id: remote_participant_id.to_string(),
            remote_profile_id: remote_profile_id.to_string(),
            state: NegotiationState::Idle,
            attempt: 0,
            role: offerer_for(local_profile_id, remote_profile_id, 0),
            started: false,
            deadline: None,
            connection: None,
            remote_stream: None,
            remote_description_set: false,
            applying_remote: false,
            pending_offer: None,
            pending_candidates: Vec::new(),
            cancel,
        }
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    /// Still negotiating, i.e. subject to the deadline.
    pub(crate) fn is_pending(&self) -> bool {
        matches!(
            self.state,
            NegotiationState::Idle | NegotiationState::Offering | NegotiationState::Answering
        )
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_participant_id", &self.remote_participant_id)
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}
