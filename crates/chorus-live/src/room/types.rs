//! Configuration, events and read-only views of a live room.

use std::time::Duration;

use chorus_common::RoomError;

use crate::directory::{Participant, Role, Room};
use crate::media::RemoteStream;
use crate::mesh::{LinkRole, NegotiationState};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime tuning of one room actor.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// A link not connected within this window is retried or failed.
    pub negotiation_timeout: Duration,
    pub max_retries: u32,
    pub sample_interval: Duration,
    /// Audio level above which a sample counts as speech.
    pub speaking_threshold: f32,
    pub attack_samples: u32,
    pub release_samples: u32,
    pub heartbeat_interval: Duration,
    pub persist_interval: Duration,
    /// Remote speaking state without a heartbeat for this long is reset.
    pub stale_after: Duration,
    pub resubscribe_base: Duration,
    pub resubscribe_max: Duration,
    /// Capacity of the [`RoomEvent`] channel.
    pub event_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(15),
            max_retries: 1,
            sample_interval: Duration::from_millis(100),
            speaking_threshold: 0.02,
            attack_samples: 2,
            release_samples: 8,
            heartbeat_interval: Duration::from_secs(2),
            persist_interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(6),
            resubscribe_base: Duration::from_millis(500),
            resubscribe_max: Duration::from_secs(30),
            event_capacity: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything the UI layer learns about a room, in actor order.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// The confirmed view changed.
    RoomUpdated {
        room: Room,
        participants: Vec<Participant>,
        speak_requests: Vec<String>,
    },
    RemoteStream {
        participant_id: String,
        stream: RemoteStream,
    },
    RemoteStreamRemoved {
        participant_id: String,
    },
    /// Local or remote speaking state flipped.
    SpeakingChanged {
        participant_id: String,
        speaking: bool,
    },
    ConnectionDegraded {
        participant_id: String,
        error: RoomError,
    },
    /// `None` once the local participant is no longer in the room.
    LocalRoleChanged {
        role: Option<Role>,
    },
    SignalingUnavailable {
        reason: String,
    },
    SignalingRestored,
    RoomEnded,
    Error(RoomError),
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Where the local participant stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPhase {
    Absent,
    Joining,
    Joined(Role),
    Leaving,
}

impl LocalPhase {
    pub fn role(self) -> Option<Role> {
        match self {
            LocalPhase::Joined(role) => Some(role),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSummary {
    pub participant_id: String,
    pub profile_id: String,
    pub state: NegotiationState,
    pub attempt: u32,
    pub role: LinkRole,
    pub has_stream: bool,
}

/// Point-in-time copy of the actor's state.
#[derive(Debug, Clone)]
pub struct RoomView {
    pub room: Room,
    pub participants: Vec<Participant>,
    pub speak_requests: Vec<String>,
    pub phase: LocalPhase,
    pub local_participant_id: Option<String>,
    /// Local mute intent; `None` without a microphone.
    pub muted: Option<bool>,
    /// Mute state as last persisted.
    pub muted_confirmed: Option<bool>,
    /// Sorted by remote participant id.
    pub links: Vec<LinkSummary>,
    pub signaling_available: bool,
    /// Remote participants currently heard speaking.
    pub speaking: Vec<String>,
    /// Tag on this session's log lines; `None` outside a session.
    pub session_tag: Option<String>,
}

impl RoomView {
    pub fn link(&self, participant_id: &str) -> Option<&LinkSummary> {
        self.links.iter().find(|l| l.participant_id == participant_id)
    }

    pub fn connected_links(&self) -> usize {
        self.links
            .iter()
            .filter(|l| l.state == NegotiationState::Connected)
            .count()
    }
}
