use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Failures of the live-room core.
///
/// Every variant degrades a single participant's experience; none of them
/// stops the room actor. `Clone` so one outcome can be handed to several
/// waiting callers (e.g. a join requested twice while in flight).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("directory write failed: {0}")]
    DirectoryWriteFailed(String),

    #[error("directory read failed: {0}")]
    DirectoryReadFailed(String),

    #[error("negotiation with {participant_id} timed out (attempt {attempt})")]
    NegotiationTimeout { participant_id: String, attempt: u32 },

    #[error("negotiation with {participant_id} failed: {reason}")]
    NegotiationFailed {
        participant_id: String,
        reason: String,
    },

    #[error("microphone permission denied: {0}")]
    MediaPermissionDenied(String),

    #[error("signaling unavailable: {0}")]
    SignalingDeliveryUnavailable(String),

    #[error("not joined to the room")]
    NotJoined,

    #[error("already joined to the room")]
    AlreadyJoined,

    #[error("room is not live")]
    RoomNotLive,

    #[error("room has no free speaker slot")]
    RoomFull,

    #[error("only the host can do that")]
    NotHost,

    #[error("invalid role transition: {0}")]
    InvalidTransition(String),

    #[error("participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("no pending speak request from {0}")]
    NoPendingRequest(String),

    #[error("room actor stopped")]
    ActorStopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ChorusError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}
