//! Client-side core of Chorus live audio rooms.
//!
//! A room is a full mesh of peer connections among its transmitting
//! members, coordinated through a persisted participant directory and a
//! best-effort signaling bus. [`RoomHandle::open`] starts the per-room actor;
//! the backends plug in through the [`ParticipantDirectory`],
//! [`SignalingChannel`] and [`MediaTransport`] traits.

pub mod directory;
pub mod identity;
pub mod media;
pub mod mesh;
pub mod mute;
pub mod protocol;
pub mod realtime;
pub mod room;
pub mod signaling;
pub mod speaking;

pub use directory::{
    MemoryDirectory, Participant, ParticipantDirectory, Role, Room, RoomSnapshot, RoomStatus,
    SupabaseDirectory, SupabaseDirectoryConfig,
};
pub use identity::Identity;
pub use media::{
    ConnectionRequest, LocalTrack, LoopbackTransport, MediaConnection, MediaEvent, MediaTransport,
    RemoteStream,
};
pub use mesh::{LinkRole, NegotiationState};
pub use protocol::{IceCandidate, SignalPayload, SignalingMessage};
pub use realtime::{RealtimeClient, RealtimeConfig};
pub use room::{LinkSummary, LocalPhase, RoomConfig, RoomEvent, RoomHandle, RoomServices, RoomView};
pub use signaling::{LocalSignaling, LocalSignalingHub, RealtimeSignaling, SignalingChannel, SignalingEvent};
