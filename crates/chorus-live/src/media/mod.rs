//! Contracts with the platform's real-time media stack.
//!
//! The room core never touches audio samples. It asks a [`MediaTransport`]
//! for the microphone and for one [`MediaConnection`] per peer link, moves
//! session descriptions and ICE candidates between them and signaling, and
//! learns about connectivity from [`MediaEvent`]s.

mod loopback;

pub use loopback::{LoopbackTrack, LoopbackTransport, PairFault};

use std::sync::Arc;

use async_trait::async_trait;
use chorus_common::RoomError;
use tokio::sync::mpsc;

use crate::protocol::IceCandidate;

/// Handle to audio received from one remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub participant_id: String,
    pub stream_id: String,
}

/// Captured local audio.
pub trait LocalTrack: Send + Sync {
    /// Takes effect immediately; a disabled track sends silence.
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Current input level in `0.0..=1.0`. Zero while disabled.
    fn audio_level(&self) -> f32;
    /// Release the capture device.
    fn stop(&self);
}

/// Everything a transport needs to build one peer connection.
#[derive(Clone)]
pub struct ConnectionRequest {
    pub local_participant_id: String,
    pub remote_participant_id: String,
    pub attempt: u32,
    pub track: Arc<dyn LocalTrack>,
}

/// Asynchronous transport callbacks, tagged with the link they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    LocalCandidate {
        participant_id: String,
        attempt: u32,
        candidate: IceCandidate,
    },
    Connected {
        participant_id: String,
        attempt: u32,
        stream: RemoteStream,
    },
    Failed {
        participant_id: String,
        attempt: u32,
        reason: String,
    },
}

#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Create an offer and apply it as the local description.
    async fn create_offer(&self) -> Result<String, RoomError>;

    /// Apply a remote offer and return the local answer.
    async fn accept_offer(&self, sdp: &str) -> Result<String, RoomError>;

    async fn accept_answer(&self, sdp: &str) -> Result<(), RoomError>;

    /// Fails when no remote description has been applied yet.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RoomError>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn acquire_microphone(&self) -> Result<Arc<dyn LocalTrack>, RoomError>;

    async fn create_connection(
        &self,
        request: ConnectionRequest,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<Arc<dyn MediaConnection>, RoomError>;
}
