//! A live audio room as seen from one client.
//!
//! [`RoomHandle::open`] spawns an actor that owns the room's confirmed view
//! and the local participant's media; the handle sends it commands and the
//! returned receiver carries [`RoomEvent`]s.

mod actor;
mod handle;
mod state;
mod types;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::directory::ParticipantDirectory;
use crate::media::MediaTransport;
use crate::signaling::SignalingChannel;

pub use handle::RoomHandle;
pub use state::{RoomChange, RoomState};
pub use types::{LinkSummary, LocalPhase, RoomConfig, RoomEvent, RoomView};

/// The backends a room talks to.
#[derive(Clone)]
pub struct RoomServices {
    pub directory: Arc<dyn ParticipantDirectory>,
    pub signaling: Arc<dyn SignalingChannel>,
    pub transport: Arc<dyn MediaTransport>,
}
