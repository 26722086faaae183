//! Room-scoped, best-effort message bus between the members of a room.
//!
//! Delivery is at most once with no ordering guarantee across senders.
//! The channel keeps no negotiation state; everything it carries is
//! interpreted by the room actor.

mod local;
mod realtime;

pub use local::{LocalSignaling, LocalSignalingHub};
pub use realtime::RealtimeSignaling;

use async_trait::async_trait;
use chorus_common::RoomError;
use tokio::sync::mpsc;

use crate::protocol::SignalingMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Message(SignalingMessage),
    /// The subscription is gone. No further events follow on this
    /// receiver; subscribe again to resume.
    Unavailable(String),
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Subscribe to one room, replacing any previous subscription.
    async fn subscribe(&self, room_id: &str) -> Result<mpsc::Receiver<SignalingEvent>, RoomError>;

    /// Publish to the subscribed room. Fails with
    /// [`RoomError::SignalingDeliveryUnavailable`] when not subscribed or
    /// the transport is down.
    async fn send(&self, message: SignalingMessage) -> Result<(), RoomError>;

    async fn unsubscribe(&self);
}
