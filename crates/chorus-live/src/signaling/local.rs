//! In-process signaling for the demo and tests.
//!
//! A [`LocalSignalingHub`] holds one broadcast bus per room; each client
//! gets its own [`LocalSignaling`] endpoint. The hub can be taken offline
//! (every live subscription then ends with `Unavailable`) and can silently
//! drop messages matching a predicate to simulate loss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chorus_common::RoomError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{SignalingChannel, SignalingEvent};
use crate::protocol::SignalingMessage;

type DropFilter = Arc<dyn Fn(&SignalingMessage) -> bool + Send + Sync>;

struct HubInner {
    rooms: Mutex<HashMap<String, broadcast::Sender<SignalingMessage>>>,
    drop_filter: Mutex<Option<DropFilter>>,
    available: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct LocalSignalingHub {
    inner: Arc<HubInner>,
}

impl Default for LocalSignalingHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalSignalingHub {
    pub fn new() -> Self {
        let (available, _) = watch::channel(true);
        Self {
            inner: Arc::new(HubInner {
                rooms: Mutex::new(HashMap::new()),
                drop_filter: Mutex::new(None),
                available,
            }),
        }
    }

    /// A fresh client endpoint.
    pub fn endpoint(&self) -> LocalSignaling {
        LocalSignaling {
            hub: self.clone(),
            session: Mutex::new(None),
        }
    }

    /// Take the hub offline or bring it back.
    pub fn set_available(&self, available: bool) {
        self.inner.available.send_replace(available);
    }

    pub fn is_available(&self) -> bool {
        *self.inner.available.borrow()
    }

    /// Silently drop every message for which `filter` returns true.
    pub fn drop_matching(&self, filter: impl Fn(&SignalingMessage) -> bool + Send + Sync + 'static) {
        if let Ok(mut slot) = self.inner.drop_filter.lock() {
            *slot = Some(Arc::new(filter));
        }
    }

    pub fn clear_drops(&self) {
        if let Ok(mut slot) = self.inner.drop_filter.lock() {
            *slot = None;
        }
    }

    fn bus(&self, room_id: &str) -> Result<broadcast::Sender<SignalingMessage>, RoomError> {
        let mut rooms = self
            .inner
            .rooms
            .lock()
            .map_err(|_| RoomError::SignalingDeliveryUnavailable("hub poisoned".into()))?;
        Ok(rooms
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone())
    }

    fn should_drop(&self, message: &SignalingMessage) -> bool {
        self.inner
            .drop_filter
            .lock()
            .ok()
            .and_then(|f| f.clone())
            .is_some_and(|f| f(message))
    }
}

struct Session {
    room_id: String,
    cancel: CancellationToken,
}

/// One client's connection to a [`LocalSignalingHub`].
pub struct LocalSignaling {
    hub: LocalSignalingHub,
    session: Mutex<Option<Session>>,
}

impl LocalSignaling {
    fn current_room(&self) -> Option<String> {
        self.session
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.room_id.clone()))
    }
}

async fn forward(
    mut bus: broadcast::Receiver<SignalingMessage>,
    mut available: watch::Receiver<bool>,
    cancel: CancellationToken,
    tx: mpsc::Sender<SignalingEvent>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = available.changed() => {
                if changed.is_err() || !*available.borrow_and_update() {
                    let _ = tx.send(SignalingEvent::Unavailable("signaling hub offline".into())).await;
                    return;
                }
            }
            received = bus.recv() => match received {
                Ok(message) => {
                    if tx.send(SignalingEvent::Message(message)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Local signaling subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for LocalSignaling {
    async fn subscribe(&self, room_id: &str) -> Result<mpsc::Receiver<SignalingEvent>, RoomError> {
        if !self.hub.is_available() {
            return Err(RoomError::SignalingDeliveryUnavailable(
                "signaling hub offline".into(),
            ));
        }
        let bus = self.hub.bus(room_id)?.subscribe();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(forward(
            bus,
            self.hub.inner.available.subscribe(),
            cancel.clone(),
            tx,
        ));

        let mut session = self
            .session
            .lock()
            .map_err(|_| RoomError::SignalingDeliveryUnavailable("endpoint poisoned".into()))?;
        if let Some(old) = session.replace(Session {
            room_id: room_id.to_string(),
            cancel,
        }) {
            old.cancel.cancel();
        }
        Ok(rx)
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), RoomError> {
        let room_id = self
            .current_room()
            .ok_or_else(|| RoomError::SignalingDeliveryUnavailable("not subscribed".into()))?;
        if !self.hub.is_available() {
            return Err(RoomError::SignalingDeliveryUnavailable(
                "signaling hub offline".into(),
            ));
        }
        if self.hub.should_drop(&message) {
            debug!(kind = message.payload.kind(), from = %message.from, "Dropping signal");
            return Ok(());
        }
        // No receivers is not an error: best effort, nobody listening.
        let _ = self.hub.bus(&room_id)?.send(message);
        Ok(())
    }

    async fn unsubscribe(&self) {
        if let Ok(mut session) = self.session.lock() {
            if let Some(old) = session.take() {
                old.cancel.cancel();
            }
        }
    }
}
