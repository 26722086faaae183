//! Signaling over Supabase Realtime broadcast.
//!
//! Each room maps to the channel `live-room:{room_id}`; every message is a
//! broadcast with event `signal` whose payload is the JSON envelope from
//! [`crate::protocol`].

use std::time::Duration;

use async_trait::async_trait;
use chorus_common::RoomError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SignalingChannel, SignalingEvent};
use crate::protocol::{events, SignalingMessage};
use crate::realtime::{ChannelConfig, RealtimeClient, RealtimeConfig, RealtimeEvent};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn topic_for(room_id: &str) -> String {
    format!("live-room:{room_id}")
}

struct Session {
    client: RealtimeClient,
    topic: String,
    forwarder: JoinHandle<()>,
}

pub struct RealtimeSignaling {
    config: RealtimeConfig,
    session: Mutex<Option<Session>>,
    /// Cancels the channel join in flight, if any.
    joining: Mutex<Option<CancellationToken>>,
}

impl RealtimeSignaling {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            joining: Mutex::new(None),
        }
    }

    async fn close_session(session: Session) {
        session.forwarder.abort();
        session.client.leave_channel(&session.topic).await;
        session.client.disconnect().await;
    }
}

/// Wait until the channel join is acknowledged.
async fn await_join(
    incoming: &mut mpsc::Receiver<RealtimeEvent>,
    topic: &str,
) -> Result<(), RoomError> {
    let wait = async {
        while let Some(event) = incoming.recv().await {
            match event {
                RealtimeEvent::ChannelJoined { topic: t } if t == topic => return Ok(()),
                RealtimeEvent::ChannelError { topic: t, message } if t == topic => {
                    return Err(message)
                }
                _ => {}
            }
        }
        Err("realtime connection closed".to_string())
    };
    match tokio::time::timeout(JOIN_TIMEOUT, wait).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(message)) => Err(RoomError::SignalingDeliveryUnavailable(message)),
        Err(_) => Err(RoomError::SignalingDeliveryUnavailable(
            "channel join timed out".into(),
        )),
    }
}

async fn forward(
    topic: String,
    mut incoming: mpsc::Receiver<RealtimeEvent>,
    tx: mpsc::Sender<SignalingEvent>,
) {
    while let Some(event) = incoming.recv().await {
        let out = match event {
            RealtimeEvent::Broadcast {
                topic: t,
                event,
                payload,
            } if t == topic && event == events::SIGNAL => {
                match SignalingMessage::from_value(payload) {
                    Ok(message) => SignalingEvent::Message(message),
                    Err(e) => {
                        debug!(error = %e, "Dropping undecodable signal");
                        continue;
                    }
                }
            }
            RealtimeEvent::Disconnected => SignalingEvent::Unavailable("realtime disconnected".into()),
            RealtimeEvent::ChannelError { topic: t, message } if t == topic => {
                SignalingEvent::Unavailable(message)
            }
            _ => continue,
        };
        let terminal = matches!(out, SignalingEvent::Unavailable(_));
        if tx.send(out).await.is_err() || terminal {
            return;
        }
    }
    let _ = tx
        .send(SignalingEvent::Unavailable("realtime connection closed".into()))
        .await;
}

#[async_trait]
impl SignalingChannel for RealtimeSignaling {
    async fn subscribe(&self, room_id: &str) -> Result<mpsc::Receiver<SignalingEvent>, RoomError> {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.joining.lock().await.replace(cancel.clone()) {
            previous.cancel();
        }
        let old = self.session.lock().await.take();
        if let Some(old) = old {
            Self::close_session(old).await;
        }

        let topic = topic_for(room_id);
        let (client, mut incoming) = RealtimeClient::connect(self.config.clone());
        let channel = ChannelConfig {
            access_token: self.config.access_token.clone(),
            ..Default::default()
        };
        client.join_channel(&topic, channel).await;

        // The session lock is not held here, so `unsubscribe` can cancel.
        let joined = tokio::select! {
            _ = cancel.cancelled() => Err(RoomError::SignalingDeliveryUnavailable(
                "subscribe cancelled".into(),
            )),
            joined = await_join(&mut incoming, &topic) => joined,
        };
        let mut session = self.session.lock().await;
        let joined = joined.and_then(|()| {
            if cancel.is_cancelled() {
                Err(RoomError::SignalingDeliveryUnavailable("subscribe cancelled".into()))
            } else {
                Ok(())
            }
        });
        if let Err(e) = joined {
            warn!(room_id, error = %e, "Signaling subscribe failed");
            client.disconnect().await;
            return Err(e);
        }
        info!(room_id, "Signaling channel joined");

        let (tx, rx) = mpsc::channel(256);
        let forwarder = tokio::spawn(forward(topic.clone(), incoming, tx));
        *session = Some(Session {
            client,
            topic,
            forwarder,
        });
        Ok(rx)
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), RoomError> {
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Err(RoomError::SignalingDeliveryUnavailable("not subscribed".into()));
        };
        if !session.client.is_connected().await {
            return Err(RoomError::SignalingDeliveryUnavailable(
                "realtime disconnected".into(),
            ));
        }
        if session
            .client
            .broadcast(&session.topic, events::SIGNAL, message.to_value())
            .await
        {
            Ok(())
        } else {
            Err(RoomError::SignalingDeliveryUnavailable(
                "realtime connection closed".into(),
            ))
        }
    }

    async fn unsubscribe(&self) {
        if let Some(joining) = self.joining.lock().await.take() {
            joining.cancel();
        }
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            Self::close_session(session).await;
        }
    }
}
