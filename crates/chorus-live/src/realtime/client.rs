//! Handle for the background realtime connection.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use super::connection::connection_loop;
use super::types::{ChannelConfig, RealtimeCommand, RealtimeConfig, RealtimeEvent};

/// Commands are queued to the connection task; nothing here blocks on the
/// network. Clones drive the same connection.
#[derive(Clone)]
pub struct RealtimeClient {
    command_tx: mpsc::Sender<RealtimeCommand>,
    connected: Arc<RwLock<bool>>,
}

impl RealtimeClient {
    /// Start the background connection. Returns `(client, event_receiver)`.
    pub fn connect(config: RealtimeConfig) -> (Self, mpsc::Receiver<RealtimeEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);
        let connected = Arc::new(RwLock::new(false));

        tokio::spawn(connection_loop(
            config,
            Arc::clone(&connected),
            event_tx,
            command_rx,
        ));

        (
            Self {
                command_tx,
                connected,
            },
            event_rx,
        )
    }

    /// Join `topic`; the channel is rejoined after every reconnect until
    /// left.
    pub async fn join_channel(&self, topic: &str, config: ChannelConfig) -> bool {
        self.command_tx
            .send(RealtimeCommand::JoinChannel {
                topic: topic.to_string(),
                config,
            })
            .await
            .is_ok()
    }

    pub async fn leave_channel(&self, topic: &str) {
        let _ = self
            .command_tx
            .send(RealtimeCommand::LeaveChannel {
                topic: topic.to_string(),
            })
            .await;
    }

    /// Queue a broadcast. Returns false once the connection task is gone.
    pub async fn broadcast(&self, topic: &str, event: &str, payload: serde_json::Value) -> bool {
        self.command_tx
            .send(RealtimeCommand::Broadcast {
                topic: topic.to_string(),
                event: event.to_string(),
                payload,
            })
            .await
            .is_ok()
    }

    pub async fn is_connected(&self) -> bool {
        *self.connected.read().await
    }

    pub async fn disconnect(&self) {
        let _ = self.command_tx.send(RealtimeCommand::Disconnect).await;
    }
}
