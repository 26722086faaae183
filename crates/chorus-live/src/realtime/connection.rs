//! Background WebSocket task: connect, rejoin channels, heartbeat, forward
//! commands and reconnect with exponential backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::handler::translate;
use super::types::{ChannelConfig, PhoenixMessage, RealtimeCommand, RealtimeConfig, RealtimeEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

static REF_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_ref() -> String {
    REF_COUNTER.fetch_add(1, Ordering::Relaxed).to_string()
}

type Channels = Arc<RwLock<HashMap<String, ChannelConfig>>>;

/// Serialize and send one frame on `topic`. Returns false when the socket
/// is gone.
async fn send_frame<S>(
    writer: &Mutex<S>,
    topic: &str,
    event: &str,
    payload: serde_json::Value,
) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    let msg = PhoenixMessage {
        topic: if topic == "phoenix" {
            topic.to_string()
        } else {
            format!("realtime:{topic}")
        },
        event: event.to_string(),
        payload,
        msg_ref: Some(next_ref()),
    };
    let Ok(json) = serde_json::to_string(&msg) else {
        return true;
    };
    writer
        .lock()
        .await
        .send(WsMessage::Text(json.into()))
        .await
        .is_ok()
}

pub(crate) async fn connection_loop(
    config: RealtimeConfig,
    connected: Arc<RwLock<bool>>,
    event_tx: mpsc::Sender<RealtimeEvent>,
    command_rx: mpsc::Receiver<RealtimeCommand>,
) {
    let command_rx = Arc::new(Mutex::new(command_rx));
    let channels: Channels = Arc::new(RwLock::new(HashMap::new()));
    let mut delay = config.reconnect_delay_secs.max(1);

    loop {
        let url = config.ws_url();
        info!(project = %config.project_ref, "Connecting to Supabase Realtime");

        match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&url)).await {
            Ok(Ok((ws_stream, _))) => {
                delay = config.reconnect_delay_secs.max(1);
                *connected.write().await = true;
                let _ = event_tx.send(RealtimeEvent::Connected).await;

                let (ws_write, mut ws_read) = ws_stream.split();
                let ws_write = Arc::new(Mutex::new(ws_write));

                for (topic, channel) in channels.read().await.iter() {
                    send_frame(&ws_write, topic, "phx_join", channel.to_join_payload()).await;
                }

                let heartbeat = tokio::spawn(heartbeat_task(
                    Arc::clone(&ws_write),
                    config.heartbeat_interval_secs,
                ));
                let forwarder = tokio::spawn(command_forwarder(
                    Arc::clone(&command_rx),
                    Arc::clone(&ws_write),
                    Arc::clone(&channels),
                    event_tx.clone(),
                ));

                let mut stop = false;
                while let Some(frame) = ws_read.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            match serde_json::from_str::<PhoenixMessage>(&text) {
                                Ok(msg) => {
                                    if let Some(event) = translate(&msg) {
                                        if event_tx.send(event).await.is_err() {
                                            stop = true;
                                            break;
                                        }
                                    }
                                }
                                Err(_) => debug!(text = %text, "Unrecognized frame from Supabase"),
                            }
                        }
                        Ok(WsMessage::Close(_)) => {
                            info!("Supabase Realtime closed the connection");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "WebSocket error");
                            break;
                        }
                        _ => {}
                    }
                }

                heartbeat.abort();
                let finished = forwarder.is_finished();
                forwarder.abort();
                *connected.write().await = false;
                let _ = event_tx.send(RealtimeEvent::Disconnected).await;
                // The forwarder only returns on Disconnect or a dropped client.
                if stop || finished {
                    return;
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to connect to Supabase Realtime");
                let _ = event_tx
                    .send(RealtimeEvent::Error(format!("connection failed: {e}")))
                    .await;
            }
            Err(_) => {
                error!("WebSocket connection timed out");
                let _ = event_tx
                    .send(RealtimeEvent::Error("connection timed out".into()))
                    .await;
            }
        }

        if event_tx.is_closed() {
            return;
        }
        info!(delay, "Reconnecting in {delay} seconds");
        tokio::time::sleep(Duration::from_secs(delay)).await;
        delay = (delay * 2).min(config.max_reconnect_delay_secs.max(1));
    }
}

async fn heartbeat_task<S>(writer: Arc<Mutex<S>>, interval_secs: u64)
where
    S: Sink<WsMessage> + Unpin,
{
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        interval.tick().await;
        if !send_frame(&writer, "phoenix", "heartbeat", serde_json::json!({})).await {
            break;
        }
    }
}

async fn command_forwarder<S>(
    command_rx: Arc<Mutex<mpsc::Receiver<RealtimeCommand>>>,
    writer: Arc<Mutex<S>>,
    channels: Channels,
    event_tx: mpsc::Sender<RealtimeEvent>,
) where
    S: Sink<WsMessage> + Unpin,
{
    let mut rx = command_rx.lock().await;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            RealtimeCommand::JoinChannel { topic, config } => {
                send_frame(&writer, &topic, "phx_join", config.to_join_payload()).await;
                channels.write().await.insert(topic, config);
            }
            RealtimeCommand::LeaveChannel { topic } => {
                send_frame(&writer, &topic, "phx_leave", serde_json::json!({})).await;
                channels.write().await.remove(&topic);
            }
            RealtimeCommand::Broadcast {
                topic,
                event,
                payload,
            } => {
                let body = serde_json::json!({
                    "type": "broadcast",
                    "event": event,
                    "payload": payload
                });
                if !send_frame(&writer, &topic, "broadcast", body).await {
                    let _ = event_tx
                        .send(RealtimeEvent::Error(format!("broadcast on {topic} failed")))
                        .await;
                }
            }
            RealtimeCommand::Disconnect => break,
        }
    }

    for topic in channels.read().await.keys() {
        send_frame(&writer, topic, "phx_leave", serde_json::json!({})).await;
    }
    let _ = writer.lock().await.send(WsMessage::Close(None)).await;
}
