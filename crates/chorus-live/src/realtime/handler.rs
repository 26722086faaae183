//! Translation of incoming Phoenix frames into [`RealtimeEvent`]s.

use tracing::{debug, info, warn};

use super::types::{ChangeType, PhoenixMessage, RealtimeEvent};

fn strip_topic_prefix(topic: &str) -> &str {
    topic.strip_prefix("realtime:").unwrap_or(topic)
}

/// Map one frame to the event it represents, if any. Heartbeat replies and
/// unknown events yield `None`.
pub(crate) fn translate(msg: &PhoenixMessage) -> Option<RealtimeEvent> {
    if msg.topic == "phoenix" {
        return None;
    }
    let topic = strip_topic_prefix(&msg.topic).to_string();

    match msg.event.as_str() {
        "phx_reply" => {
            let status = msg.payload.get("status").and_then(|s| s.as_str())?;
            if status == "ok" {
                debug!(topic = %topic, "Channel reply: ok");
                Some(RealtimeEvent::ChannelJoined { topic })
            } else {
                let message = msg
                    .payload
                    .pointer("/response/reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                warn!(topic = %topic, status, "Channel reply error");
                Some(RealtimeEvent::ChannelError { topic, message })
            }
        }
        "phx_error" | "phx_close" => {
            info!(topic = %topic, event = %msg.event, "Channel closed by server");
            Some(RealtimeEvent::ChannelError {
                topic,
                message: msg.event.clone(),
            })
        }
        "broadcast" => {
            let event = msg.payload.get("event")?.as_str()?.to_string();
            let payload = msg
                .payload
                .get("payload")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            Some(RealtimeEvent::Broadcast {
                topic,
                event,
                payload,
            })
        }
        "postgres_changes" => {
            let data = msg.payload.get("data")?;
            let table = data.get("table")?.as_str()?.to_string();
            let change = data
                .get("type")
                .and_then(|t| t.as_str())
                .and_then(ChangeType::parse)?;
            let record = match change {
                ChangeType::Delete => data.get("old_record"),
                _ => data.get("record"),
            }
            .cloned()
            .unwrap_or(serde_json::Value::Null);
            debug!(topic = %topic, table = %table, ?change, "Row change received");
            Some(RealtimeEvent::PostgresChange {
                topic,
                table,
                change,
                record,
            })
        }
        "system" | "presence_state" | "presence_diff" => None,
        other => {
            debug!(topic = %topic, event = other, "Unhandled Phoenix event");
            None
        }
    }
}
