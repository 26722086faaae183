//! Connection settings, Phoenix frames and the event/command enums of the
//! realtime client.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Where and how to reach a Supabase project.
#[derive(Clone)]
pub struct RealtimeConfig {
    /// Supabase project reference (the subdomain of `supabase.co`).
    pub project_ref: String,
    /// Publishable anon key.
    pub api_key: String,
    /// Signed-in user's JWT. Row-level security on the directory tables
    /// is evaluated against it.
    pub access_token: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_delay_secs: u64,
}

impl std::fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("project_ref", &self.project_ref)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .finish_non_exhaustive()
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            project_ref: String::new(),
            api_key: String::new(),
            access_token: None,
            heartbeat_interval_secs: 25,
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 30,
        }
    }
}

impl RealtimeConfig {
    pub(crate) fn ws_url(&self) -> String {
        format!(
            "wss://{}.supabase.co/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.project_ref, self.api_key
        )
    }

    /// PostgREST base URL of the project.
    pub fn rest_url(&self) -> String {
        format!("https://{}.supabase.co/rest/v1", self.project_ref)
    }

    /// Bearer token for REST calls: the user's JWT, else the anon key.
    pub fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }
}

// ---------------------------------------------------------------------------
// Phoenix frames
// ---------------------------------------------------------------------------

/// A Phoenix Channels v1 frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    pub payload: serde_json::Value,
    #[serde(rename = "ref")]
    pub msg_ref: Option<String>,
}

// ---------------------------------------------------------------------------
// Channel configuration
// ---------------------------------------------------------------------------

/// What a channel subscribes to when joined.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    pub broadcast: BroadcastConfig,
    pub postgres_changes: Vec<PostgresChangeFilter>,
    /// JWT sent with `phx_join` so the server can authorize row changes.
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastConfig {
    /// Receive our own broadcasts back (Supabase `self` key).
    pub self_send: bool,
    pub ack: bool,
}

/// One table-change subscription, e.g. every change to
/// `public.live_room_participants` where `room_id=eq.<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresChangeFilter {
    pub schema: String,
    pub table: String,
    pub filter: Option<String>,
}

impl ChannelConfig {
    pub(crate) fn to_join_payload(&self) -> serde_json::Value {
        let changes: Vec<serde_json::Value> = self
            .postgres_changes
            .iter()
            .map(|c| {
                let mut entry = serde_json::json!({
                    "event": "*",
                    "schema": c.schema,
                    "table": c.table,
                });
                if let Some(filter) = &c.filter {
                    entry["filter"] = serde_json::Value::String(filter.clone());
                }
                entry
            })
            .collect();

        let mut payload = serde_json::json!({
            "config": {
                "broadcast": {
                    "self": self.broadcast.self_send,
                    "ack": self.broadcast.ack
                },
                "presence": { "key": "" },
                "postgres_changes": changes
            }
        });
        if let Some(token) = &self.access_token {
            payload["access_token"] = serde_json::Value::String(token.clone());
        }
        payload
    }
}

// ---------------------------------------------------------------------------
// Events & commands
// ---------------------------------------------------------------------------

/// Kind of row change reported by `postgres_changes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(ChangeType::Insert),
            "UPDATE" => Some(ChangeType::Update),
            "DELETE" => Some(ChangeType::Delete),
            _ => None,
        }
    }
}

/// Events emitted by the realtime client.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    Connected,
    Disconnected,
    ChannelJoined {
        topic: String,
    },
    ChannelError {
        topic: String,
        message: String,
    },
    Broadcast {
        topic: String,
        event: String,
        payload: serde_json::Value,
    },
    PostgresChange {
        topic: String,
        table: String,
        change: ChangeType,
        record: serde_json::Value,
    },
    Error(String),
}

#[derive(Debug)]
pub(crate) enum RealtimeCommand {
    JoinChannel {
        topic: String,
        config: ChannelConfig,
    },
    LeaveChannel {
        topic: String,
    },
    Broadcast {
        topic: String,
        event: String,
        payload: serde_json::Value,
    },
    Disconnect,
}
