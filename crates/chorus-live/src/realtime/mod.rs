//! Thin Supabase Realtime client over the Phoenix Channels v1 protocol.
//!
//! One WebSocket per client, driven by a background task that handles
//! heartbeats, channel join/leave, broadcast and `postgres_changes`
//! subscriptions, and reconnects with exponential backoff.

mod client;
mod connection;
mod handler;
mod types;

pub use client::RealtimeClient;
pub use types::{
    BroadcastConfig, ChangeType, ChannelConfig, PhoenixMessage, PostgresChangeFilter,
    RealtimeConfig, RealtimeEvent,
};
