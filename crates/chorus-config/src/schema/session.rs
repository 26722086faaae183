//! Peer negotiation and signaling resubscription settings.

use serde::{Deserialize, Serialize};

/// Peer connection negotiation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Time a link may spend negotiating before it is retried.
    pub timeout_ms: u64,
    /// Retries (with swapped offerer) before a link is reported degraded.
    pub max_retries: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            max_retries: 1,
        }
    }
}

/// Signaling channel recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub resubscribe_base_ms: u64,
    pub resubscribe_max_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            resubscribe_base_ms: 500,
            resubscribe_max_ms: 30_000,
        }
    }
}
