//! Voice-activity detection and speaking-status propagation settings.

use serde::{Deserialize, Serialize};

/// Speaking detector and reporter settings.
///
/// `release_samples` must exceed `attack_samples` so short pauses do not
/// flicker the indicator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakingConfig {
    /// Audio level sampling period in milliseconds.
    pub sample_interval_ms: u64,
    /// Level (0.0-1.0) above which a sample counts as voice.
    pub threshold: f64,
    /// Consecutive loud samples before speaking starts.
    pub attack_samples: u32,
    /// Consecutive quiet samples before speaking stops.
    pub release_samples: u32,
    /// Speaking-status re-broadcast period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Minimum gap between persisted speaking writes in milliseconds.
    pub persist_interval_ms: u64,
    /// A remote "speaking" status older than this is dropped.
    pub stale_after_ms: u64,
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            threshold: 0.02,
            attack_samples: 2,
            release_samples: 8,
            heartbeat_interval_ms: 2000,
            persist_interval_ms: 1000,
            stale_after_ms: 6000,
        }
    }
}
