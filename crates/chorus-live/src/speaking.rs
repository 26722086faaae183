//! Voice activity: local hysteresis detection, report pacing, and liveness
//! of remote speaking-status.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Threshold detector with attack/release hysteresis.
///
/// Speech starts after `attack` consecutive samples above the threshold and
/// ends only after `release` consecutive samples at or below it.
#[derive(Debug, Clone)]
pub struct SpeakingDetector {
    threshold: f32,
    attack: u32,
    release: u32,
    speaking: bool,
    run: u32,
}

impl SpeakingDetector {
    pub fn new(threshold: f32, attack: u32, release: u32) -> Self {
        Self {
            threshold,
            attack: attack.max(1),
            release: release.max(1),
            speaking: false,
            run: 0,
        }
    }

    /// Feed one sample. Returns the new state on an edge.
    pub fn sample(&mut self, level: f32) -> Option<bool> {
        let loud = level > self.threshold;
        if loud == self.speaking {
            self.run = 0;
            return None;
        }
        self.run += 1;
        let needed = if self.speaking { self.release } else { self.attack };
        if self.run < needed {
            return None;
        }
        self.run = 0;
        self.speaking = !self.speaking;
        Some(self.speaking)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn reset(&mut self) {
        self.speaking = false;
        self.run = 0;
    }
}

/// What to do with the local speaking state on this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportActions {
    /// Send a speaking-status signal with this value.
    pub broadcast: Option<bool>,
    /// Write `is_speaking` to the directory.
    pub persist: Option<bool>,
}

/// Paces speaking-status broadcasts and directory writes.
///
/// Edges go out at once and the state is repeated every `heartbeat`.
/// Directory writes happen at most once per `persist_interval`; a change
/// held back by the throttle is written on a later tick, so the last value
/// always lands.
#[derive(Debug, Clone)]
pub struct SpeakingReporter {
    heartbeat: Duration,
    persist_interval: Duration,
    current: bool,
    last_broadcast: Option<Instant>,
    last_persist: Option<Instant>,
    /// Last value written (or in flight). `None` forces a rewrite.
    persisted: Option<bool>,
}

impl SpeakingReporter {
    pub fn new(heartbeat: Duration, persist_interval: Duration) -> Self {
        Self {
            heartbeat,
            persist_interval,
            current: false,
            last_broadcast: None,
            last_persist: None,
            persisted: Some(false),
        }
    }

    pub fn update(&mut self, now: Instant, speaking: bool) -> ReportActions {
        let mut actions = ReportActions::default();

        let heartbeat_due = self
            .last_broadcast
            .map_or(true, |at| now.saturating_duration_since(at) >= self.heartbeat);
        if speaking != self.current || heartbeat_due {
            self.current = speaking;
            self.last_broadcast = Some(now);
            actions.broadcast = Some(speaking);
        }

        let persist_due = self
            .last_persist
            .map_or(true, |at| now.saturating_duration_since(at) >= self.persist_interval);
        if self.persisted != Some(self.current) && persist_due {
            self.persisted = Some(self.current);
            self.last_persist = Some(now);
            actions.persist = Some(self.current);
        }

        actions
    }

    /// A directory write for `value` failed; write again when allowed.
    pub fn persist_failed(&mut self, value: bool) {
        if self.persisted == Some(value) {
            self.persisted = None;
        }
    }

    pub fn current(&self) -> bool {
        self.current
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.heartbeat, self.persist_interval);
    }
}

/// Speaking state of remote participants as heard over signaling.
#[derive(Debug, Clone)]
pub struct RemoteSpeakingTracker {
    stale_after: Duration,
    peers: HashMap<String, Instant>,
}

impl RemoteSpeakingTracker {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            peers: HashMap::new(),
        }
    }

    /// Record a speaking-status report. Returns the new value if it changed.
    pub fn observe(&mut self, participant_id: &str, speaking: bool, now: Instant) -> Option<bool> {
        if speaking {
            let was = self.peers.insert(participant_id.to_string(), now).is_some();
            (!was).then_some(true)
        } else {
            self.peers.remove(participant_id).map(|_| false)
        }
    }

    /// Reset peers whose last speaking heartbeat is older than `stale_after`.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let stale_after = self.stale_after;
        let mut expired: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) >= stale_after)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();
        for id in &expired {
            self.peers.remove(id);
        }
        expired
    }

    /// Drop a peer. Returns true when it had been speaking.
    pub fn forget(&mut self, participant_id: &str) -> bool {
        self.peers.remove(participant_id).is_some()
    }

    pub fn is_speaking(&self, participant_id: &str) -> bool {
        self.peers.contains_key(participant_id)
    }

    /// Peers currently speaking, sorted.
    pub fn speaking(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drain every speaking peer.
    pub fn clear(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }
}
