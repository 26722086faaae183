//! In-process media transport for the demo and tests.
//!
//! Descriptions and candidates are synthetic, but the state rules follow a
//! real peer connection: candidates are rejected until a remote description
//! is applied, and a connection reports `Connected` only once both
//! descriptions are set and a remote candidate has arrived. Faults can be
//! injected per participant pair and attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chorus_common::RoomError;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ConnectionRequest, LocalTrack, MediaConnection, MediaEvent, MediaTransport, RemoteStream};
use crate::protocol::IceCandidate;

// ---------------------------------------------------------------------------
// Track
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LoopbackTrack {
    enabled: AtomicBool,
    stopped: AtomicBool,
    level_bits: AtomicU32,
}

impl Default for LoopbackTrack {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            level_bits: AtomicU32::new(0.0f32.to_bits()),
        }
    }
}

impl LoopbackTrack {
    /// Simulated microphone input level.
    pub fn set_level(&self, level: f32) {
        self.level_bits
            .store(level.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

impl LocalTrack for LoopbackTrack {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn audio_level(&self) -> f32 {
        if !self.is_enabled() || self.is_stopped() {
            return 0.0;
        }
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// How a faulty pair misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairFault {
    /// Never connects; the negotiation deadline has to catch it.
    Silent,
    /// Reports a transport failure where it would have connected.
    Fail,
}

#[derive(Default)]
struct TransportState {
    deny_microphone: bool,
    /// Sorted participant pair -> (fault, number of attempts affected).
    faults: HashMap<(String, String), (PairFault, u32)>,
    tracks: Vec<Arc<LoopbackTrack>>,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Cheap to clone; clones share fault settings and counters.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<TransportState>>,
    open: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `acquire_microphone` fail with `MediaPermissionDenied`.
    pub fn deny_microphone(&self, deny: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.deny_microphone = deny;
        }
    }

    /// Attempts `0..attempts` between `a` and `b` misbehave as `fault`.
    pub fn fault_pair(&self, a: &str, b: &str, fault: PairFault, attempts: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.insert(pair_key(a, b), (fault, attempts));
        }
    }

    /// Connections created and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn connections_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// The most recently acquired microphone.
    pub fn last_track(&self) -> Option<Arc<LoopbackTrack>> {
        self.state.lock().ok().and_then(|s| s.tracks.last().cloned())
    }

    fn fault_for(&self, a: &str, b: &str, attempt: u32) -> Option<PairFault> {
        let state = self.state.lock().ok()?;
        state
            .faults
            .get(&pair_key(a, b))
            .filter(|(_, attempts)| attempt < *attempts)
            .map(|(fault, _)| *fault)
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    async fn acquire_microphone(&self) -> Result<Arc<dyn LocalTrack>, RoomError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RoomError::MediaPermissionDenied("transport poisoned".into()))?;
        if state.deny_microphone {
            return Err(RoomError::MediaPermissionDenied(
                "microphone access denied".into(),
            ));
        }
        let track = Arc::new(LoopbackTrack::default());
        state.tracks.push(Arc::clone(&track));
        Ok(track)
    }

    async fn create_connection(
        &self,
        request: ConnectionRequest,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<Arc<dyn MediaConnection>, RoomError> {
        let fault = self.fault_for(
            &request.local_participant_id,
            &request.remote_participant_id,
            request.attempt,
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackConnection {
            local: request.local_participant_id,
            remote: request.remote_participant_id,
            attempt: request.attempt,
            fault,
            events,
            state: Mutex::new(ConnectionState::default()),
            open: Arc::clone(&self.open),
        }))
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ConnectionState {
    local_description: Option<String>,
    remote_description: Option<String>,
    remote_candidates: usize,
    settled: bool,
    closed: bool,
}

struct LoopbackConnection {
    local: String,
    remote: String,
    attempt: u32,
    fault: Option<PairFault>,
    events: mpsc::Sender<MediaEvent>,
    state: Mutex<ConnectionState>,
    open: Arc<AtomicUsize>,
}

impl LoopbackConnection {
    fn description(&self, kind: &str) -> String {
        format!(
            "v=0\r\no=loopback-{kind} {} {} IN IP4 127.0.0.1\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.local, self.attempt
        )
    }

    fn failed(&self, reason: &str) -> RoomError {
        RoomError::NegotiationFailed {
            participant_id: self.remote.clone(),
            reason: reason.to_string(),
        }
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut ConnectionState) -> Result<T, RoomError>,
    ) -> Result<T, RoomError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| self.failed("connection state poisoned"))?;
        if state.closed {
            return Err(self.failed("connection closed"));
        }
        f(&mut state)
    }

    async fn emit_candidate(&self) {
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2122260223 127.0.0.1 {} typ host",
                50_000 + self.attempt
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let _ = self
            .events
            .send(MediaEvent::LocalCandidate {
                participant_id: self.remote.clone(),
                attempt: self.attempt,
                candidate,
            })
            .await;
    }

    /// Report the outcome once both descriptions and a remote candidate
    /// are in.
    async fn maybe_settle(&self) {
        let ready = self
            .with_state(|s| {
                let ready = !s.settled
                    && s.local_description.is_some()
                    && s.remote_description.is_some()
                    && s.remote_candidates > 0;
                if ready {
                    s.settled = true;
                }
                Ok(ready)
            })
            .unwrap_or(false);
        if !ready {
            return;
        }

        let event = match self.fault {
            None => MediaEvent::Connected {
                participant_id: self.remote.clone(),
                attempt: self.attempt,
                stream: RemoteStream {
                    participant_id: self.remote.clone(),
                    stream_id: format!("{}:{}", self.remote, self.attempt),
                },
            },
            Some(PairFault::Fail) => MediaEvent::Failed {
                participant_id: self.remote.clone(),
                attempt: self.attempt,
                reason: "ice failed".into(),
            },
            Some(PairFault::Silent) => {
                debug!(remote = %self.remote, attempt = self.attempt, "Loopback pair stalled");
                return;
            }
        };
        let _ = self.events.send(event).await;
    }
}

#[async_trait]
impl MediaConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<String, RoomError> {
        let offer = self.description("offer");
        self.with_state(|s| {
            if s.local_description.is_some() {
                return Err(self.failed("offer already created"));
            }
            s.local_description = Some(offer.clone());
            Ok(())
        })?;
        self.emit_candidate().await;
        Ok(offer)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, RoomError> {
        if !sdp.starts_with("v=0") {
            return Err(self.failed("malformed offer"));
        }
        let answer = self.description("answer");
        self.with_state(|s| {
            if s.remote_description.is_some() {
                return Err(self.failed("remote description already set"));
            }
            s.remote_description = Some(sdp.to_string());
            s.local_description = Some(answer.clone());
            Ok(())
        })?;
        self.emit_candidate().await;
        self.maybe_settle().await;
        Ok(answer)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), RoomError> {
        if !sdp.starts_with("v=0") {
            return Err(self.failed("malformed answer"));
        }
        self.with_state(|s| {
            if s.local_description.is_none() || s.remote_description.is_some() {
                return Err(self.failed("answer without pending offer"));
            }
            s.remote_description = Some(sdp.to_string());
            Ok(())
        })?;
        self.maybe_settle().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RoomError> {
        if candidate.candidate.is_empty() {
            return Ok(());
        }
        self.with_state(|s| {
            if s.remote_description.is_none() {
                return Err(self.failed("candidate before remote description"));
            }
            s.remote_candidates += 1;
            Ok(())
        })?;
        self.maybe_settle().await;
        Ok(())
    }

    async fn close(&self) {
        let first = self
            .state
            .lock()
            .map(|mut s| !std::mem::replace(&mut s.closed, true))
            .unwrap_or(false);
        if first {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
