//! PeerLink bookkeeping and the negotiation state machine.
//!
//! The manager never performs I/O. Every entry point returns the
//! [`MeshAction`]s the room actor must carry out; results of those actions
//! come back through the matching entry point tagged with the link's
//! participant id and attempt, and anything that no longer matches the
//! current link is discarded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chorus_common::RoomError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::link::{offerer_for, LinkRole, NegotiationState, PeerLink};
use crate::directory::Participant;
use crate::media::{MediaConnection, RemoteStream};
use crate::protocol::{IceCandidate, SignalingMessage};

const MAX_EARLY_PEERS: usize = 64;
const MAX_EARLY_CANDIDATES: usize = 32;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    pub participant_id: String,
    pub profile_id: String,
}

/// Links to open and links to close so that the mesh matches a view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub create: Vec<PeerTarget>,
    /// Remote participant ids.
    pub close: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.close.is_empty()
    }
}

/// Compute the reconcile plan for `local` against `participants`.
///
/// A link exists for every other active transmitter when the local
/// participant is itself an active transmitter with a ready microphone,
/// and for nobody otherwise.
pub fn plan<'a>(
    participants: impl IntoIterator<Item = &'a Participant>,
    local: Option<&Participant>,
    mic_ready: bool,
    existing: &HashSet<String>,
) -> ReconcilePlan {
    let eligible: BTreeMap<&str, &str> = match local {
        Some(local) if local.is_active() && local.role.transmits() && mic_ready => participants
            .into_iter()
            .filter(|p| {
                p.is_active()
                    && p.role.transmits()
                    && p.id != local.id
                    && p.profile_id != local.profile_id
            })
            .map(|p| (p.id.as_str(), p.profile_id.as_str()))
            .collect(),
        _ => BTreeMap::new(),
    };

    let create = eligible
        .iter()
        .filter(|(id, _)| !existing.contains(**id))
        .map(|(id, profile)| PeerTarget {
            participant_id: id.to_string(),
            profile_id: profile.to_string(),
        })
        .collect();
    let mut close: Vec<String> = existing
        .iter()
        .filter(|id| !eligible.contains_key(id.as_str()))
        .cloned()
        .collect();
    close.sort();

    ReconcilePlan { create, close }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Work the actor performs on the manager's behalf.
pub enum MeshAction {
    CreateConnection {
        participant_id: String,
        attempt: u32,
        cancel: CancellationToken,
    },
    CreateOffer {
        participant_id: String,
        attempt: u32,
        connection: Arc<dyn MediaConnection>,
        cancel: CancellationToken,
    },
    AcceptOffer {
        participant_id: String,
        attempt: u32,
        connection: Arc<dyn MediaConnection>,
        sdp: String,
        cancel: CancellationToken,
    },
    AcceptAnswer {
        participant_id: String,
        attempt: u32,
        connection: Arc<dyn MediaConnection>,
        sdp: String,
        cancel: CancellationToken,
    },
    AddCandidates {
        participant_id: String,
        attempt: u32,
        connection: Arc<dyn MediaConnection>,
        candidates: Vec<IceCandidate>,
        cancel: CancellationToken,
    },
    Send(SignalingMessage),
    Close(Arc<dyn MediaConnection>),
    StreamAdded {
        participant_id: String,
        stream: RemoteStream,
    },
    StreamRemoved {
        participant_id: String,
    },
    Degraded {
        participant_id: String,
        error: RoomError,
    },
}

impl fmt::Debug for MeshAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshAction::CreateConnection {
                participant_id,
                attempt,
                ..
            } => write!(f, "CreateConnection({participant_id}, {attempt})"),
            MeshAction::CreateOffer {
                participant_id,
                attempt,
                ..
            } => write!(f, "CreateOffer({participant_id}, {attempt})"),
            MeshAction::AcceptOffer {
                participant_id,
                attempt,
                ..
            } => write!(f, "AcceptOffer({participant_id}, {attempt})"),
            MeshAction::AcceptAnswer {
                participant_id,
                attempt,
                ..
            } => write!(f, "AcceptAnswer({participant_id}, {attempt})"),
            MeshAction::AddCandidates {
                participant_id,
                attempt,
                candidates,
                ..
            } => write!(
                f,
                "AddCandidates({participant_id}, {attempt}, {})",
                candidates.len()
            ),
            MeshAction::Send(msg) => write!(f, "Send({} -> {:?})", msg.payload.kind(), msg.to),
            MeshAction::Close(_) => f.write_str("Close"),
            MeshAction::StreamAdded { participant_id, .. } => {
                write!(f, "StreamAdded({participant_id})")
            }
            MeshAction::StreamRemoved { participant_id } => {
                write!(f, "StreamRemoved({participant_id})")
            }
            MeshAction::Degraded {
                participant_id,
                error,
            } => write!(f, "Degraded({participant_id}: {error})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Signals from a peer we do not have a link for yet.
#[derive(Default)]
struct EarlySignals {
    attempt: u32,
    offer: Option<String>,
    candidates: Vec<IceCandidate>,
}

pub struct MeshManager {
    local_profile_id: String,
    local_participant_id: Option<String>,
    links: HashMap<String, PeerLink>,
    early: HashMap<String, EarlySignals>,
    timeout: Duration,
    max_retries: u32,
    suspended_at: Option<Instant>,
    session: CancellationToken,
}

impl MeshManager {
    pub fn new(local_profile_id: &str, timeout: Duration, max_retries: u32) -> Self {
        Self {
            local_profile_id: local_profile_id.to_string(),
            local_participant_id: None,
            links: HashMap::new(),
            early: HashMap::new(),
            timeout,
            max_retries,
            suspended_at: None,
            session: CancellationToken::new(),
        }
    }

    /// Bind the manager to a joined participant. Link tokens become
    /// children of `session`.
    pub fn start_session(&mut self, participant_id: &str, session: CancellationToken) {
        self.local_participant_id = Some(participant_id.to_string());
        self.session = session;
    }

    /// Close every link and forget the local participant.
    pub fn end_session(&mut self) -> Vec<MeshAction> {
        let actions = self.teardown_all();
        self.local_participant_id = None;
        self.suspended_at = None;
        actions
    }

    pub fn link(&self, participant_id: &str) -> Option<&PeerLink> {
        self.links.get(participant_id)
    }

    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn remote_stream(&self, participant_id: &str) -> Option<&RemoteStream> {
        self.links.get(participant_id)?.remote_stream()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_at.is_some()
    }

    pub fn plan<'a>(
        &self,
        participants: impl IntoIterator<Item = &'a Participant>,
        local: Option<&Participant>,
        mic_ready: bool,
    ) -> ReconcilePlan {
        let existing: HashSet<String> = self.links.keys().cloned().collect();
        plan(participants, local, mic_ready, &existing)
    }

    /// Apply a plan: close first, then create.
    pub fn apply(&mut self, plan: ReconcilePlan, now: Instant) -> Vec<MeshAction> {
        let mut actions = Vec::new();
        for participant_id in &plan.close {
            actions.extend(self.remove_link(participant_id));
        }
        for target in &plan.create {
            actions.extend(self.create_link(target, now));
        }
        actions
    }

    pub fn create_link(&mut self, target: &PeerTarget, now: Instant) -> Vec<MeshAction> {
        let Some(local_id) = self.local_participant_id.clone() else {
            return Vec::new();
        };
        if self.links.contains_key(&target.participant_id) {
            return Vec::new();
        }

        let mut link = PeerLink::new(
            &local_id,
            &self.local_profile_id,
            &target.participant_id,
            &target.profile_id,
            self.session.child_token(),
        );

        if let Some(early) = self.early.remove(&target.participant_id) {
            let early_role = offerer_for(&self.local_profile_id, &target.profile_id, early.attempt);
            if early.attempt <= self.max_retries && early_role == LinkRole::Answerer {
                link.attempt = early.attempt;
                link.role = early_role;
                link.pending_offer = early.offer;
                link.pending_candidates = early.candidates;
                debug!(
                    remote = %target.participant_id,
                    attempt = early.attempt,
                    "Consuming buffered signals"
                );
            }
        }

        info!(
            remote = %target.participant_id,
            role = ?link.role,
            attempt = link.attempt,
            "Creating peer link"
        );
        let actions = self.start_attempt(&mut link, now);
        self.links.insert(target.participant_id.clone(), link);
        actions
    }

    /// Close and forget one link.
    pub fn remove_link(&mut self, participant_id: &str) -> Vec<MeshAction> {
        self.early.remove(participant_id);
        let Some(mut link) = self.links.remove(participant_id) else {
            return Vec::new();
        };
        link.state = NegotiationState::Closing;
        info!(remote = %participant_id, "Closing peer link");
        reset_connection(&mut link)
    }

    pub fn teardown_all(&mut self) -> Vec<MeshAction> {
        self.early.clear();
        let ids: Vec<String> = self.links.keys().cloned().collect();
        ids.iter().flat_map(|id| self.remove_link(id)).collect()
    }

    /// Drop buffered signals from peers the view already knows about but
    /// that did not get a link.
    pub fn prune_early(&mut self, known: impl Fn(&str) -> bool) {
        let links = &self.links;
        self.early
            .retain(|id, _| !known(id) || links.contains_key(id));
    }

    // -- signaling availability --------------------------------------------

    /// Stop starting negotiations and freeze deadlines.
    pub fn suspend(&mut self, now: Instant) {
        if self.suspended_at.is_none() {
            debug!("Mesh negotiations suspended");
            self.suspended_at = Some(now);
        }
    }

    /// Shift frozen deadlines forward and start deferred attempts.
    pub fn resume(&mut self, now: Instant) -> Vec<MeshAction> {
        let Some(since) = self.suspended_at.take() else {
            return Vec::new();
        };
        let frozen = now.saturating_duration_since(since);
        let mut actions = Vec::new();
        let ids: Vec<String> = self.links.keys().cloned().collect();
        for id in ids {
            let Some(mut link) = self.links.remove(&id) else {
                continue;
            };
            if let Some(deadline) = link.deadline {
                link.deadline = Some(deadline + frozen);
            }
            if !link.started && link.state == NegotiationState::Idle {
                actions.extend(self.start_attempt(&mut link, now));
            }
            self.links.insert(id, link);
        }
        debug!(deferred = actions.len(), "Mesh negotiations resumed");
        actions
    }

    // -- remote signals ----------------------------------------------------

    pub fn on_remote_offer(
        &mut self,
        from: &str,
        attempt: u32,
        sdp: String,
        now: Instant,
    ) -> Vec<MeshAction> {
        let Some(link) = self.links.get_mut(from) else {
            self.buffer_early(from, attempt, Some(sdp), None);
            return Vec::new();
        };

        if attempt < link.attempt {
            debug!(remote = %from, attempt, current = link.attempt, "Stale offer ignored");
            return Vec::new();
        }

        if attempt == link.attempt {
            if link.role == LinkRole::Offerer {
                debug!(remote = %from, attempt, "Offer from answerer ignored");
                return Vec::new();
            }
            if link.state != NegotiationState::Idle
                || link.remote_description_set
                || link.pending_offer.is_some()
            {
                debug!(remote = %from, attempt, state = %link.state, "Duplicate offer ignored");
                return Vec::new();
            }
            return match (&link.connection, link.started) {
                (Some(connection), true) => {
                    link.state = NegotiationState::Answering;
                    vec![MeshAction::AcceptOffer {
                        participant_id: from.to_string(),
                        attempt,
                        connection: Arc::clone(connection),
                        sdp,
                        cancel: link.cancel.clone(),
                    }]
                }
                _ => {
                    link.pending_offer = Some(sdp);
                    Vec::new()
                }
            };
        }

        // A peer already on a later attempt.
        let role = offerer_for(&self.local_profile_id, &link.remote_profile_id, attempt);
        if attempt > self.max_retries || role != LinkRole::Answerer {
            debug!(remote = %from, attempt, "Out-of-range offer ignored");
            return Vec::new();
        }
        info!(remote = %from, from_attempt = link.attempt, attempt, "Adopting peer's retry");
        let mut link = match self.links.remove(from) {
            Some(link) => link,
            None => return Vec::new(),
        };
        let mut actions = reset_connection(&mut link);
        link.attempt = attempt;
        link.role = role;
        link.state = NegotiationState::Idle;
        link.pending_offer = Some(sdp);
        self.take_early(&mut link);
        actions.extend(self.start_attempt(&mut link, now));
        self.links.insert(from.to_string(), link);
        actions
    }

    pub fn on_remote_answer(&mut self, from: &str, attempt: u32, sdp: String) -> Vec<MeshAction> {
        let Some(link) = self.links.get_mut(from) else {
            return Vec::new();
        };
        let acceptable = link.attempt == attempt
            && link.role == LinkRole::Offerer
            && link.state == NegotiationState::Offering
            && !link.remote_description_set
            && !link.applying_remote;
        let Some(connection) = link.connection.as_ref().filter(|_| acceptable) else {
            debug!(remote = %from, attempt, state = %link.state, "Answer ignored");
            return Vec::new();
        };
        link.applying_remote = true;
        vec![MeshAction::AcceptAnswer {
            participant_id: from.to_string(),
            attempt,
            connection: Arc::clone(connection),
            sdp,
            cancel: link.cancel.clone(),
        }]
    }

    pub fn on_remote_candidate(
        &mut self,
        from: &str,
        attempt: u32,
        candidate: IceCandidate,
    ) -> Vec<MeshAction> {
        let Some(link) = self.links.get_mut(from) else {
            self.buffer_early(from, attempt, None, Some(candidate));
            return Vec::new();
        };
        if attempt > link.attempt {
            // The peer retried before we did; keep them for that attempt.
            self.buffer_early(from, attempt, None, Some(candidate));
            return Vec::new();
        }
        if link.attempt != attempt || !(link.is_pending() || link.state == NegotiationState::Connected)
        {
            return Vec::new();
        }
        match (&link.connection, link.remote_description_set) {
            (Some(connection), true) => vec![MeshAction::AddCandidates {
                participant_id: from.to_string(),
                attempt,
                connection: Arc::clone(connection),
                candidates: vec![candidate],
                cancel: link.cancel.clone(),
            }],
            _ => {
                link.pending_candidates.push(candidate);
                Vec::new()
            }
        }
    }

    // -- transport results -------------------------------------------------

    pub fn on_local_candidate(
        &mut self,
        participant_id: &str,
        attempt: u32,
        candidate: IceCandidate,
    ) -> Vec<MeshAction> {
        match self.current(participant_id, attempt) {
            Some(link) => vec![MeshAction::Send(SignalingMessage::ice_candidate(
                &link.local_participant_id,
                &link.remote_participant_id,
                candidate,
                attempt,
            ))],
            None => Vec::new(),
        }
    }

    pub fn connection_created(
        &mut self,
        participant_id: &str,
        attempt: u32,
        result: Result<Arc<dyn MediaConnection>, RoomError>,
        now: Instant,
    ) -> Vec<MeshAction> {
        let wanted = self
            .current(participant_id, attempt)
            .is_some_and(|l| l.connection.is_none() && l.is_pending());
        let connection = match result {
            Ok(connection) if !wanted => {
                debug!(remote = %participant_id, attempt, "Closing stale connection");
                return vec![MeshAction::Close(connection)];
            }
            Err(_) if !wanted => return Vec::new(),
            Err(error) => return self.on_failure(participant_id, attempt, error, now),
            Ok(connection) => connection,
        };

        let Some(link) = self.links.get_mut(participant_id) else {
            return vec![MeshAction::Close(connection)];
        };
        link.connection = Some(Arc::clone(&connection));
        match link.role {
            LinkRole::Offerer => {
                link.state = NegotiationState::Offering;
                vec![MeshAction::CreateOffer {
                    participant_id: participant_id.to_string(),
                    attempt,
                    connection,
                    cancel: link.cancel.clone(),
                }]
            }
            LinkRole::Answerer => match link.pending_offer.take() {
                Some(sdp) => {
                    link.state = NegotiationState::Answering;
                    vec![MeshAction::AcceptOffer {
                        participant_id: participant_id.to_string(),
                        attempt,
                        connection,
                        sdp,
                        cancel: link.cancel.clone(),
                    }]
                }
                None => Vec::new(),
            },
        }
    }

    pub fn offer_created(
        &mut self,
        participant_id: &str,
        attempt: u32,
        result: Result<String, RoomError>,
        now: Instant,
    ) -> Vec<MeshAction> {
        let Some(link) = self
            .current(participant_id, attempt)
            .filter(|l| l.state == NegotiationState::Offering)
        else {
            return Vec::new();
        };
        match result {
            Ok(sdp) => vec![MeshAction::Send(SignalingMessage::offer(
                &link.local_participant_id,
                &link.remote_participant_id,
                sdp,
                attempt,
            ))],
            Err(error) => self.on_failure(participant_id, attempt, error, now),
        }
    }

    pub fn answer_created(
        &mut self,
        participant_id: &str,
        attempt: u32,
        result: Result<String, RoomError>,
        now: Instant,
    ) -> Vec<MeshAction> {
        if self
            .current(participant_id, attempt)
            .filter(|l| l.state == NegotiationState::Answering)
            .is_none()
        {
            return Vec::new();
        }
        let sdp = match result {
            Ok(sdp) => sdp,
            Err(error) => return self.on_failure(participant_id, attempt, error, now),
        };
        let Some(link) = self.links.get_mut(participant_id) else {
            return Vec::new();
        };
        link.remote_description_set = true;
        let mut actions = vec![MeshAction::Send(SignalingMessage::answer(
            &link.local_participant_id,
            &link.remote_participant_id,
            sdp,
            attempt,
        ))];
        actions.extend(flush_candidates(link));
        actions
    }

    pub fn remote_description_applied(
        &mut self,
        participant_id: &str,
        attempt: u32,
        result: Result<(), RoomError>,
        now: Instant,
    ) -> Vec<MeshAction> {
        if self
            .current(participant_id, attempt)
            .filter(|l| l.applying_remote)
            .is_none()
        {
            return Vec::new();
        }
        if let Err(error) = result {
            return self.on_failure(participant_id, attempt, error, now);
        }
        let Some(link) = self.links.get_mut(participant_id) else {
            return Vec::new();
        };
        link.applying_remote = false;
        link.remote_description_set = true;
        flush_candidates(link).into_iter().collect()
    }

    pub fn on_connected(
        &mut self,
        participant_id: &str,
        attempt: u32,
        stream: RemoteStream,
    ) -> Vec<MeshAction> {
        let Some(link) = self.links.get_mut(participant_id) else {
            return Vec::new();
        };
        if link.attempt != attempt || !link.is_pending() {
            return Vec::new();
        }
        link.state = NegotiationState::Connected;
        link.deadline = None;
        link.remote_stream = Some(stream.clone());
        info!(remote = %participant_id, attempt, "Peer link connected");
        vec![MeshAction::StreamAdded {
            participant_id: participant_id.to_string(),
            stream,
        }]
    }

    /// Transport failure or timeout for the current attempt: retry with
    /// swapped roles while retries remain, otherwise mark failed.
    pub fn on_failure(
        &mut self,
        participant_id: &str,
        attempt: u32,
        error: RoomError,
        now: Instant,
    ) -> Vec<MeshAction> {
        let Some(mut link) = self.links.remove(participant_id) else {
            return Vec::new();
        };
        if link.attempt != attempt
            || matches!(
                link.state,
                NegotiationState::Failed | NegotiationState::Closing
            )
        {
            self.links.insert(participant_id.to_string(), link);
            return Vec::new();
        }

        let mut actions = reset_connection(&mut link);
        if link.attempt < self.max_retries {
            link.attempt += 1;
            link.role = offerer_for(&self.local_profile_id, &link.remote_profile_id, link.attempt);
            link.state = NegotiationState::Idle;
            self.take_early(&mut link);
            warn!(
                remote = %participant_id,
                error = %error,
                attempt = link.attempt,
                role = ?link.role,
                "Negotiation failed, retrying"
            );
            actions.extend(self.start_attempt(&mut link, now));
        } else {
            link.state = NegotiationState::Failed;
            link.deadline = None;
            warn!(remote = %participant_id, error = %error, "Peer link degraded");
            actions.push(MeshAction::Degraded {
                participant_id: participant_id.to_string(),
                error,
            });
        }
        self.links.insert(participant_id.to_string(), link);
        actions
    }

    /// Time out every pending attempt whose deadline has passed.
    pub fn check_deadlines(&mut self, now: Instant) -> Vec<MeshAction> {
        if self.is_suspended() {
            return Vec::new();
        }
        let expired: Vec<(String, u32)> = self
            .links
            .values()
            .filter(|l| l.is_pending() && l.deadline.is_some_and(|d| d <= now))
            .map(|l| (l.remote_participant_id.clone(), l.attempt))
            .collect();
        expired
            .into_iter()
            .flat_map(|(participant_id, attempt)| {
                let error = RoomError::NegotiationTimeout {
                    participant_id: participant_id.clone(),
                    attempt,
                };
                self.on_failure(&participant_id, attempt, error, now)
            })
            .collect()
    }

    // -- helpers -----------------------------------------------------------

    fn current(&self, participant_id: &str, attempt: u32) -> Option<&PeerLink> {
        self.links
            .get(participant_id)
            .filter(|l| l.attempt == attempt && l.state != NegotiationState::Closing)
    }

    fn start_attempt(&self, link: &mut PeerLink, now: Instant) -> Vec<MeshAction> {
        link.cancel = self.session.child_token();
        if self.is_suspended() {
            link.started = false;
            link.deadline = None;
            return Vec::new();
        }
        link.started = true;
        link.deadline = Some(now + self.timeout);
        vec![MeshAction::CreateConnection {
            participant_id: link.remote_participant_id.clone(),
            attempt: link.attempt,
            cancel: link.cancel.clone(),
        }]
    }

    /// Move signals buffered for the link's current attempt onto it.
    fn take_early(&mut self, link: &mut PeerLink) {
        let Some(early) = self.early.remove(&link.remote_participant_id) else {
            return;
        };
        if early.attempt > link.attempt {
            self.early.insert(link.remote_participant_id.clone(), early);
            return;
        }
        if early.attempt == link.attempt {
            if link.role == LinkRole::Answerer && link.pending_offer.is_none() {
                link.pending_offer = early.offer;
            }
            link.pending_candidates.extend(early.candidates);
        }
    }

    fn buffer_early(
        &mut self,
        from: &str,
        attempt: u32,
        offer: Option<String>,
        candidate: Option<IceCandidate>,
    ) {
        if !self.early.contains_key(from) && self.early.len() >= MAX_EARLY_PEERS {
            return;
        }
        let entry = self.early.entry(from.to_string()).or_default();
        if attempt < entry.attempt {
            return;
        }
        if attempt > entry.attempt {
            *entry = EarlySignals {
                attempt,
                ..Default::default()
            };
        }
        if let Some(offer) = offer {
            debug!(remote = %from, attempt, "Buffering offer from unknown peer");
            entry.offer = Some(offer);
        }
        if let Some(candidate) = candidate {
            if entry.candidates.len() < MAX_EARLY_CANDIDATES {
                entry.candidates.push(candidate);
            }
        }
    }
}

/// Cancel in-flight work, release the connection and stream.
fn reset_connection(link: &mut PeerLink) -> Vec<MeshAction> {
    link.cancel.cancel();
    let mut actions = Vec::new();
    if let Some(connection) = link.connection.take() {
        actions.push(MeshAction::Close(connection));
    }
    if link.remote_stream.take().is_some() {
        actions.push(MeshAction::StreamRemoved {
            participant_id: link.remote_participant_id.clone(),
        });
    }
    link.remote_description_set = false;
    link.applying_remote = false;
    link.pending_offer = None;
    link.pending_candidates.clear();
    link.started = false;
    link.deadline = None;
    actions
}

fn flush_candidates(link: &mut PeerLink) -> Option<MeshAction> {
    if link.pending_candidates.is_empty() {
        return None;
    }
    let connection = link.connection.as_ref()?;
    Some(MeshAction::AddCandidates {
        participant_id: link.remote_participant_id.clone(),
        attempt: link.attempt,
        connection: Arc::clone(connection),
        candidates: std::mem::take(&mut link.pending_candidates),
        cancel: link.cancel.clone(),
    })
}
