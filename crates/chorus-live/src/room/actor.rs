//! The room actor.
//!
//! One task per open room. It exclusively owns the confirmed view, the peer
//! mesh, the microphone and the speaking/mute state, and is driven by a
//! single `select!` loop over handle commands, directory snapshots,
//! signaling events, completions of its own spawned work, transport events
//! and a fixed sample tick. Nothing it owns is behind a lock.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chorus_common::{new_correlation_id, RoomError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{RoomChange, RoomState};
use super::types::{LinkSummary, LocalPhase, RoomConfig, RoomEvent, RoomView};
use super::RoomServices;
use crate::directory::{Participant, Role, RoomSnapshot, RoomStatus};
use crate::identity::Identity;
use crate::media::{ConnectionRequest, LocalTrack, MediaConnection, MediaEvent, RemoteStream};
use crate::mesh::{MeshAction, MeshManager};
use crate::mute::{MuteRequest, MuteSynchronizer};
use crate::protocol::{SignalPayload, SignalingMessage};
use crate::signaling::SignalingEvent;
use crate::speaking::{RemoteSpeakingTracker, SpeakingDetector, SpeakingReporter};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, RoomError>>;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Requests from a [`RoomHandle`](super::RoomHandle).
pub(crate) enum Command {
    Join {
        role: Role,
        reply: Reply<Role>,
    },
    Leave {
        reply: Reply<()>,
    },
    /// `None` toggles.
    SetMuted {
        muted: Option<bool>,
        reply: Reply<bool>,
    },
    RequestToSpeak {
        reply: Reply<()>,
    },
    Promote {
        profile_id: String,
        reply: Reply<()>,
    },
    Invite {
        profile_id: String,
        reply: Reply<()>,
    },
    RemoteStream {
        participant_id: String,
        reply: oneshot::Sender<Option<RemoteStream>>,
    },
    View {
        reply: oneshot::Sender<RoomView>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MicPurpose {
    /// Capture needed before a speaker join write.
    Join,
    /// Capture for a session whose role became transmitting.
    Session,
}

/// Completions of work the actor spawned.
enum Internal {
    DirectorySubscribed(Result<mpsc::Receiver<RoomSnapshot>, RoomError>),
    MicAcquired {
        epoch: u64,
        purpose: MicPurpose,
        result: Result<Arc<dyn LocalTrack>, RoomError>,
    },
    JoinWritten {
        epoch: u64,
        result: Result<Participant, RoomError>,
    },
    LeaveWritten {
        participant_id: String,
        result: Result<(), RoomError>,
    },
    DemotionWritten(Result<(), RoomError>),
    MuteWritten {
        request: MuteRequest,
        result: Result<(), RoomError>,
        reply: Reply<bool>,
    },
    SpeakingWritten {
        epoch: u64,
        value: bool,
        result: Result<(), RoomError>,
    },
    SignalingSubscribed {
        epoch: u64,
        result: Result<mpsc::Receiver<SignalingEvent>, RoomError>,
    },
    ConnectionCreated {
        participant_id: String,
        attempt: u32,
        result: Result<Arc<dyn MediaConnection>, RoomError>,
    },
    OfferCreated {
        participant_id: String,
        attempt: u32,
        result: Result<String, RoomError>,
    },
    AnswerCreated {
        participant_id: String,
        attempt: u32,
        result: Result<String, RoomError>,
    },
    RemoteApplied {
        participant_id: String,
        attempt: u32,
        result: Result<(), RoomError>,
    },
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct PendingJoin {
    epoch: u64,
    /// Role being written; a speaker without a microphone becomes listener.
    role: Role,
    /// Set once the join write succeeded.
    participant_id: Option<String>,
    waiters: Vec<Reply<Role>>,
    /// Leaves requested before the write resolved.
    leave_waiters: Vec<Reply<()>>,
}

enum Phase {
    Absent,
    Joining(PendingJoin),
    Joined {
        participant_id: String,
        role: Role,
    },
    Leaving {
        participant_id: String,
        waiters: Vec<Reply<()>>,
    },
}

/// Resources bound to one confirmed membership.
struct Session {
    epoch: u64,
    participant_id: String,
    /// Log correlation tag.
    tag: String,
    token: CancellationToken,
}

/// Exponential backoff: `base`, doubling up to `max`.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            next: base,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.next = self.base;
    }
}

pub(crate) struct RoomActor {
    room_id: String,
    identity: Identity,
    config: RoomConfig,
    services: RoomServices,
    state: RoomState,
    phase: Phase,
    session: Option<Session>,
    epoch: u64,
    /// Rows this client left; never adopted again.
    departed: HashSet<String>,
    mesh: MeshManager,
    mic: Option<Arc<dyn LocalTrack>>,
    mic_pending: Option<u64>,
    mute: MuteSynchronizer,
    detector: SpeakingDetector,
    reporter: SpeakingReporter,
    remote_speaking: RemoteSpeakingTracker,

    commands: mpsc::Receiver<Command>,
    snapshots: Option<mpsc::Receiver<RoomSnapshot>>,
    directory_backoff: Backoff,
    directory_retry_at: Option<Instant>,
    signal_rx: Option<mpsc::Receiver<SignalingEvent>>,
    signal_backoff: Backoff,
    resubscribe_at: Option<Instant>,
    /// Epoch of the signaling subscribe in flight.
    subscribing: Option<u64>,
    /// Last unsubscribe; the next subscribe runs after it.
    signaling_teardown: Option<JoinHandle<()>>,
    signaling_lost: bool,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    media_tx: mpsc::Sender<MediaEvent>,
    media_rx: mpsc::Receiver<MediaEvent>,
    events: mpsc::Sender<RoomEvent>,
    cancel: CancellationToken,
}

async fn recv_from<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl RoomActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        room_id: &str,
        identity: Identity,
        config: RoomConfig,
        services: RoomServices,
        state: RoomState,
        snapshots: mpsc::Receiver<RoomSnapshot>,
        commands: mpsc::Receiver<Command>,
        events: mpsc::Sender<RoomEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(256);
        let (media_tx, media_rx) = mpsc::channel(256);
        Self {
            room_id: room_id.to_string(),
            mesh: MeshManager::new(
                &identity.profile_id,
                config.negotiation_timeout,
                config.max_retries,
            ),
            detector: SpeakingDetector::new(
                config.speaking_threshold,
                config.attack_samples,
                config.release_samples,
            ),
            reporter: SpeakingReporter::new(config.heartbeat_interval, config.persist_interval),
            remote_speaking: RemoteSpeakingTracker::new(config.stale_after),
            directory_backoff: Backoff::new(config.resubscribe_base, config.resubscribe_max),
            signal_backoff: Backoff::new(config.resubscribe_base, config.resubscribe_max),
            identity,
            config,
            services,
            state,
            phase: Phase::Absent,
            session: None,
            epoch: 0,
            departed: HashSet::new(),
            mic: None,
            mic_pending: None,
            mute: MuteSynchronizer::new(),
            commands,
            snapshots: Some(snapshots),
            directory_retry_at: None,
            signal_rx: None,
            resubscribe_at: None,
            subscribing: None,
            signaling_teardown: None,
            signaling_lost: false,
            internal_tx,
            internal_rx,
            media_tx,
            media_rx,
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) async fn run(mut self, initial: Vec<RoomChange>) {
        info!(
            room_id = %self.room_id,
            profile_id = %self.identity.profile_id,
            "Room actor started"
        );
        self.on_changes(initial);
        self.emit_room_updated();
        self.reconcile();

        let mut tick = time::interval(self.config.sample_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command) {
                            break;
                        }
                    }
                    None => {
                        debug!(room_id = %self.room_id, "All room handles dropped");
                        self.shutdown();
                        break;
                    }
                },
                snapshot = recv_from(&mut self.snapshots) => match snapshot {
                    Some(snapshot) => self.on_snapshots(snapshot),
                    None => self.on_directory_closed(),
                },
                event = recv_from(&mut self.signal_rx) => match event {
                    Some(SignalingEvent::Message(message)) => self.on_signal(message),
                    Some(SignalingEvent::Unavailable(reason)) => self.on_signaling_lost(reason),
                    None => self.on_signaling_lost("signaling channel closed".into()),
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                Some(event) = self.media_rx.recv() => self.on_media(event),
                _ = tick.tick() => self.on_tick(),
                _ = sleep_until_opt(self.resubscribe_at) => {
                    self.resubscribe_at = None;
                    self.subscribe_signaling();
                }
                _ = sleep_until_opt(self.directory_retry_at) => {
                    self.directory_retry_at = None;
                    self.subscribe_directory();
                }
            }
        }

        info!(room_id = %self.room_id, "Room actor stopped");
    }

    // -- commands ----------------------------------------------------------

    /// Returns false when the actor should stop.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Join { role, reply } => self.join(role, reply),
            Command::Leave { reply } => self.leave(reply),
            Command::SetMuted { muted, reply } => self.set_muted(muted, reply),
            Command::RequestToSpeak { reply } => self.request_to_speak(reply),
            Command::Promote { profile_id, reply } => self.make_speaker(profile_id, true, reply),
            Command::Invite { profile_id, reply } => self.make_speaker(profile_id, false, reply),
            Command::RemoteStream {
                participant_id,
                reply,
            } => {
                let _ = reply.send(self.mesh.remote_stream(&participant_id).cloned());
            }
            Command::View { reply } => {
                let _ = reply.send(self.view());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn join(&mut self, role: Role, reply: Reply<Role>) {
        match &mut self.phase {
            Phase::Joining(pending) => {
                debug!(room_id = %self.room_id, "Join already in flight");
                pending.waiters.push(reply);
                return;
            }
            Phase::Joined { .. } => {
                let _ = reply.send(Err(RoomError::AlreadyJoined));
                return;
            }
            Phase::Leaving { .. } => {
                let _ = reply.send(Err(RoomError::InvalidTransition(
                    "leave in progress".into(),
                )));
                return;
            }
            Phase::Absent => {}
        }
        if let Err(error) = self.check_join(role) {
            let _ = reply.send(Err(error));
            return;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        info!(room_id = %self.room_id, %role, "Joining room");
        self.phase = Phase::Joining(PendingJoin {
            epoch,
            role,
            participant_id: None,
            waiters: vec![reply],
            leave_waiters: Vec::new(),
        });
        if role.transmits() {
            self.acquire_microphone(epoch, MicPurpose::Join);
        } else {
            self.write_join(epoch, role);
        }
    }

    fn check_join(&self, role: Role) -> Result<(), RoomError> {
        if role == Role::Host {
            return Err(RoomError::InvalidTransition("cannot join as host".into()));
        }
        let room = self.state.room();
        if !room.is_live() {
            return Err(RoomError::RoomNotLive);
        }
        if role == Role::Speaker && !room.has_speaker_slot() {
            return Err(RoomError::RoomFull);
        }
        Ok(())
    }

    fn leave(&mut self, reply: Reply<()>) {
        match &mut self.phase {
            Phase::Absent => {
                let _ = reply.send(Ok(()));
            }
            Phase::Leaving { waiters, .. } => waiters.push(reply),
            Phase::Joining(pending) if pending.participant_id.is_none() => {
                debug!(room_id = %self.room_id, "Leave deferred until the join write resolves");
                pending.leave_waiters.push(reply);
            }
            Phase::Joining(pending) => {
                let mut waiters = std::mem::take(&mut pending.leave_waiters);
                waiters.push(reply);
                let participant_id = pending.participant_id.clone().unwrap_or_default();
                self.begin_leave(participant_id, waiters);
            }
            Phase::Joined { participant_id, .. } => {
                let participant_id = participant_id.clone();
                self.begin_leave(participant_id, vec![reply]);
            }
        }
    }

    /// Tear the session down within this step, then write `left_at`.
    fn begin_leave(&mut self, participant_id: String, waiters: Vec<Reply<()>>) {
        let tag = self.session.as_ref().map(|s| s.tag.clone()).unwrap_or_default();
        info!(room_id = %self.room_id, %participant_id, session = %tag, "Leaving room");
        self.departed.insert(participant_id.clone());
        self.phase = Phase::Leaving {
            participant_id: participant_id.clone(),
            waiters,
        };
        self.end_session();

        let directory = Arc::clone(&self.services.directory);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = directory.write_leave(&participant_id).await;
            let _ = tx
                .send(Internal::LeaveWritten {
                    participant_id,
                    result,
                })
                .await;
        });
    }

    fn set_muted(&mut self, muted: Option<bool>, reply: Reply<bool>) {
        let Some(participant_id) = self.joined_participant().map(str::to_string) else {
            let _ = reply.send(Err(RoomError::NotJoined));
            return;
        };
        let Some(track) = self.mic.clone() else {
            let _ = reply.send(Err(RoomError::InvalidTransition(
                "no microphone to mute".into(),
            )));
            return;
        };
        let muted = muted.unwrap_or_else(|| track.is_enabled());
        let request = self.mute.request(track.as_ref(), muted);
        debug!(room_id = %self.room_id, muted, seq = request.seq, "Mute requested");

        let directory = Arc::clone(&self.services.directory);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = directory.write_muted(&participant_id, muted).await;
            let _ = tx
                .send(Internal::MuteWritten {
                    request,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn request_to_speak(&mut self, reply: Reply<()>) {
        let role = match &self.phase {
            Phase::Joined { role, .. } => *role,
            _ => {
                let _ = reply.send(Err(RoomError::NotJoined));
                return;
            }
        };
        if role != Role::Viewer {
            let _ = reply.send(Err(RoomError::InvalidTransition(format!(
                "{role} cannot request to speak"
            ))));
            return;
        }
        if self.state.has_speak_request(&self.identity.profile_id) {
            let _ = reply.send(Ok(()));
            return;
        }

        let directory = Arc::clone(&self.services.directory);
        let room_id = self.room_id.clone();
        let profile_id = self.identity.profile_id.clone();
        tokio::spawn(async move {
            let result = directory.write_speak_request(&room_id, &profile_id).await;
            let _ = reply.send(result);
        });
    }

    /// Host turns a present viewer into a speaker; `promote` answers a
    /// pending request, an invite needs none.
    fn make_speaker(&mut self, profile_id: String, promote: bool, reply: Reply<()>) {
        let target_id = match self.check_make_speaker(&profile_id, promote) {
            Ok(id) => id,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };
        info!(room_id = %self.room_id, %profile_id, promote, "Making speaker");

        let directory = Arc::clone(&self.services.directory);
        let room_id = self.room_id.clone();
        tokio::spawn(async move {
            let result = directory.write_role_change(&target_id, Role::Speaker).await;
            if result.is_ok() && promote {
                if let Err(error) = directory.clear_speak_request(&room_id, &profile_id).await {
                    warn!(%room_id, %profile_id, %error, "Failed to clear speak request");
                }
            }
            let _ = reply.send(result);
        });
    }

    fn check_make_speaker(&self, profile_id: &str, promote: bool) -> Result<String, RoomError> {
        match &self.phase {
            Phase::Joined {
                role: Role::Host, ..
            } => {}
            Phase::Joined { .. } => return Err(RoomError::NotHost),
            _ => return Err(RoomError::NotJoined),
        }
        let target = self
            .state
            .by_profile(profile_id)
            .ok_or_else(|| RoomError::ParticipantNotFound(profile_id.to_string()))?;
        match target.role {
            Role::Viewer => {}
            Role::Listener => {
                return Err(RoomError::InvalidTransition(
                    "a listener cannot become a speaker".into(),
                ))
            }
            other => {
                return Err(RoomError::InvalidTransition(format!(
                    "{profile_id} is already {other}"
                )))
            }
        }
        if !self.state.room().has_speaker_slot() {
            return Err(RoomError::RoomFull);
        }
        if promote && !self.state.has_speak_request(profile_id) {
            return Err(RoomError::NoPendingRequest(profile_id.to_string()));
        }
        Ok(target.id.clone())
    }

    fn shutdown(&mut self) {
        info!(room_id = %self.room_id, "Shutting down room");
        // Pending callers see `ActorStopped` when their reply is dropped.
        self.end_session();
        self.phase = Phase::Absent;
        self.cancel.cancel();
    }

    // -- directory feed ----------------------------------------------------

    /// Apply every queued snapshot in order, then reconcile once.
    fn on_snapshots(&mut self, first: RoomSnapshot) {
        let mut batch = vec![first];
        if let Some(rx) = self.snapshots.as_mut() {
            while let Ok(snapshot) = rx.try_recv() {
                batch.push(snapshot);
            }
        }
        let mut updated = false;
        for snapshot in batch {
            let changes = self.state.apply(snapshot);
            updated |= !changes.is_empty();
            self.on_changes(changes);
        }
        if updated {
            self.emit_room_updated();
            self.reconcile();
        }
    }

    fn on_changes(&mut self, changes: Vec<RoomChange>) {
        for change in changes {
            match change {
                RoomChange::Updated => {}
                RoomChange::StatusChanged(status) => {
                    info!(room_id = %self.room_id, %status, "Room status changed");
                    if status == RoomStatus::Ended {
                        self.on_room_ended();
                    }
                }
                RoomChange::LocalAppeared(row) => self.on_local_appeared(row),
                RoomChange::LocalRemoved(row) => self.on_local_removed(row),
                RoomChange::LocalRoleChanged { from, to } => self.on_local_role_changed(from, to),
                RoomChange::LocalMuteChanged(muted) => self.mute.confirm(muted),
                RoomChange::ParticipantLeft(participant_id) => {
                    if self.remote_speaking.forget(&participant_id) {
                        self.emit(RoomEvent::SpeakingChanged {
                            participant_id,
                            speaking: false,
                        });
                    }
                }
            }
        }
    }

    fn on_room_ended(&mut self) {
        if matches!(self.phase, Phase::Joined { .. }) {
            self.end_session();
            self.phase = Phase::Absent;
            self.emit(RoomEvent::LocalRoleChanged { role: None });
        }
        self.emit(RoomEvent::RoomEnded);
    }

    fn on_local_appeared(&mut self, row: Participant) {
        match &self.phase {
            Phase::Joining(pending) if pending.participant_id.as_deref() == Some(row.id.as_str()) => {
                self.enter_joined(row);
            }
            Phase::Absent
                if !self.departed.contains(&row.id)
                    && self.state.room().status != RoomStatus::Ended =>
            {
                info!(
                    room_id = %self.room_id,
                    participant_id = %row.id,
                    role = %row.role,
                    "Resuming existing membership"
                );
                self.enter_joined(row);
            }
            _ => {}
        }
    }

    fn on_local_removed(&mut self, row: Participant) {
        let ours = matches!(
            &self.phase,
            Phase::Joined { participant_id, .. } if *participant_id == row.id
        );
        if ours {
            warn!(room_id = %self.room_id, participant_id = %row.id, "Removed from room");
            self.end_session();
            self.phase = Phase::Absent;
            self.emit(RoomEvent::LocalRoleChanged { role: None });
        }
    }

    fn on_local_role_changed(&mut self, from: Role, to: Role) {
        let Phase::Joined { role, .. } = &mut self.phase else {
            return;
        };
        *role = to;
        info!(room_id = %self.room_id, %from, %to, "Local role changed");
        self.emit(RoomEvent::LocalRoleChanged { role: Some(to) });
        if to.transmits() {
            if let Some(epoch) = self.session.as_ref().map(|s| s.epoch) {
                self.acquire_microphone(epoch, MicPurpose::Session);
            }
        } else {
            self.release_microphone();
        }
    }

    fn on_directory_closed(&mut self) {
        self.snapshots = None;
        let delay = self.directory_backoff.next_delay();
        warn!(room_id = %self.room_id, ?delay, "Directory feed closed, resubscribing");
        self.emit(RoomEvent::Error(RoomError::DirectoryReadFailed(
            "change feed closed".into(),
        )));
        self.directory_retry_at = Some(Instant::now() + delay);
    }

    fn subscribe_directory(&mut self) {
        let directory = Arc::clone(&self.services.directory);
        let room_id = self.room_id.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = directory.subscribe_room(&room_id).await;
            let _ = tx.send(Internal::DirectorySubscribed(result)).await;
        });
    }

    // -- session -----------------------------------------------------------

    /// Start the session for a confirmed row.
    fn enter_joined(&mut self, row: Participant) {
        self.epoch += 1;
        let token = self.cancel.child_token();
        self.mesh.start_session(&row.id, token.clone());
        // Held until signaling is subscribed.
        self.mesh.suspend(Instant::now());
        let tag = new_correlation_id();
        self.session = Some(Session {
            epoch: self.epoch,
            participant_id: row.id.clone(),
            tag: tag.clone(),
            token,
        });
        self.phase = Phase::Joined {
            participant_id: row.id.clone(),
            role: row.role,
        };

        self.detector.reset();
        self.reporter.reset();
        self.mute.reset();
        self.mute.confirm(row.is_muted);
        if let Some(track) = &self.mic {
            track.set_enabled(!row.is_muted);
        }

        info!(
            room_id = %self.room_id,
            participant_id = %row.id,
            role = %row.role,
            session = %tag,
            "Joined room"
        );
        self.emit(RoomEvent::LocalRoleChanged {
            role: Some(row.role),
        });
        self.subscribe_signaling();
        if row.role.transmits() {
            self.acquire_microphone(self.epoch, MicPurpose::Session);
        } else {
            self.release_microphone();
        }
        self.reconcile();
    }

    /// Release everything the session holds, within the current step.
    fn end_session(&mut self) {
        let Some(session) = self.session.take() else {
            self.release_microphone();
            return;
        };
        session.token.cancel();
        let actions = self.mesh.end_session();
        self.execute(actions);

        self.signal_rx = None;
        self.resubscribe_at = None;
        self.signal_backoff.reset();
        self.signaling_lost = false;

        if self.detector.is_speaking() {
            self.emit(RoomEvent::SpeakingChanged {
                participant_id: session.participant_id.clone(),
                speaking: false,
            });
        }
        self.release_microphone();
        self.reporter.reset();
        self.mute.reset();
        for participant_id in self.remote_speaking.clear() {
            self.emit(RoomEvent::SpeakingChanged {
                participant_id,
                speaking: false,
            });
        }

        self.unsubscribe_signaling();
        debug!(
            room_id = %self.room_id,
            participant_id = %session.participant_id,
            session = %session.tag,
            "Session torn down"
        );
    }

    fn acquire_microphone(&mut self, epoch: u64, purpose: MicPurpose) {
        if purpose == MicPurpose::Session && (self.mic.is_some() || self.mic_pending.is_some()) {
            return;
        }
        self.mic_pending = Some(epoch);
        let transport = Arc::clone(&self.services.transport);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.acquire_microphone().await;
            let _ = tx
                .send(Internal::MicAcquired {
                    epoch,
                    purpose,
                    result,
                })
                .await;
        });
    }

    fn release_microphone(&mut self) {
        self.mic_pending = None;
        self.detector.reset();
        if let Some(track) = self.mic.take() {
            track.stop();
            debug!(room_id = %self.room_id, "Microphone released");
        }
    }

    fn write_join(&self, epoch: u64, role: Role) {
        let directory = Arc::clone(&self.services.directory);
        let room_id = self.room_id.clone();
        let profile_id = self.identity.profile_id.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = directory.write_join(&room_id, &profile_id, role).await;
            let _ = tx.send(Internal::JoinWritten { epoch, result }).await;
        });
    }

    /// Ask the directory to make us a listener again.
    fn demote_self(&self) {
        let Some(participant_id) = self.joined_participant().map(str::to_string) else {
            return;
        };
        let directory = Arc::clone(&self.services.directory);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = directory
                .write_role_change(&participant_id, Role::Listener)
                .await;
            let _ = tx.send(Internal::DemotionWritten(result)).await;
        });
    }

    fn joined_participant(&self) -> Option<&str> {
        match &self.phase {
            Phase::Joined { participant_id, .. } => Some(participant_id),
            _ => None,
        }
    }

    // -- completions -------------------------------------------------------

    fn on_internal(&mut self, internal: Internal) {
        let now = Instant::now();
        match internal {
            Internal::DirectorySubscribed(Ok(rx)) => {
                info!(room_id = %self.room_id, "Directory feed restored");
                self.directory_backoff.reset();
                self.snapshots = Some(rx);
            }
            Internal::DirectorySubscribed(Err(error)) => {
                let delay = self.directory_backoff.next_delay();
                warn!(room_id = %self.room_id, %error, ?delay, "Directory resubscribe failed");
                self.directory_retry_at = Some(now + delay);
            }
            Internal::MicAcquired {
                epoch,
                purpose,
                result,
            } => self.on_mic_acquired(epoch, purpose, result),
            Internal::JoinWritten { epoch, result } => self.on_join_written(epoch, result),
            Internal::LeaveWritten {
                participant_id,
                result,
            } => self.on_leave_written(participant_id, result),
            Internal::DemotionWritten(result) => {
                if let Err(error) = result {
                    warn!(room_id = %self.room_id, %error, "Failed to step down to listener");
                    self.emit(RoomEvent::Error(error));
                }
            }
            Internal::MuteWritten {
                request,
                result,
                reply,
            } => {
                if self.mute.resolve(self.mic.as_deref(), request, &result) {
                    warn!(
                        room_id = %self.room_id,
                        muted = request.muted,
                        "Mute write failed, track reverted"
                    );
                }
                let _ = reply.send(result.map(|()| request.muted));
            }
            Internal::SpeakingWritten {
                epoch,
                value,
                result,
            } => {
                if let Err(error) = result {
                    debug!(room_id = %self.room_id, %error, "Speaking write failed");
                    if self.session.as_ref().is_some_and(|s| s.epoch == epoch) {
                        self.reporter.persist_failed(value);
                    }
                }
            }
            Internal::SignalingSubscribed { epoch, result } => {
                self.on_signaling_subscribed(epoch, result)
            }
            Internal::ConnectionCreated {
                participant_id,
                attempt,
                result,
            } => {
                let actions = self
                    .mesh
                    .connection_created(&participant_id, attempt, result, now);
                self.execute(actions);
            }
            Internal::OfferCreated {
                participant_id,
                attempt,
                result,
            } => {
                let actions = self.mesh.offer_created(&participant_id, attempt, result, now);
                self.execute(actions);
            }
            Internal::AnswerCreated {
                participant_id,
                attempt,
                result,
            } => {
                let actions = self.mesh.answer_created(&participant_id, attempt, result, now);
                self.execute(actions);
            }
            Internal::RemoteApplied {
                participant_id,
                attempt,
                result,
            } => {
                let actions =
                    self.mesh
                        .remote_description_applied(&participant_id, attempt, result, now);
                self.execute(actions);
            }
        }
    }

    fn on_mic_acquired(
        &mut self,
        epoch: u64,
        purpose: MicPurpose,
        result: Result<Arc<dyn LocalTrack>, RoomError>,
    ) {
        if self.mic_pending == Some(epoch) {
            self.mic_pending = None;
        }
        match purpose {
            MicPurpose::Join => {
                let Phase::Joining(pending) = &mut self.phase else {
                    if let Ok(track) = result {
                        track.stop();
                    }
                    return;
                };
                if pending.epoch != epoch {
                    if let Ok(track) = result {
                        track.stop();
                    }
                    return;
                }
                let role = match result {
                    Ok(track) => {
                        self.mic = Some(track);
                        Role::Speaker
                    }
                    Err(error) => {
                        pending.role = Role::Listener;
                        warn!(room_id = %self.room_id, %error, "Microphone unavailable, joining as listener");
                        self.emit(RoomEvent::Error(error));
                        Role::Listener
                    }
                };
                self.write_join(epoch, role);
            }
            MicPurpose::Session => {
                let current = self.session.as_ref().is_some_and(|s| s.epoch == epoch);
                let transmitting = matches!(self.phase, Phase::Joined { role, .. } if role.transmits());
                match result {
                    Ok(track) if current && transmitting && self.mic.is_none() => {
                        track.set_enabled(!self.mute.confirmed().unwrap_or(false));
                        self.mic = Some(track);
                        debug!(room_id = %self.room_id, "Microphone ready");
                        self.reconcile();
                    }
                    Ok(track) => track.stop(),
                    Err(error) if current && transmitting => {
                        warn!(room_id = %self.room_id, %error, "Microphone unavailable, stepping down");
                        self.emit(RoomEvent::Error(error));
                        self.demote_self();
                    }
                    Err(error) => {
                        debug!(room_id = %self.room_id, %error, "Stale microphone failure ignored");
                    }
                }
            }
        }
    }

    fn on_join_written(&mut self, epoch: u64, result: Result<Participant, RoomError>) {
        let phase = std::mem::replace(&mut self.phase, Phase::Absent);
        let mut pending = match phase {
            Phase::Joining(pending) if pending.epoch == epoch => pending,
            other => {
                self.phase = other;
                return;
            }
        };

        match result {
            Ok(participant) => {
                info!(
                    room_id = %self.room_id,
                    participant_id = %participant.id,
                    role = %pending.role,
                    "Join written"
                );
                for waiter in pending.waiters.drain(..) {
                    let _ = waiter.send(Ok(pending.role));
                }
                pending.participant_id = Some(participant.id.clone());
                let leave_waiters = std::mem::take(&mut pending.leave_waiters);
                if !leave_waiters.is_empty() {
                    self.begin_leave(participant.id, leave_waiters);
                    return;
                }
                let confirmed = self.state.participant(&participant.id).cloned();
                self.phase = Phase::Joining(pending);
                if let Some(row) = confirmed {
                    self.enter_joined(row);
                }
            }
            Err(error) => {
                warn!(room_id = %self.room_id, %error, "Join failed");
                self.release_microphone();
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                for waiter in pending.leave_waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
    }

    fn on_leave_written(&mut self, participant_id: String, result: Result<(), RoomError>) {
        let ours = matches!(
            &self.phase,
            Phase::Leaving { participant_id: current, .. } if *current == participant_id
        );
        if !ours {
            return;
        }
        let Phase::Leaving { waiters, .. } = std::mem::replace(&mut self.phase, Phase::Absent)
        else {
            return;
        };

        match result {
            Ok(()) => {
                info!(room_id = %self.room_id, %participant_id, "Left room");
                self.emit(RoomEvent::LocalRoleChanged { role: None });
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(error) => {
                warn!(room_id = %self.room_id, %error, "Leave failed, restoring membership");
                self.departed.remove(&participant_id);
                match self.state.participant(&participant_id).cloned() {
                    Some(row) => self.enter_joined(row),
                    None => self.emit(RoomEvent::LocalRoleChanged { role: None }),
                }
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
        }
    }

    // -- signaling ---------------------------------------------------------

    fn subscribe_signaling(&mut self) {
        let Some(epoch) = self.session.as_ref().map(|s| s.epoch) else {
            return;
        };
        if self.subscribing.is_some() {
            return;
        }
        self.subscribing = Some(epoch);
        let teardown = self.signaling_teardown.take();
        let signaling = Arc::clone(&self.services.signaling);
        let room_id = self.room_id.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Some(teardown) = teardown {
                let _ = teardown.await;
            }
            let result = signaling.subscribe(&room_id).await;
            let _ = tx
                .send(Internal::SignalingSubscribed { epoch, result })
                .await;
        });
    }

    /// Unsubscribe off the actor task; a backend may hold the subscription
    /// lock while a channel join is pending.
    fn unsubscribe_signaling(&mut self) {
        let previous = self.signaling_teardown.take();
        let signaling = Arc::clone(&self.services.signaling);
        let room_id = self.room_id.clone();
        self.signaling_teardown = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            signaling.unsubscribe().await;
            debug!(%room_id, "Signaling unsubscribed");
        }));
    }

    fn on_signaling_subscribed(
        &mut self,
        epoch: u64,
        result: Result<mpsc::Receiver<SignalingEvent>, RoomError>,
    ) {
        self.subscribing = None;
        let current = self.session.as_ref().map(|s| s.epoch);
        match (current, result) {
            (None, Ok(_stale)) => self.unsubscribe_signaling(),
            (None, Err(_)) => {}
            (Some(current), _) if current != epoch => self.subscribe_signaling(),
            (Some(_), Ok(rx)) => {
                self.signal_rx = Some(rx);
                self.signal_backoff.reset();
                let actions = self.mesh.resume(Instant::now());
                self.execute(actions);
                if std::mem::take(&mut self.signaling_lost) {
                    info!(room_id = %self.room_id, "Signaling restored");
                    self.emit(RoomEvent::SignalingRestored);
                } else {
                    debug!(room_id = %self.room_id, "Signaling subscribed");
                }
            }
            (Some(_), Err(error)) => self.on_signaling_lost(error.to_string()),
        }
    }

    /// Suspend negotiations and schedule a resubscribe. Connected links
    /// are left alone.
    fn on_signaling_lost(&mut self, reason: String) {
        if self.session.is_none() {
            self.signal_rx = None;
            return;
        }
        let now = Instant::now();
        self.signal_rx = None;
        self.mesh.suspend(now);
        if !self.signaling_lost {
            self.signaling_lost = true;
            warn!(room_id = %self.room_id, %reason, "Signaling unavailable, negotiations suspended");
            self.emit(RoomEvent::SignalingUnavailable { reason });
        }
        let delay = self.signal_backoff.next_delay();
        debug!(room_id = %self.room_id, ?delay, "Signaling resubscribe scheduled");
        self.resubscribe_at = Some(now + delay);
    }

    fn on_signal(&mut self, message: SignalingMessage) {
        let Some(local_id) = self.session.as_ref().map(|s| s.participant_id.clone()) else {
            return;
        };
        if message.from == local_id || !message.is_addressed_to(&local_id) {
            return;
        }
        debug!(
            room_id = %self.room_id,
            kind = message.payload.kind(),
            from = %message.from,
            "Signal received"
        );
        let now = Instant::now();
        let from = message.from;
        let actions = match message.payload {
            SignalPayload::Offer { sdp, attempt } => {
                self.mesh.on_remote_offer(&from, attempt, sdp, now)
            }
            SignalPayload::Answer { sdp, attempt } => self.mesh.on_remote_answer(&from, attempt, sdp),
            SignalPayload::IceCandidate { candidate, attempt } => {
                self.mesh.on_remote_candidate(&from, attempt, candidate)
            }
            SignalPayload::SpeakingStatus { is_speaking } => {
                if self.state.participant(&from).is_some() {
                    if let Some(speaking) = self.remote_speaking.observe(&from, is_speaking, now) {
                        self.emit(RoomEvent::SpeakingChanged {
                            participant_id: from,
                            speaking,
                        });
                    }
                }
                return;
            }
        };
        self.execute(actions);
    }

    fn send_signal(&self, message: SignalingMessage) {
        let signaling = Arc::clone(&self.services.signaling);
        tokio::spawn(async move {
            let kind = message.payload.kind();
            if let Err(error) = signaling.send(message).await {
                debug!(kind, %error, "Signal not delivered");
            }
        });
    }

    // -- media -------------------------------------------------------------

    fn on_media(&mut self, event: MediaEvent) {
        let now = Instant::now();
        let actions = match event {
            MediaEvent::LocalCandidate {
                participant_id,
                attempt,
                candidate,
            } => self
                .mesh
                .on_local_candidate(&participant_id, attempt, candidate),
            MediaEvent::Connected {
                participant_id,
                attempt,
                stream,
            } => self.mesh.on_connected(&participant_id, attempt, stream),
            MediaEvent::Failed {
                participant_id,
                attempt,
                reason,
            } => {
                let error = RoomError::NegotiationFailed {
                    participant_id: participant_id.clone(),
                    reason,
                };
                self.mesh.on_failure(&participant_id, attempt, error, now)
            }
        };
        self.execute(actions);
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let actions = self.mesh.check_deadlines(now);
        self.execute(actions);

        for participant_id in self.remote_speaking.expire(now) {
            debug!(room_id = %self.room_id, %participant_id, "Speaking heartbeat expired");
            self.emit(RoomEvent::SpeakingChanged {
                participant_id,
                speaking: false,
            });
        }
        self.sample_speaking(now);
    }

    fn sample_speaking(&mut self, now: Instant) {
        let Some((participant_id, epoch)) = self
            .session
            .as_ref()
            .map(|s| (s.participant_id.clone(), s.epoch))
        else {
            return;
        };
        let transmitting = matches!(self.phase, Phase::Joined { role, .. } if role.transmits());
        let level = self
            .mic
            .as_ref()
            .filter(|_| transmitting)
            .map(|track| track.audio_level());

        match level {
            Some(level) => {
                if let Some(speaking) = self.detector.sample(level) {
                    debug!(room_id = %self.room_id, speaking, "Local speaking changed");
                    self.emit(RoomEvent::SpeakingChanged {
                        participant_id: participant_id.clone(),
                        speaking,
                    });
                }
            }
            // Nothing to report without a transmitting microphone.
            None if !self.reporter.current() => return,
            None => {}
        }

        let report = self.reporter.update(now, self.detector.is_speaking());
        if let Some(speaking) = report.broadcast {
            if self.signal_rx.is_some() {
                self.send_signal(SignalingMessage::speaking_status(&participant_id, speaking));
            }
        }
        if let Some(value) = report.persist {
            let directory = Arc::clone(&self.services.directory);
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let result = directory.write_speaking(&participant_id, value).await;
                let _ = tx
                    .send(Internal::SpeakingWritten {
                        epoch,
                        value,
                        result,
                    })
                    .await;
            });
        }
    }

    // -- mesh --------------------------------------------------------------

    /// Bring the mesh in line with the confirmed view.
    fn reconcile(&mut self) {
        let Some(participant_id) = self.session.as_ref().map(|s| s.participant_id.clone()) else {
            return;
        };
        let local = self.state.participant(&participant_id);
        let plan = self
            .mesh
            .plan(self.state.participants(), local, self.mic.is_some());
        if !plan.is_empty() {
            info!(
                room_id = %self.room_id,
                create = plan.create.len(),
                close = plan.close.len(),
                "Reconciling mesh"
            );
            let actions = self.mesh.apply(plan, Instant::now());
            self.execute(actions);
        }
        let state = &self.state;
        self.mesh.prune_early(|id| state.participant(id).is_some());
    }

    fn execute(&mut self, actions: Vec<MeshAction>) {
        for action in actions {
            match action {
                MeshAction::CreateConnection {
                    participant_id,
                    attempt,
                    cancel: _,
                } => self.create_connection(participant_id, attempt),
                MeshAction::CreateOffer {
                    participant_id,
                    attempt,
                    connection,
                    cancel,
                } => self.spawn_step(cancel, async move {
                    Internal::OfferCreated {
                        result: connection.create_offer().await,
                        participant_id,
                        attempt,
                    }
                }),
                MeshAction::AcceptOffer {
                    participant_id,
                    attempt,
                    connection,
                    sdp,
                    cancel,
                } => self.spawn_step(cancel, async move {
                    Internal::AnswerCreated {
                        result: connection.accept_offer(&sdp).await,
                        participant_id,
                        attempt,
                    }
                }),
                MeshAction::AcceptAnswer {
                    participant_id,
                    attempt,
                    connection,
                    sdp,
                    cancel,
                } => self.spawn_step(cancel, async move {
                    Internal::RemoteApplied {
                        result: connection.accept_answer(&sdp).await,
                        participant_id,
                        attempt,
                    }
                }),
                MeshAction::AddCandidates {
                    participant_id,
                    attempt,
                    connection,
                    candidates,
                    cancel,
                } => {
                    tokio::spawn(async move {
                        for candidate in candidates {
                            let added = tokio::select! {
                                _ = cancel.cancelled() => return,
                                added = connection.add_ice_candidate(candidate) => added,
                            };
                            if let Err(error) = added {
                                debug!(%participant_id, attempt, %error, "ICE candidate rejected");
                            }
                        }
                    });
                }
                MeshAction::Send(message) => self.send_signal(message),
                MeshAction::Close(connection) => {
                    tokio::spawn(async move { connection.close().await });
                }
                MeshAction::StreamAdded {
                    participant_id,
                    stream,
                } => self.emit(RoomEvent::RemoteStream {
                    participant_id,
                    stream,
                }),
                MeshAction::StreamRemoved { participant_id } => {
                    self.emit(RoomEvent::RemoteStreamRemoved { participant_id })
                }
                MeshAction::Degraded {
                    participant_id,
                    error,
                } => self.emit(RoomEvent::ConnectionDegraded {
                    participant_id,
                    error,
                }),
            }
        }
    }

    /// Results always come back, even for links that went away meanwhile,
    /// so the manager can close connections nobody wants.
    fn create_connection(&mut self, participant_id: String, attempt: u32) {
        let (Some(track), Some(session)) = (self.mic.clone(), self.session.as_ref()) else {
            warn!(room_id = %self.room_id, %participant_id, "No microphone for peer connection");
            let error = RoomError::NegotiationFailed {
                participant_id: participant_id.clone(),
                reason: "no local microphone".into(),
            };
            let actions =
                self.mesh
                    .connection_created(&participant_id, attempt, Err(error), Instant::now());
            self.execute(actions);
            return;
        };
        let request = ConnectionRequest {
            local_participant_id: session.participant_id.clone(),
            remote_participant_id: participant_id.clone(),
            attempt,
            track,
        };
        let transport = Arc::clone(&self.services.transport);
        let events = self.media_tx.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.create_connection(request, events).await;
            let _ = tx
                .send(Internal::ConnectionCreated {
                    participant_id,
                    attempt,
                    result,
                })
                .await;
        });
    }

    fn spawn_step<F>(&self, cancel: CancellationToken, step: F)
    where
        F: Future<Output = Internal> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                internal = step => {
                    let _ = tx.send(internal).await;
                }
            }
        });
    }

    // -- output ------------------------------------------------------------

    fn emit(&self, event: RoomEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(room_id = %self.room_id, ?event, "Room event channel full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn emit_room_updated(&self) {
        self.emit(RoomEvent::RoomUpdated {
            room: self.state.room().clone(),
            participants: self.state.participants().cloned().collect(),
            speak_requests: self.state.speak_requests().cloned().collect(),
        });
    }

    fn view(&self) -> RoomView {
        let (phase, local_participant_id) = match &self.phase {
            Phase::Absent => (LocalPhase::Absent, None),
            Phase::Joining(pending) => (LocalPhase::Joining, pending.participant_id.clone()),
            Phase::Joined {
                participant_id,
                role,
            } => (LocalPhase::Joined(*role), Some(participant_id.clone())),
            Phase::Leaving { participant_id, .. } => {
                (LocalPhase::Leaving, Some(participant_id.clone()))
            }
        };
        let mut links: Vec<LinkSummary> = self
            .mesh
            .links()
            .map(|link| LinkSummary {
                participant_id: link.remote_participant_id.clone(),
                profile_id: link.remote_profile_id.clone(),
                state: link.state,
                attempt: link.attempt,
                role: link.role,
                has_stream: link.remote_stream().is_some(),
            })
            .collect();
        links.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));

        RoomView {
            room: self.state.room().clone(),
            participants: self.state.participants().cloned().collect(),
            speak_requests: self.state.speak_requests().cloned().collect(),
            phase,
            local_participant_id,
            muted: self.mic.as_ref().map(|track| !track.is_enabled()),
            muted_confirmed: self.mute.confirmed(),
            links,
            signaling_available: self.signal_rx.is_some(),
            speaking: self.remote_speaking.speaking(),
            session_tag: self.session.as_ref().map(|s| s.tag.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }
}
