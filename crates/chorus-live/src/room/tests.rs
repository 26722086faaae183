use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorus_common::RoomError;
use tokio::sync::{mpsc, Mutex};
use tokio::time;

use super::*;
use crate::directory::{MemoryDirectory, ParticipantDirectory, Role, Room, RoomStatus, WriteKind};
use crate::identity::Identity;
use crate::media::{LocalTrack, LoopbackTransport, PairFault};
use crate::mesh::NegotiationState;
use crate::protocol::SignalingMessage;
use crate::signaling::{LocalSignaling, LocalSignalingHub, SignalingChannel, SignalingEvent};

const ROOM: &str = "room-1";

fn config() -> RoomConfig {
    RoomConfig {
        negotiation_timeout: Duration::from_secs(2),
        ..RoomConfig::default()
    }
}

/// A live room hosted by profile `h`, with shared in-process backends.
struct Harness {
    directory: Arc<MemoryDirectory>,
    hub: LocalSignalingHub,
    transport: LoopbackTransport,
}

impl Harness {
    async fn new(max_speakers: u32) -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        let mut room = Room::new(ROOM, "Standup", max_speakers);
        room.status = RoomStatus::Live;
        directory.create_room(room).await;
        directory.write_join(ROOM, "h", Role::Host).await.unwrap();
        Self {
            directory,
            hub: LocalSignalingHub::new(),
            transport: LoopbackTransport::new(),
        }
    }

    async fn open(&self, profile: &str) -> Client {
        self.open_with(profile, Arc::new(self.hub.endpoint())).await
    }

    async fn open_with(&self, profile: &str, signaling: Arc<dyn SignalingChannel>) -> Client {
        let services = RoomServices {
            directory: self.directory.clone(),
            signaling,
            transport: Arc::new(self.transport.clone()),
        };
        let (handle, events) =
            RoomHandle::open(ROOM, Identity::local(profile, profile), services, config())
                .await
                .unwrap();
        Client { handle, events }
    }

    /// Open `profile` and join with `role`, waiting until the row is confirmed.
    async fn joined(&self, profile: &str, role: Role) -> Client {
        let client = self.open(profile).await;
        assert_eq!(client.handle.join(role).await.unwrap(), role);
        client
            .wait("joined", |v| v.phase == LocalPhase::Joined(role))
            .await;
        client
    }

    async fn pid(&self, profile: &str) -> String {
        self.directory
            .participant(ROOM, profile)
            .await
            .map(|p| p.id)
            .unwrap_or_else(|| panic!("{profile} has no active row"))
    }
}

/// Holds one lock across the whole subscribe, like a backend waiting for a
/// channel join acknowledgement; unsubscribe needs the same lock.
struct SlowSignaling {
    inner: LocalSignaling,
    lock: Mutex<()>,
    join_delay: Duration,
}

#[async_trait]
impl SignalingChannel for SlowSignaling {
    async fn subscribe(&self, room_id: &str) -> Result<mpsc::Receiver<SignalingEvent>, RoomError> {
        let _guard = self.lock.lock().await;
        time::sleep(self.join_delay).await;
        self.inner.subscribe(room_id).await
    }

    async fn send(&self, message: SignalingMessage) -> Result<(), RoomError> {
        self.inner.send(message).await
    }

    async fn unsubscribe(&self) {
        let _guard = self.lock.lock().await;
        self.inner.unsubscribe().await;
    }
}

struct Client {
    handle: RoomHandle,
    events: mpsc::Receiver<RoomEvent>,
}

impl Client {
    async fn view(&self) -> RoomView {
        self.handle.view().await.unwrap()
    }

    async fn wait(&self, what: &str, pred: impl Fn(&RoomView) -> bool) -> RoomView {
        for _ in 0..400 {
            let view = self.view().await;
            if pred(&view) {
                return view;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn expect(&mut self, what: &str, pred: impl Fn(&RoomEvent) -> bool) -> RoomEvent {
        let events = &mut self.events;
        let found = time::timeout(Duration::from_secs(30), async {
            loop {
                match events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => {}
                    None => panic!("event stream closed waiting for {what}"),
                }
            }
        })
        .await;
        found.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }
}

#[tokio::test(start_paused = true)]
async fn host_row_is_adopted_on_open() {
    let harness = Harness::new(3).await;
    let host = harness.open("h").await;
    let view = host
        .wait("host joined", |v| v.phase == LocalPhase::Joined(Role::Host))
        .await;
    assert_eq!(view.local_participant_id, Some(harness.pid("h").await));
    assert_eq!(view.muted, Some(false));
}

#[tokio::test(start_paused = true)]
async fn speakers_form_a_full_mesh_and_listeners_stay_out() {
    let harness = Harness::new(3).await;
    let host = harness.open("h").await;
    let s1 = harness.joined("s1", Role::Speaker).await;
    let s2 = harness.joined("s2", Role::Speaker).await;
    let listener = harness.joined("l", Role::Listener).await;

    for (name, client) in [("h", &host), ("s1", &s1), ("s2", &s2)] {
        client
            .wait(&format!("{name} fully connected"), |v| v.connected_links() == 2)
            .await;
    }

    let s1_pid = harness.pid("s1").await;
    let stream = host.handle.remote_stream(&s1_pid).await.unwrap();
    assert_eq!(stream.map(|s| s.participant_id), Some(s1_pid.clone()));

    let view = listener.view().await;
    assert!(view.links.is_empty());
    assert_eq!(view.muted, None);
    assert!(host.view().await.link(&harness.pid("l").await).is_none());
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.transport.open_connections(), 6);
}

#[tokio::test(start_paused = true)]
async fn repeated_join_and_leave_write_once() {
    let harness = Harness::new(3).await;
    let client = harness.open("l").await;

    let (a, b) = tokio::join!(client.handle.join(Role::Listener), client.handle.join(Role::Listener));
    assert_eq!(a.unwrap(), Role::Listener);
    assert_eq!(b.unwrap(), Role::Listener);
    client
        .wait("joined", |v| v.phase == LocalPhase::Joined(Role::Listener))
        .await;
    assert_eq!(harness.directory.write_count(WriteKind::Join).await, 2);
    assert!(matches!(
        client.handle.join(Role::Listener).await,
        Err(RoomError::AlreadyJoined)
    ));

    let first_tag = client.view().await.session_tag;
    assert!(first_tag.is_some());

    let (a, b) = tokio::join!(client.handle.leave(), client.handle.leave());
    a.unwrap();
    b.unwrap();
    client.handle.leave().await.unwrap();
    assert_eq!(harness.directory.write_count(WriteKind::Leave).await, 1);
    let view = client.view().await;
    assert_eq!(view.phase, LocalPhase::Absent);
    assert_eq!(view.session_tag, None);
    assert!(harness.directory.participant(ROOM, "l").await.is_none());

    client.handle.join(Role::Listener).await.unwrap();
    let view = client
        .wait("joined again", |v| v.phase == LocalPhase::Joined(Role::Listener))
        .await;
    assert!(view.session_tag.is_some());
    assert_ne!(view.session_tag, first_tag);
}

#[tokio::test(start_paused = true)]
async fn leave_releases_media_before_the_write_lands() {
    let harness = Harness::new(3).await;
    let host = harness.open("h").await;
    let s1 = harness.joined("s1", Role::Speaker).await;
    host.wait("link to s1", |v| v.connected_links() == 1).await;

    harness.directory.set_latency(Duration::from_secs(1)).await;
    let handle = s1.handle.clone();
    let leaving = tokio::spawn(async move { handle.leave().await });
    time::sleep(Duration::from_millis(100)).await;

    let view = s1.view().await;
    assert_eq!(view.phase, LocalPhase::Leaving);
    assert!(view.links.is_empty());
    assert_eq!(view.muted, None);

    leaving.await.unwrap().unwrap();
    host.wait("s1 gone", |v| v.links.is_empty()).await;
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.transport.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn join_as_host_or_into_a_full_room_is_rejected() {
    let harness = Harness::new(1).await;
    let _host = harness.open("h").await;
    let _s1 = harness.joined("s1", Role::Speaker).await;

    let s2 = harness.open("s2").await;
    assert!(matches!(
        s2.handle.join(Role::Host).await,
        Err(RoomError::InvalidTransition(_))
    ));
    s2.wait("s1 counted", |v| v.room.speaker_count == 1).await;
    assert!(matches!(
        s2.handle.join(Role::Speaker).await,
        Err(RoomError::RoomFull)
    ));
    assert_eq!(s2.handle.join(Role::Listener).await.unwrap(), Role::Listener);
}

#[tokio::test(start_paused = true)]
async fn denied_microphone_joins_as_listener() {
    let harness = Harness::new(3).await;
    harness.transport.deny_microphone(true);
    let mut s1 = harness.open("s1").await;

    assert_eq!(s1.handle.join(Role::Speaker).await.unwrap(), Role::Listener);
    s1.expect("permission error", |e| {
        matches!(e, RoomEvent::Error(RoomError::MediaPermissionDenied(_)))
    })
    .await;
    s1.wait("joined as listener", |v| {
        v.phase == LocalPhase::Joined(Role::Listener)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn demotion_closes_links_and_releases_the_microphone() {
    let harness = Harness::new(3).await;
    let host = harness.open("h").await;
    let mut s1 = harness.joined("s1", Role::Speaker).await;
    let s2 = harness.joined("s2", Role::Speaker).await;
    s2.wait("s2 connected", |v| v.connected_links() == 2).await;

    let s1_pid = harness.pid("s1").await;
    harness
        .directory
        .write_role_change(&s1_pid, Role::Listener)
        .await
        .unwrap();

    s1.expect("demoted", |e| {
        matches!(e, RoomEvent::LocalRoleChanged { role: Some(Role::Listener) })
    })
    .await;
    let view = s1
        .wait("links closed", |v| v.links.is_empty() && v.muted.is_none())
        .await;
    assert_eq!(view.phase, LocalPhase::Joined(Role::Listener));
    host.wait("host drops s1", |v| v.link(&s1_pid).is_none()).await;
    s2.wait("s2 keeps host", |v| v.connected_links() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn mute_reverts_when_the_write_fails() {
    let harness = Harness::new(3).await;
    let s1 = harness.joined("s1", Role::Speaker).await;

    harness.directory.set_failing(WriteKind::Muted, true).await;
    assert!(matches!(
        s1.handle.set_muted(true).await,
        Err(RoomError::DirectoryWriteFailed(_))
    ));
    assert_eq!(s1.view().await.muted, Some(false));

    harness.directory.set_failing(WriteKind::Muted, false).await;
    assert!(s1.handle.set_muted(true).await.unwrap());
    s1.wait("mute confirmed", |v| v.muted_confirmed == Some(true))
        .await;
    assert_eq!(s1.view().await.muted, Some(true));

    assert!(!s1.handle.toggle_mute().await.unwrap());
    s1.wait("unmute confirmed", |v| v.muted_confirmed == Some(false))
        .await;
}

#[tokio::test(start_paused = true)]
async fn mute_needs_a_microphone() {
    let harness = Harness::new(3).await;
    let listener = harness.open("l").await;
    assert!(matches!(
        listener.handle.set_muted(true).await,
        Err(RoomError::NotJoined)
    ));
    let listener = harness.joined("l2", Role::Listener).await;
    assert!(matches!(
        listener.handle.set_muted(true).await,
        Err(RoomError::InvalidTransition(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn stalled_pair_recovers_on_retry() {
    let harness = Harness::new(3).await;
    let host = harness.open("h").await;
    let h_pid = harness.pid("h").await;
    let s1_row = harness
        .directory
        .write_join(ROOM, "s1", Role::Speaker)
        .await
        .unwrap();
    harness
        .transport
        .fault_pair(&h_pid, &s1_row.id, PairFault::Silent, 1);
    let _s1 = harness.open("s1").await;

    let view = host.wait("connected on retry", |v| v.connected_links() == 1).await;
    assert_eq!(view.link(&s1_row.id).map(|l| l.attempt), Some(1));
}

#[tokio::test(start_paused = true)]
async fn pair_failing_every_attempt_is_reported_degraded() {
    let harness = Harness::new(3).await;
    let mut host = harness.open("h").await;
    let h_pid = harness.pid("h").await;
    let s1_row = harness
        .directory
        .write_join(ROOM, "s1", Role::Speaker)
        .await
        .unwrap();
    harness
        .transport
        .fault_pair(&h_pid, &s1_row.id, PairFault::Silent, 2);
    let _s1 = harness.open("s1").await;

    let event = host
        .expect("degraded", |e| matches!(e, RoomEvent::ConnectionDegraded { .. }))
        .await;
    let RoomEvent::ConnectionDegraded { participant_id, error } = event else {
        unreachable!();
    };
    assert_eq!(participant_id, s1_row.id);
    assert!(matches!(error, RoomError::NegotiationTimeout { attempt: 1, .. }));

    // The failed link stays in place rather than being rebuilt.
    let link = host.view().await.link(&s1_row.id).cloned().unwrap();
    assert_eq!(link.state, NegotiationState::Failed);
}

#[tokio::test(start_paused = true)]
async fn signaling_outage_keeps_media_and_recovers() {
    let harness = Harness::new(3).await;
    let mut host = harness.open("h").await;
    let _s1 = harness.joined("s1", Role::Speaker).await;
    host.wait("connected", |v| v.connected_links() == 1).await;

    harness.hub.set_available(false);
    host.expect("unavailable", |e| matches!(e, RoomEvent::SignalingUnavailable { .. }))
        .await;
    let view = host.view().await;
    assert!(!view.signaling_available);
    assert_eq!(view.connected_links(), 1);

    time::sleep(Duration::from_secs(5)).await;
    harness.hub.set_available(true);
    host.expect("restored", |e| matches!(e, RoomEvent::SignalingRestored))
        .await;
    let view = host.view().await;
    assert!(view.signaling_available);
    assert_eq!(view.connected_links(), 1);
}

#[tokio::test(start_paused = true)]
async fn promotion_requires_host_request_and_capacity() {
    let harness = Harness::new(2).await;
    let host = harness.open("h").await;
    host.wait("host joined", |v| v.phase == LocalPhase::Joined(Role::Host))
        .await;
    let s1 = harness.joined("s1", Role::Speaker).await;
    let mut viewer = harness.joined("v", Role::Viewer).await;
    let listener = harness.joined("l", Role::Listener).await;
    host.wait("everyone in", |v| v.participants.len() == 4).await;

    assert!(matches!(s1.handle.promote("v").await, Err(RoomError::NotHost)));
    assert!(matches!(
        host.handle.promote("v").await,
        Err(RoomError::NoPendingRequest(_))
    ));
    assert!(matches!(
        host.handle.promote("ghost").await,
        Err(RoomError::ParticipantNotFound(_))
    ));
    assert!(matches!(
        host.handle.invite("s1").await,
        Err(RoomError::InvalidTransition(_))
    ));
    assert!(matches!(
        listener.handle.request_to_speak().await,
        Err(RoomError::InvalidTransition(_))
    ));

    viewer.handle.request_to_speak().await.unwrap();
    host.wait("request visible", |v| v.speak_requests == vec!["v".to_string()])
        .await;
    host.handle.promote("v").await.unwrap();

    viewer
        .expect("promoted", |e| {
            matches!(e, RoomEvent::LocalRoleChanged { role: Some(Role::Speaker) })
        })
        .await;
    viewer
        .wait("microphone live", |v| v.muted == Some(false))
        .await;
    host.wait("request cleared", |v| v.speak_requests.is_empty())
        .await;

    let _w = harness.joined("w", Role::Viewer).await;
    host.wait("w in", |v| v.participants.len() == 5).await;
    assert!(matches!(host.handle.invite("w").await, Err(RoomError::RoomFull)));
}

#[tokio::test(start_paused = true)]
async fn speaking_reaches_peers_and_the_directory() {
    let harness = Harness::new(3).await;
    let mut host = harness.open("h").await;
    host.wait("host mic", |v| v.muted.is_some()).await;
    let mut s1 = harness.joined("s1", Role::Speaker).await;
    s1.wait("s1 mic", |v| v.muted.is_some()).await;
    host.wait("connected", |v| v.connected_links() == 1).await;

    let s1_pid = harness.pid("s1").await;
    let track = harness.transport.last_track().unwrap();
    track.set_level(0.4);

    s1.expect("local speaking", |e| {
        matches!(e, RoomEvent::SpeakingChanged { speaking: true, .. })
    })
    .await;
    let pid = s1_pid.clone();
    host.expect("remote speaking", move |e| {
        matches!(e, RoomEvent::SpeakingChanged { participant_id, speaking: true } if *participant_id == pid)
    })
    .await;
    host.wait("speaking list", |v| v.speaking == vec![s1_pid.clone()])
        .await;
    time::sleep(Duration::from_secs(2)).await;
    assert!(harness.directory.participant(ROOM, "s1").await.unwrap().is_speaking);

    track.set_level(0.0);
    let pid = s1_pid.clone();
    host.expect("remote silence", move |e| {
        matches!(e, RoomEvent::SpeakingChanged { participant_id, speaking: false } if *participant_id == pid)
    })
    .await;
    time::sleep(Duration::from_secs(2)).await;
    assert!(!harness.directory.participant(ROOM, "s1").await.unwrap().is_speaking);
}

#[tokio::test(start_paused = true)]
async fn muted_track_reads_as_silence() {
    let harness = Harness::new(3).await;
    let mut s1 = harness.joined("s1", Role::Speaker).await;
    s1.wait("s1 mic", |v| v.muted.is_some()).await;
    let track = harness.transport.last_track().unwrap();
    s1.handle.set_muted(true).await.unwrap();
    track.set_level(0.9);
    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(track.audio_level(), 0.0);
    while let Ok(event) = s1.events.try_recv() {
        assert!(!matches!(event, RoomEvent::SpeakingChanged { speaking: true, .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn ended_room_tears_everyone_down() {
    let harness = Harness::new(3).await;
    let mut host = harness.open("h").await;
    let mut s1 = harness.joined("s1", Role::Speaker).await;
    host.wait("connected", |v| v.connected_links() == 1).await;

    harness.directory.set_room_status(ROOM, RoomStatus::Ended).await;
    for client in [&mut host, &mut s1] {
        client.expect("ended", |e| matches!(e, RoomEvent::RoomEnded)).await;
        let view = client.view().await;
        assert_eq!(view.phase, LocalPhase::Absent);
        assert!(view.links.is_empty());
    }
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.transport.open_connections(), 0);
    assert!(matches!(
        s1.handle.join(Role::Listener).await,
        Err(RoomError::RoomNotLive)
    ));
}

#[tokio::test(start_paused = true)]
async fn external_removal_ends_the_session() {
    let harness = Harness::new(3).await;
    let mut s1 = harness.joined("s1", Role::Speaker).await;
    harness
        .directory
        .remove_participant(&harness.pid("s1").await)
        .await;
    s1.expect("removed", |e| matches!(e, RoomEvent::LocalRoleChanged { role: None }))
        .await;
    let view = s1.view().await;
    assert_eq!(view.phase, LocalPhase::Absent);
    assert_eq!(view.muted, None);
}

#[tokio::test(start_paused = true)]
async fn shutdown_keeps_the_row_for_resume() {
    let harness = Harness::new(3).await;
    let s1 = harness.joined("s1", Role::Speaker).await;
    let pid = harness.pid("s1").await;
    s1.handle.shutdown().await.unwrap();
    assert!(matches!(s1.handle.view().await, Err(RoomError::ActorStopped)));
    assert_eq!(harness.directory.write_count(WriteKind::Leave).await, 0);

    let again = harness.open("s1").await;
    let view = again
        .wait("resumed", |v| v.phase == LocalPhase::Joined(Role::Speaker))
        .await;
    assert_eq!(view.local_participant_id, Some(pid));
}

#[tokio::test(start_paused = true)]
async fn failed_join_write_leaves_the_client_absent() {
    let harness = Harness::new(3).await;
    let client = harness.open("s1").await;

    harness.directory.set_failing(WriteKind::Join, true).await;
    assert!(matches!(
        client.handle.join(Role::Speaker).await,
        Err(RoomError::DirectoryWriteFailed(_))
    ));
    let view = client.view().await;
    assert_eq!(view.phase, LocalPhase::Absent);
    assert_eq!(view.local_participant_id, None);
    assert_eq!(view.muted, None);
    assert!(harness.directory.participant(ROOM, "s1").await.is_none());

    harness.directory.set_failing(WriteKind::Join, false).await;
    assert_eq!(client.handle.join(Role::Speaker).await.unwrap(), Role::Speaker);
    client
        .wait("joined", |v| v.phase == LocalPhase::Joined(Role::Speaker))
        .await;
}

#[tokio::test(start_paused = true)]
async fn failed_leave_write_restores_the_session() {
    let harness = Harness::new(3).await;
    let host = harness.open("h").await;
    let s1 = harness.joined("s1", Role::Speaker).await;
    s1.wait("linked to host", |v| v.connected_links() == 1).await;
    let h_pid = harness.pid("h").await;
    let s1_pid = harness.pid("s1").await;

    harness.directory.set_failing(WriteKind::Leave, true).await;
    assert!(matches!(
        s1.handle.leave().await,
        Err(RoomError::DirectoryWriteFailed(_))
    ));
    let view = s1
        .wait("session restored", |v| {
            v.phase == LocalPhase::Joined(Role::Speaker)
                && v.signaling_available
                && v.muted == Some(false)
                && v.link(&h_pid).is_some()
        })
        .await;
    assert_eq!(view.local_participant_id, Some(s1_pid.clone()));
    assert!(harness.directory.participant(ROOM, "s1").await.is_some());
    assert!(host
        .view()
        .await
        .participants
        .iter()
        .any(|p| p.id == s1_pid));

    harness.directory.set_failing(WriteKind::Leave, false).await;
    s1.handle.leave().await.unwrap();
    assert_eq!(s1.view().await.phase, LocalPhase::Absent);
    assert!(harness.directory.participant(ROOM, "s1").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_role_change_keeps_viewers_and_requests() {
    let harness = Harness::new(3).await;
    let host = harness.open("h").await;
    host.wait("host joined", |v| v.phase == LocalPhase::Joined(Role::Host))
        .await;
    let mut viewer = harness.joined("v", Role::Viewer).await;
    let _w = harness.joined("w", Role::Viewer).await;
    viewer.handle.request_to_speak().await.unwrap();
    host.wait("request visible", |v| {
        v.speak_requests == vec!["v".to_string()] && v.participants.len() == 3
    })
    .await;

    harness.directory.set_failing(WriteKind::RoleChange, true).await;
    assert!(matches!(
        host.handle.promote("v").await,
        Err(RoomError::DirectoryWriteFailed(_))
    ));
    assert!(matches!(
        host.handle.invite("w").await,
        Err(RoomError::DirectoryWriteFailed(_))
    ));

    time::sleep(Duration::from_millis(200)).await;
    let view = host.view().await;
    assert_eq!(view.speak_requests, vec!["v".to_string()]);
    for profile in ["v", "w"] {
        let role = view
            .participants
            .iter()
            .find(|p| p.profile_id == profile)
            .map(|p| p.role);
        assert_eq!(role, Some(Role::Viewer));
    }
    assert_eq!(viewer.view().await.phase, LocalPhase::Joined(Role::Viewer));
    while let Ok(event) = viewer.events.try_recv() {
        assert!(!matches!(
            event,
            RoomEvent::LocalRoleChanged { role: Some(Role::Speaker) }
        ));
    }

    harness.directory.set_failing(WriteKind::RoleChange, false).await;
    host.handle.promote("v").await.unwrap();
    viewer
        .expect("promoted", |e| {
            matches!(e, RoomEvent::LocalRoleChanged { role: Some(Role::Speaker) })
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn host_departure_keeps_the_speaker_link() {
    let harness = Harness::new(3).await;
    let host = harness.open("h").await;
    let s1 = harness.joined("s1", Role::Speaker).await;
    let s2 = harness.joined("s2", Role::Speaker).await;
    for (name, client) in [("h", &host), ("s1", &s1), ("s2", &s2)] {
        client
            .wait(&format!("{name} fully connected"), |v| v.connected_links() == 2)
            .await;
    }
    let h_pid = harness.pid("h").await;
    let s2_pid = harness.pid("s2").await;
    let before = s1.view().await.link(&s2_pid).cloned().unwrap();
    let created = harness.transport.connections_created();

    host.handle.leave().await.unwrap();
    for (name, client) in [("s1", &s1), ("s2", &s2)] {
        client
            .wait(&format!("{name} drops the host"), |v| v.link(&h_pid).is_none())
            .await;
    }

    let after = s1.view().await.link(&s2_pid).cloned().unwrap();
    assert_eq!(after.state, NegotiationState::Connected);
    assert_eq!(after.attempt, before.attempt);
    assert_eq!(s2.view().await.connected_links(), 1);
    assert_eq!(harness.transport.connections_created(), created);
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.transport.open_connections(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_signaling_subscribe_does_not_stall_the_room() {
    let harness = Harness::new(3).await;
    let signaling = Arc::new(SlowSignaling {
        inner: harness.hub.endpoint(),
        lock: Mutex::new(()),
        join_delay: Duration::from_secs(5),
    });
    let client = harness.open_with("l", signaling).await;
    client.handle.join(Role::Listener).await.unwrap();
    client
        .wait("joined", |v| v.phase == LocalPhase::Joined(Role::Listener))
        .await;
    assert!(!client.view().await.signaling_available);

    // The subscribe still holds the signaling lock here.
    time::timeout(Duration::from_secs(1), client.handle.leave())
        .await
        .expect("leave stalled behind the subscribe")
        .unwrap();
    let view = time::timeout(Duration::from_secs(1), client.view())
        .await
        .expect("room stalled behind the unsubscribe");
    assert_eq!(view.phase, LocalPhase::Absent);

    client.handle.join(Role::Listener).await.unwrap();
    client
        .wait("signaling after rejoin", |v| {
            v.phase == LocalPhase::Joined(Role::Listener) && v.signaling_available
        })
        .await;
}
