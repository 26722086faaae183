use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorus_common::RoomError;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::directory::{Participant, Role};
use crate::media::{MediaConnection, RemoteStream};
use crate::protocol::{IceCandidate, SignalPayload};

const TIMEOUT: Duration = Duration::from_secs(15);

struct StubConnection;

#[async_trait]
impl MediaConnection for StubConnection {
    async fn create_offer(&self) -> Result<String, RoomError> {
        Ok("v=0 offer".into())
    }
    async fn accept_offer(&self, _sdp: &str) -> Result<String, RoomError> {
        Ok("v=0 answer".into())
    }
    async fn accept_answer(&self, _sdp: &str) -> Result<(), RoomError> {
        Ok(())
    }
    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), RoomError> {
        Ok(())
    }
    async fn close(&self) {}
}

fn stub() -> Arc<dyn MediaConnection> {
    Arc::new(StubConnection)
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 1 127.0.0.1 {n} typ host"),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
    }
}

fn participant(profile: &str, role: Role) -> Participant {
    Participant {
        id: format!("p-{profile}"),
        profile_id: profile.into(),
        room_id: "room-1".into(),
        role,
        is_muted: false,
        is_speaking: false,
        joined_at: Utc::now(),
        left_at: None,
    }
}

/// H < S1 < S2 by profile id, plus a listener.
fn scenario() -> Vec<Participant> {
    vec![
        participant("h", Role::Host),
        participant("s1", Role::Speaker),
        participant("s2", Role::Speaker),
        participant("zl", Role::Listener),
    ]
}

fn manager(profile: &str) -> MeshManager {
    let mut mesh = MeshManager::new(profile, TIMEOUT, 1);
    mesh.start_session(&format!("p-{profile}"), CancellationToken::new());
    mesh
}

fn target(profile: &str) -> PeerTarget {
    PeerTarget {
        participant_id: format!("p-{profile}"),
        profile_id: profile.into(),
    }
}

fn names(actions: &[MeshAction]) -> Vec<String> {
    actions.iter().map(|a| format!("{a:?}")).collect()
}

fn sent(actions: &[MeshAction]) -> Vec<&crate::protocol::SignalingMessage> {
    actions
        .iter()
        .filter_map(|a| match a {
            MeshAction::Send(msg) => Some(msg),
            _ => None,
        })
        .collect()
}

// -- plan -----------------------------------------------------------------

#[test]
fn listener_plans_no_links() {
    let rows = scenario();
    let local = rows.iter().find(|p| p.profile_id == "zl");
    let plan = plan(&rows, local, true, &HashSet::new());
    assert!(plan.is_empty());
}

#[test]
fn host_plans_links_to_every_speaker_but_not_listeners() {
    let rows = scenario();
    let local = rows.iter().find(|p| p.profile_id == "h");
    let plan = plan(&rows, local, true, &HashSet::new());
    let ids: Vec<&str> = plan.create.iter().map(|t| t.participant_id.as_str()).collect();
    assert_eq!(ids, vec!["p-s1", "p-s2"]);
    assert!(plan.close.is_empty());
}

#[test]
fn no_links_without_microphone() {
    let rows = scenario();
    let local = rows.iter().find(|p| p.profile_id == "s1");
    assert!(plan(&rows, local, false, &HashSet::new()).is_empty());
}

#[test]
fn demoted_peer_is_closed_and_not_recreated() {
    let mut rows = scenario();
    rows[2].role = Role::Listener;
    let existing: HashSet<String> = ["p-h".to_string(), "p-s2".to_string()].into();
    let local = rows.iter().find(|p| p.profile_id == "s1");
    let plan = plan(&rows, local, true, &existing);
    assert!(plan.create.is_empty());
    assert_eq!(plan.close, vec!["p-s2".to_string()]);
}

#[test]
fn departed_peer_is_closed() {
    let mut rows = scenario();
    rows[0].left_at = Some(Utc::now());
    let existing: HashSet<String> = ["p-h".to_string(), "p-s2".to_string()].into();
    let local = rows.iter().find(|p| p.profile_id == "s1");
    let plan = plan(&rows, local, true, &existing);
    assert_eq!(plan.close, vec!["p-h".to_string()]);
}

#[test]
fn scenario_has_one_deterministic_offerer_per_pair() {
    let rows = scenario();
    let now = Instant::now();
    let profiles = ["h", "s1", "s2"];
    let mut meshes: Vec<MeshManager> = profiles.iter().map(|p| manager(p)).collect();
    for (mesh, profile) in meshes.iter_mut().zip(profiles) {
        let local = rows.iter().find(|p| p.profile_id == profile);
        let plan = mesh.plan(&rows, local, true);
        mesh.apply(plan, now);
    }

    let role = |mesh: &MeshManager, remote: &str| mesh.link(remote).map(|l| l.role);
    assert_eq!(role(&meshes[0], "p-s1"), Some(LinkRole::Offerer));
    assert_eq!(role(&meshes[0], "p-s2"), Some(LinkRole::Offerer));
    assert_eq!(role(&meshes[1], "p-h"), Some(LinkRole::Answerer));
    assert_eq!(role(&meshes[1], "p-s2"), Some(LinkRole::Offerer));
    assert_eq!(role(&meshes[2], "p-h"), Some(LinkRole::Answerer));
    assert_eq!(role(&meshes[2], "p-s1"), Some(LinkRole::Answerer));

    let total: usize = meshes.iter().map(MeshManager::len).sum();
    assert_eq!(total, 6, "three links, seen from both ends");
}

// -- negotiation ----------------------------------------------------------

#[test]
fn offerer_creates_connection_then_sends_offer() {
    let now = Instant::now();
    let mut h = manager("h");

    let actions = h.create_link(&target("s1"), now);
    assert_eq!(names(&actions), vec!["CreateConnection(p-s1, 0)"]);

    let actions = h.connection_created("p-s1", 0, Ok(stub()), now);
    assert_eq!(names(&actions), vec!["CreateOffer(p-s1, 0)"]);
    assert_eq!(h.link("p-s1").unwrap().state, NegotiationState::Offering);

    let actions = h.offer_created("p-s1", 0, Ok("v=0 offer".into()), now);
    let msgs = sent(&actions);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].from, "p-h");
    assert_eq!(msgs[0].to.as_deref(), Some("p-s1"));
    assert!(matches!(msgs[0].payload, SignalPayload::Offer { attempt: 0, .. }));
}

#[test]
fn answerer_holds_early_offer_until_connection_exists() {
    let now = Instant::now();
    let mut s1 = manager("s1");
    s1.create_link(&target("h"), now);

    assert!(s1.on_remote_offer("p-h", 0, "v=0 offer".into(), now).is_empty());
    let actions = s1.connection_created("p-h", 0, Ok(stub()), now);
    assert_eq!(names(&actions), vec!["AcceptOffer(p-h, 0)"]);

    let actions = s1.answer_created("p-h", 0, Ok("v=0 answer".into()), now);
    let msgs = sent(&actions);
    assert!(matches!(msgs[0].payload, SignalPayload::Answer { attempt: 0, .. }));
}

#[test]
fn duplicate_offer_is_ignored() {
    let now = Instant::now();
    let mut s1 = manager("s1");
    s1.create_link(&target("h"), now);
    s1.connection_created("p-h", 0, Ok(stub()), now);

    let first = s1.on_remote_offer("p-h", 0, "v=0 offer".into(), now);
    assert_eq!(names(&first), vec!["AcceptOffer(p-h, 0)"]);
    assert!(s1.on_remote_offer("p-h", 0, "v=0 offer".into(), now).is_empty());
}

#[test]
fn offer_received_by_offerer_is_ignored() {
    let now = Instant::now();
    let mut h = manager("h");
    h.create_link(&target("s1"), now);
    h.connection_created("p-s1", 0, Ok(stub()), now);
    assert!(h.on_remote_offer("p-s1", 0, "v=0 offer".into(), now).is_empty());
    assert_eq!(h.link("p-s1").unwrap().state, NegotiationState::Offering);
}

#[test]
fn candidates_wait_for_remote_description() {
    let now = Instant::now();
    let mut h = manager("h");
    h.create_link(&target("s1"), now);
    h.connection_created("p-s1", 0, Ok(stub()), now);
    h.offer_created("p-s1", 0, Ok("v=0 offer".into()), now);

    assert!(h.on_remote_candidate("p-s1", 0, candidate(1)).is_empty());
    assert!(h.on_remote_candidate("p-s1", 0, candidate(2)).is_empty());

    let actions = h.on_remote_answer("p-s1", 0, "v=0 answer".into());
    assert_eq!(names(&actions), vec!["AcceptAnswer(p-s1, 0)"]);
    assert!(h.on_remote_answer("p-s1", 0, "v=0 answer".into()).is_empty());

    let actions = h.remote_description_applied("p-s1", 0, Ok(()), now);
    assert_eq!(names(&actions), vec!["AddCandidates(p-s1, 0, 2)"]);

    let actions = h.on_remote_candidate("p-s1", 0, candidate(3));
    assert_eq!(names(&actions), vec!["AddCandidates(p-s1, 0, 1)"]);
}

#[test]
fn signals_for_other_attempts_are_ignored() {
    let now = Instant::now();
    let mut h = manager("h");
    h.create_link(&target("s1"), now);
    h.connection_created("p-s1", 0, Ok(stub()), now);
    h.offer_created("p-s1", 0, Ok("v=0 offer".into()), now);
    assert!(h.on_remote_answer("p-s1", 1, "v=0 answer".into()).is_empty());
    assert!(h.on_local_candidate("p-s1", 3, candidate(1)).is_empty());
}

#[test]
fn connected_link_exposes_stream_and_clears_deadline() {
    let now = Instant::now();
    let mut h = manager("h");
    h.create_link(&target("s1"), now);
    let stream = RemoteStream {
        participant_id: "p-s1".into(),
        stream_id: "s".into(),
    };
    let actions = h.on_connected("p-s1", 0, stream.clone());
    assert_eq!(names(&actions), vec!["StreamAdded(p-s1)"]);
    assert_eq!(h.remote_stream("p-s1"), Some(&stream));
    assert!(h.check_deadlines(now + TIMEOUT * 4).is_empty());

    let actions = h.remove_link("p-s1");
    assert_eq!(names(&actions), vec!["StreamRemoved(p-s1)"]);
    assert!(h.is_empty());
}

// -- failure and retry ----------------------------------------------------

#[test]
fn timeout_retries_once_with_swapped_roles_then_degrades() {
    let t0 = Instant::now();
    let mut h = manager("h");
    h.create_link(&target("s1"), t0);
    h.connection_created("p-s1", 0, Ok(stub()), t0);

    assert!(h.check_deadlines(t0 + Duration::from_secs(14)).is_empty());

    let actions = h.check_deadlines(t0 + Duration::from_secs(16));
    assert_eq!(names(&actions), vec!["Close", "CreateConnection(p-s1, 1)"]);
    let link = h.link("p-s1").unwrap();
    assert_eq!(link.attempt, 1);
    assert_eq!(link.role, LinkRole::Answerer);

    let actions = h.check_deadlines(t0 + Duration::from_secs(32));
    assert_eq!(names(&actions).len(), 1);
    match &actions[0] {
        MeshAction::Degraded { participant_id, error } => {
            assert_eq!(participant_id, "p-s1");
            assert_eq!(
                *error,
                RoomError::NegotiationTimeout {
                    participant_id: "p-s1".into(),
                    attempt: 1
                }
            );
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.link("p-s1").unwrap().state, NegotiationState::Failed);

    // The failed link is kept, so reconciliation does not recreate it.
    let rows = scenario();
    let local = rows.iter().find(|p| p.profile_id == "h");
    assert!(!h
        .plan(&rows, local, true)
        .create
        .iter()
        .any(|t| t.participant_id == "p-s1"));
    assert!(h.check_deadlines(t0 + Duration::from_secs(100)).is_empty());
}

#[test]
fn transport_failure_triggers_retry() {
    let now = Instant::now();
    let mut h = manager("h");
    h.create_link(&target("s1"), now);
    h.connection_created("p-s1", 0, Ok(stub()), now);
    let error = RoomError::NegotiationFailed {
        participant_id: "p-s1".into(),
        reason: "ice failed".into(),
    };
    let actions = h.on_failure("p-s1", 0, error.clone(), now);
    assert_eq!(names(&actions), vec!["Close", "CreateConnection(p-s1, 1)"]);
    // A repeated report for the old attempt changes nothing.
    assert!(h.on_failure("p-s1", 0, error, now).is_empty());
}

#[test]
fn failed_connection_creation_retries_at_once() {
    let now = Instant::now();
    let mut h = manager("h");
    h.create_link(&target("s1"), now);
    let error = RoomError::NegotiationFailed {
        participant_id: "p-s1".into(),
        reason: "no local microphone".into(),
    };

    let actions = h.connection_created("p-s1", 0, Err(error.clone()), now);
    assert_eq!(names(&actions), vec!["CreateConnection(p-s1, 1)"]);
    assert_eq!(h.link("p-s1").unwrap().attempt, 1);

    let actions = h.connection_created("p-s1", 1, Err(error), now);
    assert!(matches!(actions.as_slice(), [MeshAction::Degraded { .. }]));
    assert_eq!(h.link("p-s1").unwrap().state, NegotiationState::Failed);
}

#[test]
fn stale_connection_is_closed() {
    let now = Instant::now();
    let mut h = manager("h");
    h.create_link(&target("s1"), now);
    h.check_deadlines(now + TIMEOUT + Duration::from_secs(1));
    let actions = h.connection_created("p-s1", 0, Ok(stub()), now);
    assert_eq!(names(&actions), vec!["Close"]);

    h.remove_link("p-s1");
    let actions = h.connection_created("p-s1", 1, Ok(stub()), now);
    assert_eq!(names(&actions), vec!["Close"]);
}

#[test]
fn peer_retry_is_adopted_by_the_answerer() {
    let now = Instant::now();
    // s1 offers to s2 on attempt 0 and answers on attempt 1.
    let mut s1 = manager("s1");
    s1.create_link(&target("s2"), now);
    s1.connection_created("p-s2", 0, Ok(stub()), now);

    let actions = s1.on_remote_offer("p-s2", 1, "v=0 retry".into(), now);
    assert_eq!(names(&actions), vec!["Close", "CreateConnection(p-s2, 1)"]);
    let link = s1.link("p-s2").unwrap();
    assert_eq!(link.attempt, 1);
    assert_eq!(link.role, LinkRole::Answerer);

    let actions = s1.connection_created("p-s2", 1, Ok(stub()), now);
    assert_eq!(names(&actions), vec!["AcceptOffer(p-s2, 1)"]);
}

#[test]
fn candidates_from_a_later_attempt_survive_until_adopted() {
    let now = Instant::now();
    let mut s1 = manager("s1");
    s1.create_link(&target("s2"), now);
    s1.connection_created("p-s2", 0, Ok(stub()), now);

    assert!(s1.on_remote_candidate("p-s2", 1, candidate(7)).is_empty());
    s1.on_remote_offer("p-s2", 1, "v=0 retry".into(), now);
    s1.connection_created("p-s2", 1, Ok(stub()), now);
    let actions = s1.answer_created("p-s2", 1, Ok("v=0 answer".into()), now);
    assert_eq!(
        names(&actions),
        vec!["Send(answer -> Some(\"p-s2\"))", "AddCandidates(p-s2, 1, 1)"]
    );
}

#[test]
fn offer_from_unknown_peer_is_buffered() {
    let now = Instant::now();
    let mut s2 = manager("s2");
    assert!(s2.on_remote_offer("p-s1", 0, "v=0 offer".into(), now).is_empty());
    assert!(s2.on_remote_candidate("p-s1", 0, candidate(1)).is_empty());

    s2.create_link(&target("s1"), now);
    let actions = s2.connection_created("p-s1", 0, Ok(stub()), now);
    assert_eq!(names(&actions), vec!["AcceptOffer(p-s1, 0)"]);
    let actions = s2.answer_created("p-s1", 0, Ok("v=0 answer".into()), now);
    assert_eq!(names(&actions).len(), 2);
}

// -- signaling outages ----------------------------------------------------

#[test]
fn suspension_freezes_deadlines() {
    let t0 = Instant::now();
    let mut h = manager("h");
    h.create_link(&target("s1"), t0);

    h.suspend(t0 + Duration::from_secs(5));
    assert!(h.check_deadlines(t0 + Duration::from_secs(20)).is_empty());

    // Ten frozen seconds push the deadline from t0+15 to t0+25.
    assert!(h.resume(t0 + Duration::from_secs(15)).is_empty());
    assert!(h.check_deadlines(t0 + Duration::from_secs(24)).is_empty());
    assert_eq!(
        names(&h.check_deadlines(t0 + Duration::from_secs(26))),
        vec!["CreateConnection(p-s1, 1)"]
    );
}

#[test]
fn links_created_while_suspended_start_on_resume() {
    let now = Instant::now();
    let mut h = manager("h");
    h.suspend(now);
    assert!(h.create_link(&target("s1"), now).is_empty());
    assert_eq!(h.link("p-s1").unwrap().state, NegotiationState::Idle);

    let actions = h.resume(now + Duration::from_secs(60));
    assert_eq!(names(&actions), vec!["CreateConnection(p-s1, 0)"]);
}

#[test]
fn teardown_closes_everything() {
    let now = Instant::now();
    let mut h = manager("h");
    h.create_link(&target("s1"), now);
    h.create_link(&target("s2"), now);
    h.connection_created("p-s1", 0, Ok(stub()), now);
    h.connection_created("p-s2", 0, Ok(stub()), now);

    let actions = h.end_session();
    assert_eq!(names(&actions), vec!["Close", "Close"]);
    assert!(h.is_empty());
    // Without a session nothing is created.
    assert!(h.create_link(&target("s1"), now).is_empty());
}
