//! In-process directory used by the demo and the test-suite.
//!
//! Enforces the data-model invariants the hosted backend enforces with
//! constraints: one active row per profile and room, one host, speakers
//! bounded by `max_speakers`. Every successful write publishes a fresh
//! snapshot to the room's subscribers, in write order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorus_common::{new_id, RoomError};
use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use super::types::{Participant, Role, Room, RoomSnapshot, RoomStatus};
use super::ParticipantDirectory;

/// Write operations that can be made to fail or counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Join,
    Leave,
    RoleChange,
    Muted,
    Speaking,
    SpeakRequest,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, Room>,
    participants: Vec<Participant>,
    speak_requests: HashMap<String, BTreeSet<String>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<RoomSnapshot>>>,
    failing: HashSet<WriteKind>,
    write_counts: HashMap<WriteKind, usize>,
    latency: Duration,
}

impl Inner {
    fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let mut room = self.rooms.get(room_id)?.clone();
        let participants: Vec<Participant> = self
            .participants
            .iter()
            .filter(|p| p.room_id == room_id)
            .cloned()
            .collect();
        room.recount(&participants);
        Some(RoomSnapshot {
            room,
            participants,
            speak_requests: self.speak_requests.get(room_id).cloned().unwrap_or_default(),
        })
    }

    fn publish(&mut self, room_id: &str) {
        let Some(snapshot) = self.snapshot(room_id) else {
            return;
        };
        if let Some(subs) = self.subscribers.get_mut(room_id) {
            subs.retain(|tx| match tx.try_send(snapshot.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(room_id, "Directory subscriber lagging, snapshot dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    fn check(&mut self, kind: WriteKind) -> Result<(), RoomError> {
        if self.failing.contains(&kind) {
            return Err(RoomError::DirectoryWriteFailed(format!(
                "injected {kind:?} failure"
            )));
        }
        Ok(())
    }

    fn record(&mut self, kind: WriteKind, room_id: &str) {
        *self.write_counts.entry(kind).or_default() += 1;
        self.publish(room_id);
    }

    fn active_mut(&mut self, participant_id: &str) -> Result<&mut Participant, RoomError> {
        self.participants
            .iter_mut()
            .find(|p| p.id == participant_id && p.is_active())
            .ok_or_else(|| RoomError::ParticipantNotFound(participant_id.to_string()))
    }
}

/// Cheap to clone; clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_room(&self, room: Room) {
        let mut inner = self.inner.write().await;
        let room_id = room.id.clone();
        inner.rooms.insert(room_id.clone(), room);
        inner.publish(&room_id);
    }

    pub async fn set_room_status(&self, room_id: &str, status: RoomStatus) {
        let mut inner = self.inner.write().await;
        if let Some(room) = inner.rooms.get_mut(room_id) {
            room.status = status;
        }
        inner.publish(room_id);
    }

    /// Mark a participant departed without going through its own client.
    pub async fn remove_participant(&self, participant_id: &str) {
        let mut inner = self.inner.write().await;
        let room_id = match inner.active_mut(participant_id) {
            Ok(p) => {
                p.left_at = Some(Utc::now());
                p.room_id.clone()
            }
            Err(_) => return,
        };
        inner.publish(&room_id);
    }

    pub async fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        self.inner.read().await.snapshot(room_id)
    }

    /// Active row of `profile_id` in `room_id`.
    pub async fn participant(&self, room_id: &str, profile_id: &str) -> Option<Participant> {
        self.inner
            .read()
            .await
            .participants
            .iter()
            .find(|p| p.room_id == room_id && p.profile_id == profile_id && p.is_active())
            .cloned()
    }

    /// Make every subsequent write of `kind` fail until cleared.
    pub async fn set_failing(&self, kind: WriteKind, failing: bool) {
        let mut inner = self.inner.write().await;
        if failing {
            inner.failing.insert(kind);
        } else {
            inner.failing.remove(&kind);
        }
    }

    /// Delay applied to every write before it takes effect.
    pub async fn set_latency(&self, latency: Duration) {
        self.inner.write().await.latency = latency;
    }

    /// Number of successful writes of `kind`.
    pub async fn write_count(&self, kind: WriteKind) -> usize {
        self.inner
            .read()
            .await
            .write_counts
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    async fn delay(&self) {
        let latency = self.inner.read().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn update_participant(
        &self,
        kind: WriteKind,
        participant_id: &str,
        apply: impl FnOnce(&mut Participant) + Send,
    ) -> Result<(), RoomError> {
        self.delay().await;
        let mut inner = self.inner.write().await;
        inner.check(kind)?;
        let participant = inner.active_mut(participant_id)?;
        apply(participant);
        let room_id = participant.room_id.clone();
        inner.record(kind, &room_id);
        Ok(())
    }
}

#[async_trait]
impl ParticipantDirectory for MemoryDirectory {
    async fn subscribe_room(
        &self,
        room_id: &str,
    ) -> Result<mpsc::Receiver<RoomSnapshot>, RoomError> {
        let mut inner = self.inner.write().await;
        let snapshot = inner
            .snapshot(room_id)
            .ok_or_else(|| RoomError::DirectoryReadFailed(format!("no such room: {room_id}")))?;
        let (tx, rx) = mpsc::channel(64);
        let _ = tx.try_send(snapshot);
        inner
            .subscribers
            .entry(room_id.to_string())
            .or_default()
            .push(tx);
        debug!(room_id, "Directory subscription opened");
        Ok(rx)
    }

    async fn write_join(
        &self,
        room_id: &str,
        profile_id: &str,
        role: Role,
    ) -> Result<Participant, RoomError> {
        self.delay().await;
        let mut inner = self.inner.write().await;
        inner.check(WriteKind::Join)?;

        let snapshot = inner
            .snapshot(room_id)
            .ok_or_else(|| RoomError::DirectoryWriteFailed(format!("no such room: {room_id}")))?;
        if snapshot.room.status == RoomStatus::Ended {
            return Err(RoomError::DirectoryWriteFailed("room has ended".into()));
        }
        let active = || snapshot.active_participants();
        if active().any(|p| p.profile_id == profile_id) {
            return Err(RoomError::DirectoryWriteFailed(format!(
                "{profile_id} already has an active row"
            )));
        }
        match role {
            Role::Host if active().any(|p| p.role == Role::Host) => {
                return Err(RoomError::DirectoryWriteFailed(
                    "room already has a host".into(),
                ));
            }
            Role::Speaker if !snapshot.room.has_speaker_slot() => {
                return Err(RoomError::DirectoryWriteFailed(
                    "speaker capacity exceeded".into(),
                ));
            }
            _ => {}
        }

        let participant = Participant {
            id: new_id(),
            profile_id: profile_id.to_string(),
            room_id: room_id.to_string(),
            role,
            is_muted: false,
            is_speaking: false,
            joined_at: Utc::now(),
            left_at: None,
        };
        inner.participants.push(participant.clone());
        inner.record(WriteKind::Join, room_id);
        Ok(participant)
    }

    async fn write_leave(&self, participant_id: &str) -> Result<(), RoomError> {
        self.update_participant(WriteKind::Leave, participant_id, |p| {
            p.left_at = Some(Utc::now());
            p.is_speaking = false;
        })
        .await
    }

    async fn write_role_change(&self, participant_id: &str, role: Role) -> Result<(), RoomError> {
        if role == Role::Speaker {
            let inner = self.inner.read().await;
            let room_id = inner
                .participants
                .iter()
                .find(|p| p.id == participant_id && p.is_active())
                .map(|p| p.room_id.clone());
            if let Some(snapshot) = room_id.and_then(|id| inner.snapshot(&id)) {
                if !snapshot.room.has_speaker_slot() {
                    return Err(RoomError::DirectoryWriteFailed(
                        "speaker capacity exceeded".into(),
                    ));
                }
            }
        }
        self.update_participant(WriteKind::RoleChange, participant_id, move |p| {
            p.role = role;
            if !role.transmits() {
                p.is_speaking = false;
            }
        })
        .await
    }

    async fn write_muted(&self, participant_id: &str, muted: bool) -> Result<(), RoomError> {
        self.update_participant(WriteKind::Muted, participant_id, move |p| {
            p.is_muted = muted;
        })
        .await
    }

    async fn write_speaking(&self, participant_id: &str, speaking: bool) -> Result<(), RoomError> {
        self.update_participant(WriteKind::Speaking, participant_id, move |p| {
            p.is_speaking = speaking;
        })
        .await
    }

    async fn write_speak_request(&self, room_id: &str, profile_id: &str) -> Result<(), RoomError> {
        self.delay().await;
        let mut inner = self.inner.write().await;
        inner.check(WriteKind::SpeakRequest)?;
        inner
            .speak_requests
            .entry(room_id.to_string())
            .or_default()
            .insert(profile_id.to_string());
        inner.record(WriteKind::SpeakRequest, room_id);
        Ok(())
    }

    async fn clear_speak_request(&self, room_id: &str, profile_id: &str) -> Result<(), RoomError> {
        self.delay().await;
        let mut inner = self.inner.write().await;
        inner.check(WriteKind::SpeakRequest)?;
        if let Some(requests) = inner.speak_requests.get_mut(room_id) {
            requests.remove(profile_id);
        }
        inner.record(WriteKind::SpeakRequest, room_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn live_room(dir: &MemoryDirectory, max_speakers: u32) {
        let mut room = Room::new("room-1", "Test room", max_speakers);
        room.status = RoomStatus::Live;
        dir.create_room(room).await;
    }

    #[tokio::test]
    async fn subscribe_delivers_current_state_first() {
        let dir = MemoryDirectory::new();
        live_room(&dir, 2).await;
        dir.write_join("room-1", "u-host", Role::Host).await.unwrap();

        let mut rx = dir.subscribe_room("room-1").await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.room.participant_count, 1);
        assert_eq!(first.participants[0].role, Role::Host);
    }

    #[tokio::test]
    async fn subscribe_to_unknown_room_fails() {
        let dir = MemoryDirectory::new();
        let err = dir.subscribe_room("nope").await.unwrap_err();
        assert!(matches!(err, RoomError::DirectoryReadFailed(_)));
    }

    #[tokio::test]
    async fn second_active_row_for_profile_is_rejected() {
        let dir = MemoryDirectory::new();
        live_room(&dir, 2).await;
        dir.write_join("room-1", "u-1", Role::Listener).await.unwrap();
        let err = dir
            .write_join("room-1", "u-1", Role::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::DirectoryWriteFailed(_)));
    }

    #[tokio::test]
    async fn speaker_capacity_is_enforced() {
        let dir = MemoryDirectory::new();
        live_room(&dir, 1).await;
        dir.write_join("room-1", "u-1", Role::Speaker).await.unwrap();
        assert!(dir.write_join("room-1", "u-2", Role::Speaker).await.is_err());

        let viewer = dir.write_join("room-1", "u-3", Role::Viewer).await.unwrap();
        assert!(dir
            .write_role_change(&viewer.id, Role::Speaker)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn leave_then_rejoin_creates_a_new_row() {
        let dir = MemoryDirectory::new();
        live_room(&dir, 2).await;
        let first = dir.write_join("room-1", "u-1", Role::Listener).await.unwrap();
        dir.write_leave(&first.id).await.unwrap();
        let second = dir.write_join("room-1", "u-1", Role::Listener).await.unwrap();
        assert_ne!(first.id, second.id);

        let snapshot = dir.snapshot("room-1").await.unwrap();
        assert_eq!(snapshot.participants.len(), 2);
        assert_eq!(snapshot.room.participant_count, 1);
    }

    #[tokio::test]
    async fn injected_failure_leaves_rows_untouched() {
        let dir = MemoryDirectory::new();
        live_room(&dir, 2).await;
        let p = dir.write_join("room-1", "u-1", Role::Speaker).await.unwrap();

        dir.set_failing(WriteKind::Muted, true).await;
        assert!(dir.write_muted(&p.id, true).await.is_err());
        assert!(!dir.participant("room-1", "u-1").await.unwrap().is_muted);
        assert_eq!(dir.write_count(WriteKind::Muted).await, 0);

        dir.set_failing(WriteKind::Muted, false).await;
        dir.write_muted(&p.id, true).await.unwrap();
        assert!(dir.participant("room-1", "u-1").await.unwrap().is_muted);
        assert_eq!(dir.write_count(WriteKind::Muted).await, 1);
    }

    #[tokio::test]
    async fn speak_requests_appear_in_snapshots() {
        let dir = MemoryDirectory::new();
        live_room(&dir, 2).await;
        let mut rx = dir.subscribe_room("room-1").await.unwrap();
        let _ = rx.recv().await;

        dir.write_speak_request("room-1", "u-9").await.unwrap();
        let snapshot = rx.recv().await.unwrap();
        assert!(snapshot.speak_requests.contains("u-9"));

        dir.clear_speak_request("room-1", "u-9").await.unwrap();
        let snapshot = rx.recv().await.unwrap();
        assert!(snapshot.speak_requests.is_empty());
    }
}
