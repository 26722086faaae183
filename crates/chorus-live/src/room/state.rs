//! The confirmed room view and the diff between consecutive snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::warn;

use crate::directory::{Participant, Role, Room, RoomSnapshot, RoomStatus};

/// One observable difference between the previous view and a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomChange {
    /// Something in the view changed; always first in a non-empty diff.
    Updated,
    StatusChanged(RoomStatus),
    /// The local profile has an active row it did not have before.
    LocalAppeared(Participant),
    /// The local profile's active row is gone.
    LocalRemoved(Participant),
    LocalRoleChanged { from: Role, to: Role },
    LocalMuteChanged(bool),
    /// A remote participant departed or was dropped from the view.
    ParticipantLeft(String),
}

/// Room, active participants and pending speak requests as last confirmed by
/// the directory.
#[derive(Debug)]
pub struct RoomState {
    local_profile_id: String,
    room: Room,
    /// Active rows keyed by participant id, at most one per profile.
    participants: BTreeMap<String, Participant>,
    speak_requests: BTreeSet<String>,
    seeded: bool,
}

impl RoomState {
    /// Seed the view from the first snapshot of a subscription.
    pub fn new(local_profile_id: &str, first: RoomSnapshot) -> (Self, Vec<RoomChange>) {
        let mut state = Self {
            local_profile_id: local_profile_id.to_string(),
            room: first.room.clone(),
            participants: BTreeMap::new(),
            speak_requests: BTreeSet::new(),
            seeded: false,
        };
        let changes = state.apply(first);
        (state, changes)
    }

    /// Replace the view with `snapshot` and report what changed. Applying
    /// the same snapshot twice yields no changes the second time.
    pub fn apply(&mut self, snapshot: RoomSnapshot) -> Vec<RoomChange> {
        let RoomSnapshot {
            mut room,
            participants,
            speak_requests,
        } = snapshot;

        if room.id != self.room.id {
            warn!(room_id = %self.room.id, other = %room.id, "Snapshot for another room ignored");
            return Vec::new();
        }
        if room.status < self.room.status {
            warn!(
                room_id = %room.id,
                current = %self.room.status,
                received = %room.status,
                "Room status moved backwards, keeping current"
            );
            room.status = self.room.status;
        }

        let participants = dedupe(&room.id, participants);
        room.recount(participants.values());

        if self.seeded
            && room == self.room
            && participants == self.participants
            && speak_requests == self.speak_requests
        {
            return Vec::new();
        }

        self.seeded = true;
        let mut changes = vec![RoomChange::Updated];
        if room.status != self.room.status {
            changes.push(RoomChange::StatusChanged(room.status));
        }

        let old_local = self.local().cloned();
        let left: Vec<String> = self
            .participants
            .values()
            .filter(|p| p.profile_id != self.local_profile_id && !participants.contains_key(&p.id))
            .map(|p| p.id.clone())
            .collect();

        self.room = room;
        self.participants = participants;
        self.speak_requests = speak_requests;

        match (old_local, self.local().cloned()) {
            (None, Some(new)) => changes.push(RoomChange::LocalAppeared(new)),
            (Some(old), None) => changes.push(RoomChange::LocalRemoved(old)),
            (Some(old), Some(new)) if old.id != new.id => {
                changes.push(RoomChange::LocalRemoved(old));
                changes.push(RoomChange::LocalAppeared(new));
            }
            (Some(old), Some(new)) => {
                if old.role != new.role {
                    changes.push(RoomChange::LocalRoleChanged {
                        from: old.role,
                        to: new.role,
                    });
                }
                if old.is_muted != new.is_muted {
                    changes.push(RoomChange::LocalMuteChanged(new.is_muted));
                }
            }
            (None, None) => {}
        }
        changes.extend(left.into_iter().map(RoomChange::ParticipantLeft));
        changes
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    /// Active participants ordered by id.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.get(participant_id)
    }

    pub fn by_profile(&self, profile_id: &str) -> Option<&Participant> {
        self.participants
            .values()
            .find(|p| p.profile_id == profile_id)
    }

    /// The local profile's active row.
    pub fn local(&self) -> Option<&Participant> {
        self.by_profile(&self.local_profile_id)
    }

    pub fn has_speak_request(&self, profile_id: &str) -> bool {
        self.speak_requests.contains(profile_id)
    }

    pub fn speak_requests(&self) -> impl Iterator<Item = &String> {
        self.speak_requests.iter()
    }
}

/// Keep active rows of this room, one per profile; the most recently joined
/// row wins.
fn dedupe(room_id: &str, participants: Vec<Participant>) -> BTreeMap<String, Participant> {
    let mut by_profile: HashMap<String, Participant> = HashMap::new();
    for p in participants
        .into_iter()
        .filter(|p| p.is_active() && p.room_id == room_id)
    {
        if let Some(existing) = by_profile.get(&p.profile_id) {
            let keep_existing = existing.joined_at >= p.joined_at;
            let kept = if keep_existing { &existing.id } else { &p.id };
            warn!(room_id, profile_id = %p.profile_id, %kept, "Duplicate active rows for one profile");
            if keep_existing {
                continue;
            }
        }
        by_profile.insert(p.profile_id.clone(), p);
    }
    by_profile
        .into_values()
        .map(|p| (p.id.clone(), p))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn live_room() -> Room {
        let mut room = Room::new("room-1", "Standup", 3);
        room.status = RoomStatus::Live;
        room
    }

    fn row(id: &str, profile: &str, role: Role) -> Participant {
        Participant {
            id: id.into(),
            profile_id: profile.into(),
            room_id: "room-1".into(),
            role,
            is_muted: false,
            is_speaking: false,
            joined_at: Utc::now(),
            left_at: None,
        }
    }

    fn snapshot(participants: Vec<Participant>) -> RoomSnapshot {
        RoomSnapshot {
            room: live_room(),
            participants,
            speak_requests: BTreeSet::new(),
        }
    }

    fn empty_state(local: &str) -> RoomState {
        RoomState::new(local, snapshot(Vec::new())).0
    }

    #[test]
    fn seed_reports_the_initial_view() {
        let (state, changes) = RoomState::new("me", snapshot(vec![row("p-1", "me", Role::Host)]));
        assert_eq!(changes[0], RoomChange::Updated);
        assert!(matches!(changes[1], RoomChange::LocalAppeared(ref p) if p.id == "p-1"));
        assert_eq!(state.room().title, "Standup");
        assert_eq!(state.room().participant_count, 1);
    }

    #[test]
    fn same_snapshot_twice_is_a_no_op() {
        let mut state = empty_state("me");
        let snap = snapshot(vec![row("p-1", "other", Role::Speaker)]);
        assert!(!state.apply(snap.clone()).is_empty());
        assert!(state.apply(snap).is_empty());
    }

    #[test]
    fn counters_are_recomputed_locally() {
        let mut state = empty_state("me");
        let mut snap = snapshot(vec![
            row("p-h", "h", Role::Host),
            row("p-s", "s", Role::Speaker),
            row("p-l", "l", Role::Listener),
        ]);
        snap.room.speaker_count = 99;
        state.apply(snap);
        assert_eq!(state.room().speaker_count, 1);
        assert_eq!(state.room().listener_count, 1);
        assert_eq!(state.room().participant_count, 3);
    }

    #[test]
    fn status_never_moves_backwards() {
        let mut state = empty_state("me");
        let mut ended = snapshot(Vec::new());
        ended.room.status = RoomStatus::Ended;
        assert!(state.apply(ended).contains(&RoomChange::StatusChanged(RoomStatus::Ended)));

        let live = snapshot(Vec::new());
        assert!(state.apply(live).is_empty());
        assert_eq!(state.room().status, RoomStatus::Ended);
    }

    #[test]
    fn newest_duplicate_row_wins() {
        let mut state = empty_state("me");
        let mut old = row("p-old", "dup", Role::Listener);
        old.joined_at = Utc::now() - Duration::seconds(30);
        let new = row("p-new", "dup", Role::Speaker);
        state.apply(snapshot(vec![new, old]));
        assert_eq!(state.by_profile("dup").map(|p| p.id.as_str()), Some("p-new"));
        assert_eq!(state.participants().count(), 1);
    }

    #[test]
    fn departed_rows_are_not_in_the_view() {
        let mut state = empty_state("me");
        let mut gone = row("p-1", "other", Role::Speaker);
        gone.left_at = Some(Utc::now());
        state.apply(snapshot(vec![gone]));
        assert!(state.participant("p-1").is_none());
    }

    #[test]
    fn local_role_and_mute_changes() {
        let mut state = empty_state("me");
        state.apply(snapshot(vec![row("p-me", "me", Role::Viewer)]));

        let mut promoted = row("p-me", "me", Role::Speaker);
        promoted.is_muted = true;
        let changes = state.apply(snapshot(vec![promoted]));
        assert!(changes.contains(&RoomChange::LocalRoleChanged {
            from: Role::Viewer,
            to: Role::Speaker
        }));
        assert!(changes.contains(&RoomChange::LocalMuteChanged(true)));

        let changes = state.apply(snapshot(Vec::new()));
        assert!(matches!(changes.last(), Some(RoomChange::LocalRemoved(p)) if p.id == "p-me"));
    }

    #[test]
    fn remote_departures_are_reported() {
        let mut state = empty_state("me");
        state.apply(snapshot(vec![
            row("p-me", "me", Role::Speaker),
            row("p-2", "two", Role::Speaker),
        ]));
        let changes = state.apply(snapshot(vec![row("p-me", "me", Role::Speaker)]));
        assert_eq!(
            changes,
            vec![
                RoomChange::Updated,
                RoomChange::ParticipantLeft("p-2".into())
            ]
        );
    }
}
