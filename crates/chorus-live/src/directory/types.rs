//! Rows the participant directory persists, and the snapshot its change
//! feed delivers.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// Lifecycle status of a room. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Scheduled,
    Live,
    Ended,
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoomStatus::Scheduled => "scheduled",
            RoomStatus::Live => "live",
            RoomStatus::Ended => "ended",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub status: RoomStatus,
    #[serde(default)]
    pub title: String,
    pub max_speakers: u32,
    #[serde(default)]
    pub recording_enabled: bool,
    #[serde(default)]
    pub speaker_count: u32,
    #[serde(default)]
    pub listener_count: u32,
    #[serde(default)]
    pub viewer_count: u32,
    #[serde(default)]
    pub participant_count: u32,
}

impl Room {
    pub fn new(id: impl Into<String>, title: impl Into<String>, max_speakers: u32) -> Self {
        Self {
            id: id.into(),
            status: RoomStatus::Scheduled,
            title: title.into(),
            max_speakers,
            recording_enabled: false,
            speaker_count: 0,
            listener_count: 0,
            viewer_count: 0,
            participant_count: 0,
        }
    }

    /// Recompute the derived counters from the active participant rows.
    pub fn recount<'a>(&mut self, participants: impl IntoIterator<Item = &'a Participant>) {
        self.speaker_count = 0;
        self.listener_count = 0;
        self.viewer_count = 0;
        self.participant_count = 0;
        for p in participants.into_iter().filter(|p| p.is_active()) {
            self.participant_count += 1;
            match p.role {
                Role::Host => {}
                Role::Speaker => self.speaker_count += 1,
                Role::Listener => self.listener_count += 1,
                Role::Viewer => self.viewer_count += 1,
            }
        }
    }

    pub fn has_speaker_slot(&self) -> bool {
        self.speaker_count < self.max_speakers
    }

    pub fn is_live(&self) -> bool {
        self.status == RoomStatus::Live
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Speaker,
    Listener,
    Viewer,
}

impl Role {
    /// Hosts and speakers send audio; everyone else only receives.
    pub fn transmits(self) -> bool {
        matches!(self, Role::Host | Role::Speaker)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Speaker => "speaker",
            Role::Listener => "listener",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub profile_id: String,
    pub room_id: String,
    pub role: Role,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_speaking: bool,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    /// Not yet departed.
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One full room state as delivered by the directory change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room: Room,
    pub participants: Vec<Participant>,
    /// Profiles with a pending request to speak.
    pub speak_requests: BTreeSet<String>,
}

impl RoomSnapshot {
    pub fn active_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.is_active())
    }
}
