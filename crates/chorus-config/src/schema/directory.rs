//! Table names of the participant directory.

use serde::{Deserialize, Serialize};

/// Where room, participant and speak-request rows live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub schema: String,
    pub rooms_table: String,
    pub participants_table: String,
    pub speak_requests_table: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            schema: "public".into(),
            rooms_table: "live_rooms".into(),
            participants_table: "live_room_participants".into(),
            speak_requests_table: "live_room_speak_requests".into(),
        }
    }
}
