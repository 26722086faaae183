//! Participant directory: the persisted, eventually consistent source of
//! room membership, roles and mute state.
//!
//! The room core never reads rows directly. It subscribes to one room and
//! receives full [`RoomSnapshot`]s in commit order; every write goes through
//! the trait below and is confirmed only when a later snapshot reflects it.

mod memory;
mod supabase;
mod types;

pub use memory::{MemoryDirectory, WriteKind};
pub use supabase::{SupabaseDirectory, SupabaseDirectoryConfig};
pub use types::{Participant, Role, Room, RoomSnapshot, RoomStatus};

use async_trait::async_trait;
use chorus_common::RoomError;
use tokio::sync::mpsc;

#[async_trait]
pub trait ParticipantDirectory: Send + Sync {
    /// Start the change feed for one room. The first snapshot is the
    /// current state.
    async fn subscribe_room(&self, room_id: &str)
        -> Result<mpsc::Receiver<RoomSnapshot>, RoomError>;

    async fn write_join(
        &self,
        room_id: &str,
        profile_id: &str,
        role: Role,
    ) -> Result<Participant, RoomError>;

    /// Set `left_at` on the participant row.
    async fn write_leave(&self, participant_id: &str) -> Result<(), RoomError>;

    async fn write_role_change(&self, participant_id: &str, role: Role) -> Result<(), RoomError>;

    async fn write_muted(&self, participant_id: &str, muted: bool) -> Result<(), RoomError>;

    async fn write_speaking(&self, participant_id: &str, speaking: bool) -> Result<(), RoomError>;

    async fn write_speak_request(&self, room_id: &str, profile_id: &str) -> Result<(), RoomError>;

    async fn clear_speak_request(&self, room_id: &str, profile_id: &str) -> Result<(), RoomError>;
}
