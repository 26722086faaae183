//! Configuration schema types for chorus.
//!
//! All structs use `serde(default)` so partial configs work correctly.
//! Missing fields are filled with the defaults the room core ships with.

mod directory;
mod session;
mod speaking;
mod supabase;
mod system;

pub use directory::*;
pub use session::*;
pub use speaking::*;
pub use supabase::*;
pub use system::*;

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Root configuration.
///
/// Only override what you want to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ChorusConfig {
    pub supabase: SupabaseConfig,
    pub directory: DirectoryConfig,
    pub negotiation: NegotiationConfig,
    pub speaking: SpeakingConfig,
    pub signaling: SignalingConfig,
    pub logging: LoggingConfig,
}

// =============================================================================
// Tests
// =============================================================================
