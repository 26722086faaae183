//! Local mute intent versus persisted mute state.
//!
//! The track follows the user's intent at once. The directory write that
//! follows may fail; only the newest request is allowed to revert the
//! track, so an older failure never undoes a newer toggle.

use chorus_common::RoomError;

use crate::media::LocalTrack;

/// Token for one in-flight mute write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuteRequest {
    pub seq: u64,
    pub muted: bool,
    /// Track state before this request was applied.
    pub previous_enabled: bool,
}

#[derive(Debug, Default)]
pub struct MuteSynchronizer {
    seq: u64,
    intent: Option<bool>,
    confirmed: Option<bool>,
}

impl MuteSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `muted` to the track and return the token for its write.
    pub fn request(&mut self, track: &dyn LocalTrack, muted: bool) -> MuteRequest {
        let previous_enabled = track.is_enabled();
        track.set_enabled(!muted);
        self.seq += 1;
        self.intent = Some(muted);
        MuteRequest {
            seq: self.seq,
            muted,
            previous_enabled,
        }
    }

    /// Settle a write. Returns true when the track was reverted.
    pub fn resolve(
        &mut self,
        track: Option<&dyn LocalTrack>,
        request: MuteRequest,
        result: &Result<(), RoomError>,
    ) -> bool {
        if result.is_ok() || request.seq != self.seq {
            return false;
        }
        if let Some(track) = track {
            track.set_enabled(request.previous_enabled);
        }
        self.intent = Some(!request.previous_enabled);
        true
    }

    /// Mute state seen in the latest directory snapshot.
    pub fn confirm(&mut self, muted: bool) {
        self.confirmed = Some(muted);
    }

    pub fn confirmed(&self) -> Option<bool> {
        self.confirmed
    }

    pub fn intent(&self) -> Option<bool> {
        self.intent
    }

    pub fn reset(&mut self) {
        self.intent = None;
        self.confirmed = None;
    }
}
