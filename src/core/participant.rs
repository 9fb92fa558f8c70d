//! One peer's presence in a call.

use serde::{Deserialize, Serialize};

use super::identity::{PeerId, Ssrc};
use super::payload::ParticipantPayload;
use super::time::Timestamp;

/// Roster entry for a single peer.
///
/// Server-authoritative fields come from snapshots and diffs; `sounding`,
/// `speaking`, and `muted_by_me` are local and survive merges. `partial`
/// marks entries synthesized from an activity signal before any snapshot
/// or diff confirmed them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub peer: PeerId,
    pub joined_at: Timestamp,
    pub last_active: Timestamp,
    /// Monotonically assigned by the server; orders raised-hand requests.
    pub raised_hand_rating: u64,
    pub ssrc: Option<Ssrc>,
    /// `None` means "default volume" (wire sentinel 0).
    pub volume: Option<u32>,
    pub apply_volume_from_min: bool,
    pub sounding: bool,
    pub speaking: bool,
    pub muted: bool,
    pub muted_by_me: bool,
    pub can_self_unmute: bool,
    pub partial: bool,
    /// Call version that last wrote this entry's server fields.
    pub version: u64,
}

impl Participant {
    /// Materialize from a fully-specified server payload.
    pub fn from_payload(payload: &ParticipantPayload, version: u64) -> Self {
        Self {
            peer: payload.peer,
            joined_at: payload.joined_at,
            last_active: payload.last_active,
            raised_hand_rating: payload.raised_hand_rating,
            ssrc: Ssrc::new(payload.ssrc),
            volume: (payload.volume != 0).then_some(payload.volume),
            apply_volume_from_min: payload.apply_volume_from_min,
            sounding: false,
            speaking: false,
            muted: payload.muted,
            muted_by_me: false,
            can_self_unmute: payload.can_self_unmute,
            partial: false,
            version,
        }
    }

    /// Speculative entry for a peer only known from an activity signal.
    /// Production merges always carry server data, so this is a test
    /// convenience only.
    #[cfg(test)]
    pub fn partial_from_activity(peer: PeerId, ssrc: Option<Ssrc>, now: Timestamp) -> Self {
        Self {
            peer,
            joined_at: now,
            last_active: now,
            raised_hand_rating: 0,
            ssrc,
            volume: None,
            apply_volume_from_min: true,
            sounding: false,
            speaking: false,
            muted: false,
            muted_by_me: false,
            can_self_unmute: true,
            partial: true,
            version: 0,
        }
    }

    /// Overwrite server-authoritative fields, preserving local state.
    ///
    /// A participant muted without the right to self-unmute cannot be
    /// producing audio; stale decaying flags are cleared on that edge.
    pub fn merge_payload(&mut self, payload: &ParticipantPayload, version: u64) {
        debug_assert_eq!(self.peer, payload.peer);
        self.joined_at = payload.joined_at;
        self.last_active = self.last_active.max(payload.last_active);
        self.raised_hand_rating = payload.raised_hand_rating;
        self.ssrc = Ssrc::new(payload.ssrc);
        self.volume = (payload.volume != 0).then_some(payload.volume);
        self.apply_volume_from_min = payload.apply_volume_from_min;
        self.muted = payload.muted;
        self.can_self_unmute = payload.can_self_unmute;
        self.partial = false;
        self.version = version;
        if self.muted && !self.can_self_unmute {
            self.sounding = false;
            self.speaking = false;
        }
    }

    /// Whether this participant may currently produce audio at all.
    pub fn may_be_heard(&self) -> bool {
        !self.muted || self.can_self_unmute
    }
}
