//! Per-participant voice-activity decay.
//!
//! Two boolean-with-deadline machines per peer: `sounding` (raw audio
//! energy) and `speaking` (sustained voice). Both are edge-triggered:
//! callers get told exactly when a boolean rises or lapses, and a deadline
//! refresh that does not flip the boolean reports nothing.

use std::collections::BTreeMap;

use crate::core::{LastSpokeTimes, Limits, PeerId, Timestamp};

/// Which booleans rose on a fresh signal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivityRise {
    pub sounding: bool,
    pub speaking: bool,
}

impl ActivityRise {
    pub fn any(self) -> bool {
        self.sounding || self.speaking
    }
}

/// A peer whose booleans lapsed during a sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActivityLapse {
    pub peer: PeerId,
    pub sounding_lapsed: bool,
    pub speaking_lapsed: bool,
}

#[derive(Debug)]
pub struct ActivityTracker {
    sound_retention_ms: u64,
    active_retention_ms: u64,
    sounding_until: BTreeMap<PeerId, Timestamp>,
    speaking_until: BTreeMap<PeerId, Timestamp>,
}

impl ActivityTracker {
    pub fn new(limits: &Limits) -> Self {
        Self {
            sound_retention_ms: limits.sound_retention_ms,
            active_retention_ms: limits.active_speaking_retention_ms,
            sounding_until: BTreeMap::new(),
            speaking_until: BTreeMap::new(),
        }
    }

    pub fn is_sounding(&self, peer: PeerId) -> bool {
        self.sounding_until.contains_key(&peer)
    }

    pub fn is_speaking(&self, peer: PeerId) -> bool {
        self.speaking_until.contains_key(&peer)
    }

    /// Record an ssrc-derived activity signal.
    ///
    /// A severity already older than the retention window by the time it
    /// arrives is ignored; it would have decayed before anyone saw it.
    pub fn note_spoke(&mut self, peer: PeerId, when: LastSpokeTimes, now: Timestamp) -> ActivityRise {
        let mut rise = ActivityRise::default();
        if !when.anything.is_zero() && now.saturating_since(when.anything) <= self.sound_retention_ms
        {
            rise.sounding = self
                .arm(Deadline::Sounding, peer, now.saturating_add_ms(self.sound_retention_ms));
        }
        if !when.voice.is_zero() && now.saturating_since(when.voice) <= self.sound_retention_ms {
            rise.speaking = self
                .arm(Deadline::Speaking, peer, now.saturating_add_ms(self.sound_retention_ms));
        }
        rise
    }

    /// Record a peer-keyed active update. These arrive rarely, so the
    /// derived speaking state is kept for the longer active retention.
    pub fn note_active(&mut self, peer: PeerId, now: Timestamp) -> bool {
        self.arm(
            Deadline::Speaking,
            peer,
            now.saturating_add_ms(self.active_retention_ms),
        )
    }

    /// Expire every deadline at or before `now`. Returns one lapse record
    /// per peer whose booleans flipped.
    pub fn sweep(&mut self, now: Timestamp) -> Vec<ActivityLapse> {
        let mut lapses: BTreeMap<PeerId, ActivityLapse> = BTreeMap::new();

        self.sounding_until.retain(|peer, deadline| {
            if *deadline > now {
                return true;
            }
            lapses
                .entry(*peer)
                .or_insert(ActivityLapse {
                    peer: *peer,
                    sounding_lapsed: false,
                    speaking_lapsed: false,
                })
                .sounding_lapsed = true;
            false
        });
        self.speaking_until.retain(|peer, deadline| {
            if *deadline > now {
                return true;
            }
            lapses
                .entry(*peer)
                .or_insert(ActivityLapse {
                    peer: *peer,
                    sounding_lapsed: false,
                    speaking_lapsed: false,
                })
                .speaking_lapsed = true;
            false
        });

        lapses.into_values().collect()
    }

    /// Earliest pending deadline, if any peer is still active. The sweep
    /// timer is armed from this, so no deadlines mean no wakeups.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let sounding = self.sounding_until.values().min();
        let speaking = self.speaking_until.values().min();
        match (sounding, speaking) {
            (Some(a), Some(b)) => Some(*a.min(b)),
            (Some(a), None) => Some(*a),
            (None, Some(b)) => Some(*b),
            (None, None) => None,
        }
    }

    /// Drop all state for a departed peer.
    pub fn forget(&mut self, peer: PeerId) {
        self.sounding_until.remove(&peer);
        self.speaking_until.remove(&peer);
    }

    pub fn clear(&mut self) {
        self.sounding_until.clear();
        self.speaking_until.clear();
    }

    /// Returns true when the deadline newly armed (the boolean rose);
    /// false when it only refreshed an already-active deadline.
    fn arm(&mut self, which: Deadline, peer: PeerId, deadline: Timestamp) -> bool {
        let map = match which {
            Deadline::Sounding => &mut self.sounding_until,
            Deadline::Speaking => &mut self.speaking_until,
        };
        match map.entry(peer) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(deadline);
                true
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                if deadline > *slot.get() {
                    slot.insert(deadline);
                }
                false
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Deadline {
    Sounding,
    Speaking,
}
