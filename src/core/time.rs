//! Layer 0: Time primitives
//!
//! Timestamp: milliseconds on the host clock domain, used for deadlines.
//! LastSpokeTimes: the two voice-activity severities delivered by signals.

use serde::{Deserialize, Serialize};

/// Milliseconds on the host's clock domain.
///
/// Only differences are meaningful; the engine never interprets this as
/// wall time. `ZERO` doubles as the "never" sentinel carried by payloads.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_add_ms(self, ms: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(ms))
    }

    /// Milliseconds elapsed from `earlier` to `self`, zero if `earlier`
    /// is in the future.
    pub fn saturating_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Last observed voice-activity instants at two severities.
///
/// `anything` reflects raw audio energy, `voice` sustained speech. The
/// derived `sounding`/`speaking` booleans decay from these via the
/// activity tracker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSpokeTimes {
    pub anything: Timestamp,
    pub voice: Timestamp,
}

impl LastSpokeTimes {
    /// Keep the most recent instant per severity.
    pub fn merge_max(&mut self, other: LastSpokeTimes) {
        self.anything = self.anything.max(other.anything);
        self.voice = self.voice.max(other.voice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_since_clamps_at_zero() {
        assert_eq!(Timestamp(50).saturating_since(Timestamp(80)), 0);
        assert_eq!(Timestamp(80).saturating_since(Timestamp(50)), 30);
    }

    #[test]
    fn merge_max_keeps_freshest_per_severity() {
        let mut a = LastSpokeTimes {
            anything: Timestamp(10),
            voice: Timestamp(40),
        };
        a.merge_max(LastSpokeTimes {
            anything: Timestamp(30),
            voice: Timestamp(20),
        });
        assert_eq!(a.anything, Timestamp(30));
        assert_eq!(a.voice, Timestamp(40));
    }
}
