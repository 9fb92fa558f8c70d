//! Engine tunables (normative defaults).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tunables for decay, resolution, and request retry behavior.
///
/// Values are explicit about their units. Defaults match the behavior of
/// the protocol this engine reconciles against; hosts normally only touch
/// these in tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// How long `sounding`/`speaking` stay set after the last fresh
    /// activity signal.
    pub sound_retention_ms: u64,
    /// Retention for `speaking` derived from peer-keyed active updates,
    /// which arrive far less often than per-ssrc signals.
    pub active_speaking_retention_ms: u64,

    /// Window during which unknown ssrcs/peers are coalesced into a
    /// single resolution request.
    pub resolve_coalesce_ms: u64,
    /// Resolution attempts per unknown reference before eviction.
    pub resolve_retry_budget: u32,
    /// Cap on pending unknown-reference ledger entries (ssrc and peer
    /// ledgers counted together).
    pub max_unknown_entries: usize,

    /// Retries per failed outgoing request before giving up.
    pub request_retry_budget: u32,
    /// Base delay before retrying a failed request; doubles per attempt.
    pub request_backoff_ms: u64,

    pub max_event_subscribers: usize,
    pub subscriber_queue_events: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            sound_retention_ms: 350,
            active_speaking_retention_ms: 6_000,

            resolve_coalesce_ms: 100,
            resolve_retry_budget: 3,
            max_unknown_entries: 1_024,

            request_retry_budget: 3,
            request_backoff_ms: 500,

            max_event_subscribers: 64,
            subscriber_queue_events: 4_096,
        }
    }
}

impl Limits {
    pub fn from_toml_str(input: &str) -> Result<Self, LimitsError> {
        let limits: Limits = toml::from_str(input)?;
        limits.validate()?;
        Ok(limits)
    }

    fn validate(&self) -> Result<(), LimitsError> {
        if self.sound_retention_ms == 0 {
            return Err(LimitsError::ZeroRetention {
                field: "sound_retention_ms",
            });
        }
        if self.active_speaking_retention_ms == 0 {
            return Err(LimitsError::ZeroRetention {
                field: "active_speaking_retention_ms",
            });
        }
        if self.max_unknown_entries == 0 {
            return Err(LimitsError::ZeroCapacity {
                field: "max_unknown_entries",
            });
        }
        if self.subscriber_queue_events == 0 {
            return Err(LimitsError::ZeroCapacity {
                field: "subscriber_queue_events",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum LimitsError {
    #[error("limits parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field} must be > 0")]
    ZeroRetention { field: &'static str },
    #[error("{field} must be > 0")]
    ZeroCapacity { field: &'static str },
}
