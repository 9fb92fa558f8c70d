//! Versioned group-call roster reconciliation.
//!
//! Maintains a local mirror of a group call's participant roster from
//! paginated snapshots, pushed incremental diffs, and high-frequency
//! voice-activity signals, under a single monotonic call version. The
//! engine is transport-agnostic and single-threaded: hosts inject a
//! [`Transport`](engine::Transport), a [`PeerDirectory`](engine::PeerDirectory),
//! a [`Clock`](engine::Clock), and a [`TimerService`](engine::TimerService),
//! then feed responses and timer firings back into the
//! [`GroupCallSession`](engine::GroupCallSession).

#![forbid(unsafe_code)]

pub mod core;
pub mod engine;
pub mod error;
pub mod test_harness;

pub use crate::core::{
    AccessHash, CallId, CallMetadataPayload, DiffBatch, DiffEntry, LastSpokeTimes, Limits,
    Participant, ParticipantPayload, PeerId, ResolveResponse, SliceCursor, SliceResponse, Ssrc,
    Timestamp,
};
pub use crate::engine::{
    CallDescriptor, DiffDecision, GroupCallSession, ReconciliationEngine, RosterEvent, RosterPhase,
    SignalOutcome,
};
pub use crate::error::{Error, Result};
