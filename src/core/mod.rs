//! Core domain types.
//!
//! Module hierarchy follows type dependency order:
//! - identity: CallId, AccessHash, PeerId, Ssrc (Layer 0)
//! - time: Timestamp, LastSpokeTimes (Layer 0)
//! - limits: engine tunables (Layer 1)
//! - payload: decoded transport payload shapes (Layer 2)
//! - participant: the roster entry record (Layer 3)

pub mod identity;
pub mod limits;
pub mod participant;
pub mod payload;
pub mod time;

pub use identity::{AccessHash, CallId, PeerId, Ssrc};
pub use limits::{Limits, LimitsError};
pub use participant::Participant;
pub use payload::{
    CallMetadataPayload, DiffBatch, DiffEntry, ParticipantPayload, ResolveResponse, SliceCursor,
    SliceResponse,
};
pub use time::{LastSpokeTimes, Timestamp};
