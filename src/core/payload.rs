//! Inbound payload shapes delivered by the transport.
//!
//! These are decoded, wire-agnostic values: the transport owns the actual
//! encoding (a non-goal here) and hands the engine these structs.

use serde::{Deserialize, Serialize};

use super::identity::{CallId, PeerId};
use super::time::Timestamp;

/// Call-level metadata snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadataPayload {
    pub id: CallId,
    /// Monotonic call version this payload was generated at.
    pub version: u64,
    pub title: String,
    /// Zero when the call is not being recorded.
    pub record_start: Timestamp,
    /// Server-reported participant total; may exceed what is locally
    /// materialized.
    pub full_count: u32,
    pub join_muted: bool,
    pub can_change_join_muted: bool,
}

/// One fully-specified participant as the server describes it.
///
/// Local-only state (decaying activity booleans, local mute override) is
/// deliberately absent; merging preserves it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantPayload {
    pub peer: PeerId,
    pub joined_at: Timestamp,
    /// Zero when the server has no activity record.
    pub last_active: Timestamp,
    pub raised_hand_rating: u64,
    /// Zero when no media stream is assigned yet.
    pub ssrc: u32,
    /// Zero means "default volume".
    pub volume: u32,
    pub apply_volume_from_min: bool,
    pub muted: bool,
    pub can_self_unmute: bool,
}

/// Pagination cursor for roster slices. Empty means "from the start".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SliceCursor(pub String);

impl SliceCursor {
    pub fn is_start(&self) -> bool {
        self.0.is_empty()
    }
}

/// One page of the paginated full-roster listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceResponse {
    pub version: u64,
    pub participants: Vec<ParticipantPayload>,
    pub next_cursor: SliceCursor,
    pub full_count: u32,
}

/// A batch of incremental changes at a specific call version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffBatch {
    pub version: u64,
    pub entries: Vec<DiffEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffEntry {
    /// Participant joined or changed; carries the full payload inline.
    Upsert(ParticipantPayload),
    /// Participant left the call.
    Left(PeerId),
    /// Metadata-only refresh, e.g. the server total moved without a
    /// roster delta.
    CountChanged { full_count: u32 },
}

/// Response to an unknown-reference resolution request. Partial failures
/// are allowed: requested ids with no matching entry stay unresolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub version: u64,
    pub participants: Vec<ParticipantPayload>,
}
