//! Collaborator contracts.
//!
//! All dependencies are injected: the engine issues fire-and-forget
//! requests and treats responses, pushed diffs, and timer firings as
//! ordinary inbound events on its single logical thread.

use std::collections::BTreeSet;

use crate::core::{AccessHash, CallId, PeerId, SliceCursor, Ssrc, Timestamp};

/// Token identifying one outgoing request. Responses are matched against
/// the token; a token the session no longer tracks is ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

/// Handle for one armed one-shot timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(pub u64);

pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// One-shot timer scheduling. The host calls
/// [`GroupCallSession::timer_fired`](crate::engine::session::GroupCallSession::timer_fired)
/// with the handle when the delay elapses; a canceled handle must never
/// fire.
pub trait TimerService {
    fn schedule_after(&mut self, delay_ms: u64) -> TimerHandle;
    fn cancel(&mut self, handle: TimerHandle);
}

/// Outgoing request surface of the network transport. Inbound traffic
/// (slice/metadata responses, pushed diff batches, activity signals) is
/// delivered by the host calling the session's `handle_*` methods.
pub trait Transport {
    fn fetch_call_metadata(&mut self, call: CallId, access: AccessHash) -> RequestId;
    fn fetch_participants_slice(
        &mut self,
        call: CallId,
        access: AccessHash,
        cursor: &SliceCursor,
    ) -> RequestId;
}

/// External identity resolution. Partial failures are allowed per id; the
/// response simply omits what could not be resolved.
pub trait PeerDirectory {
    fn resolve(
        &mut self,
        call: CallId,
        ssrcs: &BTreeSet<Ssrc>,
        peers: &BTreeSet<PeerId>,
    ) -> RequestId;
}
