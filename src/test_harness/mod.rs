//! Deterministic collaborator doubles for engine tests.
//!
//! Everything here is hand-driven: the clock only moves when told, timers
//! never fire on their own, and the transport/directory doubles just log
//! what was asked of them. Tests feed responses back through the session's
//! `handle_*` methods, which keeps every scenario single-threaded and
//! reproducible.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::{AccessHash, CallId, PeerId, SliceCursor, Ssrc, Timestamp};
use crate::engine::transport::{
    Clock, PeerDirectory, RequestId, TimerHandle, TimerService, Transport,
};

/// Manually-advanced clock.
#[derive(Clone, Default)]
pub struct TestClock {
    now_ms: Arc<AtomicU64>,
}

impl TestClock {
    pub fn at(ms: u64) -> Self {
        let clock = Self::default();
        clock.set_ms(ms);
        clock
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    pub fn set_ms(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now_ms())
    }
}

/// One request a double observed, in issue order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssuedRequest {
    Metadata {
        id: RequestId,
        call: CallId,
        access: AccessHash,
    },
    Slice {
        id: RequestId,
        call: CallId,
        cursor: SliceCursor,
    },
    Resolve {
        id: RequestId,
        call: CallId,
        ssrcs: BTreeSet<Ssrc>,
        peers: BTreeSet<PeerId>,
    },
}

impl IssuedRequest {
    pub fn id(&self) -> RequestId {
        match self {
            IssuedRequest::Metadata { id, .. }
            | IssuedRequest::Slice { id, .. }
            | IssuedRequest::Resolve { id, .. } => *id,
        }
    }
}

#[derive(Default)]
struct LogState {
    next_id: u64,
    requests: Vec<IssuedRequest>,
}

/// Shared log behind the transport and directory doubles. Clones observe
/// the same underlying log, so a test can hold one handle while the
/// session owns the doubles.
#[derive(Clone, Default)]
pub struct RequestLog {
    state: Rc<RefCell<LogState>>,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain every request issued since the last call.
    pub fn take(&self) -> Vec<IssuedRequest> {
        std::mem::take(&mut self.state.borrow_mut().requests)
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().requests.is_empty()
    }

    fn push(&self, build: impl FnOnce(RequestId) -> IssuedRequest) -> RequestId {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = RequestId(state.next_id);
        state.requests.push(build(id));
        id
    }
}

/// Transport double; records requests and returns fresh ids.
#[derive(Clone)]
pub struct ScriptedTransport {
    log: RequestLog,
}

impl ScriptedTransport {
    pub fn new(log: RequestLog) -> Self {
        Self { log }
    }
}

impl Transport for ScriptedTransport {
    fn fetch_call_metadata(&mut self, call: CallId, access: AccessHash) -> RequestId {
        self.log
            .push(|id| IssuedRequest::Metadata { id, call, access })
    }

    fn fetch_participants_slice(
        &mut self,
        call: CallId,
        _access: AccessHash,
        cursor: &SliceCursor,
    ) -> RequestId {
        let cursor = cursor.clone();
        self.log.push(|id| IssuedRequest::Slice { id, call, cursor })
    }
}

/// Directory double; records resolution requests.
#[derive(Clone)]
pub struct ScriptedDirectory {
    log: RequestLog,
}

impl ScriptedDirectory {
    pub fn new(log: RequestLog) -> Self {
        Self { log }
    }
}

impl PeerDirectory for ScriptedDirectory {
    fn resolve(
        &mut self,
        call: CallId,
        ssrcs: &BTreeSet<Ssrc>,
        peers: &BTreeSet<PeerId>,
    ) -> RequestId {
        let ssrcs = ssrcs.clone();
        let peers = peers.clone();
        self.log.push(|id| IssuedRequest::Resolve {
            id,
            call,
            ssrcs,
            peers,
        })
    }
}

#[derive(Default)]
struct TimerState {
    next_handle: u64,
    scheduled: Vec<(TimerHandle, u64)>,
    canceled: Vec<TimerHandle>,
}

/// Timer double. Nothing fires by itself; tests pull scheduled handles
/// and call `timer_fired` on the session when ready.
#[derive(Clone, Default)]
pub struct ManualTimers {
    state: Rc<RefCell<TimerState>>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain (handle, delay_ms) pairs scheduled since the last call.
    pub fn take_scheduled(&self) -> Vec<(TimerHandle, u64)> {
        std::mem::take(&mut self.state.borrow_mut().scheduled)
    }

    pub fn canceled(&self) -> Vec<TimerHandle> {
        self.state.borrow().canceled.clone()
    }
}

impl TimerService for ManualTimers {
    fn schedule_after(&mut self, delay_ms: u64) -> TimerHandle {
        let mut state = self.state.borrow_mut();
        state.next_handle += 1;
        let handle = TimerHandle(state.next_handle);
        state.scheduled.push((handle, delay_ms));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.state.borrow_mut().canceled.push(handle);
    }
}
