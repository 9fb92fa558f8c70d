//! Single-call session façade.
//!
//! Owns one [`ReconciliationEngine`] plus the request/timer bookkeeping
//! around it: at most one in-flight request per kind, exponential backoff
//! with a retry budget, resolve-batch coalescing, and the decay sweep
//! timer. Everything runs on one logical thread; responses and timer
//! firings re-enter through the `handle_*` methods.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::core::{
    CallMetadataPayload, DiffBatch, LastSpokeTimes, Limits, Participant, ParticipantPayload,
    PeerId, ResolveResponse, SliceResponse, Ssrc, Timestamp,
};
use crate::engine::events::{BroadcastError, EventSubscription, RosterBroadcaster};
use crate::engine::reconcile::{
    CallDescriptor, DiffDecision, ReconciliationEngine, ResolveBatch, RosterPhase, SignalOutcome,
    SliceSource,
};
use crate::engine::transport::{Clock, PeerDirectory, RequestId, TimerHandle, TimerService, Transport};

/// Lifecycle of one request kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum RequestState {
    #[default]
    Idle,
    InFlight {
        id: RequestId,
        attempts: u32,
    },
    BackingOff {
        timer: TimerHandle,
        attempts: u32,
    },
}

impl RequestState {
    fn in_flight_id(&self) -> Option<RequestId> {
        match self {
            RequestState::InFlight { id, .. } => Some(*id),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestKind {
    Slice,
    Reload,
    Resolve,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerPurpose {
    Sweep,
    ResolveCoalesce,
    Retry(RequestKind),
}

pub struct GroupCallSession<T, D, C, S> {
    transport: T,
    directory: D,
    clock: C,
    timers: S,
    limits: Limits,
    engine: ReconciliationEngine,
    broadcaster: RosterBroadcaster,
    alive: bool,
    slice: RequestState,
    reload: RequestState,
    resolve: RequestState,
    /// Batch attached to the in-flight resolve, kept for retries.
    resolve_in_flight: Option<ResolveBatch>,
    coalesce_timer: Option<TimerHandle>,
    sweep_timer: Option<(TimerHandle, Timestamp)>,
    timer_purposes: BTreeMap<TimerHandle, TimerPurpose>,
}

impl<T, D, C, S> GroupCallSession<T, D, C, S>
where
    T: Transport,
    D: PeerDirectory,
    C: Clock,
    S: TimerService,
{
    pub fn new(
        descriptor: CallDescriptor,
        limits: Limits,
        transport: T,
        directory: D,
        clock: C,
        timers: S,
    ) -> Self {
        let broadcaster = RosterBroadcaster::new(
            limits.max_event_subscribers,
            limits.subscriber_queue_events,
        );
        let engine = ReconciliationEngine::new(descriptor, limits.clone());
        Self {
            transport,
            directory,
            clock,
            timers,
            limits,
            engine,
            broadcaster,
            alive: true,
            slice: RequestState::Idle,
            reload: RequestState::Idle,
            resolve: RequestState::Idle,
            resolve_in_flight: None,
            coalesce_timer: None,
            sweep_timer: None,
            timer_purposes: BTreeMap::new(),
        }
    }

    pub fn subscribe(&self) -> Result<EventSubscription, BroadcastError> {
        self.broadcaster.subscribe()
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Request the next roster slice. No-op while a slice request is
    /// already pending or the roster is complete.
    pub fn request_participants(&mut self) {
        if !self.alive || self.slice != RequestState::Idle {
            return;
        }
        let Some(cursor) = self.engine.begin_loading() else {
            return;
        };
        let id = self.transport.fetch_participants_slice(
            self.engine.call_id(),
            self.engine.access(),
            &cursor,
        );
        self.slice = RequestState::InFlight { id, attempts: 0 };
    }

    /// Force a full metadata refresh, e.g. after a detected diff gap.
    pub fn reload(&mut self) {
        if !self.alive || self.reload != RequestState::Idle {
            return;
        }
        let id = self
            .transport
            .fetch_call_metadata(self.engine.call_id(), self.engine.access());
        self.reload = RequestState::InFlight { id, attempts: 0 };
    }

    /// Park an explicit ssrc set for resolution, e.g. from the media
    /// layer noticing streams it cannot attribute.
    pub fn request_resolution(&mut self, ssrcs: &BTreeSet<Ssrc>) {
        if !self.alive {
            return;
        }
        if self.engine.enqueue_unknown_ssrcs(ssrcs) {
            self.arm_coalesce_timer();
        }
    }

    /// Mark the local session as joined. Irreversible for this session.
    pub fn set_in_call(&mut self) {
        self.engine.set_in_call();
    }

    pub fn set_join_muted_locally(&mut self, muted: bool) -> bool {
        self.engine.set_join_muted_locally(muted)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Response to a [`reload`](Self::reload)-issued metadata fetch.
    pub fn handle_metadata_response(&mut self, id: RequestId, payload: &CallMetadataPayload) {
        if !self.alive || self.reload.in_flight_id() != Some(id) {
            return;
        }
        self.reload = RequestState::Idle;
        // A reload replaces whatever we thought we knew.
        self.engine.apply_call_metadata(payload, true);
        self.after_engine();
    }

    /// Server-pushed metadata, version-gated.
    pub fn handle_metadata_push(&mut self, payload: &CallMetadataPayload) {
        if !self.alive {
            return;
        }
        self.engine.apply_call_metadata(payload, false);
        self.after_engine();
    }

    pub fn handle_slice_response(&mut self, id: RequestId, resp: &SliceResponse) {
        if !self.alive || self.slice.in_flight_id() != Some(id) {
            return;
        }
        self.slice = RequestState::Idle;
        let now = self.clock.now();
        self.engine
            .apply_participants_slice(resp, SliceSource::Paginated, now);
        self.after_engine();
        if !self.engine.roster_complete() {
            self.request_participants();
        }
    }

    /// Server-pushed incremental diff. A version gap triggers a reload.
    pub fn handle_diff(&mut self, batch: &DiffBatch) {
        if !self.alive {
            return;
        }
        let now = self.clock.now();
        match self.engine.apply_diff(batch, now) {
            DiffDecision::Applied | DiffDecision::StaleDuplicate => {}
            DiffDecision::Gap { .. } => {
                self.after_engine();
                self.reload();
                return;
            }
        }
        self.after_engine();
    }

    /// ssrc-keyed voice activity from the media layer.
    pub fn handle_last_spoke(&mut self, raw_ssrc: u32, when: LastSpokeTimes) {
        if !self.alive {
            return;
        }
        let now = self.clock.now();
        if self.engine.apply_last_spoke(raw_ssrc, when, now) == SignalOutcome::QueuedUnknown {
            self.arm_coalesce_timer();
        }
        self.after_engine();
    }

    /// Peer-keyed active update, optionally with inline peer data.
    pub fn handle_active_update(
        &mut self,
        peer: PeerId,
        when: LastSpokeTimes,
        resolved: Option<&ParticipantPayload>,
    ) {
        if !self.alive {
            return;
        }
        let now = self.clock.now();
        if self.engine.apply_active_update(peer, when, resolved, now)
            == SignalOutcome::QueuedUnknown
        {
            self.arm_coalesce_timer();
        }
        self.after_engine();
    }

    pub fn handle_resolve_response(&mut self, id: RequestId, resp: &ResolveResponse) {
        if !self.alive || self.resolve.in_flight_id() != Some(id) {
            return;
        }
        self.resolve = RequestState::Idle;
        self.resolve_in_flight = None;
        let now = self.clock.now();
        self.engine.apply_resolve_response(resp, now);
        // Whatever the directory could not name goes around again.
        if self.engine.has_pending_unknowns() {
            self.arm_coalesce_timer();
        }
        self.after_engine();
    }

    /// Transport-level failure for any outstanding request. Retries with
    /// exponential backoff until the budget runs out; after that the
    /// roster simply stays incomplete until the caller reloads.
    pub fn handle_request_failure(&mut self, id: RequestId) {
        if !self.alive {
            return;
        }
        for kind in [RequestKind::Slice, RequestKind::Reload, RequestKind::Resolve] {
            let state = self.request_state_mut(kind);
            let RequestState::InFlight { id: pending, attempts } = *state else {
                continue;
            };
            if pending != id {
                continue;
            }
            let attempts = attempts + 1;
            if attempts >= self.limits.request_retry_budget {
                tracing::warn!(
                    "giving up on {kind:?} request after {attempts} attempts"
                );
                *self.request_state_mut(kind) = RequestState::Idle;
                if kind == RequestKind::Resolve {
                    self.resolve_in_flight = None;
                }
                return;
            }
            let delay = self.limits.request_backoff_ms << (attempts - 1);
            let timer = self.timers.schedule_after(delay);
            self.timer_purposes.insert(timer, TimerPurpose::Retry(kind));
            *self.request_state_mut(kind) = RequestState::BackingOff { timer, attempts };
            return;
        }
    }

    /// One-shot timer fired. Unknown or stale handles are ignored.
    pub fn timer_fired(&mut self, handle: TimerHandle) {
        if !self.alive {
            return;
        }
        let Some(purpose) = self.timer_purposes.remove(&handle) else {
            return;
        };
        match purpose {
            TimerPurpose::Sweep => {
                if self.sweep_timer.map(|(h, _)| h) == Some(handle) {
                    self.sweep_timer = None;
                    self.sweep_now();
                }
            }
            TimerPurpose::ResolveCoalesce => {
                if self.coalesce_timer == Some(handle) {
                    self.coalesce_timer = None;
                    self.issue_resolve();
                }
            }
            TimerPurpose::Retry(kind) => {
                let state = self.request_state_mut(kind);
                let RequestState::BackingOff { timer, attempts } = *state else {
                    return;
                };
                if timer != handle {
                    return;
                }
                *state = RequestState::Idle;
                self.retry(kind, attempts);
            }
        }
    }

    /// Expire decayed activity now. Normally driven by the sweep timer.
    pub fn sweep_now(&mut self) {
        let now = self.clock.now();
        self.engine.sweep(now);
        self.after_engine();
    }

    /// Stop issuing requests and timers; pending responses become no-ops.
    pub fn shutdown(&mut self) {
        self.alive = false;
        for (handle, _) in std::mem::take(&mut self.timer_purposes) {
            self.timers.cancel(handle);
        }
        self.coalesce_timer = None;
        self.sweep_timer = None;
        self.slice = RequestState::Idle;
        self.reload = RequestState::Idle;
        self.resolve = RequestState::Idle;
        self.resolve_in_flight = None;
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn participants(&self) -> Vec<Participant> {
        self.engine.ordered_participants().cloned().collect()
    }

    pub fn participant(&self, peer: PeerId) -> Option<&Participant> {
        self.engine.participant(peer)
    }

    pub fn peer_by_ssrc(&self, ssrc: Ssrc) -> Option<PeerId> {
        self.engine.peer_by_ssrc(ssrc)
    }

    pub fn roster_complete(&self) -> bool {
        self.engine.roster_complete()
    }

    pub fn phase(&self) -> RosterPhase {
        self.engine.phase()
    }

    pub fn in_call(&self) -> bool {
        self.engine.in_call()
    }

    pub fn version(&self) -> u64 {
        self.engine.version()
    }

    pub fn title(&self) -> &str {
        self.engine.title()
    }

    pub fn record_start(&self) -> Timestamp {
        self.engine.record_start()
    }

    pub fn full_count(&self) -> u32 {
        self.engine.full_count()
    }

    pub fn join_muted(&self) -> bool {
        self.engine.join_muted()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn request_state_mut(&mut self, kind: RequestKind) -> &mut RequestState {
        match kind {
            RequestKind::Slice => &mut self.slice,
            RequestKind::Reload => &mut self.reload,
            RequestKind::Resolve => &mut self.resolve,
        }
    }

    fn retry(&mut self, kind: RequestKind, attempts: u32) {
        match kind {
            RequestKind::Slice => {
                let Some(cursor) = self.engine.begin_loading() else {
                    return;
                };
                let id = self.transport.fetch_participants_slice(
                    self.engine.call_id(),
                    self.engine.access(),
                    &cursor,
                );
                self.slice = RequestState::InFlight { id, attempts };
            }
            RequestKind::Reload => {
                let id = self
                    .transport
                    .fetch_call_metadata(self.engine.call_id(), self.engine.access());
                self.reload = RequestState::InFlight { id, attempts };
            }
            RequestKind::Resolve => {
                let Some(batch) = self.resolve_in_flight.clone() else {
                    return;
                };
                let id = self
                    .directory
                    .resolve(self.engine.call_id(), &batch.ssrcs, &batch.peers);
                self.resolve = RequestState::InFlight { id, attempts };
            }
        }
    }

    /// Start the coalescing window unless one is already open or a
    /// resolve request is already out.
    fn arm_coalesce_timer(&mut self) {
        if self.coalesce_timer.is_some() || self.resolve != RequestState::Idle {
            return;
        }
        let timer = self.timers.schedule_after(self.limits.resolve_coalesce_ms);
        self.timer_purposes
            .insert(timer, TimerPurpose::ResolveCoalesce);
        self.coalesce_timer = Some(timer);
    }

    fn issue_resolve(&mut self) {
        if self.resolve != RequestState::Idle {
            return;
        }
        let Some(batch) = self.engine.take_resolve_batch() else {
            return;
        };
        let id = self
            .directory
            .resolve(self.engine.call_id(), &batch.ssrcs, &batch.peers);
        self.resolve_in_flight = Some(batch);
        self.resolve = RequestState::InFlight { id, attempts: 0 };
    }

    /// Post-mutation bookkeeping: publish accumulated events and keep the
    /// sweep timer tracking the earliest activity deadline.
    fn after_engine(&mut self) {
        for event in self.engine.take_events() {
            self.broadcaster.publish(event);
        }
        self.rearm_sweep();
    }

    fn rearm_sweep(&mut self) {
        let deadline = self.engine.next_sweep_deadline();
        match (deadline, self.sweep_timer) {
            (None, None) => {}
            (None, Some((handle, _))) => {
                self.timers.cancel(handle);
                self.timer_purposes.remove(&handle);
                self.sweep_timer = None;
            }
            (Some(at), current) => {
                if let Some((_, armed_at)) = current
                    && armed_at <= at
                {
                    return;
                }
                if let Some((handle, _)) = current {
                    self.timers.cancel(handle);
                    self.timer_purposes.remove(&handle);
                }
                let now = self.clock.now();
                let delay = at.saturating_since(now);
                let timer = self.timers.schedule_after(delay);
                self.timer_purposes.insert(timer, TimerPurpose::Sweep);
                self.sweep_timer = Some((timer, at));
            }
        }
    }
}
