//! Versioned merge of call metadata, roster slices, and incremental diffs.
//!
//! Every mutation funnels through here so the version gate and the
//! roster/ssrc-index lockstep invariant cannot be bypassed. Recoverable
//! protocol outcomes (stale update, duplicate, gap) are decisions, not
//! errors; the worst case is a stale roster, never an inconsistent one.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::core::{
    AccessHash, CallId, CallMetadataPayload, DiffBatch, DiffEntry, LastSpokeTimes, Limits,
    Participant, PeerId, SliceCursor, SliceResponse, Ssrc, Timestamp,
};
use crate::engine::activity::ActivityTracker;
use crate::engine::events::RosterEvent;
use crate::engine::registry::ParticipantRegistry;

/// Static identity of the call being reconciled.
#[derive(Clone, Copy, Debug)]
pub struct CallDescriptor {
    pub id: CallId,
    pub access: AccessHash,
    pub owner: PeerId,
}

/// Roster completeness, orthogonal to whether the local session is an
/// active participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RosterPhase {
    Unstarted,
    Loading,
    Partial,
    Complete,
}

/// Where a batch of fully-specified participants came from. The origin
/// decides the per-entry conflict rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceSource {
    /// Steady-state pagination while loading the full roster.
    Paginated,
    /// Targeted fetch for ssrcs/peers from the unknown-reference ledger;
    /// merges unconditionally for the requested identities.
    UnknownResolution,
    /// Single participant carried inline by an incremental diff.
    DiffInline,
}

/// Decision for one inbound diff batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffDecision {
    Applied,
    /// Version at or behind current: a duplicate, dropped silently.
    StaleDuplicate,
    /// Version skips ahead (or no snapshot exists yet): the batch is
    /// dropped with no partial effects and a full reload is required.
    Gap { expected: u64, got: u64 },
}

/// Outcome of an activity signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalOutcome {
    Applied,
    /// The reference is unknown; it was parked in the ledger and a
    /// resolution pass should be scheduled.
    QueuedUnknown,
    /// Unusable signal (zero ssrc, ledger full): dropped.
    Dropped,
}

/// Call-level metadata under the monotonic version counter.
#[derive(Clone, Debug)]
pub struct CallState {
    pub id: CallId,
    pub access: AccessHash,
    pub owner: PeerId,
    pub title: String,
    pub record_start: Timestamp,
    pub version: u64,
    pub full_count: u32,
    pub cursor: SliceCursor,
    pub join_muted: bool,
    pub can_change_join_muted: bool,
    pub all_received: bool,
}

/// Activity signal parked for a not-yet-identified participant.
#[derive(Clone, Copy, Debug)]
struct PendingSignal {
    when: LastSpokeTimes,
    attempts: u32,
}

/// Identities to resolve in one outgoing directory request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolveBatch {
    pub ssrcs: BTreeSet<Ssrc>,
    pub peers: BTreeSet<PeerId>,
}

impl ResolveBatch {
    pub fn is_empty(&self) -> bool {
        self.ssrcs.is_empty() && self.peers.is_empty()
    }
}

pub struct ReconciliationEngine {
    limits: Limits,
    state: CallState,
    registry: ParticipantRegistry,
    activity: ActivityTracker,
    unknown_ssrcs: BTreeMap<Ssrc, PendingSignal>,
    unknown_peers: BTreeMap<PeerId, PendingSignal>,
    phase: RosterPhase,
    in_call: bool,
    pending_events: Vec<RosterEvent>,
    needs_resort: bool,
}

impl ReconciliationEngine {
    pub fn new(descriptor: CallDescriptor, limits: Limits) -> Self {
        let activity = ActivityTracker::new(&limits);
        Self {
            limits,
            state: CallState {
                id: descriptor.id,
                access: descriptor.access,
                owner: descriptor.owner,
                title: String::new(),
                record_start: Timestamp::ZERO,
                version: 0,
                full_count: 0,
                cursor: SliceCursor::default(),
                join_muted: false,
                can_change_join_muted: true,
                all_received: false,
            },
            registry: ParticipantRegistry::new(),
            activity,
            unknown_ssrcs: BTreeMap::new(),
            unknown_peers: BTreeMap::new(),
            phase: RosterPhase::Unstarted,
            in_call: false,
            pending_events: Vec::new(),
            needs_resort: false,
        }
    }

    // ------------------------------------------------------------------
    // Inbound payloads
    // ------------------------------------------------------------------

    /// Merge call-level metadata. Safe to call with stale data: unless
    /// `force` is set, a payload at or behind the current version (once a
    /// version is known) is a no-op. Returns whether it applied.
    pub fn apply_call_metadata(&mut self, payload: &CallMetadataPayload, force: bool) -> bool {
        if payload.id != self.state.id {
            tracing::warn!(
                "metadata for call {} delivered to call {}, ignoring",
                payload.id,
                self.state.id
            );
            return false;
        }
        let known = self.state.version != 0;
        if !force && known && payload.version <= self.state.version {
            tracing::debug!(
                "stale call metadata (version {} <= {})",
                payload.version,
                self.state.version
            );
            return false;
        }

        if payload.title != self.state.title {
            self.state.title = payload.title.clone();
            self.pending_events
                .push(RosterEvent::TitleChanged(self.state.title.clone()));
        }
        if payload.record_start != self.state.record_start {
            self.state.record_start = payload.record_start;
            self.pending_events
                .push(RosterEvent::RecordStartChanged(self.state.record_start));
        }
        self.set_full_count(payload.full_count);
        self.state.join_muted = payload.join_muted;
        self.state.can_change_join_muted = payload.can_change_join_muted;
        // The counter only moves forward, even on a forced refresh.
        self.state.version = self.state.version.max(payload.version);
        true
    }

    /// Begin (or continue) loading the paginated roster. Returns the
    /// cursor to fetch, or `None` once the roster is complete.
    pub fn begin_loading(&mut self) -> Option<SliceCursor> {
        if self.state.all_received {
            return None;
        }
        if self.phase == RosterPhase::Unstarted {
            self.phase = RosterPhase::Loading;
        }
        Some(self.state.cursor.clone())
    }

    /// Merge a batch of fully-specified participants.
    pub fn apply_participants_slice(
        &mut self,
        resp: &SliceResponse,
        source: SliceSource,
        now: Timestamp,
    ) {
        let was_empty = self.registry.is_empty();

        for payload in &resp.participants {
            self.merge_participant(payload, resp.version, source, now);
        }

        if source == SliceSource::Paginated {
            // Slices are partial views: absence here never removes anyone.
            if resp.participants.is_empty() && resp.next_cursor == self.state.cursor {
                if !self.state.all_received {
                    self.state.all_received = true;
                    self.phase = RosterPhase::Complete;
                    self.pending_events.push(RosterEvent::RosterComplete);
                }
            } else {
                self.state.cursor = resp.next_cursor.clone();
                if self.phase != RosterPhase::Complete {
                    self.phase = RosterPhase::Partial;
                }
                self.pending_events.push(RosterEvent::SliceAppended);
            }
            self.set_full_count(resp.full_count);
            if resp.version > self.state.version {
                self.state.version = resp.version;
            }
        }

        self.finish(was_empty);
    }

    /// Apply an incremental diff batch, all-or-nothing.
    pub fn apply_diff(&mut self, batch: &DiffBatch, now: Timestamp) -> DiffDecision {
        if self.state.version != 0 && batch.version <= self.state.version {
            tracing::debug!(
                "duplicate diff batch (version {} <= {})",
                batch.version,
                self.state.version
            );
            return DiffDecision::StaleDuplicate;
        }
        let expected = self.state.version + 1;
        if self.state.version == 0 || batch.version != expected {
            tracing::warn!(
                "diff gap: expected version {expected}, got {}; dropping batch",
                batch.version
            );
            return DiffDecision::Gap {
                expected,
                got: batch.version,
            };
        }

        let was_empty = self.registry.is_empty();
        for entry in &batch.entries {
            match entry {
                DiffEntry::Upsert(payload) => {
                    self.merge_participant(payload, batch.version, SliceSource::DiffInline, now);
                }
                DiffEntry::Left(peer) => {
                    if let Some(update) = self.registry.remove(*peer) {
                        self.activity.forget(*peer);
                        self.pending_events.push(RosterEvent::Participant(update));
                    }
                }
                DiffEntry::CountChanged { full_count } => {
                    self.set_full_count(*full_count);
                }
            }
        }
        // Only now that the whole batch applied cleanly.
        self.state.version = batch.version;

        self.finish(was_empty);
        DiffDecision::Applied
    }

    /// Apply an ssrc-keyed voice-activity signal.
    pub fn apply_last_spoke(
        &mut self,
        raw_ssrc: u32,
        when: LastSpokeTimes,
        now: Timestamp,
    ) -> SignalOutcome {
        let Some(ssrc) = Ssrc::new(raw_ssrc) else {
            return SignalOutcome::Dropped;
        };
        if let Some(peer) = self.registry.peer_by_ssrc(ssrc) {
            let was_empty = self.registry.is_empty();
            self.note_activity(peer, when, now);
            self.finish(was_empty);
            return SignalOutcome::Applied;
        }

        if !self.unknown_ssrcs.contains_key(&ssrc) && self.ledger_full() {
            tracing::warn!("unknown-reference ledger full, dropping signal for ssrc {ssrc}");
            return SignalOutcome::Dropped;
        }
        self.unknown_ssrcs
            .entry(ssrc)
            .and_modify(|pending| pending.when.merge_max(when))
            .or_insert(PendingSignal { when, attempts: 0 });
        SignalOutcome::QueuedUnknown
    }

    /// Apply a peer-keyed active update. `resolved` carries peer data the
    /// host already had on hand, allowing a speculative partial entry.
    pub fn apply_active_update(
        &mut self,
        peer: PeerId,
        when: LastSpokeTimes,
        resolved: Option<&crate::core::ParticipantPayload>,
        now: Timestamp,
    ) -> SignalOutcome {
        let was_empty = self.registry.is_empty();

        if self.registry.get(peer).is_none() {
            match resolved {
                Some(payload) if payload.peer == peer => {
                    let mut participant = Participant::from_payload(payload, self.state.version);
                    // Never confirmed by a snapshot or diff.
                    participant.partial = true;
                    let outcome = self.registry.upsert(participant);
                    if let Some(displaced) = outcome.displaced {
                        self.pending_events.push(RosterEvent::Participant(displaced));
                    }
                    self.pending_events
                        .push(RosterEvent::Participant(outcome.update));
                    self.needs_resort = true;
                }
                _ => {
                    if !self.unknown_peers.contains_key(&peer) && self.ledger_full() {
                        tracing::warn!(
                            "unknown-reference ledger full, dropping active update for peer {peer}"
                        );
                        return SignalOutcome::Dropped;
                    }
                    self.unknown_peers
                        .entry(peer)
                        .and_modify(|pending| pending.when.merge_max(when))
                        .or_insert(PendingSignal { when, attempts: 0 });
                    return SignalOutcome::QueuedUnknown;
                }
            }
        }

        self.note_active(peer, when, now);
        self.finish(was_empty);
        SignalOutcome::Applied
    }

    /// Expire decayed activity deadlines and clear the derived booleans.
    pub fn sweep(&mut self, now: Timestamp) {
        let was_empty = self.registry.is_empty();
        let lapses = self.activity.sweep(now);
        for lapse in lapses {
            let Some(existing) = self.registry.get(lapse.peer) else {
                continue;
            };
            let before = existing.clone();
            let Some(p) = self.registry.get_mut(lapse.peer) else {
                continue;
            };
            let mut changed = false;
            if lapse.sounding_lapsed && p.sounding {
                p.sounding = false;
                changed = true;
            }
            if lapse.speaking_lapsed && p.speaking {
                p.speaking = false;
                changed = true;
                self.needs_resort = true;
            }
            if changed {
                let now_value = p.clone();
                self.pending_events
                    .push(RosterEvent::Participant(crate::engine::registry::ParticipantUpdate {
                        before: Some(before),
                        now: Some(now_value),
                    }));
            }
        }
        self.finish(was_empty);
    }

    // ------------------------------------------------------------------
    // Unknown-reference resolution
    // ------------------------------------------------------------------

    /// Collect pending unknown references into one outgoing batch,
    /// charging each entry one attempt. Entries over the retry budget are
    /// evicted here, bounding ledger growth.
    pub fn take_resolve_batch(&mut self) -> Option<ResolveBatch> {
        let budget = self.limits.resolve_retry_budget;
        let mut batch = ResolveBatch::default();

        self.unknown_ssrcs.retain(|ssrc, pending| {
            if pending.attempts >= budget {
                tracing::warn!("evicting unresolved ssrc {ssrc} after {budget} attempts");
                return false;
            }
            pending.attempts += 1;
            batch.ssrcs.insert(*ssrc);
            true
        });
        self.unknown_peers.retain(|peer, pending| {
            if pending.attempts >= budget {
                tracing::warn!("evicting unresolved peer {peer} after {budget} attempts");
                return false;
            }
            pending.attempts += 1;
            batch.peers.insert(*peer);
            true
        });

        (!batch.is_empty()).then_some(batch)
    }

    /// Merge a directory response and replay the parked signals against
    /// the now-known participants.
    pub fn apply_resolve_response(&mut self, resp: &crate::core::ResolveResponse, now: Timestamp) {
        let was_empty = self.registry.is_empty();

        for payload in &resp.participants {
            self.merge_participant(payload, resp.version, SliceSource::UnknownResolution, now);
        }

        self.finish(was_empty);
    }

    /// Park an explicit ssrc set for resolution (no activity attached).
    pub fn enqueue_unknown_ssrcs(&mut self, ssrcs: &BTreeSet<Ssrc>) -> bool {
        let mut queued = false;
        for ssrc in ssrcs {
            if self.registry.peer_by_ssrc(*ssrc).is_some()
                || self.unknown_ssrcs.contains_key(ssrc)
            {
                continue;
            }
            if self.ledger_full() {
                tracing::warn!("unknown-reference ledger full, dropping ssrc {ssrc}");
                break;
            }
            self.unknown_ssrcs.insert(
                *ssrc,
                PendingSignal {
                    when: LastSpokeTimes::default(),
                    attempts: 0,
                },
            );
            queued = true;
        }
        queued
    }

    pub fn has_pending_unknowns(&self) -> bool {
        !self.unknown_ssrcs.is_empty() || !self.unknown_peers.is_empty()
    }

    // ------------------------------------------------------------------
    // Queries and local commands
    // ------------------------------------------------------------------

    pub fn call_id(&self) -> CallId {
        self.state.id
    }

    pub fn access(&self) -> AccessHash {
        self.state.access
    }

    pub fn owner(&self) -> PeerId {
        self.state.owner
    }

    pub fn title(&self) -> &str {
        &self.state.title
    }

    pub fn record_start(&self) -> Timestamp {
        self.state.record_start
    }

    pub fn version(&self) -> u64 {
        self.state.version
    }

    pub fn full_count(&self) -> u32 {
        self.state.full_count
    }

    pub fn cursor(&self) -> &SliceCursor {
        &self.state.cursor
    }

    pub fn phase(&self) -> RosterPhase {
        self.phase
    }

    pub fn roster_complete(&self) -> bool {
        self.state.all_received
    }

    pub fn in_call(&self) -> bool {
        self.in_call
    }

    pub fn set_in_call(&mut self) {
        self.in_call = true;
    }

    pub fn join_muted(&self) -> bool {
        self.state.join_muted
    }

    pub fn can_change_join_muted(&self) -> bool {
        self.state.can_change_join_muted
    }

    /// Local join-mute preference; effective only while the server marks
    /// the flag user-changeable.
    pub fn set_join_muted_locally(&mut self, muted: bool) -> bool {
        if !self.state.can_change_join_muted {
            return false;
        }
        self.state.join_muted = muted;
        true
    }

    pub fn participant(&self, peer: PeerId) -> Option<&Participant> {
        self.registry.get(peer)
    }

    pub fn peer_by_ssrc(&self, ssrc: Ssrc) -> Option<PeerId> {
        self.registry.peer_by_ssrc(ssrc)
    }

    pub fn ordered_participants(&self) -> impl Iterator<Item = &Participant> {
        self.registry.ordered()
    }

    pub fn participant_count(&self) -> usize {
        self.registry.len()
    }

    pub fn next_sweep_deadline(&self) -> Option<Timestamp> {
        self.activity.next_deadline()
    }

    /// Drain events accumulated by the mutations since the last drain.
    pub fn take_events(&mut self) -> Vec<RosterEvent> {
        std::mem::take(&mut self.pending_events)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn merge_participant(
        &mut self,
        payload: &crate::core::ParticipantPayload,
        version: u64,
        source: SliceSource,
        now: Timestamp,
    ) {
        match self.registry.get(payload.peer) {
            Some(existing) => {
                // Per-entry staleness gate; targeted resolution loads were
                // requested explicitly and merge unconditionally.
                if source != SliceSource::UnknownResolution && version < existing.version {
                    return;
                }
                let keep_partial = source == SliceSource::UnknownResolution && existing.partial;
                let prior_order_key = (
                    existing.speaking,
                    existing.last_active,
                    existing.joined_at,
                    existing.raised_hand_rating,
                );
                let mut merged = existing.clone();
                merged.merge_payload(payload, version.max(existing.version));
                merged.partial = keep_partial;
                let order_key = (
                    merged.speaking,
                    merged.last_active,
                    merged.joined_at,
                    merged.raised_hand_rating,
                );
                if order_key != prior_order_key {
                    self.needs_resort = true;
                }
                if !merged.may_be_heard() {
                    self.activity.forget(merged.peer);
                }
                let outcome = self.registry.upsert(merged);
                if let Some(displaced) = outcome.displaced {
                    self.pending_events.push(RosterEvent::Participant(displaced));
                }
                self.pending_events
                    .push(RosterEvent::Participant(outcome.update));
            }
            None => {
                let mut participant = Participant::from_payload(payload, version);
                if source == SliceSource::UnknownResolution {
                    participant.partial = true;
                }
                let outcome = self.registry.upsert(participant);
                if let Some(displaced) = outcome.displaced {
                    self.pending_events.push(RosterEvent::Participant(displaced));
                }
                self.pending_events
                    .push(RosterEvent::Participant(outcome.update));
                self.needs_resort = true;
            }
        }
        self.replay_pending(payload.peer, Ssrc::new(payload.ssrc), now);
    }

    /// Replay any parked activity signal for a participant that just
    /// became known, applying the originally-signaled timestamps.
    fn replay_pending(&mut self, peer: PeerId, ssrc: Option<Ssrc>, now: Timestamp) {
        let mut when = LastSpokeTimes::default();
        let mut found = false;
        if let Some(ssrc) = ssrc
            && let Some(pending) = self.unknown_ssrcs.remove(&ssrc)
        {
            when.merge_max(pending.when);
            found = true;
        }
        if let Some(pending) = self.unknown_peers.remove(&peer) {
            when.merge_max(pending.when);
            found = true;
        }
        if !found {
            return;
        }

        let signaled_at = when.anything.max(when.voice);
        if let Some(p) = self.registry.get_mut(peer)
            && signaled_at > p.last_active
        {
            p.last_active = signaled_at;
        }
        self.note_activity(peer, when, now);
    }

    fn note_activity(&mut self, peer: PeerId, when: LastSpokeTimes, now: Timestamp) {
        let Some(existing) = self.registry.get(peer) else {
            return;
        };
        if !existing.may_be_heard() {
            return;
        }
        let before = existing.clone();

        let rise = self.activity.note_spoke(peer, when, now);
        if !rise.any() {
            return;
        }
        let Some(p) = self.registry.get_mut(peer) else {
            return;
        };
        if rise.sounding {
            p.sounding = true;
        }
        if rise.speaking {
            p.speaking = true;
            p.last_active = p.last_active.max(when.voice);
            self.needs_resort = true;
        }
        let now_value = p.clone();
        self.pending_events
            .push(RosterEvent::Participant(crate::engine::registry::ParticipantUpdate {
                before: Some(before),
                now: Some(now_value),
            }));
    }

    fn note_active(&mut self, peer: PeerId, when: LastSpokeTimes, now: Timestamp) {
        let Some(existing) = self.registry.get(peer) else {
            return;
        };
        if !existing.may_be_heard() {
            return;
        }
        let before = existing.clone();

        let rose = self.activity.note_active(peer, now);
        let signaled_at = when.anything.max(when.voice);
        let Some(p) = self.registry.get_mut(peer) else {
            return;
        };
        let mut changed = false;
        if rose {
            p.speaking = true;
            changed = true;
        }
        if signaled_at > p.last_active {
            p.last_active = signaled_at;
            changed = true;
        }
        if changed {
            self.needs_resort = true;
            let now_value = p.clone();
            self.pending_events
                .push(RosterEvent::Participant(crate::engine::registry::ParticipantUpdate {
                    before: Some(before),
                    now: Some(now_value),
                }));
        }
    }

    fn set_full_count(&mut self, reported: u32) {
        // The server total may lag behind what we have materialized.
        let count = reported.max(self.registry.len() as u32);
        if count != self.state.full_count {
            self.state.full_count = count;
            self.pending_events.push(RosterEvent::FullCountChanged(count));
        }
    }

    fn ledger_full(&self) -> bool {
        self.unknown_ssrcs.len() + self.unknown_peers.len() >= self.limits.max_unknown_entries
    }

    fn finish(&mut self, was_empty: bool) {
        if self.needs_resort {
            self.registry.resort();
            self.needs_resort = false;
        }
        let empty = self.registry.is_empty();
        if empty != was_empty {
            self.pending_events
                .push(RosterEvent::CallEmptyChanged { empty });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ParticipantPayload, ResolveResponse};

    fn descriptor() -> CallDescriptor {
        CallDescriptor {
            id: CallId(7),
            access: AccessHash(0xdead),
            owner: PeerId(1_000),
        }
    }

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(descriptor(), Limits::default())
    }

    fn payload(peer: u64, ssrc: u32) -> ParticipantPayload {
        ParticipantPayload {
            peer: PeerId(peer),
            joined_at: Timestamp(1_000),
            last_active: Timestamp(0),
            raised_hand_rating: 0,
            ssrc,
            volume: 0,
            apply_volume_from_min: true,
            muted: false,
            can_self_unmute: true,
        }
    }

    fn slice(version: u64, participants: Vec<ParticipantPayload>, cursor: &str) -> SliceResponse {
        let full_count = participants.len() as u32;
        SliceResponse {
            version,
            participants,
            next_cursor: SliceCursor(cursor.to_owned()),
            full_count,
        }
    }

    fn snapshot_v5(engine: &mut ReconciliationEngine) {
        engine.apply_participants_slice(
            &slice(5, vec![payload(1, 10), payload(2, 11)], "p1"),
            SliceSource::Paginated,
            Timestamp(1_000),
        );
        engine.take_events();
    }

    #[test]
    fn diff_advances_version_and_remaps_ssrcs() {
        let mut engine = engine();
        snapshot_v5(&mut engine);
        assert_eq!(engine.version(), 5);

        let batch = DiffBatch {
            version: 6,
            entries: vec![
                DiffEntry::Left(PeerId(2)),
                DiffEntry::Upsert(payload(3, 12)),
            ],
        };
        assert_eq!(engine.apply_diff(&batch, Timestamp(2_000)), DiffDecision::Applied);

        assert_eq!(engine.version(), 6);
        assert_eq!(engine.peer_by_ssrc(Ssrc::new(11).unwrap()), None);
        assert_eq!(engine.peer_by_ssrc(Ssrc::new(12).unwrap()), Some(PeerId(3)));
    }

    #[test]
    fn duplicate_diff_is_a_silent_noop() {
        let mut engine = engine();
        snapshot_v5(&mut engine);

        let batch = DiffBatch {
            version: 5,
            entries: vec![DiffEntry::Left(PeerId(1))],
        };
        assert_eq!(
            engine.apply_diff(&batch, Timestamp(2_000)),
            DiffDecision::StaleDuplicate
        );
        assert!(engine.participant(PeerId(1)).is_some());
        assert!(engine.take_events().is_empty());
    }

    #[test]
    fn gap_diff_leaves_state_untouched() {
        let mut engine = engine();
        snapshot_v5(&mut engine);

        let batch = DiffBatch {
            version: 8,
            entries: vec![
                DiffEntry::Upsert(payload(9, 99)),
                DiffEntry::Left(PeerId(1)),
            ],
        };
        assert_eq!(
            engine.apply_diff(&batch, Timestamp(2_000)),
            DiffDecision::Gap { expected: 6, got: 8 }
        );
        assert_eq!(engine.version(), 5);
        assert_eq!(engine.participant_count(), 2);
        assert!(engine.participant(PeerId(9)).is_none());
        assert!(engine.take_events().is_empty());
    }

    #[test]
    fn merge_raising_last_active_reorders_the_view() {
        let mut engine = engine();
        snapshot_v5(&mut engine);
        let before: Vec<PeerId> = engine.ordered_participants().map(|p| p.peer).collect();
        assert_eq!(before, vec![PeerId(1), PeerId(2)]);

        let mut active = payload(2, 11);
        active.last_active = Timestamp(5_000);
        let batch = DiffBatch {
            version: 6,
            entries: vec![DiffEntry::Upsert(active)],
        };
        assert_eq!(engine.apply_diff(&batch, Timestamp(2_000)), DiffDecision::Applied);

        assert_eq!(
            engine.participant(PeerId(2)).unwrap().last_active,
            Timestamp(5_000)
        );
        let after: Vec<PeerId> = engine.ordered_participants().map(|p| p.peer).collect();
        assert_eq!(after, vec![PeerId(2), PeerId(1)]);
    }

    #[test]
    fn ssrc_handover_emits_deltas_for_both_peers() {
        let mut engine = engine();
        snapshot_v5(&mut engine);

        // Peer 3 joins on the stream peer 2 was using.
        let batch = DiffBatch {
            version: 6,
            entries: vec![DiffEntry::Upsert(payload(3, 11))],
        };
        assert_eq!(engine.apply_diff(&batch, Timestamp(2_000)), DiffDecision::Applied);

        assert_eq!(engine.participant(PeerId(2)).unwrap().ssrc, None);
        assert_eq!(engine.peer_by_ssrc(Ssrc::new(11).unwrap()), Some(PeerId(3)));
        let mutated: Vec<PeerId> = engine
            .take_events()
            .iter()
            .filter_map(|event| match event {
                RosterEvent::Participant(update) => update.now.as_ref().map(|p| p.peer),
                _ => None,
            })
            .collect();
        assert!(mutated.contains(&PeerId(2)));
        assert!(mutated.contains(&PeerId(3)));
    }

    #[test]
    fn reapplied_slice_is_idempotent() {
        let mut engine = engine();
        let page = slice(5, vec![payload(1, 10), payload(2, 11)], "p1");
        engine.apply_participants_slice(&page, SliceSource::Paginated, Timestamp(1_000));
        let count = engine.participant_count();
        let version = engine.version();

        engine.apply_participants_slice(&page, SliceSource::Paginated, Timestamp(1_500));
        assert_eq!(engine.participant_count(), count);
        assert_eq!(engine.version(), version);
    }

    #[test]
    fn empty_slice_with_unchanged_cursor_completes_the_roster() {
        let mut engine = engine();
        assert!(engine.begin_loading().is_some());
        snapshot_v5(&mut engine);
        assert_eq!(engine.phase(), RosterPhase::Partial);

        engine.apply_participants_slice(
            &slice(5, vec![], "p1"),
            SliceSource::Paginated,
            Timestamp(2_000),
        );
        assert!(engine.roster_complete());
        assert_eq!(engine.phase(), RosterPhase::Complete);
        assert!(engine.begin_loading().is_none());
        assert!(engine
            .take_events()
            .iter()
            .any(|e| *e == RosterEvent::RosterComplete));
    }

    #[test]
    fn slice_never_removes_existing_participants() {
        let mut engine = engine();
        snapshot_v5(&mut engine);

        engine.apply_participants_slice(
            &slice(5, vec![payload(3, 12)], "p2"),
            SliceSource::Paginated,
            Timestamp(2_000),
        );
        assert_eq!(engine.participant_count(), 3);
    }

    #[test]
    fn unknown_ssrc_signal_is_parked_then_replayed_on_resolution() {
        let mut engine = engine();
        snapshot_v5(&mut engine);

        let spoke = LastSpokeTimes {
            anything: Timestamp(1_900),
            voice: Timestamp(1_900),
        };
        assert_eq!(
            engine.apply_last_spoke(99, spoke, Timestamp(2_000)),
            SignalOutcome::QueuedUnknown
        );
        assert!(engine.has_pending_unknowns());

        let batch = engine.take_resolve_batch().unwrap();
        assert_eq!(batch.ssrcs.len(), 1);
        assert!(batch.ssrcs.contains(&Ssrc::new(99).unwrap()));

        engine.apply_resolve_response(
            &ResolveResponse {
                version: 5,
                participants: vec![payload(40, 99)],
            },
            Timestamp(2_050),
        );

        assert!(!engine.has_pending_unknowns());
        let p = engine.participant(PeerId(40)).unwrap();
        assert!(p.speaking && p.sounding);
        assert_eq!(p.last_active, Timestamp(1_900));
        assert_eq!(engine.peer_by_ssrc(Ssrc::new(99).unwrap()), Some(PeerId(40)));
    }

    #[test]
    fn unresolved_entries_are_evicted_after_the_retry_budget() {
        let mut engine = engine();
        let spoke = LastSpokeTimes {
            anything: Timestamp(900),
            voice: Timestamp(900),
        };
        engine.apply_last_spoke(99, spoke, Timestamp(1_000));

        let budget = Limits::default().resolve_retry_budget;
        for _ in 0..budget {
            assert!(engine.take_resolve_batch().is_some());
        }
        assert!(engine.take_resolve_batch().is_none());
        assert!(!engine.has_pending_unknowns());
    }

    #[test]
    fn activity_signal_for_known_ssrc_marks_speaking_and_resorts() {
        let mut engine = engine();
        snapshot_v5(&mut engine);

        let spoke = LastSpokeTimes {
            anything: Timestamp(1_990),
            voice: Timestamp(1_990),
        };
        assert_eq!(
            engine.apply_last_spoke(11, spoke, Timestamp(2_000)),
            SignalOutcome::Applied
        );

        let p = engine.participant(PeerId(2)).unwrap();
        assert!(p.speaking && p.sounding);
        let first = engine.ordered_participants().next().unwrap();
        assert_eq!(first.peer, PeerId(2));
    }

    #[test]
    fn sweep_clears_decayed_activity_with_one_event_per_peer() {
        let mut engine = engine();
        snapshot_v5(&mut engine);
        let spoke = LastSpokeTimes {
            anything: Timestamp(1_990),
            voice: Timestamp(1_990),
        };
        engine.apply_last_spoke(10, spoke, Timestamp(2_000));
        engine.take_events();

        let deadline = engine.next_sweep_deadline().unwrap();
        engine.sweep(deadline);

        let p = engine.participant(PeerId(1)).unwrap();
        assert!(!p.speaking && !p.sounding);
        let events = engine.take_events();
        let participant_events = events
            .iter()
            .filter(|e| matches!(e, RosterEvent::Participant(_)))
            .count();
        assert_eq!(participant_events, 1);
        assert_eq!(engine.next_sweep_deadline(), None);
    }

    #[test]
    fn force_muted_participant_ignores_activity() {
        let mut engine = engine();
        let mut silenced = payload(1, 10);
        silenced.muted = true;
        silenced.can_self_unmute = false;
        engine.apply_participants_slice(
            &slice(5, vec![silenced], "p1"),
            SliceSource::Paginated,
            Timestamp(1_000),
        );
        engine.take_events();

        let spoke = LastSpokeTimes {
            anything: Timestamp(1_990),
            voice: Timestamp(1_990),
        };
        engine.apply_last_spoke(10, spoke, Timestamp(2_000));
        assert!(!engine.participant(PeerId(1)).unwrap().speaking);
        assert!(engine.take_events().is_empty());
    }

    #[test]
    fn metadata_version_gate_rejects_stale_pushes() {
        let mut engine = engine();
        let mut meta = CallMetadataPayload {
            id: CallId(7),
            version: 4,
            title: "standup".into(),
            record_start: Timestamp::ZERO,
            full_count: 2,
            join_muted: false,
            can_change_join_muted: true,
        };
        assert!(engine.apply_call_metadata(&meta, false));
        assert_eq!(engine.title(), "standup");

        meta.version = 3;
        meta.title = "older".into();
        assert!(!engine.apply_call_metadata(&meta, false));
        assert_eq!(engine.title(), "standup");

        // A deliberate reload applies regardless.
        assert!(engine.apply_call_metadata(&meta, true));
        assert_eq!(engine.title(), "older");
        assert_eq!(engine.version(), 4);
    }

    #[test]
    fn active_update_without_known_peer_uses_inline_data() {
        let mut engine = engine();
        snapshot_v5(&mut engine);

        let when = LastSpokeTimes {
            anything: Timestamp(2_000),
            voice: Timestamp(2_000),
        };
        let inline = payload(50, 0);
        assert_eq!(
            engine.apply_active_update(PeerId(50), when, Some(&inline), Timestamp(2_000)),
            SignalOutcome::Applied
        );

        let p = engine.participant(PeerId(50)).unwrap();
        assert!(p.partial);
        assert!(p.speaking);
        assert_eq!(p.last_active, Timestamp(2_000));
    }

    #[test]
    fn join_mute_policy_respects_changeability() {
        let mut engine = engine();
        let meta = CallMetadataPayload {
            id: CallId(7),
            version: 2,
            title: String::new(),
            record_start: Timestamp::ZERO,
            full_count: 0,
            join_muted: true,
            can_change_join_muted: false,
        };
        engine.apply_call_metadata(&meta, false);
        assert!(engine.join_muted());
        assert!(!engine.set_join_muted_locally(false));
        assert!(engine.join_muted());
    }
}
