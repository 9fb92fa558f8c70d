//! Reconciliation engine.
//!
//! Module hierarchy follows dependency order:
//! - registry: roster storage plus the ssrc reverse index (Layer 0)
//! - activity: voice-activity decay deadlines (Layer 0)
//! - events: the observable change stream (Layer 1)
//! - transport: injected collaborator contracts (Layer 1)
//! - reconcile: versioned merge of metadata, slices, and diffs (Layer 2)
//! - session: per-call façade tying it all together (Layer 3)

pub mod activity;
pub mod events;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod transport;

pub use activity::{ActivityLapse, ActivityRise, ActivityTracker};
pub use events::{BroadcastError, DropReason, EventSubscription, RosterBroadcaster, RosterEvent};
pub use reconcile::{
    CallDescriptor, DiffDecision, ReconciliationEngine, ResolveBatch, RosterPhase, SignalOutcome,
    SliceSource,
};
pub use registry::{ParticipantRegistry, ParticipantUpdate, UpsertOutcome};
pub use session::GroupCallSession;
pub use transport::{Clock, PeerDirectory, RequestId, TimerHandle, TimerService, Transport};
