//! Roster change notifications.
//!
//! A bounded-subscriber broadcaster over crossbeam channels. Events for a
//! given peer are published in the order their causing mutations applied;
//! a subscriber that stops draining is dropped rather than allowed to
//! block the engine.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender, TryRecvError, TrySendError};
use thiserror::Error;

use crate::core::Timestamp;
use crate::engine::registry::ParticipantUpdate;

/// One engine-observable change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RosterEvent {
    /// A participant was inserted, mutated, or removed.
    Participant(ParticipantUpdate),
    /// A pagination slice was appended to the roster.
    SliceAppended,
    /// Every participant has been received; the roster is complete.
    RosterComplete,
    TitleChanged(String),
    /// Zero timestamp means recording stopped / never started.
    RecordStartChanged(Timestamp),
    FullCountChanged(u32),
    /// The roster transitioned between empty and non-empty.
    CallEmptyChanged { empty: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    SubscriberLagged,
}

#[derive(Debug)]
pub struct EventSubscription {
    receiver: Receiver<RosterEvent>,
    drop_reason: Arc<Mutex<Option<DropReason>>>,
}

impl EventSubscription {
    pub fn try_recv(&self) -> Result<RosterEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<RosterEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        self.drop_reason.lock().ok().and_then(|guard| *guard)
    }
}

#[derive(Clone)]
pub struct RosterBroadcaster {
    inner: Arc<Mutex<BroadcasterState>>,
}

impl RosterBroadcaster {
    pub fn new(max_subscribers: usize, queue_events: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BroadcasterState {
                max_subscribers,
                queue_events,
                next_subscriber_id: 1,
                subscribers: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe(&self) -> Result<EventSubscription, BroadcastError> {
        let mut state = self.lock_state()?;
        if state.subscribers.len() >= state.max_subscribers {
            return Err(BroadcastError::SubscriberLimitReached {
                max_subscribers: state.max_subscribers,
            });
        }

        let (sender, receiver) = crossbeam::channel::bounded(state.queue_events);
        let drop_reason = Arc::new(Mutex::new(None));
        let id = state.next_subscriber_id;
        state.next_subscriber_id = state.next_subscriber_id.saturating_add(1);
        state.subscribers.insert(
            id,
            SubscriberState {
                sender,
                drop_reason: Arc::clone(&drop_reason),
            },
        );

        Ok(EventSubscription {
            receiver,
            drop_reason,
        })
    }

    pub fn publish(&self, event: RosterEvent) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };

        let mut dropped = Vec::new();
        for (id, subscriber) in &state.subscribers {
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    subscriber.set_drop_reason(DropReason::SubscriberLagged);
                    dropped.push(*id);
                }
                Err(TrySendError::Disconnected(_)) => {
                    dropped.push(*id);
                }
            }
        }

        for id in dropped {
            state.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> Result<usize, BroadcastError> {
        Ok(self.lock_state()?.subscribers.len())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, BroadcasterState>, BroadcastError> {
        self.inner.lock().map_err(|_| BroadcastError::LockPoisoned)
    }
}

struct BroadcasterState {
    max_subscribers: usize,
    queue_events: usize,
    next_subscriber_id: u64,
    subscribers: BTreeMap<u64, SubscriberState>,
}

struct SubscriberState {
    sender: Sender<RosterEvent>,
    drop_reason: Arc<Mutex<Option<DropReason>>>,
}

impl SubscriberState {
    fn set_drop_reason(&self, reason: DropReason) {
        if let Ok(mut guard) = self.drop_reason.lock()
            && guard.is_none()
        {
            *guard = Some(reason);
        }
    }
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("subscriber limit reached ({max_subscribers})")]
    SubscriberLimitReached { max_subscribers: usize },
    #[error("broadcaster lock poisoned")]
    LockPoisoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broadcaster(queue: usize) -> RosterBroadcaster {
        RosterBroadcaster::new(2, queue)
    }

    #[test]
    fn delivers_events_in_order() {
        let broadcaster = broadcaster(8);
        let sub = broadcaster.subscribe().unwrap();

        broadcaster.publish(RosterEvent::TitleChanged("a".into()));
        broadcaster.publish(RosterEvent::TitleChanged("b".into()));

        assert_eq!(sub.try_recv().unwrap(), RosterEvent::TitleChanged("a".into()));
        assert_eq!(sub.try_recv().unwrap(), RosterEvent::TitleChanged("b".into()));
    }

    #[test]
    fn lagging_subscriber_is_dropped_not_blocked() {
        let broadcaster = broadcaster(1);
        let sub = broadcaster.subscribe().unwrap();

        broadcaster.publish(RosterEvent::SliceAppended);
        broadcaster.publish(RosterEvent::SliceAppended);

        assert_eq!(sub.drop_reason(), Some(DropReason::SubscriberLagged));
        assert_eq!(broadcaster.subscriber_count().unwrap(), 0);
    }

    #[test]
    fn subscriber_limit_is_enforced() {
        let broadcaster = broadcaster(8);
        let _a = broadcaster.subscribe().unwrap();
        let _b = broadcaster.subscribe().unwrap();
        let err = broadcaster.subscribe().unwrap_err();
        assert!(matches!(err, BroadcastError::SubscriberLimitReached { .. }));
    }
}
