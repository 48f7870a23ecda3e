//! Tally-change fan-out from the vote recorder to live subscribers.
//!
//! ```text
//!   VoteRecorder ── publish(ballot) ──► EventBus ──► [queue] ──► LiveUpdateStream
//!                                          │  ├────► [queue] ──► LiveUpdateStream
//!                                          │  └────► [queue] ──► LiveUpdateStream
//!                                          ▼
//!                        coordinator channel "ballot:{id}:updates"
//!                                          │
//!                                          ▼
//!                        listener in every other process ──► its local queues
//! ```
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a full queue
//! loses that update for its own subscriber only.

mod distributed;
mod local;

pub use distributed::{channel_name, DistributedEventBus, ReconnectConfig};
pub use local::LocalEventBus;

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::coordination::CoordinationError;
use crate::models::TallySnapshot;

/// Snapshots buffered per subscriber before updates start being dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("broadcast channel unavailable: {0}")]
    Unavailable(#[from] CoordinationError),

    #[error("could not encode update: {0}")]
    Encode(String),
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Fans a snapshot out to the topic's subscribers without waiting on any of
    /// them. Returns how many local queues accepted it.
    async fn publish(&self, topic: &str, snapshot: TallySnapshot) -> Result<usize, BusError>;

    /// Starts receiving snapshots published from now on.
    fn subscribe(&self, topic: &str) -> Subscription;

    fn unsubscribe(&self, subscription: &mut Subscription) {
        subscription.unsubscribe();
    }

    fn subscriber_count(&self, topic: &str) -> usize;

    /// Topics with bookkeeping in this process, including ones whose
    /// subscribers have all left.
    fn topics(&self) -> Vec<String>;

    /// Drops a topic's bookkeeping if, and only if, it has no subscribers.
    fn reclaim(&self, topic: &str) -> bool;
}

struct Slot {
    id: u64,
    sender: mpsc::Sender<TallySnapshot>,
}

/// Subscriber queues by topic, shared by a bus and its subscription handles.
#[derive(Default)]
pub(crate) struct Registry {
    topics: Mutex<HashMap<String, Vec<Slot>>>,
    next_id: AtomicU64,
}

impl Registry {
    fn topics_guard(&self) -> MutexGuard<'_, HashMap<String, Vec<Slot>>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register(self: &Arc<Self>, topic: &str, capacity: usize) -> Subscription {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics_guard()
            .entry(topic.to_string())
            .or_default()
            .push(Slot { id, sender });
        debug!("Subscriber {} joined topic {}", id, topic);

        Subscription {
            id,
            topic: topic.to_string(),
            receiver,
            registry: Arc::downgrade(self),
            active: true,
        }
    }

    fn remove(&self, topic: &str, id: u64) {
        if let Some(slots) = self.topics_guard().get_mut(topic) {
            slots.retain(|slot| slot.id != id);
        }
        debug!("Subscriber {} left topic {}", id, topic);
    }

    pub(crate) fn count(&self, topic: &str) -> usize {
        self.topics_guard()
            .get(topic)
            .map(|slots| slots.iter().filter(|slot| !slot.sender.is_closed()).count())
            .unwrap_or(0)
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        self.topics_guard().keys().cloned().collect()
    }

    pub(crate) fn reclaim(&self, topic: &str) -> bool {
        let mut topics = self.topics_guard();
        let idle = topics
            .get(topic)
            .map(|slots| slots.iter().all(|slot| slot.sender.is_closed()))
            .unwrap_or(false);
        if idle {
            topics.remove(topic);
        }
        idle
    }

    pub(crate) fn deliver(&self, topic: &str, snapshot: &TallySnapshot) -> usize {
        let mut topics = self.topics_guard();
        let Some(slots) = topics.get_mut(topic) else {
            return 0;
        };

        let mut delivered = 0;
        slots.retain(|slot| match slot.sender.try_send(snapshot.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("Subscriber {} on topic {} is full, dropping update", slot.id, topic);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }
}

/// One subscriber's end of a topic. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: String,
    receiver: mpsc::Receiver<TallySnapshot>,
    registry: Weak<Registry>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Next snapshot, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<TallySnapshot> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TallySnapshot> {
        self.receiver.try_recv().ok()
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<TallySnapshot>> {
        self.receiver.poll_recv(cx)
    }

    /// Leaves the topic. Safe to call repeatedly, and after the bus is gone.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.receiver.close();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.topic, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
