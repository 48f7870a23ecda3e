use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

use super::{BusError, EventBus, Registry, Subscription, DEFAULT_QUEUE_CAPACITY};
use crate::models::TallySnapshot;

/// Single-process fan-out straight into subscriber queues.
pub struct LocalEventBus {
    registry: Arc<Registry>,
    queue_capacity: usize,
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            queue_capacity,
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub(crate) fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub(crate) fn deliver(&self, topic: &str, snapshot: &TallySnapshot) -> usize {
        let delivered = self.registry.deliver(topic, snapshot);
        debug!(
            "Delivered tally #{} for {} to {} local subscriber(s)",
            snapshot.total_votes, topic, delivered
        );
        delivered
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, topic: &str, snapshot: TallySnapshot) -> Result<usize, BusError> {
        Ok(self.deliver(topic, &snapshot))
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        self.registry.register(topic, self.queue_capacity)
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.count(topic)
    }

    fn topics(&self) -> Vec<String> {
        self.registry.topics()
    }

    fn reclaim(&self, topic: &str) -> bool {
        self.registry.reclaim(topic)
    }
}
