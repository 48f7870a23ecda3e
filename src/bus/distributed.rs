use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::{BusError, EventBus, LocalEventBus, Registry, Subscription};
use crate::coordination::Coordinator;
use crate::models::TallySnapshot;

/// Reconnection behaviour for channel listeners.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first resubscription attempt
    pub initial_delay: Duration,
    /// Upper bound for the doubling delay
    pub max_delay: Duration,
    /// How often an idle listener checks whether it still has local subscribers
    pub idle_check: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            idle_check: Duration::from_secs(1),
        }
    }
}

pub fn channel_name(topic: &str) -> String {
    format!("ballot:{}:updates", topic)
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    snapshot: TallySnapshot,
}

struct Listener {
    id: u64,
    handle: JoinHandle<()>,
}

type Listeners = Arc<Mutex<HashMap<String, Listener>>>;

fn listeners_guard(listeners: &Listeners) -> MutexGuard<'_, HashMap<String, Listener>> {
    listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fan-out across processes through a coordinator channel.
///
/// Local subscribers are served directly by the publishing process, so they
/// keep receiving updates during a coordinator outage. Each topic with local
/// subscribers gets one listener task that relays updates published by other
/// processes. Cross-process delivery is best effort: at most once, unordered,
/// and lost while a listener is reconnecting.
pub struct DistributedEventBus {
    local: LocalEventBus,
    coordinator: Arc<dyn Coordinator>,
    origin: Uuid,
    reconnect: ReconnectConfig,
    listeners: Listeners,
    next_listener: AtomicU64,
}

impl DistributedEventBus {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        queue_capacity: usize,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            local: LocalEventBus::with_queue_capacity(queue_capacity),
            coordinator,
            origin: Uuid::new_v4(),
            reconnect,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn has_listener(&self, topic: &str) -> bool {
        listeners_guard(&self.listeners)
            .get(topic)
            .map(|listener| !listener.handle.is_finished())
            .unwrap_or(false)
    }

    fn ensure_listener(&self, topic: &str) {
        let mut listeners = listeners_guard(&self.listeners);
        if let Some(existing) = listeners.get(topic) {
            if !existing.handle.is_finished() {
                return;
            }
        }

        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let task = ListenerTask {
            id,
            topic: topic.to_string(),
            channel: channel_name(topic),
            coordinator: Arc::clone(&self.coordinator),
            registry: self.local.registry(),
            origin: self.origin,
            reconnect: self.reconnect.clone(),
            listeners: Arc::clone(&self.listeners),
        };
        let handle = tokio::spawn(task.run());
        listeners.insert(topic.to_string(), Listener { id, handle });
    }
}

impl Drop for DistributedEventBus {
    fn drop(&mut self) {
        for (_, listener) in listeners_guard(&self.listeners).drain() {
            listener.handle.abort();
        }
    }
}

#[async_trait]
impl EventBus for DistributedEventBus {
    async fn publish(&self, topic: &str, snapshot: TallySnapshot) -> Result<usize, BusError> {
        let delivered = self.local.deliver(topic, &snapshot);

        let payload = serde_json::to_string(&Envelope {
            origin: self.origin,
            snapshot,
        })
        .map_err(|e| BusError::Encode(e.to_string()))?;

        let remote = self
            .coordinator
            .publish(&channel_name(topic), payload)
            .await?;
        debug!("Relayed update for {} to {} listener(s)", topic, remote);
        Ok(delivered)
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        let subscription = self.local.subscribe(topic);
        self.ensure_listener(topic);
        subscription
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.local.subscriber_count(topic)
    }

    fn topics(&self) -> Vec<String> {
        self.local.topics()
    }

    fn reclaim(&self, topic: &str) -> bool {
        // Held across both steps so a concurrent subscribe spawns a fresh listener
        let mut listeners = listeners_guard(&self.listeners);
        if !self.local.reclaim(topic) {
            return false;
        }
        if let Some(listener) = listeners.remove(topic) {
            listener.handle.abort();
        }
        true
    }
}

struct ListenerTask {
    id: u64,
    topic: String,
    channel: String,
    coordinator: Arc<dyn Coordinator>,
    registry: Arc<Registry>,
    origin: Uuid,
    reconnect: ReconnectConfig,
    listeners: Listeners,
}

impl ListenerTask {
    async fn run(self) {
        loop {
            self.listen().await;

            // Subscribers register before taking the listeners lock, so a zero
            // count seen under it means nobody is relying on this listener
            let mut listeners = listeners_guard(&self.listeners);
            if listeners.get(&self.topic).map(|l| l.id) != Some(self.id) {
                return;
            }
            if self.registry.count(&self.topic) == 0 {
                listeners.remove(&self.topic);
                return;
            }
            debug!("Subscriber joined {} while listener was exiting, staying", self.topic);
        }
    }

    async fn listen(&self) {
        let mut delay = self.reconnect.initial_delay;

        loop {
            if self.registry.count(&self.topic) == 0 {
                debug!("No local subscribers left for {}, listener exiting", self.topic);
                return;
            }

            match self.coordinator.subscribe(&self.channel).await {
                Ok(mut messages) => {
                    info!("Listening for remote updates on {}", self.channel);
                    delay = self.reconnect.initial_delay;

                    let mut idle = interval(self.reconnect.idle_check);
                    idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            message = messages.next() => match message {
                                Some(payload) => self.relay(&payload),
                                None => {
                                    warn!("Lost subscription to {}, reconnecting", self.channel);
                                    break;
                                }
                            },
                            _ = idle.tick() => {
                                if self.registry.count(&self.topic) == 0 {
                                    debug!("No local subscribers left for {}, listener exiting", self.topic);
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!(
                    "Subscribing to {} failed, retrying in {:?}: {}",
                    self.channel, delay, e
                ),
            }

            sleep(delay).await;
            delay = (delay * 2).min(self.reconnect.max_delay);
        }
    }

    fn relay(&self, payload: &str) {
        match serde_json::from_str::<Envelope>(payload) {
            // Local subscribers already got our own updates at publish time
            Ok(envelope) if envelope.origin == self.origin => {}
            Ok(envelope) => {
                let delivered = self.registry.deliver(&self.topic, &envelope.snapshot);
                debug!(
                    "Relayed remote tally #{} for {} to {} subscriber(s)",
                    envelope.snapshot.total_votes, self.topic, delivered
                );
            }
            Err(e) => warn!("Discarding malformed update on {}: {}", self.channel, e),
        }
    }
}
