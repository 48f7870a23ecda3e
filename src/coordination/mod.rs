//! Cluster coordination primitives: key-based leases and topic pub/sub.
//!
//! The distributed lock and bus variants talk to a [`Coordinator`]. Every
//! process in a deployment shares one coordinator, which is what makes their
//! locks exclusive and their broadcasts visible to each other.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Messages delivered on a subscribed channel. The stream ending means the
/// subscription was lost and has to be re-established.
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("coordination service unreachable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Takes the lease on `key` for `token` unless another token holds an unexpired lease.
    async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError>;

    /// Extends a lease still held by `token`. Returns `false` if it was lost.
    async fn renew_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError>;

    async fn release_lease(&self, key: &str, token: &str) -> Result<bool, CoordinationError>;

    /// Returns the number of subscribers the message reached.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, CoordinationError>;

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, CoordinationError>;
}

struct Lease {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct SharedState {
    leases: HashMap<String, Lease>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// Coordinator living in process memory. Sharing one instance between several
/// service instances stands in for a networked coordination service; taking it
/// offline simulates an outage (all calls fail, open subscriptions end).
pub struct InMemoryCoordinator {
    state: Mutex<SharedState>,
    online: AtomicBool,
    channel_capacity: usize,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            state: Mutex::new(SharedState::default()),
            online: AtomicBool::new(true),
            channel_capacity,
        }
    }

    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online && !online {
            warn!("Coordinator going offline, dropping all channel subscriptions");
            if let Ok(mut state) = self.state.lock() {
                state.channels.clear();
            }
        } else if !was_online && online {
            info!("Coordinator back online");
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Token currently holding an unexpired lease on `key`.
    pub fn lease_holder(&self, key: &str) -> Option<String> {
        let state = self.state.lock().ok()?;
        state
            .leases
            .get(key)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.token.clone())
    }

    pub fn channel_subscribers(&self, channel: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.channels.get(channel).map(|sender| sender.receiver_count()))
            .unwrap_or(0)
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut SharedState) -> T,
    ) -> Result<T, CoordinationError> {
        if !self.is_online() {
            return Err(CoordinationError::Unreachable("coordinator offline".to_string()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| CoordinationError::Unreachable("coordinator state poisoned".to_string()))?;
        Ok(f(&mut state))
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        self.with_state(|state| {
            let now = Instant::now();
            if let Some(existing) = state.leases.get(key) {
                if existing.token != token && existing.expires_at > now {
                    return false;
                }
            }
            state.leases.insert(
                key.to_string(),
                Lease {
                    token: token.to_string(),
                    expires_at: now + ttl,
                },
            );
            true
        })
    }

    async fn renew_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        self.with_state(|state| {
            let now = Instant::now();
            match state.leases.get_mut(key) {
                Some(lease) if lease.token == token && lease.expires_at > now => {
                    lease.expires_at = now + ttl;
                    true
                }
                _ => false,
            }
        })
    }

    async fn release_lease(&self, key: &str, token: &str) -> Result<bool, CoordinationError> {
        self.with_state(|state| match state.leases.get(key) {
            Some(lease) if lease.token == token => {
                state.leases.remove(key);
                true
            }
            _ => false,
        })
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, CoordinationError> {
        self.with_state(|state| {
            let reached = match state.channels.get(channel) {
                Some(sender) => sender.send(payload).unwrap_or(0),
                None => return 0,
            };
            if reached == 0 {
                state.channels.remove(channel);
            }
            reached
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, CoordinationError> {
        let capacity = self.channel_capacity;
        let receiver = self.with_state(|state| {
            // Channels whose subscribers all went away
            state.channels.retain(|_, sender| sender.receiver_count() > 0);
            state
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(capacity).0)
                .subscribe()
        })?;

        let channel = channel.to_string();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| match item {
            Ok(payload) => Some(payload),
            Err(e) => {
                debug!("Channel {} subscriber lagged: {}", channel, e);
                None
            }
        });
        Ok(Box::pin(stream))
    }
}
