use async_trait::async_trait;
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use super::{BallotLock, BallotLockGuard, LocalBallotLock, LockError};
use crate::coordination::Coordinator;

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long a lease survives without renewal
    pub lease: Duration,
    /// Give up waiting for a contended lease after this long
    pub acquire_timeout: Duration,
    /// Pause between attempts on a contended lease
    pub retry_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(20),
        }
    }
}

fn lease_key(ballot_id: &str) -> String {
    format!("lock:ballot:{}", ballot_id)
}

/// Cluster-wide per-ballot lock built on coordinator leases.
///
/// While a guard is held a heartbeat renews the lease every third of its
/// duration. If renewal fails for a whole lease period the guard is marked lost
/// and the loss is logged as an alarm; callers check the guard before
/// committing work.
pub struct LeaseBallotLock {
    coordinator: Arc<dyn Coordinator>,
    config: LeaseConfig,
}

impl LeaseBallotLock {
    pub fn new(coordinator: Arc<dyn Coordinator>, config: LeaseConfig) -> Self {
        Self { coordinator, config }
    }
}

#[async_trait]
impl BallotLock for LeaseBallotLock {
    async fn acquire(&self, ballot_id: &str) -> Result<BallotLockGuard, LockError> {
        let key = lease_key(ballot_id);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            if self
                .coordinator
                .try_acquire_lease(&key, &token, self.config.lease)
                .await?
            {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Timed out waiting for lease {}", key);
                return Err(LockError::Timeout(ballot_id.to_string()));
            }
            sleep(self.config.retry_interval.min(deadline - now)).await;
        }

        debug!("Acquired lease {}", key);
        let hold = LeaseHold::start(Arc::clone(&self.coordinator), key, token, self.config.lease);
        Ok(BallotLockGuard::lease(ballot_id, hold))
    }

    // Lease state lives in the coordinator and expires on its own
    fn tracked_ballots(&self) -> Vec<String> {
        Vec::new()
    }

    fn forget(&self, _ballot_id: &str) -> bool {
        false
    }
}

/// A held lease and the heartbeat keeping it alive.
pub struct LeaseHold {
    coordinator: Arc<dyn Coordinator>,
    key: String,
    token: String,
    lost: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
}

impl LeaseHold {
    fn start(coordinator: Arc<dyn Coordinator>, key: String, token: String, lease: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat(
            Arc::clone(&coordinator),
            key.clone(),
            token.clone(),
            lease,
            Arc::clone(&lost),
        ));
        Self {
            coordinator,
            key,
            token,
            lost,
            heartbeat,
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub async fn release(self) {
        self.heartbeat.abort();
        release_lease(self.coordinator, self.key, self.token).await;
    }

    pub(crate) fn release_in_background(self) {
        self.heartbeat.abort();
        let LeaseHold {
            coordinator,
            key,
            token,
            ..
        } = self;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_lease(coordinator, key, token));
            }
            Err(_) => warn!("No runtime to release lease {}, leaving it to expire", key),
        }
    }
}

async fn release_lease(coordinator: Arc<dyn Coordinator>, key: String, token: String) {
    match coordinator.release_lease(&key, &token).await {
        Ok(true) => debug!("Released lease {}", key),
        Ok(false) => warn!("Lease {} was already gone at release", key),
        Err(e) => warn!("Failed to release lease {}, it will expire: {}", key, e),
    }
}

async fn heartbeat(
    coordinator: Arc<dyn Coordinator>,
    key: String,
    token: String,
    lease: Duration,
    lost: Arc<AtomicBool>,
) {
    let period = (lease / 3).max(Duration::from_millis(1));
    let mut last_renewed = Instant::now();

    loop {
        sleep(period).await;
        match coordinator.renew_lease(&key, &token, lease).await {
            Ok(true) => last_renewed = Instant::now(),
            Ok(false) => {
                error!("ALARM: lease {} expired while held", key);
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                if last_renewed.elapsed() >= lease {
                    error!("ALARM: lease {} could not be renewed within its lease: {}", key, e);
                    lost.store(true, Ordering::SeqCst);
                    return;
                }
                warn!("Renewing lease {} failed, retrying: {}", key, e);
            }
        }
    }
}

/// Distributed lock that falls back to a process-local lock when the
/// coordinator is unreachable. Only sound when a single process serves votes.
pub struct FallbackBallotLock {
    primary: LeaseBallotLock,
    local: LocalBallotLock,
}

impl FallbackBallotLock {
    pub fn new(primary: LeaseBallotLock) -> Self {
        Self {
            primary,
            local: LocalBallotLock::new(),
        }
    }
}

#[async_trait]
impl BallotLock for FallbackBallotLock {
    async fn acquire(&self, ballot_id: &str) -> Result<BallotLockGuard, LockError> {
        match self.primary.acquire(ballot_id).await {
            Err(LockError::Unavailable(e)) => {
                warn!(
                    "Lock service unavailable ({}), using process-local lock for ballot {}; not safe across processes",
                    e, ballot_id
                );
                self.local.acquire(ballot_id).await
            }
            other => other,
        }
    }

    fn tracked_ballots(&self) -> Vec<String> {
        self.local.tracked_ballots()
    }

    fn forget(&self, ballot_id: &str) -> bool {
        self.local.forget(ballot_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinator;

    fn config() -> LeaseConfig {
        LeaseConfig {
            lease: Duration::from_secs(3),
            acquire_timeout: Duration::from_millis(200),
            retry_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn lease_is_exclusive_across_lock_instances() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let worker_a = LeaseBallotLock::new(coordinator.clone(), config());
        let worker_b = LeaseBallotLock::new(coordinator.clone(), config());

        let guard = worker_a.acquire("b1").await.unwrap();
        assert!(guard.is_distributed());
        assert!(matches!(worker_b.acquire("b1").await, Err(LockError::Timeout(_))));

        guard.release().await;
        let guard_b = worker_b.acquire("b1").await.unwrap();
        guard_b.release().await;
        assert!(coordinator.lease_holder("lock:ballot:b1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_lease_alive_past_its_duration() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let lock = LeaseBallotLock::new(coordinator.clone(), config());

        let guard = lock.acquire("b1").await.unwrap();
        sleep(Duration::from_secs(10)).await;

        assert!(guard.check().is_ok());
        assert!(coordinator.lease_holder("lock:ballot:b1").is_some());
        guard.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn outage_longer_than_lease_marks_guard_lost() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let lock = LeaseBallotLock::new(coordinator.clone(), config());

        let guard = lock.acquire("b1").await.unwrap();
        coordinator.set_online(false);
        sleep(Duration::from_secs(5)).await;

        assert!(matches!(guard.check(), Err(LockError::LeaseLost(_))));
    }

    #[tokio::test]
    async fn unreachable_coordinator_is_an_error_in_strict_mode() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        coordinator.set_online(false);
        let lock = LeaseBallotLock::new(coordinator, config());

        assert!(matches!(lock.acquire("b1").await, Err(LockError::Unavailable(_))));
    }

    #[tokio::test]
    async fn permissive_mode_falls_back_to_local_lock() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        coordinator.set_online(false);
        let lock = FallbackBallotLock::new(LeaseBallotLock::new(coordinator, config()));

        let guard = lock.acquire("b1").await.unwrap();
        assert!(!guard.is_distributed());
        assert_eq!(lock.tracked_ballots(), vec!["b1".to_string()]);
        guard.release().await;
    }

    #[tokio::test]
    async fn contention_timeout_does_not_fall_back() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let holder = LeaseBallotLock::new(coordinator.clone(), config());
        let lock = FallbackBallotLock::new(LeaseBallotLock::new(coordinator, config()));

        let _held = holder.acquire("b1").await.unwrap();
        assert!(matches!(lock.acquire("b1").await, Err(LockError::Timeout(_))));
    }

    #[tokio::test]
    async fn dropped_lease_guard_is_released_in_background() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let lock = LeaseBallotLock::new(coordinator.clone(), config());

        drop(lock.acquire("b1").await.unwrap());
        for _ in 0..50 {
            if coordinator.lease_holder("lock:ballot:b1").is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(coordinator.lease_holder("lock:ballot:b1").is_none());
    }
}
