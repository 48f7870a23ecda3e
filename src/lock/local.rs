use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Mutex as AsyncMutex;

use super::{BallotLock, BallotLockGuard, LockError};

/// Process-local per-ballot lock. Not exclusive across processes.
#[derive(Default)]
pub struct LocalBallotLock {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LocalBallotLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BallotLock for LocalBallotLock {
    async fn acquire(&self, ballot_id: &str) -> Result<BallotLockGuard, LockError> {
        // Clone under the map lock so `forget` sees this waiter
        let mutex = Arc::clone(
            self.locks()
                .entry(ballot_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        );
        let guard = mutex.lock_owned().await;
        Ok(BallotLockGuard::local(ballot_id, guard))
    }

    fn tracked_ballots(&self) -> Vec<String> {
        self.locks().keys().cloned().collect()
    }

    fn forget(&self, ballot_id: &str) -> bool {
        let mut locks = self.locks();
        let idle = locks
            .get(ballot_id)
            .map(|mutex| Arc::strong_count(mutex) == 1)
            .unwrap_or(false);
        if idle {
            locks.remove(ballot_id);
        }
        idle
    }
}
