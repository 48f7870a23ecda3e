//! Per-ballot mutual exclusion.
//!
//! Every vote for a ballot runs its validate, persist, broadcast sequence while
//! holding that ballot's lock. [`LocalBallotLock`] is exclusive within one
//! process; [`LeaseBallotLock`] is exclusive across every process sharing a
//! [`Coordinator`](crate::coordination::Coordinator), and
//! [`FallbackBallotLock`] degrades from the latter to the former when the
//! coordinator cannot be reached.

mod lease;
mod local;

pub use lease::{FallbackBallotLock, LeaseBallotLock, LeaseConfig, LeaseHold};
pub use local::LocalBallotLock;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::coordination::CoordinationError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock service unavailable: {0}")]
    Unavailable(#[from] CoordinationError),

    #[error("timed out waiting for the lock on ballot {0}")]
    Timeout(String),

    #[error("lease on ballot {0} was lost while held")]
    LeaseLost(String),
}

#[async_trait]
pub trait BallotLock: Send + Sync {
    /// Waits until this caller exclusively owns the lock for `ballot_id`.
    async fn acquire(&self, ballot_id: &str) -> Result<BallotLockGuard, LockError>;

    /// Ballots with lock bookkeeping held in this process.
    fn tracked_ballots(&self) -> Vec<String>;

    /// Drops bookkeeping for an idle ballot. Returns `false` if the lock is held
    /// or awaited, or was not tracked.
    fn forget(&self, ballot_id: &str) -> bool;
}

enum Hold {
    Local(OwnedMutexGuard<()>),
    Lease(LeaseHold),
    Released,
}

/// Ownership of one ballot's lock.
///
/// Call [`release`](Self::release) on every normal path. If the guard is dropped
/// instead (an error unwound past it, or the owning task was cancelled) the lock
/// is still released: immediately for a local lock, on a background task for
/// a lease.
pub struct BallotLockGuard {
    ballot_id: String,
    hold: Hold,
}

impl BallotLockGuard {
    pub(crate) fn local(ballot_id: &str, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            ballot_id: ballot_id.to_string(),
            hold: Hold::Local(guard),
        }
    }

    pub(crate) fn lease(ballot_id: &str, hold: LeaseHold) -> Self {
        Self {
            ballot_id: ballot_id.to_string(),
            hold: Hold::Lease(hold),
        }
    }

    pub fn ballot_id(&self) -> &str {
        &self.ballot_id
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self.hold, Hold::Lease(_))
    }

    /// Fails if a lease backing this guard expired while it was held.
    pub fn check(&self) -> Result<(), LockError> {
        match &self.hold {
            Hold::Lease(hold) if hold.is_lost() => Err(LockError::LeaseLost(self.ballot_id.clone())),
            _ => Ok(()),
        }
    }

    pub async fn release(mut self) {
        match std::mem::replace(&mut self.hold, Hold::Released) {
            Hold::Lease(hold) => hold.release().await,
            Hold::Local(guard) => drop(guard),
            Hold::Released => {}
        }
    }
}

impl Drop for BallotLockGuard {
    fn drop(&mut self) {
        if let Hold::Lease(hold) = std::mem::replace(&mut self.hold, Hold::Released) {
            hold.release_in_background();
        }
    }
}
