use thiserror::Error;

use crate::bus::BusError;
use crate::db::RepositoryError;
use crate::lock::LockError;
use crate::models::BallotStatus;

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("ballot {0} not found")]
    BallotNotFound(String),

    #[error("ballot {ballot_id} is {status} and not accepting votes")]
    InvalidBallotState {
        ballot_id: String,
        status: BallotStatus,
    },

    #[error("option not allowed: {0}")]
    OptionNotAllowed(String),

    #[error("invalid ballot: {0}")]
    InvalidBallot(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("ballot lock unavailable: {0}")]
    LockUnavailable(#[from] LockError),

    #[error("live broadcast unavailable: {0}")]
    BusUnavailable(#[from] BusError),
}

impl VoteError {
    /// Infrastructure failures the caller may retry. Validation failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VoteError::Persistence(_) | VoteError::LockUnavailable(_) | VoteError::BusUnavailable(_)
        )
    }
}
