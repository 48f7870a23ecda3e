use log::debug;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::{Ballot, TallySnapshot};

/// In-memory vote counts per ballot, cached for fast broadcast.
///
/// Mutations for a ballot happen while that ballot's lock is held; the store
/// only guarantees that each individual call is atomic.
#[derive(Default)]
pub struct TallyStore {
    ballots: Mutex<HashMap<String, HashMap<i64, u64>>>,
}

fn total(counts: &HashMap<i64, u64>) -> u64 {
    counts.values().sum()
}

impl TallyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<String, HashMap<i64, u64>>> {
        // Counts stay consistent even if a holder panicked mid-call
        self.ballots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_tracked(&self, ballot_id: &str) -> bool {
        self.guard().contains_key(ballot_id)
    }

    /// Installs counts loaded from storage. Never moves a ballot's total
    /// backwards, so a stale read cannot undo newer increments.
    pub fn replace(&self, ballot_id: &str, counts: HashMap<i64, u64>) -> bool {
        let mut ballots = self.guard();
        match ballots.get(ballot_id) {
            Some(current) if total(current) > total(&counts) => {
                debug!(
                    "Ignoring stale tally for ballot {} ({} < {})",
                    ballot_id,
                    total(&counts),
                    total(current)
                );
                false
            }
            _ => {
                ballots.insert(ballot_id.to_string(), counts);
                true
            }
        }
    }

    pub fn increment(&self, ballot: &Ballot, option_id: i64) -> TallySnapshot {
        let mut ballots = self.guard();
        let counts = ballots.entry(ballot.id.clone()).or_default();
        *counts.entry(option_id).or_insert(0) += 1;
        TallySnapshot::from_counts(ballot, counts)
    }

    pub fn snapshot(&self, ballot: &Ballot) -> Option<TallySnapshot> {
        self.guard()
            .get(&ballot.id)
            .map(|counts| TallySnapshot::from_counts(ballot, counts))
    }

    pub fn tracked_ballots(&self) -> Vec<String> {
        self.guard().keys().cloned().collect()
    }

    pub fn forget(&self, ballot_id: &str) -> bool {
        self.guard().remove(ballot_id).is_some()
    }
}
