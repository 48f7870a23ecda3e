#![allow(dead_code)]

use async_trait::async_trait;
use livetally::db::{BallotRepository, InMemoryRepository, RepositoryError};
use livetally::models::{Ballot, BallotDraft, BallotOption};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Repository wrapper that records how many votes per ballot are being
/// persisted at once, and can fail or slow down chosen calls.
#[derive(Default)]
pub struct InstrumentedRepository {
    inner: InMemoryRepository,
    persist_calls: AtomicUsize,
    load_calls: AtomicUsize,
    fail_on_call: Option<usize>,
    persist_delay: Duration,
    slow_persist: Option<(usize, Duration)>,
    slow_load: Option<(usize, Duration)>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
}

impl InstrumentedRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the `call`-th persist (1-based) with a storage error.
    pub fn failing_on(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn with_persist_delay(mut self, delay: Duration) -> Self {
        self.persist_delay = delay;
        self
    }

    /// Delays only the `call`-th persist (1-based).
    pub fn slow_persist_on(mut self, call: usize, delay: Duration) -> Self {
        self.slow_persist = Some((call, delay));
        self
    }

    /// Delays only the `call`-th ballot load (1-based).
    pub fn slow_load_on(mut self, call: usize, delay: Duration) -> Self {
        self.slow_load = Some((call, delay));
        self
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self, ballot_id: &str) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(ballot_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn in_flight(&self, ballot_id: &str) -> usize {
        self.in_flight
            .lock()
            .unwrap()
            .get(ballot_id)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, ballot_id: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let now = in_flight.entry(ballot_id.to_string()).or_insert(0);
        *now += 1;
        let mut max = self.max_in_flight.lock().unwrap();
        let peak = max.entry(ballot_id.to_string()).or_insert(0);
        *peak = (*peak).max(*now);
    }

    fn exit(&self, ballot_id: &str) {
        if let Some(now) = self.in_flight.lock().unwrap().get_mut(ballot_id) {
            *now -= 1;
        }
    }
}

#[async_trait]
impl BallotRepository for InstrumentedRepository {
    async fn list_ballots(&self) -> Result<Vec<Ballot>, RepositoryError> {
        self.inner.list_ballots().await
    }

    async fn load_ballot(&self, ballot_id: &str) -> Result<Option<Ballot>, RepositoryError> {
        let call = self.load_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((slow, delay)) = self.slow_load {
            if slow == call {
                tokio::time::sleep(delay).await;
            }
        }
        self.inner.load_ballot(ballot_id).await
    }

    async fn create_ballot(
        &self,
        ballot_id: &str,
        draft: &BallotDraft,
    ) -> Result<Ballot, RepositoryError> {
        self.inner.create_ballot(ballot_id, draft).await
    }

    async fn add_write_in_option(
        &self,
        ballot_id: &str,
        text: &str,
    ) -> Result<BallotOption, RepositoryError> {
        self.inner.add_write_in_option(ballot_id, text).await
    }

    async fn persist_vote(&self, ballot_id: &str, option_id: i64) -> Result<(), RepositoryError> {
        let call = self.persist_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.enter(ballot_id);
        let delay = match self.slow_persist {
            Some((slow, delay)) if slow == call => delay,
            _ => self.persist_delay,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        let result = if Some(call) == self.fail_on_call {
            Err(RepositoryError::Unavailable(format!("injected failure on call {}", call)))
        } else {
            self.inner.persist_vote(ballot_id, option_id).await
        };
        self.exit(ballot_id);
        result
    }

    async fn get_tallies(&self, ballot_id: &str) -> Result<HashMap<i64, u64>, RepositoryError> {
        self.inner.get_tallies(ballot_id).await
    }
}

pub fn yes_no() -> BallotDraft {
    BallotDraft::new("Should the library open on Sundays?", vec!["Yes".into(), "No".into()])
}
