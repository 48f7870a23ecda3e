//! The single entry point for casting votes.
//!
//! For one ballot, `record_vote` runs recheck, resolve, persist, tally and
//! publish while holding that ballot's lock, so subscribers see snapshots in
//! the same order the votes were persisted. Different ballots never wait on
//! each other.

use log::{debug, info, warn};
use std::sync::Arc;

use crate::bus::EventBus;
use crate::db::BallotRepository;
use crate::error::VoteError;
use crate::lock::{BallotLock, BallotLockGuard};
use crate::models::{
    new_ballot_id, Ballot, BallotDraft, BallotStatus, OptionSelector, Resolution, TallySnapshot,
};
use crate::tally::TallyStore;

pub struct VoteRecorder {
    repository: Arc<dyn BallotRepository>,
    lock: Arc<dyn BallotLock>,
    bus: Arc<dyn EventBus>,
    tallies: TallyStore,
    // Other processes write votes too; the repository is the source of truth
    shared_tallies: bool,
}

impl VoteRecorder {
    pub fn new(
        repository: Arc<dyn BallotRepository>,
        lock: Arc<dyn BallotLock>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            repository,
            lock,
            bus,
            tallies: TallyStore::new(),
            shared_tallies: false,
        }
    }

    /// Recompute tallies from the repository instead of trusting the in-memory
    /// counts. Required whenever several processes record votes for the same
    /// ballots.
    pub fn with_shared_tallies(mut self, shared: bool) -> Self {
        self.shared_tallies = shared;
        self
    }

    pub fn repository(&self) -> &Arc<dyn BallotRepository> {
        &self.repository
    }

    pub fn lock(&self) -> &Arc<dyn BallotLock> {
        &self.lock
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn tallies(&self) -> &TallyStore {
        &self.tallies
    }

    pub async fn create_ballot(&self, draft: BallotDraft) -> Result<Ballot, VoteError> {
        let draft = draft.validate()?;
        let ballot_id = new_ballot_id();
        let ballot = self.repository.create_ballot(&ballot_id, &draft).await?;
        info!(
            "Created ballot {} '{}' with {} option(s)",
            ballot.id,
            ballot.measure,
            ballot.options.len()
        );
        Ok(ballot)
    }

    pub async fn get_ballot(&self, ballot_id: &str) -> Result<Ballot, VoteError> {
        self.repository
            .load_ballot(ballot_id)
            .await?
            .ok_or_else(|| VoteError::BallotNotFound(ballot_id.to_string()))
    }

    pub async fn list_ballots(&self) -> Result<Vec<Ballot>, VoteError> {
        Ok(self.repository.list_ballots().await?)
    }

    /// Current counts for every option of the ballot, in option order.
    pub async fn current_tally(&self, ballot_id: &str) -> Result<TallySnapshot, VoteError> {
        let ballot = self.get_ballot(ballot_id).await?;
        if !self.shared_tallies {
            if let Some(snapshot) = self.tallies.snapshot(&ballot) {
                return Ok(snapshot);
            }
        }
        // Read-only: only the lock holder installs counts into the store
        let counts = self.repository.get_tallies(ballot_id).await?;
        Ok(TallySnapshot::from_counts(&ballot, &counts))
    }

    /// Records one vote and returns the tally it produced.
    pub async fn record_vote(
        &self,
        ballot_id: &str,
        selector: impl Into<OptionSelector>,
    ) -> Result<TallySnapshot, VoteError> {
        let selector = selector.into();

        // Cheap rejection before queueing on the lock
        self.active_ballot(ballot_id).await?;

        let guard = self.lock.acquire(ballot_id).await?;
        let result = self.record_locked(&guard, ballot_id, &selector).await;
        guard.release().await;

        if let Err(e) = &result {
            debug!("Vote on ballot {} rejected: {}", ballot_id, e);
        }
        result
    }

    async fn record_locked(
        &self,
        guard: &BallotLockGuard,
        ballot_id: &str,
        selector: &OptionSelector,
    ) -> Result<TallySnapshot, VoteError> {
        let mut ballot = self.active_ballot(ballot_id).await?;

        let option_id = match ballot.resolve(selector)? {
            Resolution::Existing(option_id) => option_id,
            Resolution::NewWriteIn(text) => {
                guard.check()?;
                let option = self.repository.add_write_in_option(ballot_id, &text).await?;
                info!("Added write-in option '{}' to ballot {}", option.text, ballot_id);
                let option_id = option.id;
                ballot.options.push(option);
                option_id
            }
        };

        if !self.shared_tallies && !self.tallies.is_tracked(ballot_id) {
            // Hydrate before persisting so the new vote is counted exactly once
            let counts = self.repository.get_tallies(ballot_id).await?;
            self.tallies.replace(ballot_id, counts);
        }

        guard.check()?;
        self.repository.persist_vote(ballot_id, option_id).await?;

        let snapshot = if self.shared_tallies {
            self.refresh_from_repository(&ballot, option_id).await
        } else {
            self.tallies.increment(&ballot, option_id)
        };

        match self.bus.publish(ballot_id, snapshot.clone()).await {
            Ok(delivered) => debug!(
                "Published tally #{} for ballot {} to {} subscriber(s)",
                snapshot.total_votes, ballot_id, delivered
            ),
            // The vote is already durable; live viewers catch up on the next one
            Err(e) => warn!("Broadcast for ballot {} failed: {}", ballot_id, e),
        }

        Ok(snapshot)
    }

    async fn refresh_from_repository(&self, ballot: &Ballot, option_id: i64) -> TallySnapshot {
        match self.repository.get_tallies(&ballot.id).await {
            Ok(counts) => {
                self.tallies.replace(&ballot.id, counts);
            }
            Err(e) => {
                warn!(
                    "Could not reload tallies for ballot {}, counting locally: {}",
                    ballot.id, e
                );
                self.tallies.increment(ballot, option_id);
            }
        }
        self.tallies
            .snapshot(ballot)
            .unwrap_or_else(|| TallySnapshot::from_counts(ballot, &Default::default()))
    }

    async fn active_ballot(&self, ballot_id: &str) -> Result<Ballot, VoteError> {
        let ballot = self.get_ballot(ballot_id).await?;
        match ballot.status() {
            BallotStatus::Active => Ok(ballot),
            status => Err(VoteError::InvalidBallotState {
                ballot_id: ballot_id.to_string(),
                status,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalEventBus;
    use crate::db::InMemoryRepository;
    use crate::lock::LocalBallotLock;
    use chrono::{Duration, Utc};

    fn recorder() -> VoteRecorder {
        VoteRecorder::new(
            Arc::new(InMemoryRepository::new()),
            Arc::new(LocalBallotLock::new()),
            Arc::new(LocalEventBus::new()),
        )
    }

    fn yes_no() -> BallotDraft {
        BallotDraft::new("Adopt the proposal?", vec!["Yes".into(), "No".into()])
    }

    #[tokio::test]
    async fn records_by_text_and_id() {
        let recorder = recorder();
        let ballot = recorder.create_ballot(yes_no()).await.unwrap();

        recorder.record_vote(&ballot.id, "Yes").await.unwrap();
        let snapshot = recorder.record_vote(&ballot.id, ballot.options[1].id).await.unwrap();

        assert_eq!(snapshot.count_for("Yes"), 1);
        assert_eq!(snapshot.count_for("No"), 1);
        assert_eq!(recorder.current_tally(&ballot.id).await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn unknown_ballot_is_not_found() {
        let recorder = recorder();
        let err = recorder.record_vote("missing", "Yes").await.unwrap_err();
        assert!(matches!(err, VoteError::BallotNotFound(_)));
    }

    #[tokio::test]
    async fn pending_ballot_rejects_votes() {
        let recorder = recorder();
        let ballot = recorder
            .create_ballot(yes_no().starting_at(Utc::now() + Duration::hours(1)))
            .await
            .unwrap();

        let err = recorder.record_vote(&ballot.id, "Yes").await.unwrap_err();
        assert!(matches!(
            err,
            VoteError::InvalidBallotState { status: BallotStatus::Pending, .. }
        ));
    }

    #[tokio::test]
    async fn write_in_requires_permission() {
        let recorder = recorder();
        let ballot = recorder.create_ballot(yes_no()).await.unwrap();

        let err = recorder.record_vote(&ballot.id, "Maybe").await.unwrap_err();
        assert!(matches!(err, VoteError::OptionNotAllowed(_)));
        assert_eq!(recorder.current_tally(&ballot.id).await.unwrap().total_votes, 0);
    }

    #[tokio::test]
    async fn write_in_is_created_once_and_matched_ignoring_case() {
        let recorder = recorder();
        let ballot = recorder.create_ballot(yes_no().with_write_ins(true)).await.unwrap();

        recorder
            .record_vote(&ballot.id, OptionSelector::WriteIn("<b>Maybe</b>".into()))
            .await
            .unwrap();
        let snapshot = recorder.record_vote(&ballot.id, "maybe").await.unwrap();

        assert_eq!(snapshot.count_for("Maybe"), 2);
        let stored = recorder.get_ballot(&ballot.id).await.unwrap();
        assert_eq!(stored.options.len(), 3);
        assert!(stored.options[2].is_write_in);
    }

    #[tokio::test]
    async fn invalid_draft_is_rejected() {
        let recorder = recorder();
        let err = recorder
            .create_ballot(BallotDraft::new("Hm", vec!["A".into(), "B".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::InvalidBallot(_)));
        assert!(recorder.list_ballots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hydrates_counts_persisted_by_an_earlier_process() {
        let repository = Arc::new(InMemoryRepository::new());
        let first = VoteRecorder::new(
            repository.clone(),
            Arc::new(LocalBallotLock::new()),
            Arc::new(LocalEventBus::new()),
        );
        let ballot = first.create_ballot(yes_no()).await.unwrap();
        first.record_vote(&ballot.id, "Yes").await.unwrap();
        first.record_vote(&ballot.id, "Yes").await.unwrap();

        let restarted = VoteRecorder::new(
            repository,
            Arc::new(LocalBallotLock::new()),
            Arc::new(LocalEventBus::new()),
        );
        let snapshot = restarted.record_vote(&ballot.id, "No").await.unwrap();

        assert_eq!(snapshot.count_for("Yes"), 2);
        assert_eq!(snapshot.count_for("No"), 1);
    }

    #[tokio::test]
    async fn publishes_each_recorded_vote() {
        let recorder = recorder();
        let ballot = recorder.create_ballot(yes_no()).await.unwrap();
        let mut subscription = recorder.bus().subscribe(&ballot.id);

        recorder.record_vote(&ballot.id, "Yes").await.unwrap();
        recorder.record_vote(&ballot.id, "No").await.unwrap();

        assert_eq!(subscription.recv().await.map(|s| s.total_votes), Some(1));
        assert_eq!(subscription.recv().await.map(|s| s.total_votes), Some(2));
    }
}
