use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{BallotRepository, RepositoryError};
use crate::models::{Ballot, BallotDraft, BallotOption};

#[derive(Default)]
struct MemoryState {
    ballots: HashMap<String, Ballot>,
    // Creation order for listing
    order: Vec<String>,
    votes: HashMap<String, HashMap<i64, u64>>,
    next_option_id: i64,
}

/// Process-local repository used when no database is configured.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> Result<T, RepositoryError>,
    ) -> Result<T, RepositoryError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("in-memory store poisoned".to_string()))?;
        f(&mut state)
    }
}

impl MemoryState {
    fn allocate_option_id(&mut self) -> i64 {
        self.next_option_id += 1;
        self.next_option_id
    }
}

#[async_trait]
impl BallotRepository for InMemoryRepository {
    async fn list_ballots(&self) -> Result<Vec<Ballot>, RepositoryError> {
        self.with_state(|state| {
            Ok(state
                .order
                .iter()
                .filter_map(|id| state.ballots.get(id).cloned())
                .collect())
        })
    }

    async fn load_ballot(&self, ballot_id: &str) -> Result<Option<Ballot>, RepositoryError> {
        self.with_state(|state| Ok(state.ballots.get(ballot_id).cloned()))
    }

    async fn create_ballot(
        &self,
        ballot_id: &str,
        draft: &BallotDraft,
    ) -> Result<Ballot, RepositoryError> {
        self.with_state(|state| {
            let options = draft
                .options
                .iter()
                .map(|text| BallotOption {
                    id: state.allocate_option_id(),
                    text: text.clone(),
                    is_write_in: false,
                })
                .collect();

            let ballot = Ballot {
                id: ballot_id.to_string(),
                measure: draft.measure.clone(),
                options,
                allow_write_in: draft.allow_write_in,
                start_time: draft.start_time,
                end_time: draft.end_time,
                created_at: Utc::now(),
            };

            if state.ballots.insert(ballot_id.to_string(), ballot.clone()).is_none() {
                state.order.push(ballot_id.to_string());
            }
            state.votes.entry(ballot_id.to_string()).or_default();
            Ok(ballot)
        })
    }

    async fn add_write_in_option(
        &self,
        ballot_id: &str,
        text: &str,
    ) -> Result<BallotOption, RepositoryError> {
        self.with_state(|state| {
            let id = state.allocate_option_id();
            let ballot = state
                .ballots
                .get_mut(ballot_id)
                .ok_or_else(|| RepositoryError::MissingBallot(ballot_id.to_string()))?;
            let option = BallotOption {
                id,
                text: text.to_string(),
                is_write_in: true,
            };
            ballot.options.push(option.clone());
            Ok(option)
        })
    }

    async fn persist_vote(&self, ballot_id: &str, option_id: i64) -> Result<(), RepositoryError> {
        self.with_state(|state| {
            let known = state
                .ballots
                .get(ballot_id)
                .map(|ballot| ballot.option_by_id(option_id).is_some())
                .unwrap_or(false);
            if !known {
                return Err(RepositoryError::MissingOption {
                    ballot_id: ballot_id.to_string(),
                    option_id,
                });
            }
            *state
                .votes
                .entry(ballot_id.to_string())
                .or_default()
                .entry(option_id)
                .or_insert(0) += 1;
            Ok(())
        })
    }

    async fn get_tallies(&self, ballot_id: &str) -> Result<HashMap<i64, u64>, RepositoryError> {
        self.with_state(|state| Ok(state.votes.get(ballot_id).cloned().unwrap_or_default()))
    }
}
