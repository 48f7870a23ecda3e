//! Wires one service instance together from [`Settings`].

use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;

use crate::bus::{DistributedEventBus, EventBus, LocalEventBus};
use crate::config::{Backend, FallbackMode, Settings};
use crate::coordination::Coordinator;
use crate::db::{BallotRepository, Database, InMemoryRepository, RepositoryError};
use crate::error::VoteError;
use crate::lock::{BallotLock, FallbackBallotLock, LeaseBallotLock, LocalBallotLock};
use crate::recorder::VoteRecorder;
use crate::stream::LiveUpdateStream;
use crate::tasks::reaper::StaleMetadataReaper;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("distributed backends need a coordinator")]
    MissingCoordinator,

    #[error("failed to open storage: {0}")]
    Repository(#[from] RepositoryError),
}

pub async fn open_repository(settings: &Settings) -> Result<Arc<dyn BallotRepository>, AppError> {
    match &settings.database_url {
        Some(url) => {
            let database = Database::connect(url).await?;
            Ok(Arc::new(database))
        }
        None => {
            info!("DATABASE_URL not set, keeping ballots in memory");
            Ok(Arc::new(InMemoryRepository::new()))
        }
    }
}

/// One service instance. Several instances sharing a repository and a
/// coordinator behave like separate worker processes.
pub struct App {
    settings: Settings,
    recorder: Arc<VoteRecorder>,
}

impl App {
    pub fn build(
        settings: Settings,
        repository: Arc<dyn BallotRepository>,
        coordinator: Option<Arc<dyn Coordinator>>,
    ) -> Result<Self, AppError> {
        if settings.needs_coordinator() && coordinator.is_none() {
            return Err(AppError::MissingCoordinator);
        }

        let lock: Arc<dyn BallotLock> = match (settings.lock_backend, &coordinator) {
            (Backend::Distributed, Some(coordinator)) => {
                let lease = LeaseBallotLock::new(Arc::clone(coordinator), settings.lease.clone());
                match settings.lock_fallback {
                    FallbackMode::Strict => Arc::new(lease),
                    FallbackMode::Permissive => {
                        warn!("Permissive lock fallback enabled; only safe with a single process");
                        Arc::new(FallbackBallotLock::new(lease))
                    }
                }
            }
            _ => Arc::new(LocalBallotLock::new()),
        };

        let bus: Arc<dyn EventBus> = match (settings.bus_backend, &coordinator) {
            (Backend::Distributed, Some(coordinator)) => Arc::new(DistributedEventBus::new(
                Arc::clone(coordinator),
                settings.subscriber_queue_capacity,
                settings.reconnect.clone(),
            )),
            _ => Arc::new(LocalEventBus::with_queue_capacity(settings.subscriber_queue_capacity)),
        };

        let recorder = VoteRecorder::new(repository, lock, bus)
            .with_shared_tallies(settings.lock_backend == Backend::Distributed);

        info!(
            "Service ready ({}, lock: {:?}, bus: {:?})",
            settings.environment, settings.lock_backend, settings.bus_backend
        );
        Ok(Self {
            settings,
            recorder: Arc::new(recorder),
        })
    }

    pub async fn connect(
        settings: Settings,
        coordinator: Option<Arc<dyn Coordinator>>,
    ) -> Result<Self, AppError> {
        let repository = open_repository(&settings).await?;
        Self::build(settings, repository, coordinator)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn recorder(&self) -> &Arc<VoteRecorder> {
        &self.recorder
    }

    pub async fn live_stream(&self, ballot_id: &str) -> Result<LiveUpdateStream, VoteError> {
        LiveUpdateStream::connect(Arc::clone(&self.recorder), ballot_id, self.settings.keepalive).await
    }

    /// `None` when the profile disables background sweeps.
    pub fn reaper(&self) -> Option<StaleMetadataReaper> {
        self.settings
            .reaper_interval
            .map(|interval| StaleMetadataReaper::new(Arc::clone(&self.recorder), interval))
    }
}
