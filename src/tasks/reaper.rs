use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::models::BallotStatus;
use crate::recorder::VoteRecorder;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub reclaimed: usize,
    pub skipped: usize,
}

/// Drops lock, subscriber and tally bookkeeping for ballots that have ended
/// and have nobody watching.
pub struct StaleMetadataReaper {
    recorder: Arc<VoteRecorder>,
    interval: Duration,
}

impl StaleMetadataReaper {
    pub fn new(recorder: Arc<VoteRecorder>, interval: Duration) -> Self {
        Self { recorder, interval }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("Starting stale metadata reaper (every {:?})", self.interval);
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = self.sweep().await;
            if report.reclaimed > 0 {
                info!(
                    "Reaper reclaimed {} of {} tracked ballot(s)",
                    report.reclaimed, report.examined
                );
            } else {
                debug!("Reaper found nothing to reclaim among {} ballot(s)", report.examined);
            }
        }

        info!("Stale metadata reaper stopped");
    }

    /// One pass over every ballot with in-memory bookkeeping.
    pub async fn sweep(&self) -> SweepReport {
        let lock = self.recorder.lock();
        let bus = self.recorder.bus();
        let tallies = self.recorder.tallies();

        let known: BTreeSet<String> = lock
            .tracked_ballots()
            .into_iter()
            .chain(bus.topics())
            .chain(tallies.tracked_ballots())
            .collect();

        let mut report = SweepReport {
            examined: known.len(),
            ..SweepReport::default()
        };

        for ballot_id in known {
            if self.reclaim(&ballot_id).await {
                report.reclaimed += 1;
            } else {
                report.skipped += 1;
            }
        }
        report
    }

    async fn reclaim(&self, ballot_id: &str) -> bool {
        let status = match self.recorder.repository().load_ballot(ballot_id).await {
            Ok(Some(ballot)) => ballot.status(),
            // Deleted ballots can never receive votes again
            Ok(None) => BallotStatus::Ended,
            Err(e) => {
                error!("Reaper could not load ballot {}, skipping: {}", ballot_id, e);
                return false;
            }
        };
        if status != BallotStatus::Ended {
            return false;
        }

        let bus = self.recorder.bus();
        if bus.subscriber_count(ballot_id) > 0 {
            debug!("Ballot {} has ended but still has live viewers", ballot_id);
            return false;
        }
        if bus.topics().iter().any(|topic| topic == ballot_id) && !bus.reclaim(ballot_id) {
            // A viewer joined since the count above
            return false;
        }

        // Tallies only change under the ballot lock
        let lock = self.recorder.lock();
        match lock.acquire(ballot_id).await {
            Ok(guard) => {
                self.recorder.tallies().forget(ballot_id);
                guard.release().await;
            }
            Err(e) => {
                warn!("Reaper could not lock ballot {}, skipping: {}", ballot_id, e);
                return false;
            }
        }
        lock.forget(ballot_id);

        info!("Reclaimed bookkeeping for ended ballot {}", ballot_id);
        true
    }
}
