//! Per-client live tally feeds.

use log::{debug, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::bus::Subscription;
use crate::error::VoteError;
use crate::models::{BallotStatus, TallySnapshot};
use crate::recorder::VoteRecorder;

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Snapshot(TallySnapshot),
    KeepAlive,
}

type StatusCheck = Pin<Box<dyn Future<Output = bool> + Send>>;

/// A client's view of one ballot: the current tally on connect, then every
/// newer tally as it is published, with keep-alives while nothing happens.
///
/// The stream ends once a keep-alive tick finds the ballot ended. Dropping it
/// unsubscribes from the bus.
pub struct LiveUpdateStream {
    recorder: Arc<VoteRecorder>,
    ballot_id: String,
    subscription: Subscription,
    initial: Option<TallySnapshot>,
    last_version: Option<u64>,
    keepalive: Interval,
    status_check: Option<StatusCheck>,
    finished: bool,
}

impl LiveUpdateStream {
    pub async fn connect(
        recorder: Arc<VoteRecorder>,
        ballot_id: &str,
        keepalive: Duration,
    ) -> Result<Self, VoteError> {
        // Subscribe first so nothing published after the read below is missed
        let subscription = recorder.bus().subscribe(ballot_id);
        let initial = recorder.current_tally(ballot_id).await?;

        let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            "Live stream {} connected to ballot {} at tally #{}",
            subscription.id(),
            ballot_id,
            initial.total_votes
        );
        Ok(Self {
            recorder,
            ballot_id: ballot_id.to_string(),
            subscription,
            initial: Some(initial),
            last_version: None,
            keepalive: ticker,
            status_check: None,
            finished: false,
        })
    }

    pub fn ballot_id(&self) -> &str {
        &self.ballot_id
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription.id()
    }

    /// Pumps events into `sink` until the client goes away, `cancel` fires, or
    /// the ballot ends. Returns the number of events delivered.
    pub async fn forward(mut self, sink: mpsc::Sender<LiveEvent>, cancel: CancellationToken) -> usize {
        let mut forwarded = 0;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sink.closed() => break,
                event = self.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = sink.send(event) => {
                    if sent.is_err() {
                        break;
                    }
                    forwarded += 1;
                }
            }
        }

        self.close();
        info!(
            "Live stream {} for ballot {} closed after {} event(s)",
            self.subscription.id(),
            self.ballot_id,
            forwarded
        );
        forwarded
    }

    fn close(&mut self) {
        self.finished = true;
        self.status_check = None;
        self.subscription.unsubscribe();
    }

    fn is_newer(&self, snapshot: &TallySnapshot) -> bool {
        self.last_version
            .map(|last| snapshot.total_votes > last)
            .unwrap_or(true)
    }

    fn start_status_check(&self) -> StatusCheck {
        let recorder = Arc::clone(&self.recorder);
        let ballot_id = self.ballot_id.clone();
        Box::pin(async move { ballot_ended(&recorder, &ballot_id).await })
    }

    fn finish_status_check(&mut self, ended: bool) -> Poll<Option<LiveEvent>> {
        self.status_check = None;
        if ended {
            info!("Ballot {} has ended, closing live stream", self.ballot_id);
            self.close();
            Poll::Ready(None)
        } else {
            Poll::Ready(Some(LiveEvent::KeepAlive))
        }
    }
}

async fn ballot_ended(recorder: &VoteRecorder, ballot_id: &str) -> bool {
    match recorder.get_ballot(ballot_id).await {
        Ok(ballot) => ballot.status() == BallotStatus::Ended,
        Err(VoteError::BallotNotFound(_)) => true,
        Err(e) => {
            warn!("Could not check status of ballot {}: {}", ballot_id, e);
            false
        }
    }
}

impl Stream for LiveUpdateStream {
    type Item = LiveEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LiveEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(snapshot) = this.initial.take() {
            this.last_version = Some(snapshot.total_votes);
            return Poll::Ready(Some(LiveEvent::Snapshot(snapshot)));
        }

        if let Some(check) = this.status_check.as_mut() {
            if let Poll::Ready(ended) = check.as_mut().poll(cx) {
                return this.finish_status_check(ended);
            }
        }

        loop {
            match this.subscription.poll_recv(cx) {
                Poll::Ready(Some(snapshot)) => {
                    if this.is_newer(&snapshot) {
                        this.last_version = Some(snapshot.total_votes);
                        return Poll::Ready(Some(LiveEvent::Snapshot(snapshot)));
                    }
                    debug!(
                        "Skipping stale tally #{} for ballot {}",
                        snapshot.total_votes, this.ballot_id
                    );
                }
                Poll::Ready(None) => {
                    this.close();
                    return Poll::Ready(None);
                }
                Poll::Pending => break,
            }
        }

        if this.status_check.is_none() && this.keepalive.poll_tick(cx).is_ready() {
            let mut check = this.start_status_check();
            match check.as_mut().poll(cx) {
                Poll::Ready(ended) => return this.finish_status_check(ended),
                Poll::Pending => this.status_check = Some(check),
            }
        }

        Poll::Pending
    }
}
