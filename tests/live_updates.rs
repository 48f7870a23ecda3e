mod common;

use common::yes_no;
use livetally::bus::{EventBus, LocalEventBus};
use livetally::db::InMemoryRepository;
use livetally::lock::{BallotLock, LocalBallotLock};
use livetally::stream::DEFAULT_KEEPALIVE;
use livetally::{LiveEvent, LiveUpdateStream, StaleMetadataReaper, SweepReport, VoteRecorder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

fn recorder() -> Arc<VoteRecorder> {
    Arc::new(VoteRecorder::new(
        Arc::new(InMemoryRepository::new()),
        Arc::new(LocalBallotLock::new()),
        Arc::new(LocalEventBus::with_queue_capacity(4)),
    ))
}

#[tokio::test]
async fn late_viewer_starts_from_the_current_tally() {
    let recorder = recorder();
    let ballot = recorder.create_ballot(yes_no()).await.unwrap();
    for choice in ["Yes", "Yes", "No", "Yes"] {
        recorder.record_vote(&ballot.id, choice).await.unwrap();
    }

    let mut stream = LiveUpdateStream::connect(recorder.clone(), &ballot.id, DEFAULT_KEEPALIVE)
        .await
        .unwrap();

    match stream.next().await {
        Some(LiveEvent::Snapshot(snapshot)) => {
            assert_eq!(snapshot, recorder.current_tally(&ballot.id).await.unwrap());
            assert_eq!(snapshot.count_for("Yes"), 3);
            assert_eq!(snapshot.count_for("No"), 1);
        }
        other => panic!("expected an initial snapshot, got {:?}", other),
    }
}

#[tokio::test]
async fn slow_viewer_does_not_hold_back_others() {
    let recorder = recorder();
    let ballot = recorder.create_ballot(yes_no()).await.unwrap();
    let _stalled = recorder.bus().subscribe(&ballot.id);
    let mut attentive = recorder.bus().subscribe(&ballot.id);

    for i in 1..=10u64 {
        recorder.record_vote(&ballot.id, "Yes").await.unwrap();
        assert_eq!(attentive.recv().await.map(|s| s.total_votes), Some(i));
    }
}

#[tokio::test]
async fn disconnect_then_sweep_reclaims_ended_ballot() {
    let recorder = recorder();
    let ballot = recorder
        .create_ballot(yes_no().ending_at(chrono::Utc::now() + chrono::Duration::milliseconds(200)))
        .await
        .unwrap();
    recorder.record_vote(&ballot.id, "No").await.unwrap();

    let stream = LiveUpdateStream::connect(recorder.clone(), &ballot.id, DEFAULT_KEEPALIVE)
        .await
        .unwrap();
    let (sink, mut outbound) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let viewer = tokio::spawn(stream.forward(sink, cancel.clone()));
    assert!(matches!(outbound.recv().await, Some(LiveEvent::Snapshot(_))));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let reaper = StaleMetadataReaper::new(recorder.clone(), Duration::from_secs(60));

    // Still watched: ended, but kept
    assert_eq!(reaper.sweep().await.reclaimed, 0);
    assert_eq!(recorder.bus().subscriber_count(&ballot.id), 1);

    cancel.cancel();
    viewer.await.unwrap();

    assert_eq!(reaper.sweep().await, SweepReport { examined: 1, reclaimed: 1, skipped: 0 });
    assert!(recorder.bus().topics().is_empty());
    assert!(recorder.lock().tracked_ballots().is_empty());
    assert!(!recorder.tallies().is_tracked(&ballot.id));

    // Bookkeeping is rebuilt from storage if anyone asks again
    assert_eq!(recorder.current_tally(&ballot.id).await.unwrap().count_for("No"), 1);
}

#[tokio::test]
async fn sweep_never_touches_active_ballots() {
    let recorder = recorder();
    let ballot = recorder.create_ballot(yes_no()).await.unwrap();
    recorder.record_vote(&ballot.id, "Yes").await.unwrap();
    let mut viewer = recorder.bus().subscribe(&ballot.id);
    recorder.bus().unsubscribe(&mut viewer);

    let reaper = StaleMetadataReaper::new(recorder.clone(), Duration::from_secs(60));
    for _ in 0..3 {
        assert_eq!(reaper.sweep().await.reclaimed, 0);
    }
    assert!(recorder.tallies().is_tracked(&ballot.id));
    assert_eq!(recorder.bus().topics(), vec![ballot.id.clone()]);

    let snapshot = recorder.record_vote(&ballot.id, "Yes").await.unwrap();
    assert_eq!(snapshot.count_for("Yes"), 2);
}
