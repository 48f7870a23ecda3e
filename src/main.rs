use livetally::app::{open_repository, App};
use livetally::coordination::{Coordinator, InMemoryCoordinator};
use livetally::models::{BallotDraft, OptionSelector};
use livetally::stream::LiveEvent;
use livetally::{logging, Settings};
use log::{error, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use std::env;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn env_count(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    logging::init(&settings);

    let votes = env_count("SIMULATED_VOTES", 50);
    let workers = env_count("WORKERS", 1);
    if let Err(e) = settings.check_workers(workers) {
        error!("Invalid configuration: {}", e);
        std::process::exit(2);
    }

    // Stand-in for the shared coordination service all workers would reach
    let coordinator: Option<Arc<dyn Coordinator>> = if settings.needs_coordinator() {
        Some(Arc::new(InMemoryCoordinator::new()))
    } else {
        None
    };

    let repository = match open_repository(&settings).await {
        Ok(repository) => repository,
        Err(e) => {
            error!("Failed to initialize storage: {}", e);
            return;
        }
    };

    let mut apps = Vec::with_capacity(workers);
    for _ in 0..workers {
        match App::build(settings.clone(), Arc::clone(&repository), coordinator.clone()) {
            Ok(app) => apps.push(app),
            Err(e) => {
                error!("Failed to start worker: {}", e);
                return;
            }
        }
    }

    let draft = BallotDraft::new(
        "Where should the team offsite be?",
        vec!["Mountains".to_string(), "Beach".to_string(), "City".to_string()],
    )
    .with_write_ins(true);
    let ballot = match apps[0].recorder().create_ballot(draft).await {
        Ok(ballot) => ballot,
        Err(e) => {
            error!("Failed to create demo ballot: {}", e);
            return;
        }
    };
    let (_, status) = ballot.describe_status(chrono::Utc::now());
    info!("Ballot {} '{}' is {}", ballot.id, ballot.measure, status);

    let cancel = CancellationToken::new();

    // Watch from the last worker so cross-worker fan-out is visible
    let viewer = match apps[workers - 1].live_stream(&ballot.id).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to open live stream: {}", e);
            return;
        }
    };
    let (sink, mut outbound) = mpsc::channel(64);
    let forwarder = tokio::spawn(viewer.forward(sink, cancel.clone()));
    let printer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            if let LiveEvent::Snapshot(snapshot) = event {
                let summary: Vec<String> = snapshot
                    .entries
                    .iter()
                    .map(|entry| format!("{}={}", entry.option, entry.count))
                    .collect();
                info!("Live tally #{}: {}", snapshot.total_votes, summary.join(", "));
            }
        }
    });

    let options: Vec<String> = ballot.options.iter().map(|o| o.text.clone()).collect();
    let selections: Vec<(usize, OptionSelector)> = {
        let mut rng = rand::thread_rng();
        (0..votes)
            .map(|_| {
                let worker = rng.gen_range(0..workers);
                let selector = if rng.gen_bool(0.2) {
                    OptionSelector::WriteIn(format!("Sim-Write-in-{}", rng.gen_range(1..=5)))
                } else {
                    let text = options.choose(&mut rng).cloned().unwrap_or_default();
                    OptionSelector::Text(text)
                };
                (worker, selector)
            })
            .collect()
    };

    let mut handles = Vec::with_capacity(votes);
    for (worker, selector) in selections {
        let recorder = Arc::clone(apps[worker].recorder());
        let ballot_id = ballot.id.clone();
        handles.push(tokio::spawn(async move {
            recorder.record_vote(&ballot_id, selector).await
        }));
    }

    let mut failed = 0;
    for handle in handles {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                failed += 1;
                warn!("Vote failed (retryable: {}): {}", e.is_retryable(), e);
            }
            Err(e) => {
                failed += 1;
                error!("Vote task panicked: {}", e);
            }
        }
    }

    match apps[0].recorder().current_tally(&ballot.id).await {
        Ok(tally) => info!(
            "Recorded {} of {} votes ({} failed), final total {}",
            votes - failed,
            votes,
            failed,
            tally.total_votes
        ),
        Err(e) => error!("Failed to read final tally: {}", e),
    }

    let reapers: Vec<_> = apps.iter().filter_map(|app| app.reaper()).collect();
    let mut reaper_handles = Vec::new();
    for reaper in reapers {
        let cancel = cancel.clone();
        reaper_handles.push(tokio::spawn(async move { reaper.run(cancel).await }));
    }

    info!("Simulation finished; press Ctrl-C to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    cancel.cancel();

    if let Ok(delivered) = forwarder.await {
        info!("Viewer received {} event(s)", delivered);
    }
    let _ = printer.await;
    for handle in reaper_handles {
        let _ = handle.await;
    }
    info!("Shut down cleanly");
}
