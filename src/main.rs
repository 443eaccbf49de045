//! Arena matchmaker demo
//!
//! Runs two simulated clients against one in-process document store, with
//! the store's ownership rules enforced, until they agree on a match.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arena_matchmaker::identity::{IdentityProvider, LocalIdentity, Principal};
use arena_matchmaker::matchmaking::{security_rules, Match, MatchmakingCoordinator, MatchmakingError, StaleSweeper};
use arena_matchmaker::store::MemoryStore;
use arena_matchmaker::util::time::{Clock, SystemClock};
use arena_matchmaker::MatchmakingConfig;

/// Simulated store round trip
const STORE_LATENCY: Duration = Duration::from_millis(20);

/// Give up if no match was agreed within this window
const DEMO_TIMEOUT: Duration = Duration::from_secs(30);

enum Outcome {
    Found(&'static str, Match),
    Failed(&'static str, MatchmakingError),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = MatchmakingConfig::from_env().context("invalid matchmaking configuration")?;

    init_tracing(&config.log_level);

    info!("Starting arena matchmaker demo");

    let store = MemoryStore::with_rules_and_latency(security_rules(), STORE_LATENCY);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Privileged cleanup routine
    let sweeper = StaleSweeper::new(
        Arc::new(store.privileged()),
        clock.clone(),
        Arc::new(config.clone()),
    );
    let sweep_every = config.heartbeat_interval;
    let janitor = tokio::spawn(sweeper.run(sweep_every));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut clients = Vec::new();

    for (user_id, name) in [("alice", "Alice"), ("bob", "Bob")] {
        let identity: Arc<dyn IdentityProvider> =
            Arc::new(LocalIdentity::signed_in(Principal::new(user_id, name)));
        let coordinator = MatchmakingCoordinator::new(
            Arc::new(store.connect(identity.clone())),
            identity,
            clock.clone(),
            config.clone(),
        );

        let found_tx = tx.clone();
        let error_tx = tx.clone();
        let client = coordinator.clone();
        tokio::spawn(async move {
            client
                .join_queue(
                    move |record| {
                        let _ = found_tx.send(Outcome::Found(user_id, record));
                    },
                    move |e| {
                        let _ = error_tx.send(Outcome::Failed(user_id, e));
                    },
                )
                .await;
        });
        clients.push(coordinator);
    }
    drop(tx);

    let deadline = tokio::time::sleep(DEMO_TIMEOUT);
    tokio::pin!(deadline);

    let mut matched = 0;
    while matched < clients.len() {
        tokio::select! {
            outcome = rx.recv() => match outcome {
                Some(Outcome::Found(user_id, record)) => {
                    info!(user_id, match_id = %record.id, "Match found");
                    println!("{user_id}: {record}");
                    matched += 1;
                }
                Some(Outcome::Failed(user_id, e)) => {
                    error!(user_id, error = %e, "Matchmaking failed");
                    break;
                }
                None => break,
            },
            _ = &mut deadline => {
                error!("No match within {:?}", DEMO_TIMEOUT);
                break;
            }
            _ = shutdown_signal() => break,
        }
    }

    for client in &clients {
        client.leave_queue().await;
    }
    janitor.abort();

    info!(
        foreign_delete_attempts = store.foreign_delete_attempts(),
        "Demo finished"
    );
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Resolves on Ctrl+C, or never if the handler cannot be installed
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, leaving the queue"),
        Err(e) => {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}
