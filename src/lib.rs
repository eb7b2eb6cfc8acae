pub mod admin;
pub mod builder;
pub mod db;
pub mod delivery;
pub mod error;
pub mod keys;
pub mod merge;
mod migrations;
pub mod notify;
pub mod payload;
pub mod peers;
pub mod privacy;
pub mod receiver;
mod runner;
pub mod scheduler;
pub mod state;
pub mod types;
mod util;

use std::sync::Arc;

use state::AppState;
use tokio::sync::mpsc;

use crate::error::FederationError;

/// Channel buffer size for scheduler messages
const SCHEDULER_CHANNEL_SIZE: usize = 32;

/// Bring the node up and serve until the process is killed.
///
/// Initializes state (config, node key, database migrations), starts the
/// scheduler and job runner, then binds the inbound federation endpoint.
pub async fn run() -> Result<(), FederationError> {
    let state = Arc::new(AppState::init()?);

    notify::spawn_log_listener(&state.notifier);

    // Channel for scheduler -> runner dispatch
    let (scheduler_tx, scheduler_rx) = mpsc::channel(SCHEDULER_CHANNEL_SIZE);

    // Store the sender so admin "run now" can reach the runner
    if let Ok(mut guard) = state.trigger_tx.lock() {
        *guard = Some(scheduler_tx.clone());
    }

    let scheduler_state = state.clone();
    tokio::spawn(async move {
        let scheduler = scheduler::Scheduler::new(scheduler_state, scheduler_tx);
        scheduler.run().await;
    });

    let runner_state = state.clone();
    tokio::spawn(async move {
        let runner = runner::Runner::new(runner_state);
        runner.run(scheduler_rx).await;
    });

    let config = state.config_snapshot();
    let router = receiver::create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| {
            FederationError::Config(format!("Cannot bind {}: {}", config.listen_addr, e))
        })?;
    log::info!(
        "Federation node '{}' listening on {}",
        config.node_name,
        config.listen_addr
    );
    axum::serve(listener, router)
        .await
        .map_err(|e| FederationError::Io(e.to_string()))?;
    Ok(())
}
