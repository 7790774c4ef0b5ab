pub mod calendar_feed;
pub mod classify;
pub mod commands;
pub mod consolidate;
pub mod error;
pub mod executor;
mod http;
pub mod mail_tasks;
pub mod mailbox;
pub mod notification;
pub mod nudge;
pub mod scheduler;
pub mod state;
pub mod types;
pub mod util;

use std::sync::Arc;

use state::AppState;
use tokio::sync::mpsc;

/// Channel buffer size for scheduler messages
const SCHEDULER_CHANNEL_SIZE: usize = 32;

/// Run the scheduler and executor until the scheduler stops.
pub async fn run_daemon(state: Arc<AppState>) {
    // Create channel for scheduler -> executor communication
    let (scheduler_tx, scheduler_rx) = mpsc::channel(SCHEDULER_CHANNEL_SIZE);

    // Spawn executor
    let orchestrator = Arc::clone(&state.orchestrator);
    let executor = tokio::spawn(async move {
        let executor = executor::Executor::new(orchestrator);
        executor.run(scheduler_rx).await;
    });

    let scheduler = scheduler::Scheduler::new(state, scheduler_tx);
    scheduler.run().await;

    // Dropping the scheduler closes the channel and lets the executor drain.
    drop(scheduler);
    if let Err(e) = executor.await {
        log::error!("Executor task failed: {}", e);
    }
}
