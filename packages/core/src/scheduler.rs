//! Periodic sweep scheduler.
//!
//! Drives the dispatcher: each tick runs one sweep for everything due at
//! that moment. Sweeps run inline on a single task, so they never overlap;
//! when a sweep outlasts the interval the missed ticks are skipped rather
//! than queued up.
//!
//! The scheduler is an explicit object owned by `main`: [`Scheduler::start`]
//! spawns the loop and [`Scheduler::stop`] ends it after the sweep in
//! progress (if any) completes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::dispatcher::Dispatcher;

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn start(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_sweeps(dispatcher, interval, shutdown_rx));
        Self { shutdown, task }
    }

    /// Signal the loop to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!("Scheduler task panicked: {}", err);
        }
    }
}

/// Run sweeps every `interval` until `shutdown` flips.
///
/// Errors from a sweep are logged and the loop continues. A failed sweep
/// should never take down the scheduler.
async fn run_sweeps(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!("Sweep scheduler started (interval: {}s)", interval.as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&dispatcher).await;
            }

            _ = shutdown.changed() => {
                tracing::info!("Shutdown signal received. Stopping sweeps.");
                break;
            }
        }
    }

    tracing::info!("Sweep scheduler stopped cleanly");
}

/// Execute a single sweep and log its outcome. Extracted for testability.
async fn sweep_once(dispatcher: &Dispatcher) {
    match dispatcher.sweep(Utc::now()).await {
        Ok(report) if report.due == 0 => {
            tracing::debug!("Sweep found nothing due");
        }
        Ok(report) => {
            tracing::info!(
                "Sweep finished: {} due, {} dispatched, {} skipped, {} failed, {} publish failures",
                report.due,
                report.dispatched,
                report.skipped,
                report.failed,
                report.publish_failures,
            );
        }
        Err(err) => {
            tracing::error!("Sweep failed, retrying next tick: {}", err);
        }
    }
}
