//! Periodic reconciliation loop.
//!
//! Ticks at the configured interval (default hourly), re-derives every
//! user's Hawl state from current data and repairs drift. This is the
//! safety net behind the real-time handler: it catches anything the
//! synchronous path missed (restarts, crashed requests, clock skew).
//!
//! Per-user failures are isolated inside the sweep itself; this loop
//! adds run-level resilience: a totally failed run is retried a fixed
//! number of times with a fixed delay, and every run is bounded by an
//! overall timeout.

use std::sync::Arc;
use std::time::Duration;

use mizan_core::engine::{HawlEngine, SweepSummary, RECONCILIATION_ACTOR};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::SweepSettings;

/// Handle returned to the caller so it can request an immediate sweep
/// or shut the loop down.
pub struct SweepLoopHandle {
    /// Notify to wake the loop early (e.g. after a bulk asset import).
    pub wake: Arc<Notify>,
    /// Send `true` to shut down.
    pub shutdown_tx: watch::Sender<bool>,
}

/// Spawn the sweep loop as a tokio task.  Returns a `JoinHandle` and a
/// `SweepLoopHandle` for control.
pub fn spawn_sweep_loop(
    engine: Arc<HawlEngine>,
    settings: SweepSettings,
) -> (tokio::task::JoinHandle<()>, SweepLoopHandle) {
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let wake_clone = wake.clone();

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = settings.interval_secs,
            "reconciliation loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(settings.interval_secs)) => {}
                _ = wake_clone.notified() => {
                    debug!("reconciliation loop woken early");
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("reconciliation loop shutting down");
                        return;
                    }
                }
            }

            // Check shutdown again after wakeup.
            if *shutdown_rx.borrow() {
                return;
            }

            run_sweep_with_retry(&engine, &settings).await;
        }
    });

    (
        handle,
        SweepLoopHandle {
            wake,
            shutdown_tx,
        },
    )
}

/// One bounded, retried sweep. Returns the summary of the first run
/// that completes, or None when every attempt failed or timed out.
pub async fn run_sweep_with_retry(
    engine: &HawlEngine,
    settings: &SweepSettings,
) -> Option<SweepSummary> {
    let timeout = Duration::from_secs(settings.run_timeout_secs);
    for attempt in 1..=settings.max_attempts.max(1) {
        match tokio::time::timeout(timeout, engine.run_sweep(RECONCILIATION_ACTOR)).await {
            Ok(Ok(summary)) => {
                if !summary.errors.is_empty() {
                    warn!(
                        errors = summary.errors.len(),
                        "sweep finished with per-user errors"
                    );
                }
                return Some(summary);
            }
            Ok(Err(err)) => {
                warn!(attempt, error = %err, "sweep failed");
            }
            Err(_) => {
                // committed per-user transactions stand; only the
                // remainder of the run is abandoned
                warn!(attempt, timeout_secs = settings.run_timeout_secs, "sweep timed out");
            }
        }
        if attempt < settings.max_attempts {
            tokio::time::sleep(Duration::from_secs(settings.retry_delay_secs)).await;
        }
    }
    error!(
        attempts = settings.max_attempts,
        "sweep abandoned after repeated failures"
    );
    None
}
