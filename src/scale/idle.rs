//! Idle watcher - the background task driving scale-to-zero
//!
//! Wakes on a fixed interval, asks the controller whether the idle window has
//! passed, and stops cleanly on shutdown signal.

use super::ScaleController;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// How often the watcher wakes to check idleness.
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Run the idle watcher until `shutdown_rx` fires.
pub async fn run_idle_watcher(
    controller: Arc<ScaleController>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    // The first tick of a tokio interval fires immediately; skip it so a
    // fresh start never races a scale decision.
    ticker.tick().await;

    tracing::debug!(
        interval_secs = TICK_INTERVAL.as_secs(),
        idle_timeout_secs = controller.settings().idle_timeout.as_secs(),
        "idle watcher running"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                controller.idle_tick().await;
            }
            _ = &mut shutdown_rx => {
                tracing::debug!("idle watcher stopping");
                return;
            }
        }
    }
}
