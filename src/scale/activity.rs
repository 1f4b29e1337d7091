//! Last-activity tracking for the idle watcher
//!
//! A single atomic timestamp, touched on every successfully proxied request.
//! Readers and writers never block; last writer wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct ActivityTracker {
    /// Milliseconds since `epoch` of the most recent activity.
    last_activity_ms: AtomicU64,
    epoch: Instant,
}

impl ActivityTracker {
    /// Create a tracker whose last activity is "now".
    pub fn new() -> Self {
        Self {
            last_activity_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Record activity. O(1), lock-free.
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    /// Time elapsed since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_idle_time() {
        let tracker = ActivityTracker::new();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(tracker.idle_for() >= Duration::from_secs(60));

        tracker.touch();
        assert!(tracker.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_writer_wins() {
        let tracker = ActivityTracker::new();
        tracker.touch();
        tokio::time::advance(Duration::from_secs(10)).await;
        tracker.touch();
        assert!(tracker.idle_for() < Duration::from_secs(1));
    }
}
