use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Last-activity clock shared by a session's queues and its idle watchdog.
///
/// Uses [`tokio::time::Instant`] so the watchdog follows a paused runtime clock in tests.
#[derive(Debug)]
pub struct Activity {
    epoch: Instant,
    last_nanos: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_nanos: AtomicU64::new(0),
        }
    }

    /// Record activity at the current instant.
    pub fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.epoch);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.last_nanos.fetch_max(nanos, Ordering::AcqRel);
    }

    /// Instant of the most recent activity, or of creation if nothing happened yet.
    pub fn last(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.last_nanos.load(Ordering::Acquire))
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_touch_moves_last_activity_forward() {
        let activity = Activity::new();
        let created = activity.last();

        tokio::time::advance(Duration::from_millis(50)).await;
        activity.touch();

        assert_eq!(activity.last() - created, Duration::from_millis(50));
    }
}
