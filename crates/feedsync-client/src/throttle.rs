use std::time::Duration;

use feedsync_core::{cancel::Cancellation, error::Cancelled};
use tokio::{sync::Mutex, time::Instant};
use tracing::trace;

/// Minimum spacing between outbound requests (leaky bucket of depth 1).
///
/// The lock is held across the wait, so concurrent callers are granted one
/// at a time and each interval is measured from the previous grant.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last_grant: Mutex<Option<Instant>>,
}

impl Throttle {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_grant: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait for the next dispatch slot and return the grant time.
    ///
    /// A cancelled wait is not a grant; the next caller is still measured
    /// from the last successful one.
    pub async fn acquire(&self, cancel: &Cancellation) -> Result<Instant, Cancelled> {
        let mut last = cancel.run(self.last_grant.lock()).await?;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            let now = Instant::now();
            if ready_at > now {
                trace!(wait_ms = (ready_at - now).as_millis() as u64, "throttling");
                cancel.sleep(ready_at - now).await?;
            }
        }
        let granted = Instant::now();
        *last = Some(granted);
        Ok(granted)
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}
