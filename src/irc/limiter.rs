//! Outbound flood control.
//!
//! Every line sent on a connection reserves a send slot at
//! `max(now, last_slot + interval)` and waits for it. Nothing is dropped;
//! bursts are stretched out to one line per interval.
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last_scheduled: Option<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_INTERVAL)
    }
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_scheduled: None,
        }
    }

    /// Claim the next send slot relative to `now`.
    pub fn reserve_at(&mut self, now: Instant) -> Instant {
        let slot = match self.last_scheduled {
            Some(last) => now.max(last + self.interval),
            None => now,
        };
        self.last_scheduled = Some(slot);
        slot
    }

    /// Claim the next send slot.
    pub fn reserve(&mut self) -> Instant {
        self.reserve_at(Instant::now())
    }

    /// Wait until this caller may write.
    pub async fn until_ready(&mut self) {
        let slot = self.reserve();
        tokio::time::sleep_until(slot).await;
    }
}
