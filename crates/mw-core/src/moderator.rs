//! Transmit rate moderation.
//!
//! A bulk producer (reset replay, import backfill) calls
//! [`TransmitModerator::pause`] once per item; the moderator sleeps just
//! enough to hold the stream at the configured items-per-minute rate.
//! Accounting is over a one-second granule so short bursts are allowed
//! through and the pause stays responsive to cancellation.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct TransmitModerator {
    items_per_minute: u32,
    granule_start: Instant,
    granule_count: u32,
}

impl TransmitModerator {
    pub fn new(items_per_minute: u32) -> Self {
        TransmitModerator {
            items_per_minute: items_per_minute.max(1),
            granule_start: Instant::now(),
            granule_count: 0,
        }
    }

    /// Account for one item, sleeping if the current one-second granule is
    /// already over budget.
    pub async fn pause(&mut self) {
        let per_second = (self.items_per_minute / 60).max(1);
        let now = Instant::now();
        if now.duration_since(self.granule_start) >= Duration::from_secs(1) {
            self.granule_start = now;
            self.granule_count = 0;
        }
        self.granule_count += 1;
        if self.granule_count >= per_second {
            let wake = self.granule_start + Duration::from_secs(1);
            tokio::time::sleep_until(wake).await;
            self.granule_start = Instant::now();
            self.granule_count = 0;
        }
    }
}
