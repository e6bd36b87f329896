use std::sync::Arc;
use tokio::time::Duration;

use leaky_bucket::RateLimiter;

use crate::engine_config::PacerConfig;

/// Engine-wide send pacer. Every worker acquires one permit per transport
/// call, so the aggregate outbound rate stays bounded no matter how wide the
/// fan-out is. Per-server pacing on top of this is the batch processor's
/// post-send pause.
#[derive(Clone)]
pub struct SendPacer {
    bucket: Arc<RateLimiter>,
}

impl SendPacer {
    pub fn new(max_per_sec: usize, refill_interval: Duration, refill_amount: usize) -> Self {
        let bucket = RateLimiter::builder()
            .initial(max_per_sec)
            .interval(refill_interval)
            .max(max_per_sec)
            .refill(refill_amount)
            .build();

        Self {
            bucket: Arc::new(bucket),
        }
    }

    pub fn from_config(pacer: &PacerConfig) -> Self {
        Self::new(
            pacer.sends_per_sec,
            Duration::from_millis(pacer.refill_interval_ms),
            pacer.refill_amount,
        )
    }

    pub async fn acquire_one(&self) {
        self.bucket.acquire_one().await;
    }
}
