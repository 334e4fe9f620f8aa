// =============================================================================
// Upstream Pacer — leaky-bucket admission for sync-heavy loops
// =============================================================================
//
// The run worker syncs one symbol's history per iteration and the upstream
// broker tolerates roughly five symbol fetches per five seconds. The pacer
// hands out `capacity` permits per `period`; when the bucket is empty,
// `admit` sleeps until the next refill.
// =============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct BucketState {
    available: u32,
    window_start: Instant,
}

/// Leaky-bucket pacer shared across loops via `Arc`.
pub struct Pacer {
    capacity: u32,
    period: Duration,
    state: Mutex<BucketState>,
}

impl Pacer {
    /// A bucket that admits `capacity` calls per `period`.
    pub fn new(capacity: u32, period: Duration) -> Self {
        Self {
            capacity,
            period,
            state: Mutex::new(BucketState {
                available: capacity,
                window_start: Instant::now(),
            }),
        }
    }

    /// Take one permit, sleeping until the next refill when none are left.
    pub async fn admit(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let elapsed = state.window_start.elapsed();
                if elapsed >= self.period {
                    state.available = self.capacity;
                    state.window_start = Instant::now();
                }
                if state.available > 0 {
                    state.available -= 1;
                    None
                } else {
                    Some(self.period.saturating_sub(state.window_start.elapsed()))
                }
            };

            match wait {
                None => return,
                Some(delay) => {
                    debug!(delay_ms = delay.as_millis() as u64, "pacer bucket empty — waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
