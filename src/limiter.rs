// Cooperative token-bucket bandwidth limiter shared across all tasks.
//
// Fetchers call `acquire(n)` before writing each chunk; when the budget is
// exhausted the call sleeps (it never busy-waits) until the deficit is paid
// back by elapsed time. A limit of 0 disables the limiter entirely.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    /// Bytes per second.
    rate: f64,
    /// Burst capacity, one second of budget.
    capacity: f64,
    /// Remaining budget; may go negative, in which case callers wait for
    /// the debt to be repaid.
    available: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.available = (self.available + elapsed.as_secs_f64() * self.rate).min(self.capacity);
    }
}

#[derive(Debug)]
pub struct BandwidthLimiter {
    bucket: Option<Mutex<Bucket>>,
}

impl BandwidthLimiter {
    /// `bytes_per_sec == 0` means unlimited.
    pub fn new(bytes_per_sec: u64) -> Self {
        let bucket = (bytes_per_sec > 0).then(|| {
            let rate = bytes_per_sec as f64;
            Mutex::new(Bucket {
                rate,
                capacity: rate,
                available: rate,
                last_refill: Instant::now(),
            })
        });
        Self { bucket }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Charge `bytes` against the budget, sleeping until the charge is
    /// covered. Chunks larger than the burst capacity are allowed and
    /// simply incur a proportionally longer wait.
    pub async fn acquire(&self, bytes: usize) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let wait = {
            let mut b = bucket.lock();
            b.refill(Instant::now());
            b.available -= bytes as f64;
            if b.available >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-b.available / b.rate))
            }
        };
        if let Some(delay) = wait {
            tokio::time::sleep(delay).await;
        }
    }
}
