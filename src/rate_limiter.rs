// =============================================================================
// Rate Limiter (C3) — token bucket + inflight cap in front of each broker.
// =============================================================================
//
// Unlike the header-watching counters an exchange client might keep purely
// for diagnostics, both pieces here genuinely suspend the caller: `acquire`
// waits until tokens are available, and the concurrency permit is held for
// the lifetime of the outbound call via an RAII guard so it is always
// released, including on early return or error.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, trace};

struct Bucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            capacity: burst,
            tokens: burst,
            rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Try to take `n` tokens; returns the wait duration needed if not
    /// enough are available yet.
    fn try_take(&mut self, n: f64) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            Ok(())
        } else {
            let deficit = n - self.tokens;
            let wait_s = if self.rate_per_sec > 0.0 { deficit / self.rate_per_sec } else { 0.05 };
            Err(Duration::from_secs_f64(wait_s.max(0.001)))
        }
    }
}

/// Per-broker composite limiter: a token bucket plus a counted semaphore for
/// in-flight requests.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    inflight: Arc<Semaphore>,
}

/// Held for the duration of one outbound call; releases the concurrency
/// permit on drop regardless of how the call ends.
pub struct RateLimitGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: f64, max_inflight: usize) -> Self {
        Self {
            bucket: Mutex::new(Bucket::new(rate_per_sec, burst)),
            inflight: Arc::new(Semaphore::new(max_inflight)),
        }
    }

    /// Suspend until at least `n` tokens are available AND an inflight slot
    /// is free, then return a guard scoping the inflight slot.
    pub async fn acquire(&self, n: f64) -> RateLimitGuard<'_> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                bucket.try_take(n)
            };
            match wait {
                Ok(()) => break,
                Err(duration) => {
                    trace!(wait_ms = duration.as_millis() as u64, "rate limiter: waiting for tokens");
                    tokio::time::sleep(duration).await;
                }
            }
        }

        let permit = self
            .inflight
            .acquire()
            .await
            .expect("rate limiter semaphore never closed");
        debug!("rate limiter: slot acquired");
        RateLimitGuard { _permit: permit }
    }

    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.tokens
    }

    pub fn inflight_available(&self) -> usize {
        self.inflight.available_permits()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("available_tokens", &self.available_tokens())
            .field("inflight_available", &self.inflight_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_within_burst_does_not_block() {
        let limiter = RateLimiter::new(10.0, 5.0, 4);
        let start = Instant::now();
        let _g = limiter.acquire(1.0).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn acquire_beyond_burst_waits_for_refill() {
        let limiter = RateLimiter::new(100.0, 1.0, 4);
        let _first = limiter.acquire(1.0).await;
        let start = Instant::now();
        let _second = limiter.acquire(1.0).await;
        // at 100/s, refilling one token takes ~10ms; allow generous slack.
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[tokio::test]
    async fn concurrency_cap_limits_simultaneous_holders() {
        let limiter = Arc::new(RateLimiter::new(1_000.0, 1_000.0, 2));
        assert_eq!(limiter.inflight_available(), 2);
        let g1 = limiter.acquire(1.0).await;
        let g2 = limiter.acquire(1.0).await;
        assert_eq!(limiter.inflight_available(), 0);
        drop(g1);
        assert_eq!(limiter.inflight_available(), 1);
        drop(g2);
    }
}
