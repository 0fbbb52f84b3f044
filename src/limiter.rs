// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// A token bucket for rate limiting, shared by every fetcher of every download.
///
/// Permission is granted per chunk. A caller that finds the bucket short
/// still debits its chunk, driving the balance negative, and sleeps until the
/// debt would be repaid. Later callers queue behind that debt, so grants come
/// out roughly in arrival order whatever the chunk sizes.
#[derive(Clone)]
pub struct SpeedLimiter {
    state: Arc<Mutex<TokenBucket>>,
}

/// The internal state of the token bucket.
struct TokenBucket {
    /// Burst size in bytes.
    capacity: f64,
    /// Current balance. Negative while callers are waiting out a debt.
    tokens: f64,
    /// Refill rate in bytes per second; 0 disables limiting.
    rate: u64,
    last_refill: Instant,
}

impl SpeedLimiter {
    /// Creates a new speed limiter.
    /// A rate of 0 means the limiter is disabled (unlimited speed).
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(TokenBucket {
                capacity: rate_bytes_per_sec as f64,
                tokens: rate_bytes_per_sec as f64,
                rate: rate_bytes_per_sec,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Sets a new speed limit. A rate of 0 means unlimited.
    pub async fn set_rate(&self, rate_bytes_per_sec: u64) {
        let mut bucket = self.state.lock().await;
        bucket.rate = rate_bytes_per_sec;
        bucket.capacity = rate_bytes_per_sec as f64;
        bucket.tokens = bucket.capacity;
        bucket.last_refill = Instant::now();
    }

    pub async fn rate(&self) -> u64 {
        self.state.lock().await.rate
    }

    /// Waits until `amount` bytes may be transferred, then debits them.
    pub async fn acquire(&self, amount: u64) {
        if amount == 0 {
            return;
        }

        let wait_time = {
            let mut bucket = self.state.lock().await;
            if bucket.rate == 0 {
                return;
            }
            bucket.refill();
            bucket.tokens -= amount as f64;
            if bucket.tokens >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-bucket.tokens / bucket.rate as f64)
        };

        // The lock is already released here.
        tokio::time::sleep(wait_time).await;
    }
}

impl TokenBucket {
    /// Adds tokens to the bucket based on elapsed time.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate as f64).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = SpeedLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(10 * 1024 * 1024).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn waits_once_burst_is_spent() {
        let limiter = SpeedLimiter::new(1000);
        let start = Instant::now();
        limiter.acquire(1000).await;
        assert!(start.elapsed() < Duration::from_millis(100));

        limiter.acquire(500).await;
        assert!(start.elapsed() >= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn chunk_larger_than_capacity_is_still_granted() {
        let limiter = SpeedLimiter::new(2000);
        let start = Instant::now();
        limiter.acquire(2500).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn concurrent_callers_share_the_rate() {
        let limiter = SpeedLimiter::new(4000);
        limiter.acquire(4000).await;
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..2 {
                    limiter.acquire(250).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 2000 bytes at 4000 B/s.
        assert!(start.elapsed() >= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn set_rate_switches_limiting_off() {
        let limiter = SpeedLimiter::new(10);
        limiter.set_rate(0).await;
        assert_eq!(limiter.rate().await, 0);
        let start = Instant::now();
        limiter.acquire(1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
