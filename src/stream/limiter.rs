//! Process-wide byte budget.
//!
//! Token bucket refilled continuously at `rate` bytes per second with a
//! burst equal to one second of traffic. Acquisition reserves tokens up
//! front (the balance may go negative) and sleeps off the debt outside the
//! lock, so concurrent callers queue fairly instead of spinning.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::config::StorageConfig;

#[derive(Debug)]
struct Bucket {
    /// Bytes per second.
    rate: f64,
    /// Largest single reservation.
    burst: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Shared rate governor. Without a configured limit every call is a no-op.
#[derive(Debug)]
pub struct RateGovernor {
    bucket: Option<Bucket>,
}

impl RateGovernor {
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn new(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            return Self::unlimited();
        }
        Self {
            bucket: Some(Bucket {
                rate: bytes_per_sec as f64,
                burst: bytes_per_sec,
                state: Mutex::new(BucketState {
                    tokens: bytes_per_sec as f64,
                    last_refill: Instant::now(),
                }),
            }),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        match config.rate_limit() {
            Some(limit) => {
                tracing::info!("Rate limiter enabled at {} bytes/sec", limit);
                Self::new(limit)
            }
            None => Self::unlimited(),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Largest chunk a single call may move without exceeding the burst.
    pub fn slice_len(&self, len: usize) -> usize {
        match &self.bucket {
            Some(bucket) => len.min(bucket.burst.min(usize::MAX as u64) as usize).max(1),
            None => len,
        }
    }

    /// Wait until `n` bytes of budget are available. Callers slice their
    /// buffers with [`slice_len`](Self::slice_len); larger requests are
    /// clamped to the burst.
    pub async fn acquire(&self, n: usize) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        if n == 0 {
            return;
        }

        let wait = bucket.reserve((n as u64).min(bucket.burst));
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

impl Bucket {
    fn state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take `n` tokens and return how long the caller must wait for them.
    fn reserve(&self, n: u64) -> Duration {
        let mut state = self.state();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst as f64);
        state.last_refill = now;

        state.tokens -= n as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let governor = RateGovernor::unlimited();
        let start = Instant::now();
        governor.acquire(usize::MAX).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(governor.slice_len(1 << 30), 1 << 30);
        assert!(!RateGovernor::new(0).is_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle() {
        let governor = RateGovernor::new(1000);

        // The initial bucket is full.
        let start = Instant::now();
        governor.acquire(1000).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The next 500 bytes cost half a second.
        governor.acquire(500).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(499), "{waited:?}");
        assert!(waited <= Duration::from_millis(510), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slice_len_clamps_to_burst() {
        let governor = RateGovernor::new(4096);
        assert_eq!(governor.slice_len(1 << 20), 4096);
        assert_eq!(governor.slice_len(100), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_across_tasks() {
        let governor = Arc::new(RateGovernor::new(1000));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let governor = Arc::clone(&governor);
            handles.push(tokio::spawn(async move { governor.acquire(1000).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 4000 bytes at 1000/s with a 1000 byte head start.
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(2990), "{waited:?}");
    }

    #[test]
    fn test_from_config_requires_enable_flag() {
        let mut config = StorageConfig {
            storage_rate_limit: 1024,
            ..Default::default()
        };
        assert!(!RateGovernor::from_config(&config).is_limited());
        config.enable_rate_limiter = true;
        assert!(RateGovernor::from_config(&config).is_limited());
    }
}
