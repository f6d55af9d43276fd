//! Per-peer token buckets
//!
//! Refill-on-demand buckets keyed by peer id, used for the packet rate
//! limit and the amount throughput meters. A bucket starts full and refills
//! continuously at its configured rate.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn take(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

/// Keyed token buckets with a shared rate
#[derive(Debug)]
pub struct PeerLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl PeerLimiter {
    /// Create a limiter. `refill_per_sec` is the sustained rate; the burst
    /// capacity is one second's worth.
    pub fn new(refill_per_sec: u64) -> Self {
        Self {
            capacity: refill_per_sec as f64,
            refill_per_sec: refill_per_sec as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take `amount` tokens from the peer's bucket
    pub async fn take(&self, peer_id: &str, amount: u64) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(peer_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_per_sec));
        bucket.take(amount as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_exhausts_and_refills() {
        tokio::time::pause();
        let limiter = PeerLimiter::new(10);

        for _ in 0..10 {
            assert!(limiter.take("peer-1", 1).await);
        }
        assert!(!limiter.take("peer-1", 1).await);

        // a different peer has its own bucket
        assert!(limiter.take("peer-2", 10).await);

        // refills over time
        tokio::time::advance(std::time::Duration::from_millis(500)).await;
        assert!(limiter.take("peer-1", 5).await);
        assert!(!limiter.take("peer-1", 1).await);
    }

    #[tokio::test]
    async fn test_bucket_caps_at_capacity() {
        tokio::time::pause();
        let limiter = PeerLimiter::new(10);
        tokio::time::advance(std::time::Duration::from_secs(60)).await;
        assert!(limiter.take("peer-1", 10).await);
        assert!(!limiter.take("peer-1", 1).await);
    }
}
