//! Per-IP rate limiting for credential frames.
//!
//! AUTH and REGISTER are the only frames an unauthenticated connection can
//! usefully send, so they are the only ones gated. Exhausted buckets get a
//! `RATE_LIMITED` result instead of a dropped connection.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(burst: f64) -> Self {
        Self {
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    /// Refill for the elapsed time, then try to spend one token.
    fn take(&mut self, refill_rate: f64, burst: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * refill_rate).min(burst);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Shared token-bucket limiter keyed by client IP.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<IpAddr, TokenBucket>>>,
    refill_rate: f64,
    burst: f64,
}

impl RateLimiter {
    /// A fresh IP may spend `burst` attempts at once and earns one back
    /// every `refill_secs` seconds.
    pub fn new(burst: f64, refill_secs: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            refill_rate: 1.0 / refill_secs,
            burst,
        }
    }

    /// Whether `ip` may spend a credential attempt right now.
    pub async fn allow(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::full(self.burst));
        bucket.take(self.refill_rate, self.burst)
    }

    /// Drop buckets that have not been touched for `max_idle_secs`.
    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| {
            now.duration_since(bucket.last_refill).as_secs_f64() < max_idle_secs
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10.0, 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allows_burst_then_refuses() {
        let limiter = RateLimiter::new(4.0, 60.0);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..4 {
            assert!(limiter.allow(ip).await);
        }

        assert!(!limiter.allow(ip).await);
    }

    #[tokio::test]
    async fn test_ips_do_not_share_buckets() {
        let limiter = RateLimiter::new(2.0, 60.0);
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.allow(ip1).await);
        assert!(limiter.allow(ip1).await);
        assert!(!limiter.allow(ip1).await);

        assert!(limiter.allow(ip2).await);
    }

    #[tokio::test]
    async fn test_purge_drops_idle_buckets() {
        let limiter = RateLimiter::new(4.0, 60.0);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(limiter.allow(ip).await);

        limiter.purge_stale(0.0).await;

        let buckets = limiter.buckets.lock().await;
        assert!(buckets.is_empty());
    }
}
