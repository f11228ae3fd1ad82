//! Token bucket rate limiting for piece payloads.
//!
//! The engine only calls [`RateLimiter::acquire`] before moving block data;
//! shaping policy lives entirely in the bucket.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Token bucket rate limiter for controlling bandwidth usage.
///
/// Tokens are added at a fixed rate and consumed when bandwidth is used.
/// Allows bursts up to bucket capacity while maintaining the average rate.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum number of tokens the bucket can hold
    capacity: u64,
    /// Current number of tokens in the bucket
    tokens: u64,
    /// Tokens added per second
    refill_rate: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket. Zero capacity or rate are raised to one.
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: refill_rate.max(1),
            last_refill: Instant::now(),
        }
    }

    /// Consumes up to `requested` tokens, returning how many were taken.
    pub fn consume(&mut self, requested: u64) -> u64 {
        self.refill();

        let consumed = requested.min(self.tokens);
        self.tokens -= consumed;
        consumed
    }

    /// Returns current number of available tokens.
    pub fn available_tokens(&mut self) -> u64 {
        self.refill();
        self.tokens
    }

    /// Returns bucket capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Time until `wanted` tokens (capped at capacity) will be available.
    pub fn time_until_available(&mut self, wanted: u64) -> Duration {
        self.refill();
        let deficit = wanted.min(self.capacity).saturating_sub(self.tokens);
        if deficit == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(deficit as f64 / self.refill_rate as f64)
            .max(Duration::from_millis(1))
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);

        if elapsed >= Duration::from_millis(1) {
            let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;

            if tokens_to_add > 0 {
                self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
                self.last_refill = now;
            }
        }
    }
}

/// Shared byte-rate limiter awaited before sending or receiving blocks.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<Mutex<TokenBucket>>,
}

impl RateLimiter {
    /// Limiter that never waits.
    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Limits throughput to `bytes_per_second` with a one second burst.
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bucket: Some(Mutex::new(TokenBucket::new(
                bytes_per_second,
                bytes_per_second,
            ))),
        }
    }

    /// Builds a limiter from an optional configured limit.
    pub fn from_limit(bytes_per_second: Option<u64>) -> Self {
        match bytes_per_second {
            Some(rate) if rate > 0 => Self::new(rate),
            _ => Self::unlimited(),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.bucket.is_some()
    }

    /// Waits until `bytes` tokens have been taken from the bucket.
    ///
    /// Transfers larger than the bucket capacity are paid for in chunks.
    pub async fn acquire(&self, bytes: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        let mut remaining = bytes;
        while remaining > 0 {
            let wait = {
                let mut bucket = bucket.lock();
                remaining -= bucket.consume(remaining);
                bucket.time_until_available(remaining)
            };
            if remaining > 0 {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
