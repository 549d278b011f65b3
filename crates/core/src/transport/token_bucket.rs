//! Hierarchical token bucket rate limiter.
//!
//! Each bucket may have a parent. A withdrawal succeeds only if the bucket and every ancestor
//! currently hold enough tokens, in which case all of them are debited. A withdrawal larger
//! than the burst is admitted from a full bucket and leaves it in debt, which refill pays
//! down before any further withdrawal is admitted. The scene-wide bucket
//! is the root, each circuit has an aggregate bucket below it and one bucket per throttle
//! category below that.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::util::time_source::{InstantTimeSrc, TimeSource};

/// Token bucket for rate limiting datagram transmission.
///
/// A rate of 0 means unlimited: such a bucket always admits and only defers to its parent.
///
/// Thread-safe via internal mutex. Locks are taken child first, then parent.
pub struct TokenBucket<T: TimeSource = InstantTimeSrc> {
    state: Mutex<BucketState>,
    parent: Option<Arc<TokenBucket<T>>>,
    time_source: T,
}

struct BucketState {
    /// Maximum tokens (burst capacity in bytes)
    capacity: usize,
    /// Current tokens (bytes), negative while repaying an oversized withdrawal
    tokens: i64,
    /// Fractional tokens (prevents precision loss at low rates)
    fractional_tokens: f64,
    /// Refill rate (bytes/second)
    rate: usize,
    /// Last refill timestamp
    last_refill: Instant,
}

impl TokenBucket<InstantTimeSrc> {
    /// Create a root bucket.
    ///
    /// # Arguments
    /// * `capacity` - Maximum burst capacity (bytes)
    /// * `rate` - Refill rate (bytes/second), 0 for unlimited
    ///
    /// # Example
    /// ```
    /// # use lludp::transport::token_bucket::TokenBucket;
    /// let bucket = TokenBucket::new(10_000, 100_000);
    /// assert!(bucket.try_consume(4_000));
    /// assert!(!bucket.try_consume(8_000));
    /// ```
    pub fn new(capacity: usize, rate: usize) -> Self {
        Self::with_time_source(capacity, rate, None, InstantTimeSrc::new())
    }

    /// Create a bucket whose withdrawals are also charged to `parent`.
    pub fn with_parent(capacity: usize, rate: usize, parent: Arc<TokenBucket>) -> Self {
        Self::with_time_source(capacity, rate, Some(parent), InstantTimeSrc::new())
    }
}

impl<T: TimeSource> TokenBucket<T> {
    pub fn with_time_source(
        capacity: usize,
        rate: usize,
        parent: Option<Arc<TokenBucket<T>>>,
        time_source: T,
    ) -> Self {
        let now = time_source.now();
        Self {
            state: Mutex::new(BucketState {
                capacity,
                tokens: capacity as i64, // Start full
                fractional_tokens: 0.0,
                rate,
                last_refill: now,
            }),
            parent,
            time_source,
        }
    }

    /// Withdraws `bytes` from this bucket and all its ancestors, or from none of them.
    pub fn try_consume(&self, bytes: usize) -> bool {
        let now = self.time_source.now();
        let mut state = self.state.lock();
        state.refill(now);
        if !state.admits(bytes) {
            return false;
        }
        if let Some(parent) = &self.parent {
            if !parent.try_consume(bytes) {
                return false;
            }
        }
        if state.rate > 0 {
            state.tokens -= bytes as i64;
        }
        true
    }

    /// Update the refill rate, keeping the burst window proportional.
    pub fn set_rate(&self, new_rate: usize, capacity: usize) {
        let mut state = self.state.lock();
        state.refill(self.time_source.now());
        state.rate = new_rate;
        state.capacity = capacity;
        state.tokens = state.tokens.min(capacity as i64);
    }

    /// Get current rate (bytes/second)
    pub fn rate(&self) -> usize {
        self.state.lock().rate
    }

    /// Get current available tokens (bytes), zero while in debt
    pub fn available_tokens(&self) -> usize {
        let mut state = self.state.lock();
        state.refill(self.time_source.now());
        state.tokens.max(0) as usize
    }
}

impl BucketState {
    fn admits(&self, bytes: usize) -> bool {
        // A request larger than the whole burst can never accumulate, so it is admitted once
        // the bucket is full and the overdraft is carried as debt.
        self.rate == 0 || self.tokens >= bytes as i64 || self.tokens >= self.capacity as i64
    }

    /// Refill tokens based on elapsed time, never beyond capacity.
    fn refill(&mut self, now: Instant) {
        if self.rate == 0 {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        let capacity = self.capacity as i64;
        if self.tokens >= capacity {
            self.fractional_tokens = 0.0;
            return;
        }

        self.fractional_tokens += self.rate as f64 * elapsed.as_secs_f64();
        let whole = self.fractional_tokens.floor();
        if whole >= 1.0 {
            let room = (capacity - self.tokens) as f64;
            let added = whole.min(room);
            self.tokens += added as i64;
            self.fractional_tokens -= whole;
            if self.tokens >= capacity {
                self.fractional_tokens = 0.0;
            }
        }
    }
}
