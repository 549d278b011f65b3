//! Exponential backoff used by the retransmission timer.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use lludp::util::backoff::ExponentialBackoff;
//!
//! let backoff = ExponentialBackoff::new(Duration::from_secs(20));
//! let rto = Duration::from_secs(1);
//! assert_eq!(backoff.delay(rto, 0), Duration::from_secs(1));
//! assert_eq!(backoff.delay(rto, 2), Duration::from_secs(4));
//! assert_eq!(backoff.delay(rto, 8), Duration::from_secs(20));
//! ```

use std::time::Duration;

/// Stateless exponential backoff delay calculator.
///
/// Computes delays using the formula: `base * 2^attempt`, capped at `max`.
/// The base is passed on each call because the retransmission timeout it
/// multiplies is re-estimated continuously.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    /// Maximum delay (cap)
    max: Duration,
}

impl ExponentialBackoff {
    pub const fn new(max: Duration) -> Self {
        Self { max }
    }

    /// Returns `base * 2^attempt`, capped at `max`.
    #[inline]
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        // Cap exponent to avoid overflow (2^16 is far beyond any sane ceiling)
        let exponent = attempt.min(16);
        let delay = base.saturating_mul(1u32 << exponent);
        delay.min(self.max)
    }

    #[inline]
    pub fn max(&self) -> Duration {
        self.max
    }
}
