//! Backoff strategies for the retry coordinator.
//!
//! Attempt semantics: attempt `0` is the initial call (no delay); retries start at `attempt = 1`.
//!
//! | strategy      | delay for attempt `a`                          |
//! |---------------|------------------------------------------------|
//! | `Exponential` | `base * 2^(a-1)`                               |
//! | `Linear`      | `base * a`                                     |
//! | `Fixed`       | `base`                                         |
//! | `Fibonacci`   | `base` for `a` in 1..=2, then `base * (2a - 1)` |
//!
//! The Fibonacci variant is a simplified growth curve, not the real sequence; existing
//! deployments tune their limits against it so it stays as is.
//!
//! ```rust
//! use std::time::Duration;
//! use lifeline::backoff::{Backoff, RetryStrategy};
//!
//! let backoff = Backoff::new(RetryStrategy::Exponential, Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(400));
//! assert_eq!(backoff.delay(8), Duration::from_secs(2));
//! ```
//!
//! Computations that would overflow saturate to [`MAX_BACKOFF`] (1 day).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
    #[error("unknown retry strategy '{0}' (expected exponential, linear, fixed or fibonacci)")]
    UnknownStrategy(String),
}

/// Delay growth curve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
    Fibonacci,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Fibonacci => "fibonacci",
        }
    }

    /// Delay for `attempt` before any cap or jitter.
    pub fn raw_delay(&self, base: Duration, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier: u128 = match self {
            RetryStrategy::Exponential => 2u128.saturating_pow(attempt - 1),
            RetryStrategy::Linear => u128::from(attempt),
            RetryStrategy::Fixed => 1,
            RetryStrategy::Fibonacci if attempt <= 2 => 1,
            RetryStrategy::Fibonacci => u128::from(attempt) * 2 - 1,
        };
        let nanos = base.as_nanos().saturating_mul(multiplier).min(MAX_BACKOFF.as_nanos());
        // bounded by MAX_BACKOFF, fits in u64
        Duration::from_nanos(nanos as u64)
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryStrategy {
    type Err = BackoffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exponential" => Ok(RetryStrategy::Exponential),
            "linear" => Ok(RetryStrategy::Linear),
            "fixed" | "constant" => Ok(RetryStrategy::Fixed),
            "fibonacci" => Ok(RetryStrategy::Fibonacci),
            _ => Err(BackoffError::UnknownStrategy(s.to_string())),
        }
    }
}

/// A strategy bound to a base delay and an optional cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    strategy: RetryStrategy,
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    pub fn new(strategy: RetryStrategy, base: Duration) -> Self {
        Self { strategy, base, max: None }
    }

    pub fn exponential(base: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, base)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(RetryStrategy::Fixed, delay)
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    /// Capped delay for `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.strategy.raw_delay(self.base, attempt);
        self.max.map_or(raw, |max| raw.min(max))
    }
}
