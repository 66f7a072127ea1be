//! Retry coordinator.
//!
//! The coordinator never retries anything itself: it only answers "how long should the caller
//! wait before attempt `n`". The gateway and the recovery strategies do the sleeping.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries) and is a hard bound.
//! - Delays follow the configured [`RetryStrategy`], then jitter, then are clamped to
//!   `[0, max_delay]`.
//!
//! ```rust
//! use std::time::Duration;
//! use lifeline::backoff::RetryStrategy;
//! use lifeline::retry::{RetryConfig, RetryCoordinator};
//!
//! let config = RetryConfig::builder()
//!     .max_attempts(4)
//!     .strategy(RetryStrategy::Linear)
//!     .base_delay(Duration::from_millis(200))
//!     .jitter_percent(0.0)
//!     .build()
//!     .unwrap();
//! let coordinator = RetryCoordinator::new(config);
//! assert_eq!(coordinator.delay_for(3), Duration::from_millis(600));
//! ```

use crate::backoff::{BackoffError, RetryStrategy};
use crate::jitter::{Jitter, JitterError};
use rand::Rng;
use std::time::Duration;

/// Retry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter in percent of the computed delay (`10.0` = ±10%).
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_percent: 10.0,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Check the invariants the builder enforces.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(self.max_attempts));
        }
        if self.max_delay < self.base_delay {
            return Err(BuildError::Backoff(BackoffError::MaxLessThanBase {
                base: self.base_delay,
                max: self.max_delay,
            }));
        }
        Jitter::percent(self.jitter_percent)?;
        Ok(())
    }
}

/// Errors produced while building retry settings.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(u32),
    #[error(transparent)]
    Backoff(#[from] BackoffError),
    #[error(transparent)]
    Jitter(#[from] JitterError),
}

/// Builder for [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn jitter_percent(mut self, percent: f64) -> Self {
        self.config.jitter_percent = percent;
        self
    }

    pub fn build(self) -> Result<RetryConfig, BuildError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Computes delays from a [`RetryConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryCoordinator {
    config: RetryConfig,
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryCoordinator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether another attempt is allowed after `attempts_made` total attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.config.max_attempts
    }

    /// Delay before retry `attempt` (1-based) under the configured policy.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_for_with_rng(attempt, &mut rand::rng())
    }

    pub fn delay_for_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        Self::compute_delay_with_rng(
            self.config.strategy,
            attempt,
            self.config.base_delay,
            self.config.max_delay,
            self.config.jitter_percent,
            rng,
        )
    }

    /// Stateless delay computation.
    pub fn compute_delay(
        strategy: RetryStrategy,
        attempt: u32,
        base: Duration,
        max: Duration,
        jitter_percent: f64,
    ) -> Duration {
        Self::compute_delay_with_rng(strategy, attempt, base, max, jitter_percent, &mut rand::rng())
    }

    pub fn compute_delay_with_rng<R: Rng>(
        strategy: RetryStrategy,
        attempt: u32,
        base: Duration,
        max: Duration,
        jitter_percent: f64,
        rng: &mut R,
    ) -> Duration {
        let raw = strategy.raw_delay(base, attempt);
        // out-of-range percentages are clamped rather than rejected here
        let jitter = Jitter::percent(jitter_percent.clamp(0.0, 100.0)).unwrap_or_default();
        jitter.apply_with_rng(raw, max, rng)
    }
}
