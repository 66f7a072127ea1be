//! Concurrency limiter bounding simultaneous in-flight provider calls.
//!
//! Two ways to hold a token:
//! - raw tokens: [`ConcurrencyLimiter::try_acquire`] / [`ConcurrencyLimiter::release`]. Each
//!   successful `try_acquire` must be matched by exactly one `release`.
//! - scoped permits: [`ConcurrencyLimiter::try_permit`] / [`ConcurrencyLimiter::acquire`] return a
//!   [`LimiterPermit`] that gives its token back when dropped, on every exit path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Limiter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Maximum simultaneous operations.
    pub max_concurrency: usize,
    /// How long [`ConcurrencyLimiter::acquire`] may queue; `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self { max_concurrency: 8, acquire_timeout: Some(Duration::from_secs(30)) }
    }
}

/// Counting semaphore shared by clones.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    // raw tokens handed out by `try_acquire` and not yet released
    leased: Arc<AtomicUsize>,
}

/// Token returned to the limiter on drop.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    /// Create a limiter with `max_concurrency` tokens (at least one).
    pub fn new(max_concurrency: usize) -> Self {
        let capacity = max_concurrency.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            leased: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(config: &LimiterConfig) -> Self {
        Self::new(config.max_concurrency)
    }

    pub fn unlimited() -> Self {
        Self::new(1_000_000_000)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Tokens currently held, raw or scoped.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Take a raw token without waiting. Returns `false` when saturated.
    pub fn try_acquire(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.leased.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    /// Return a raw token taken with [`try_acquire`](Self::try_acquire).
    ///
    /// A release with no outstanding raw token is ignored so `available` never exceeds capacity.
    pub fn release(&self) {
        let returned = self
            .leased
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if returned {
            self.semaphore.add_permits(1);
        } else {
            tracing::warn!(
                capacity = self.capacity,
                "limiter release without a matching acquire ignored"
            );
        }
    }

    /// Take a scoped permit without waiting.
    pub fn try_permit(&self) -> Option<LimiterPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| LimiterPermit { _permit: permit })
    }

    /// Queue for a scoped permit, giving up after `timeout` if one is set.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Option<LimiterPermit> {
        let acquire = self.semaphore.clone().acquire_owned();
        let permit = match timeout {
            Some(limit) => tokio::time::timeout(limit, acquire).await.ok()?,
            None => acquire.await,
        };
        // the semaphore is never closed
        permit.ok().map(|permit| LimiterPermit { _permit: permit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn raw_tokens_are_counted() {
        let limiter = ConcurrencyLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire(), "third token should be refused");
        assert_eq!(limiter.available(), 0);
        assert_eq!(limiter.in_flight(), 2);

        limiter.release();
        assert_eq!(limiter.available(), 1);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn unmatched_release_never_exceeds_capacity() {
        let limiter = ConcurrencyLimiter::new(3);
        limiter.release();
        limiter.release();
        assert_eq!(limiter.available(), 3);

        assert!(limiter.try_acquire());
        limiter.release();
        limiter.release();
        assert_eq!(limiter.available(), 3);
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let limiter = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn scoped_permit_released_on_drop() {
        let limiter = ConcurrencyLimiter::new(1);
        {
            let _permit = limiter.try_permit().expect("free token");
            assert!(limiter.try_permit().is_none());
            assert!(!limiter.try_acquire());
        }
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_saturated() {
        let limiter = ConcurrencyLimiter::new(1);
        let _held = limiter.try_permit().unwrap();

        let result = limiter.acquire(Some(Duration::from_millis(50))).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn queued_acquire_proceeds_after_release() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.try_permit().unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(None).await.is_some() })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_operations_never_exceed_limit() {
        let limiter = ConcurrencyLimiter::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let limiter = limiter.clone();
                let current = current.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _permit = limiter.acquire(None).await.unwrap();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        futures::future::join_all(handles).await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.available(), 3);
    }
}
