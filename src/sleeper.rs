//! Backoff waits.
//!
//! The gateway and the recovery strategies never call `tokio::time::sleep` directly; they ask
//! a [`Sleeper`], so tests can assert the exact backoff schedule without waiting it out.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Waits out a backoff delay.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Waits on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Returns immediately and remembers each requested delay, in order.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Total backoff the call would have waited.
    pub fn total(&self) -> Duration {
        self.calls().iter().sum()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_sleeper_skips_long_backoff() {
        let start = std::time::Instant::now();
        InstantSleeper.sleep(Duration::from_secs(60)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tracking_sleeper_records_backoff_schedule() {
        let sleeper = TrackingSleeper::new();
        let shared: Arc<dyn Sleeper> = Arc::new(sleeper.clone());
        for ms in [1_000, 2_000, 4_000] {
            shared.sleep(Duration::from_millis(ms)).await;
        }

        assert_eq!(
            sleeper.calls(),
            [1_000, 2_000, 4_000].map(Duration::from_millis).to_vec()
        );
        assert_eq!(sleeper.total(), Duration::from_secs(7));
        sleeper.clear();
        assert_eq!(sleeper.total(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_waits_on_timer() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
