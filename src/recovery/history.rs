//! Recovery attempt history, keyed by (provider, error type).
//!
//! Bounds how often recovery may run for the same failure. Never used to decide correctness.

use super::ErrorType;
use crate::clock::{millis, Clock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Attempt budget per (provider, error type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPolicy {
    pub max_attempts: u32,
    /// Idle time after which the count resets.
    pub ttl: Duration,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, ttl: Duration::from_secs(60 * 60) }
    }
}

/// Outcome of [`RecoveryHistory::check_and_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryDecision {
    /// Recovery may run; this is attempt number `attempt` in the window.
    Proceed { attempt: u32 },
    /// The budget is spent; nothing was recorded.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy)]
struct HistoryEntry {
    attempts: u32,
    last_attempt_millis: u64,
}

type Key = (String, ErrorType);

#[derive(Debug)]
pub struct RecoveryHistory {
    policy: HistoryPolicy,
    entries: Mutex<HashMap<Key, HistoryEntry>>,
    clock: Arc<dyn Clock>,
}

impl RecoveryHistory {
    pub fn new(policy: HistoryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, entries: Mutex::new(HashMap::new()), clock }
    }

    pub fn policy(&self) -> HistoryPolicy {
        self.policy
    }

    /// Reset stale counts, then either record a new attempt or report exhaustion.
    pub fn check_and_record(&self, provider: &str, error_type: &ErrorType) -> HistoryDecision {
        let now = self.clock.now_millis();
        let ttl = millis(self.policy.ttl);
        let mut entries = self.lock();
        let entry = entries
            .entry((provider.to_string(), error_type.clone()))
            .or_insert(HistoryEntry { attempts: 0, last_attempt_millis: now });

        if now.saturating_sub(entry.last_attempt_millis) > ttl {
            entry.attempts = 0;
        }
        if entry.attempts >= self.policy.max_attempts {
            return HistoryDecision::Exhausted { attempts: entry.attempts };
        }
        entry.attempts += 1;
        entry.last_attempt_millis = now;
        HistoryDecision::Proceed { attempt: entry.attempts }
    }

    /// Attempts counted in the current window.
    pub fn attempts(&self, provider: &str, error_type: &ErrorType) -> u32 {
        let now = self.clock.now_millis();
        let ttl = millis(self.policy.ttl);
        self.lock()
            .get(&(provider.to_string(), error_type.clone()))
            .filter(|entry| now.saturating_sub(entry.last_attempt_millis) <= ttl)
            .map_or(0, |entry| entry.attempts)
    }

    pub fn reset(&self, provider: &str, error_type: &ErrorType) {
        self.lock().remove(&(provider.to_string(), error_type.clone()));
    }

    /// Forget every entry for a provider.
    pub fn reset_provider(&self, provider: &str) {
        self.lock().retain(|(p, _), _| p != provider);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, HistoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn history(clock: ManualClock) -> RecoveryHistory {
        RecoveryHistory::new(HistoryPolicy::default(), Arc::new(clock))
    }

    #[test]
    fn bounded_within_window() {
        let history = history(ManualClock::new());
        let ty = ErrorType::RateLimited;
        for expected in 1..=3 {
            assert_eq!(
                history.check_and_record("polly", &ty),
                HistoryDecision::Proceed { attempt: expected }
            );
        }
        assert_eq!(history.check_and_record("polly", &ty), HistoryDecision::Exhausted { attempts: 3 });
        assert_eq!(history.attempts("polly", &ty), 3);
    }

    #[test]
    fn resets_after_ttl_of_inactivity() {
        let clock = ManualClock::new();
        let history = history(clock.clone());
        let ty = ErrorType::Timeout;
        for _ in 0..3 {
            history.check_and_record("azure", &ty);
        }
        clock.advance(Duration::from_secs(60 * 60));
        assert!(matches!(history.check_and_record("azure", &ty), HistoryDecision::Exhausted { .. }));

        clock.advance(Duration::from_millis(1));
        assert_eq!(history.attempts("azure", &ty), 0);
        assert_eq!(history.check_and_record("azure", &ty), HistoryDecision::Proceed { attempt: 1 });
    }

    #[test]
    fn keys_are_independent() {
        let history = history(ManualClock::new());
        for _ in 0..3 {
            history.check_and_record("polly", &ErrorType::RateLimited);
        }
        assert_eq!(
            history.check_and_record("polly", &ErrorType::Timeout),
            HistoryDecision::Proceed { attempt: 1 }
        );
        assert_eq!(
            history.check_and_record("azure", &ErrorType::RateLimited),
            HistoryDecision::Proceed { attempt: 1 }
        );
        history.reset_provider("polly");
        assert_eq!(history.attempts("polly", &ErrorType::RateLimited), 0);
        assert_eq!(history.attempts("azure", &ErrorType::RateLimited), 1);
    }
}
