//! Live-updatable settings.
//!
//! Readers take a cheap `Arc` snapshot per call, so a retune never affects a call already in
//! flight; the next call picks up the new value.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared handle; clones observe the same value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Derive a new value from the current one; retried if another writer raced us.
    pub fn update<F>(&self, mut f: F)
    where
        F: FnMut(&T) -> T,
    {
        self.inner.rcu(|current| Arc::new(f(&**current)));
    }

    /// Like [`update`](Self::update) but keeps the current value when `f` rejects the change.
    pub fn try_update<F, E>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce(&T) -> Result<T, E>,
    {
        let current = self.inner.load_full();
        let next = f(&current)?;
        self.inner.store(Arc::new(next));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;
    use crate::retry::RetryConfig;

    #[test]
    fn retune_retry_attempts() {
        let retry = DynamicConfig::new(RetryConfig::default());
        assert_eq!(retry.get().max_attempts, 3);
        retry.update(|current| RetryConfig { max_attempts: current.max_attempts + 2, ..current.clone() });
        assert_eq!(retry.get().max_attempts, 5);
        retry.set(RetryConfig { max_attempts: 1, ..RetryConfig::default() });
        assert_eq!(retry.get().max_attempts, 1);
    }

    #[test]
    fn in_flight_snapshot_survives_retune() {
        let strategy = DynamicConfig::new(String::from("exponential"));
        let in_flight = strategy.get();
        strategy.clone().set("linear".into());
        assert_eq!(*in_flight, "exponential");
        assert_eq!(*strategy.get(), "linear");
    }

    #[test]
    fn rejected_retune_keeps_value() {
        let attempts = DynamicConfig::new(3u32);
        let result: Result<(), &str> = attempts.try_update(|_| Err("max_attempts must be > 0"));
        assert!(result.is_err());
        assert_eq!(*attempts.get(), 3);
        attempts.try_update(|v| Ok::<_, ()>(v * 2)).unwrap();
        assert_eq!(*attempts.get(), 6);
    }
}
