//! Explicit provider registry.
//!
//! Built once at startup and handed to whatever needs per-provider state. Each provider gets
//! its own circuit breaker and connection pool; nothing is shared across providers.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::clock::{Clock, MonotonicClock};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::telemetry::Telemetry;
use tracing::warn;

/// Per-provider state.
#[derive(Clone, Debug)]
pub struct ProviderHandle {
    pub breaker: CircuitBreaker,
    pub pool: Arc<ConnectionPool>,
}

/// Errors from registry administration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("provider '{provider}' not found")]
    NotFound { provider: String },
}

/// In-memory registry backed by an RwLock. Clones share the same map.
#[derive(Clone, Debug)]
pub struct ProviderRegistry {
    inner: Arc<RwLock<HashMap<String, ProviderHandle>>>,
    breaker_config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl ProviderRegistry {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self::with_parts(breaker_config, Arc::new(MonotonicClock::default()), Telemetry::new())
    }

    pub fn with_parts(
        breaker_config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        telemetry: Telemetry,
    ) -> Self {
        Self { inner: Arc::default(), breaker_config, clock, telemetry }
    }

    /// Create a breaker and a pre-warmed pool for `provider`.
    ///
    /// Re-registering a name replaces its state; the last registration wins.
    pub fn register(&self, provider: impl Into<String>, pool: PoolConfig) -> ProviderHandle {
        let provider = provider.into();
        let handle = ProviderHandle {
            breaker: CircuitBreaker::with_parts(
                provider.clone(),
                self.breaker_config.clone(),
                Arc::clone(&self.clock),
                self.telemetry.clone(),
            ),
            pool: Arc::new(ConnectionPool::with_parts(
                provider.clone(),
                pool,
                Arc::clone(&self.clock),
                self.telemetry.clone(),
            )),
        };
        self.insert(provider, handle.clone());
        handle
    }

    /// Insert a handle built elsewhere.
    pub fn insert(&self, provider: String, handle: ProviderHandle) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&provider) {
            warn!(target: "lifeline::registry", provider = %provider, "provider replaced; last registration wins");
        }
        map.insert(provider, handle);
    }

    pub fn get(&self, provider: &str) -> Option<ProviderHandle> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).get(provider).cloned()
    }

    pub fn breaker(&self, provider: &str) -> Option<CircuitBreaker> {
        self.get(provider).map(|handle| handle.breaker)
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).contains_key(provider)
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    /// Reset a provider's breaker to Closed.
    pub fn reset(&self, provider: &str) -> Result<(), RegistryError> {
        match self.get(provider) {
            Some(handle) => {
                handle.breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { provider: provider.to_string() }),
        }
    }

    /// Breaker snapshots sorted by provider.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self.handles().map(|h| h.breaker.snapshot()).collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }

    /// Pool statistics sorted by provider.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.handles().map(|h| h.pool.stats()).collect();
        stats.sort_by(|a, b| a.provider.cmp(&b.provider));
        stats
    }

    fn handles(&self) -> impl Iterator<Item = ProviderHandle> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.values().cloned().collect::<Vec<_>>().into_iter()
    }
}
