//! Size- and TTL-bounded result cache with strict LRU eviction.
//!
//! Used to memoise artifacts that are cheap to reuse across calls: voice lists, provider
//! configuration, synthesized audio. Keys are shared across providers, so build them with
//! [`cache_key`] (`provider:kind:id`).
//!
//! Expired entries are logically absent immediately (a `get` purges them) and physically
//! removed by [`ResultCache::purge_expired`] or the background task started with
//! [`ResultCache::spawn_sweeper`].
//!
//! ```rust
//! use lifeline::cache::{cache_key, CacheConfig, ResultCache};
//!
//! let cache: ResultCache<Vec<String>> = ResultCache::new(CacheConfig::default());
//! let key = cache_key("azure", "voices", "en-US");
//! cache.set(key.clone(), vec!["JennyNeural".to_string()], None);
//! assert_eq!(cache.get(&key).map(|v| v.len()), Some(1));
//! ```

use crate::clock::{millis, Clock, MonotonicClock};
use crate::telemetry::{RtlEvent, Telemetry};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Build a namespaced cache key.
pub fn cache_key(provider: &str, kind: &str, id: &str) -> String {
    format!("{}:{}:{}", provider, kind, id)
}

/// Cache sizing and TTL settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum number of entries.
    pub capacity: usize,
    /// TTL applied when `set` is called without one.
    pub default_ttl: Duration,
    /// TTL overrides per artifact kind (`voices`, `audio`, ...).
    pub kind_ttls: HashMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            default_ttl: Duration::from_secs(60 * 60),
            kind_ttls: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// TTL for an artifact kind, falling back to the default.
    pub fn ttl_for(&self, kind: Option<&str>) -> Duration {
        kind.and_then(|k| self.kind_ttls.get(k)).copied().unwrap_or(self.default_ttl)
    }
}

/// Counters exposed for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Hit ratio in `[0, 1]`; zero before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: u64,
    expires_at: u64,
    last_access: u64,
    access_count: u64,
    // position in the access index
    tick: u64,
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    // access tick -> key, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }
}

/// Thread-safe LRU + TTL cache. Share it behind an `Arc`.
#[derive(Debug)]
pub struct ResultCache<V> {
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_parts(config, Arc::new(MonotonicClock::default()), Telemetry::new())
    }

    pub fn with_parts(config: CacheConfig, clock: Arc<dyn Clock>, telemetry: Telemetry) -> Self {
        Self { config, state: Mutex::new(CacheState::new()), clock, telemetry }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look a key up. Expired entries count as a miss and are removed.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut state = self.lock();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => now >= entry.expires_at,
        };

        if expired {
            state.remove(key);
            state.misses += 1;
            state.expirations += 1;
            drop(state);
            self.telemetry.emit(RtlEvent::CacheExpired { key: key.to_string() });
            return None;
        }

        let tick = state.tick();
        let old_tick = {
            let entry = state.entries.get_mut(key)?;
            let old = entry.tick;
            entry.tick = tick;
            entry.last_access = now;
            entry.access_count += 1;
            old
        };
        state.order.remove(&old_tick);
        state.order.insert(tick, key.to_string());
        state.hits += 1;
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert or overwrite an entry. `ttl` defaults to the configured default TTL.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let now = self.clock.now_millis();

        let evicted = {
            let mut state = self.lock();
            state.remove(&key);
            let tick = state.tick();
            state.entries.insert(
                key.clone(),
                CacheEntry {
                    value,
                    created_at: now,
                    expires_at: now.saturating_add(millis(ttl)),
                    last_access: now,
                    access_count: 0,
                    tick,
                },
            );
            state.order.insert(tick, key);
            self.evict_over_capacity(&mut state)
        };

        for key in evicted {
            self.telemetry.emit(RtlEvent::CacheEvicted { key });
        }
    }

    /// Insert using the TTL configured for an artifact kind.
    pub fn set_for_kind(&self, key: impl Into<String>, kind: &str, value: V) {
        let ttl = self.config.ttl_for(Some(kind));
        self.set(key, value, Some(ttl));
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.lock().remove(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    /// Entries physically present, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age and hit count of an entry, without touching its recency.
    pub fn entry_info(&self, key: &str) -> Option<(Duration, u64)> {
        let now = self.clock.now_millis();
        let state = self.lock();
        state.entries.get(key).map(|entry| {
            (Duration::from_millis(now.saturating_sub(entry.created_at)), entry.access_count)
        })
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let expired: Vec<String> = {
            let mut state = self.lock();
            let keys: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| now >= entry.expires_at)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                state.remove(key);
            }
            state.expirations += keys.len() as u64;
            keys
        };

        let purged = expired.len();
        for key in expired {
            self.telemetry.emit(RtlEvent::CacheExpired { key });
        }
        purged
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            size: state.entries.len(),
            capacity: self.config.capacity,
        }
    }

    /// Return the cached value or compute, store and return it.
    ///
    /// Errors from `produce` are passed through and nothing is cached.
    pub async fn get_or_insert_with<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        produce: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = produce().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    // least recently used first
    fn evict_over_capacity(&self, state: &mut CacheState<V>) -> Vec<String> {
        let mut evicted = Vec::new();
        while state.entries.len() > self.config.capacity {
            let Some((_, key)) = state.order.pop_first() else { break };
            state.entries.remove(&key);
            state.evictions += 1;
            evicted.push(key);
        }
        evicted
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V: Clone + Send + 'static> ResultCache<V> {
    /// Purge expired entries every `interval` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "cache sweep");
                }
            }
        })
    }
}
