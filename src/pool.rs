//! Per-provider pool of reusable connection slots.
//!
//! A [`ConnectionSlot`] is a lightweight handle standing for one logical connection to a
//! provider. The pool pre-warms `min_size` slots, grows lazily up to `max_size`, and retires
//! slots that are invalidated or older than the freshness window.
//!
//! Invariant, observable through [`ConnectionPool::stats`] at any time:
//! `available + active == current_size <= max_size`.
//!
//! Exhaustion is backpressure, not an error: [`ConnectionPool::acquire`] waits (woken on
//! release, re-polling every `poll_interval`) until a slot frees up or `connection_timeout`
//! passes.

use crate::clock::{millis, Clock, MonotonicClock};
use crate::telemetry::{RtlEvent, Telemetry};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Pool sizing and freshness settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Slots created up front.
    pub min_size: usize,
    /// Hard cap on slots (available + lent out).
    pub max_size: usize,
    /// Longest a caller waits for a slot on a saturated pool.
    pub connection_timeout: Duration,
    /// Slots older than this are retired instead of reused.
    pub freshness: Duration,
    /// Re-poll interval while waiting on a saturated pool.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 5,
            connection_timeout: Duration::from_secs(30),
            freshness: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Handle representing one logical connection to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSlot {
    id: Uuid,
    provider: String,
    created_at: u64,
    last_used: u64,
    valid: bool,
}

impl ConnectionSlot {
    fn new(provider: &str, now: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            created_at: now,
            last_used: now,
            valid: true,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn created_at_millis(&self) -> u64 {
        self.created_at
    }

    pub fn last_used_millis(&self) -> u64 {
        self.last_used
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark the slot unusable; the pool retires it when it comes back.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    fn is_fresh(&self, now: u64, freshness: Duration) -> bool {
        self.valid && now.saturating_sub(self.created_at) < millis(freshness)
    }
}

/// Point-in-time occupancy figures.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub provider: String,
    pub available: usize,
    pub active: usize,
    pub current_size: usize,
    pub min_size: usize,
    pub max_size: usize,
}

impl PoolStats {
    /// Share of `max_size` currently lent out, as a percentage.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.active as f64 / self.max_size as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    available: VecDeque<ConnectionSlot>,
    active: HashMap<Uuid, ConnectionSlot>,
    current_size: usize,
}

impl PoolState {
    fn debug_check(&self, max_size: usize) {
        debug_assert_eq!(self.available.len() + self.active.len(), self.current_size);
        debug_assert!(self.current_size <= max_size);
    }
}

/// Bounded slot pool for one provider.
#[derive(Debug)]
pub struct ConnectionPool {
    provider: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl ConnectionPool {
    /// Create a pool and pre-warm `min_size` slots (capped at `max_size`).
    pub fn new(provider: impl Into<String>, config: PoolConfig) -> Self {
        Self::with_parts(provider, config, Arc::new(MonotonicClock::default()), Telemetry::new())
    }

    pub fn with_parts(
        provider: impl Into<String>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
        telemetry: Telemetry,
    ) -> Self {
        let pool = Self {
            provider: provider.into(),
            config,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
            clock,
            telemetry,
        };
        pool.warm_up();
        pool
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Lend a slot without waiting; `None` when the pool is at capacity.
    pub fn try_acquire(&self) -> Option<ConnectionSlot> {
        let now = self.clock.now_millis();
        let mut state = self.lock();

        while let Some(mut slot) = state.available.pop_front() {
            if slot.is_fresh(now, self.config.freshness) {
                slot.last_used = now;
                state.active.insert(slot.id, slot.clone());
                state.debug_check(self.config.max_size);
                return Some(slot);
            }
            state.current_size -= 1;
            tracing::debug!(provider = %self.provider, slot = %slot.id, "stale slot retired on acquire");
        }

        if state.current_size < self.config.max_size {
            let slot = ConnectionSlot::new(&self.provider, now);
            state.current_size += 1;
            state.active.insert(slot.id, slot.clone());
            state.debug_check(self.config.max_size);
            return Some(slot);
        }

        None
    }

    /// Lend a slot, waiting up to `connection_timeout` on a saturated pool.
    ///
    /// Returns the time spent waiting when no slot freed up in time.
    pub async fn acquire(&self) -> Result<ConnectionSlot, Duration> {
        self.acquire_within(self.config.connection_timeout).await
    }

    /// Like [`acquire`](Self::acquire) with an explicit wait bound.
    pub async fn acquire_within(&self, timeout: Duration) -> Result<ConnectionSlot, Duration> {
        let started = tokio::time::Instant::now();
        let deadline = started + timeout;
        let mut reported = false;

        loop {
            if let Some(slot) = self.try_acquire() {
                return Ok(slot);
            }
            if !reported {
                reported = true;
                self.telemetry.emit(RtlEvent::PoolExhausted {
                    provider: self.provider.clone(),
                    max_size: self.config.max_size,
                });
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(now - started);
            }
            let wait = self.config.poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(wait, self.released.notified()).await;
        }
    }

    /// Acquire a slot wrapped in a guard that returns it on drop.
    pub async fn lease(self: &Arc<Self>) -> Result<SlotLease, Duration> {
        let slot = self.acquire().await?;
        Ok(SlotLease { pool: Arc::clone(self), slot: Some(slot) })
    }

    /// Return a lent slot. Fresh slots go back to the available set while it is below
    /// `max_size`; anything else is retired and the pool shrinks.
    pub fn release(&self, mut slot: ConnectionSlot) {
        let now = self.clock.now_millis();
        {
            let mut state = self.lock();
            if state.active.remove(&slot.id).is_none() {
                tracing::warn!(provider = %self.provider, slot = %slot.id, "release of a slot not lent by this pool ignored");
                return;
            }

            if slot.is_fresh(now, self.config.freshness)
                && state.available.len() < self.config.max_size
            {
                slot.last_used = now;
                state.available.push_back(slot);
            } else {
                state.current_size -= 1;
                tracing::debug!(provider = %self.provider, slot = %slot.id, valid = slot.valid, "slot retired on release");
            }
            state.debug_check(self.config.max_size);
        }
        self.released.notify_one();
    }

    /// Retire stale idle slots. Returns how many were dropped.
    pub fn prune_stale(&self) -> usize {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        let before = state.available.len();
        let freshness = self.config.freshness;
        state.available.retain(|slot| slot.is_fresh(now, freshness));
        let pruned = before - state.available.len();
        state.current_size -= pruned;
        state.debug_check(self.config.max_size);
        pruned
    }

    /// Create slots until `current_size` reaches `min_size` (never beyond `max_size`).
    /// Returns how many were added.
    pub fn warm_up(&self) -> usize {
        let now = self.clock.now_millis();
        let target = self.config.min_size.min(self.config.max_size);
        let mut state = self.lock();
        let mut added = 0;
        while state.current_size < target {
            state.available.push_back(ConnectionSlot::new(&self.provider, now));
            state.current_size += 1;
            added += 1;
        }
        drop(state);
        if added > 0 {
            self.released.notify_waiters();
        }
        added
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            provider: self.provider.clone(),
            available: state.available.len(),
            active: state.active.len(),
            current_size: state.current_size,
            min_size: self.config.min_size,
            max_size: self.config.max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A lent slot that goes back to its pool when dropped.
#[derive(Debug)]
pub struct SlotLease {
    pool: Arc<ConnectionPool>,
    slot: Option<ConnectionSlot>,
}

impl SlotLease {
    /// The lent slot.
    pub fn slot(&self) -> Option<&ConnectionSlot> {
        self.slot.as_ref()
    }

    /// Mark the slot broken so it is retired instead of reused.
    pub fn invalidate(&mut self) {
        if let Some(slot) = self.slot.as_mut() {
            slot.invalidate();
        }
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}
