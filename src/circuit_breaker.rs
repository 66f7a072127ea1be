//! Per-provider circuit breaker.
//!
//! Three states:
//! - **Closed**: traffic flows, consecutive failures accumulate.
//! - **Open**: calls are rejected until `timeout` has elapsed since the last failure.
//! - **HalfOpen**: a bounded number of probes go through; `success_threshold` successes close
//!   the circuit, any failure re-opens it (the failure counter is not cleared on entering
//!   HalfOpen, so it is already at or above the threshold).
//!
//! Counters and state live under one mutex so concurrent outcomes for the same provider
//! serialize against each other. Clones share that state.

use crate::clock::{millis, Clock, MonotonicClock};
use crate::telemetry::{RtlEvent, Telemetry};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: u32 },
    #[error("success_threshold must be > 0 (got {provided})")]
    InvalidSuccessThreshold { provided: u32 },
    #[error("timeout must be > 0 (got {0:?})")]
    InvalidTimeout(Duration),
    #[error("half_open_max_probes must be > 0 (got {provided})")]
    InvalidHalfOpenLimit { provided: usize },
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    half_open_max_probes: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation. Half-open probes default to one at a time.
    pub fn new(
        failure_threshold: u32,
        success_threshold: u32,
        timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if success_threshold == 0 {
            return Err(CircuitBreakerError::InvalidSuccessThreshold { provided: 0 });
        }
        if timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidTimeout(timeout));
        }
        Ok(Self { failure_threshold, success_threshold, timeout, half_open_max_probes: 1 })
    }

    /// Override the number of concurrent half-open probes; must be > 0.
    pub fn with_half_open_max_probes(mut self, limit: usize) -> Result<Self, CircuitBreakerError> {
        if limit == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit { provided: limit });
        }
        self.half_open_max_probes = limit;
        Ok(self)
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: u32::MAX,
            success_threshold: 1,
            timeout: Duration::MAX,
            half_open_max_probes: usize::MAX,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    /// How long the circuit stays Open after the last failure.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn half_open_max_probes(&self) -> usize {
        self.half_open_max_probes
    }
}

/// Answer from [`CircuitBreaker::can_execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Open; try again after `remaining`.
    Denied { remaining: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Time left before an Open circuit admits a probe.
    pub open_remaining: Option<Duration>,
    pub probes_in_flight: usize,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_millis: u64,
    probes_in_flight: usize,
}

impl BreakerState {
    fn remaining(&self, now: u64, timeout: Duration) -> Option<Duration> {
        let elapsed = Duration::from_millis(now.saturating_sub(self.last_failure_millis));
        timeout.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

/// Health gate for one provider.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    provider: Arc<str>,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

/// Half-open probe slot, freed on drop. Holds nothing when the circuit was Closed.
#[derive(Debug)]
pub struct ProbeGuard {
    state: Option<Arc<Mutex<BreakerState>>>,
}

impl ProbeGuard {
    /// Whether this admission counts against the half-open probe limit.
    pub fn is_probe(&self) -> bool {
        self.state.is_some()
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_parts(provider, config, Arc::new(MonotonicClock::default()), Telemetry::new())
    }

    pub fn with_parts(
        provider: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        telemetry: Telemetry,
    ) -> Self {
        let provider: String = provider.into();
        Self {
            provider: Arc::from(provider),
            config,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_millis: 0,
                probes_in_flight: 0,
            })),
            clock,
            telemetry,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now = self.clock.now_millis();
        let opened = {
            let mut state = self.lock();
            state.failure_count = state.failure_count.saturating_add(1);
            state.last_failure_millis = now;
            if state.state == CircuitState::HalfOpen {
                state.success_count = 0;
            }
            if state.failure_count >= self.config.failure_threshold
                && state.state != CircuitState::Open
            {
                state.state = CircuitState::Open;
                state.probes_in_flight = 0;
                Some(state.failure_count)
            } else {
                None
            }
        };

        if let Some(failure_count) = opened {
            tracing::error!(
                provider = %self.provider,
                failures = failure_count,
                threshold = self.config.failure_threshold,
                "circuit breaker → open"
            );
            self.telemetry
                .emit(RtlEvent::CircuitOpened { provider: self.provider.to_string(), failure_count });
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let closed = {
            let mut state = self.lock();
            match state.state {
                CircuitState::Closed => {
                    state.failure_count = 0;
                    false
                }
                CircuitState::HalfOpen => {
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        state.state = CircuitState::Closed;
                        state.failure_count = 0;
                        state.success_count = 0;
                        state.probes_in_flight = 0;
                        true
                    } else {
                        false
                    }
                }
                CircuitState::Open => false,
            }
        };

        if closed {
            tracing::info!(provider = %self.provider, "circuit breaker → closed");
            self.telemetry.emit(RtlEvent::CircuitClosed { provider: self.provider.to_string() });
        }
    }

    /// Whether a call may proceed. Moves Open to HalfOpen once the timeout has elapsed.
    pub fn can_execute(&self) -> Admission {
        let now = self.clock.now_millis();
        let (admission, half_opened) = {
            let mut state = self.lock();
            self.admit(&mut state, now)
        };
        if half_opened {
            self.announce_half_open();
        }
        admission
    }

    /// Like [`can_execute`](Self::can_execute), but also caps concurrent half-open probes.
    ///
    /// The returned guard frees its probe slot when dropped; record the outcome before that.
    pub fn try_admit(&self) -> Result<ProbeGuard, Duration> {
        let now = self.clock.now_millis();
        let (result, half_opened) = {
            let mut state = self.lock();
            let (admission, half_opened) = self.admit(&mut state, now);
            let result = match admission {
                Admission::Denied { remaining } => Err(remaining),
                Admission::Allowed if state.state == CircuitState::HalfOpen => {
                    if state.probes_in_flight >= self.config.half_open_max_probes {
                        tracing::debug!(
                            provider = %self.provider,
                            in_flight = state.probes_in_flight,
                            "half-open probe limit reached"
                        );
                        Err(Duration::ZERO)
                    } else {
                        state.probes_in_flight += 1;
                        Ok(ProbeGuard { state: Some(Arc::clone(&self.state)) })
                    }
                }
                Admission::Allowed => Ok(ProbeGuard { state: None }),
            };
            (result, half_opened)
        };
        if half_opened {
            self.announce_half_open();
        }
        result
    }

    /// Force the circuit Closed and clear counters.
    pub fn reset(&self) {
        let was_closed = {
            let mut state = self.lock();
            let was_closed = state.state == CircuitState::Closed;
            state.state = CircuitState::Closed;
            state.failure_count = 0;
            state.success_count = 0;
            state.probes_in_flight = 0;
            was_closed
        };
        if !was_closed {
            tracing::info!(provider = %self.provider, "circuit breaker reset");
            self.telemetry.emit(RtlEvent::CircuitClosed { provider: self.provider.to_string() });
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now_millis();
        let state = self.lock();
        BreakerSnapshot {
            provider: self.provider.to_string(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            open_remaining: match state.state {
                CircuitState::Open => Some(state.remaining(now, self.config.timeout).unwrap_or_default()),
                _ => None,
            },
            probes_in_flight: state.probes_in_flight,
        }
    }

    fn admit(&self, state: &mut BreakerState, now: u64) -> (Admission, bool) {
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => (Admission::Allowed, false),
            CircuitState::Open => match state.remaining(now, self.config.timeout) {
                Some(remaining) => (Admission::Denied { remaining }, false),
                None => {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    state.probes_in_flight = 0;
                    (Admission::Allowed, true)
                }
            },
        }
    }

    fn announce_half_open(&self) {
        tracing::info!(
            provider = %self.provider,
            timeout_ms = millis(self.config.timeout),
            "circuit breaker → half-open"
        );
        self.telemetry.emit(RtlEvent::CircuitHalfOpen { provider: self.provider.to_string() });
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
