//! Telemetry and operational hooks.
//!
//! Components never log through a concrete backend directly. They emit structured
//! [`RtlEvent`]s through a [`Telemetry`] handle, which fans each event out to:
//!
//! - a [`LogHook`] receiving `(level, category, message)`; the default [`TracingLogHook`]
//!   forwards to `tracing`,
//! - an optional [`AlertHook`] receiving `(alert_type, provider, message)` for events that
//!   should page someone (a circuit opening, a provider needing manual attention),
//! - any number of [`EventSink`]s receiving the structured event itself (e.g. [`MemorySink`]).
//!
//! ```rust
//! use lifeline::telemetry::{MemorySink, RtlEvent, Telemetry};
//!
//! let sink = MemorySink::with_capacity(16);
//! let telemetry = Telemetry::new().with_sink(sink.clone());
//! telemetry.emit(RtlEvent::CircuitClosed { provider: "azure".into() });
//! assert_eq!(sink.len(), 1);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::Level;

/// Structured events emitted on state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtlEvent {
    /// A provider's circuit tripped and now rejects calls.
    CircuitOpened { provider: String, failure_count: u32 },
    /// The open timeout elapsed; probes are allowed through.
    CircuitHalfOpen { provider: String },
    /// Enough probes succeeded; normal traffic resumes.
    CircuitClosed { provider: String },
    /// An entry was dropped to keep the cache within capacity.
    CacheEvicted { key: String },
    /// An entry outlived its TTL and was purged.
    CacheExpired { key: String },
    /// Every slot of a provider's pool is lent out; callers are waiting.
    PoolExhausted { provider: String, max_size: usize },
    /// A recovery strategy ran for a classified failure.
    RecoveryAttempted {
        provider: String,
        error_type: String,
        attempt: u32,
        action: String,
        success: bool,
    },
    /// Recovery was refused because the attempt budget for the window is spent.
    RecoveryExhausted { provider: String, error_type: String, attempts: u32 },
    /// A failure classified as needing an operator (bad credentials, ...).
    ManualInterventionRequired { provider: String, error_type: String },
    /// A call moved from one provider to another.
    ProviderFailover { from: String, to: String },
}

/// Alert categories delivered to an [`AlertHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    CircuitOpened,
    ProviderUnhealthy,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::CircuitOpened => "circuit_opened",
            AlertKind::ProviderUnhealthy => "provider_unhealthy",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RtlEvent {
    /// Severity used when the event is forwarded to a [`LogHook`].
    pub fn level(&self) -> Level {
        match self {
            RtlEvent::CircuitOpened { .. } => Level::ERROR,
            RtlEvent::RecoveryExhausted { .. } | RtlEvent::ManualInterventionRequired { .. } => {
                Level::WARN
            }
            RtlEvent::PoolExhausted { .. } | RtlEvent::ProviderFailover { .. } => Level::WARN,
            RtlEvent::CircuitHalfOpen { .. }
            | RtlEvent::CircuitClosed { .. }
            | RtlEvent::RecoveryAttempted { .. } => Level::INFO,
            RtlEvent::CacheEvicted { .. } | RtlEvent::CacheExpired { .. } => Level::DEBUG,
        }
    }

    /// Log category (component name).
    pub fn category(&self) -> &'static str {
        match self {
            RtlEvent::CircuitOpened { .. }
            | RtlEvent::CircuitHalfOpen { .. }
            | RtlEvent::CircuitClosed { .. } => "circuit_breaker",
            RtlEvent::CacheEvicted { .. } | RtlEvent::CacheExpired { .. } => "cache",
            RtlEvent::PoolExhausted { .. } => "pool",
            RtlEvent::RecoveryAttempted { .. }
            | RtlEvent::RecoveryExhausted { .. }
            | RtlEvent::ManualInterventionRequired { .. }
            | RtlEvent::ProviderFailover { .. } => "recovery",
        }
    }

    /// Alert type and provider, for events operators must hear about.
    pub fn alert(&self) -> Option<(AlertKind, &str)> {
        match self {
            RtlEvent::CircuitOpened { provider, .. } => Some((AlertKind::CircuitOpened, provider)),
            RtlEvent::RecoveryExhausted { provider, .. }
            | RtlEvent::ManualInterventionRequired { provider, .. } => {
                Some((AlertKind::ProviderUnhealthy, provider))
            }
            _ => None,
        }
    }
}

impl fmt::Display for RtlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtlEvent::CircuitOpened { provider, failure_count } => {
                write!(f, "circuit for '{}' opened after {} failures", provider, failure_count)
            }
            RtlEvent::CircuitHalfOpen { provider } => {
                write!(f, "circuit for '{}' half-open, probing", provider)
            }
            RtlEvent::CircuitClosed { provider } => write!(f, "circuit for '{}' closed", provider),
            RtlEvent::CacheEvicted { key } => write!(f, "evicted '{}'", key),
            RtlEvent::CacheExpired { key } => write!(f, "expired '{}'", key),
            RtlEvent::PoolExhausted { provider, max_size } => {
                write!(f, "pool for '{}' exhausted ({} slots in use)", provider, max_size)
            }
            RtlEvent::RecoveryAttempted { provider, error_type, attempt, action, success } => {
                write!(
                    f,
                    "recovery #{} for {} on '{}': {} ({})",
                    attempt,
                    error_type,
                    provider,
                    action,
                    if *success { "ok" } else { "failed" }
                )
            }
            RtlEvent::RecoveryExhausted { provider, error_type, attempts } => write!(
                f,
                "recovery for {} on '{}' exhausted after {} attempts",
                error_type, provider, attempts
            ),
            RtlEvent::ManualInterventionRequired { provider, error_type } => {
                write!(f, "{} on '{}' requires manual intervention", error_type, provider)
            }
            RtlEvent::ProviderFailover { from, to } => {
                write!(f, "failing over from '{}' to '{}'", from, to)
            }
        }
    }
}

/// Generic logging hook: `(level, category, message)`.
pub trait LogHook: Send + Sync {
    fn log(&self, level: Level, category: &str, message: &str);
}

impl<F> LogHook for F
where
    F: Fn(Level, &str, &str) + Send + Sync,
{
    fn log(&self, level: Level, category: &str, message: &str) {
        self(level, category, message)
    }
}

/// Operational alert hook: `(alert_type, provider, message)`.
pub trait AlertHook: Send + Sync {
    fn alert(&self, kind: AlertKind, provider: &str, message: &str);
}

impl<F> AlertHook for F
where
    F: Fn(AlertKind, &str, &str) + Send + Sync,
{
    fn alert(&self, kind: AlertKind, provider: &str, message: &str) {
        self(kind, provider, message)
    }
}

/// Consumer of structured events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &RtlEvent);
}

/// Log hook forwarding to the `tracing` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogHook;

impl LogHook for TracingLogHook {
    fn log(&self, level: Level, category: &str, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "lifeline", category, "{}", message),
            Level::WARN => tracing::warn!(target: "lifeline", category, "{}", message),
            Level::INFO => tracing::info!(target: "lifeline", category, "{}", message),
            Level::DEBUG => tracing::debug!(target: "lifeline", category, "{}", message),
            _ => tracing::trace!(target: "lifeline", category, "{}", message),
        }
    }
}

/// A sink that stores events in memory, dropping the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<RtlEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<RtlEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of events dropped because the sink was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<RtlEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &RtlEvent) {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event.clone());
    }
}

/// Fan-out handle shared by every component. Cheap to clone.
#[derive(Clone)]
pub struct Telemetry {
    log: Arc<dyn LogHook>,
    alert: Option<Arc<dyn AlertHook>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("log", &"<log hook>")
            .field("alert", &self.alert.as_ref().map(|_| "<alert hook>"))
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    /// Telemetry that logs through `tracing` and raises no alerts.
    pub fn new() -> Self {
        Self { log: Arc::new(TracingLogHook), alert: None, sinks: Vec::new() }
    }

    pub fn with_log_hook<H: LogHook + 'static>(mut self, hook: H) -> Self {
        self.log = Arc::new(hook);
        self
    }

    pub fn with_alert_hook<H: AlertHook + 'static>(mut self, hook: H) -> Self {
        self.alert = Some(Arc::new(hook));
        self
    }

    pub fn with_sink<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn emit(&self, event: RtlEvent) {
        let message = event.to_string();
        self.log.log(event.level(), event.category(), &message);
        if let (Some(hook), Some((kind, provider))) = (&self.alert, event.alert()) {
            hook.alert(kind, provider, &message);
        }
        for sink in &self.sinks {
            sink.record(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_is_bounded() {
        let sink = MemorySink::with_capacity(2);
        for i in 0..3 {
            sink.record(&RtlEvent::CacheEvicted { key: format!("k{}", i) });
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events()[0], RtlEvent::CacheEvicted { key: "k1".into() });
    }

    #[test]
    fn alerts_fire_only_for_alert_events() {
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let captured = alerts.clone();
        let telemetry =
            Telemetry::new().with_alert_hook(move |kind: AlertKind, provider: &str, _: &str| {
                captured.lock().unwrap().push((kind, provider.to_string()));
            });

        telemetry.emit(RtlEvent::CircuitClosed { provider: "polly".into() });
        telemetry.emit(RtlEvent::CircuitOpened { provider: "polly".into(), failure_count: 5 });
        telemetry.emit(RtlEvent::ManualInterventionRequired {
            provider: "azure".into(),
            error_type: "authentication".into(),
        });

        let alerts = alerts.lock().unwrap();
        assert_eq!(
            *alerts,
            vec![
                (AlertKind::CircuitOpened, "polly".to_string()),
                (AlertKind::ProviderUnhealthy, "azure".to_string())
            ]
        );
    }

    #[test]
    fn log_hook_receives_level_and_category() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let telemetry = Telemetry::new().with_log_hook(move |level: Level, cat: &str, msg: &str| {
            captured.lock().unwrap().push((level, cat.to_string(), msg.to_string()));
        });

        telemetry.emit(RtlEvent::PoolExhausted { provider: "google".into(), max_size: 4 });

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, Level::WARN);
        assert_eq!(lines[0].1, "pool");
        assert!(lines[0].2.contains("google"));
    }
}
