//! Performance monitor.
//!
//! Wall-clock and resource instrumentation around named operations, aggregated into a
//! [`PerformanceReport`] with threshold-based recommendations. Purely observational: nothing in
//! the call path reads it back.
//!
//! ```rust
//! use lifeline::monitor::{MonitorConfig, PerformanceMonitor};
//!
//! let monitor = PerformanceMonitor::new(MonitorConfig::default());
//! monitor.start_operation("synthesize");
//! let metrics = monitor.end_operation("synthesize").expect("started above");
//! assert_eq!(metrics.name, "synthesize");
//! let report = monitor.generate_report();
//! assert_eq!(report.operations.len(), 1);
//! ```

use crate::cache::CacheStats;
use crate::clock::{millis, Clock, MonotonicClock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const MB: u64 = 1024 * 1024;

/// Sample retention and alert thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Samples kept per operation name.
    pub history_limit: usize,
    pub slow_operation: Duration,
    pub memory_delta_bytes: u64,
    pub process_memory_bytes: u64,
    pub cpu_percent: f32,
    /// Hit rate below which the cache gets a recommendation.
    pub min_cache_hit_rate: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            slow_operation: Duration::from_secs(5),
            memory_delta_bytes: 50 * MB,
            process_memory_bytes: 1024 * MB,
            cpu_percent: 80.0,
            min_cache_hit_rate: 0.3,
        }
    }
}

/// Process resource reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Source of process resource readings.
pub trait ResourceProbe: Send + Sync + std::fmt::Debug {
    fn snapshot(&self) -> ResourceSnapshot;
}

/// Reports zeros; for tests and platforms without process metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

impl ResourceProbe for NullProbe {
    fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot::default()
    }
}

/// Reads the current process through `sysinfo`.
#[cfg(feature = "process-metrics")]
#[derive(Debug)]
pub struct SysinfoProbe {
    system: Mutex<sysinfo::System>,
    pid: Option<sysinfo::Pid>,
}

#[cfg(feature = "process-metrics")]
impl Default for SysinfoProbe {
    fn default() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(reason) => {
                tracing::warn!(reason, "process metrics unavailable");
                None
            }
        };
        Self { system: Mutex::new(sysinfo::System::new()), pid }
    }
}

#[cfg(feature = "process-metrics")]
impl ResourceProbe for SysinfoProbe {
    fn snapshot(&self) -> ResourceSnapshot {
        let Some(pid) = self.pid else {
            return ResourceSnapshot::default();
        };
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| ResourceSnapshot {
                memory_bytes: process.memory(),
                cpu_percent: process.cpu_usage(),
            })
            .unwrap_or_default()
    }
}

fn default_probe() -> Arc<dyn ResourceProbe> {
    #[cfg(feature = "process-metrics")]
    {
        Arc::new(SysinfoProbe::default())
    }
    #[cfg(not(feature = "process-metrics"))]
    {
        Arc::new(NullProbe)
    }
}

/// One finished operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub name: String,
    pub started_at_ms: u64,
    pub duration_ms: u64,
    /// Process memory change across the operation; negative when memory was freed.
    pub memory_delta_bytes: i64,
    pub start: ResourceSnapshot,
    pub end: ResourceSnapshot,
}

impl OperationMetrics {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Aggregate over one operation name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSummary {
    pub name: String,
    pub samples: usize,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    pub avg_memory_delta_bytes: f64,
    pub total_memory_delta_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub generated_at_ms: u64,
    pub operations: Vec<OperationSummary>,
    pub process: ResourceSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    pub recommendations: Vec<String>,
}

impl PerformanceReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    started_at_ms: u64,
    start: ResourceSnapshot,
}

#[derive(Debug, Default)]
struct MonitorState {
    in_flight: HashMap<String, Vec<InFlight>>,
    history: HashMap<String, VecDeque<OperationMetrics>>,
}

#[derive(Debug)]
pub struct PerformanceMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    probe: Arc<dyn ResourceProbe>,
    clock: Arc<dyn Clock>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_parts(config, default_probe(), Arc::new(MonotonicClock::default()))
    }

    pub fn with_parts(
        config: MonitorConfig,
        probe: Arc<dyn ResourceProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, state: Mutex::new(MonitorState::default()), probe, clock }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Mark the start of an operation. Nested starts of the same name end in LIFO order, so
    /// only callers that pair starts and ends strictly should use this; concurrent callers
    /// should use [`measure`](Self::measure).
    pub fn start_operation(&self, name: &str) {
        let started = self.begin();
        self.lock().in_flight.entry(name.to_string()).or_default().push(started);
    }

    /// Finish the most recent start of `name`. `None` if it was never started.
    pub fn end_operation(&self, name: &str) -> Option<OperationMetrics> {
        let started = {
            let mut state = self.lock();
            let started = state.in_flight.get_mut(name)?.pop()?;
            if state.in_flight.get(name).is_some_and(Vec::is_empty) {
                state.in_flight.remove(name);
            }
            started
        };
        Some(self.finish(name, started))
    }

    /// Time a future under `name`.
    ///
    /// The start is held by this call alone, so overlapping measurements of one name never
    /// swap start times, and a future dropped before completion records nothing.
    pub async fn measure<F, T>(&self, name: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = self.begin();
        let out = fut.await;
        self.finish(name, started);
        out
    }

    /// Operations started through [`start_operation`](Self::start_operation) and not yet ended.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.values().map(Vec::len).sum()
    }

    fn begin(&self) -> InFlight {
        let start = self.probe.snapshot();
        InFlight { started_at_ms: self.clock.now_millis(), start }
    }

    fn finish(&self, name: &str, started: InFlight) -> OperationMetrics {
        let end = self.probe.snapshot();
        let now = self.clock.now_millis();
        let metrics = OperationMetrics {
            name: name.to_string(),
            started_at_ms: started.started_at_ms,
            duration_ms: now.saturating_sub(started.started_at_ms),
            memory_delta_bytes: delta(started.start.memory_bytes, end.memory_bytes),
            start: started.start,
            end,
        };

        {
            let mut state = self.lock();
            let samples = state.history.entry(name.to_string()).or_default();
            samples.push_back(metrics.clone());
            while samples.len() > self.config.history_limit {
                samples.pop_front();
            }
        }

        if metrics.duration() > self.config.slow_operation {
            tracing::warn!(operation = name, duration_ms = metrics.duration_ms, "slow operation");
        }
        metrics
    }

    /// Samples currently retained for `name`.
    pub fn samples(&self, name: &str) -> Vec<OperationMetrics> {
        self.lock().history.get(name).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.in_flight.clear();
    }

    pub fn generate_report(&self) -> PerformanceReport {
        self.build_report(None)
    }

    /// Report including cache statistics.
    pub fn generate_report_with_cache(&self, cache: CacheStats) -> PerformanceReport {
        self.build_report(Some(cache))
    }

    fn build_report(&self, cache: Option<CacheStats>) -> PerformanceReport {
        let process = self.probe.snapshot();
        let mut operations: Vec<OperationSummary> = {
            let state = self.lock();
            state.history.iter().filter_map(|(name, samples)| summarize(name, samples)).collect()
        };
        operations.sort_by(|a, b| a.name.cmp(&b.name));

        let mut recommendations = Vec::new();
        let slow_ms = millis(self.config.slow_operation) as f64;
        for op in &operations {
            if op.avg_duration_ms > slow_ms {
                recommendations.push(format!(
                    "'{}' averages {:.0} ms, above the {:.0} ms threshold; cache results or prefer a faster provider",
                    op.name, op.avg_duration_ms, slow_ms
                ));
            }
            if op.avg_memory_delta_bytes > self.config.memory_delta_bytes as f64 {
                recommendations.push(format!(
                    "'{}' grows memory by {:.1} MB on average (threshold {} MB); check for buffered audio not being released",
                    op.name,
                    op.avg_memory_delta_bytes / MB as f64,
                    self.config.memory_delta_bytes / MB
                ));
            }
        }
        if process.memory_bytes > self.config.process_memory_bytes {
            recommendations.push(format!(
                "process memory at {} MB exceeds {} MB; lower cache capacity or pool sizes",
                process.memory_bytes / MB,
                self.config.process_memory_bytes / MB
            ));
        }
        if process.cpu_percent > self.config.cpu_percent {
            recommendations.push(format!(
                "process CPU at {:.0}% exceeds {:.0}%; reduce max concurrency",
                process.cpu_percent, self.config.cpu_percent
            ));
        }
        if let Some(stats) = cache {
            if stats.hits + stats.misses > 0 && stats.hit_rate() < self.config.min_cache_hit_rate {
                recommendations.push(format!(
                    "cache hit rate {:.0}% is below {:.0}%; raise TTLs or capacity",
                    stats.hit_rate() * 100.0,
                    self.config.min_cache_hit_rate * 100.0
                ));
            }
        }

        PerformanceReport {
            generated_at_ms: self.clock.now_millis(),
            operations,
            process,
            cache,
            recommendations,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn delta(start: u64, end: u64) -> i64 {
    if end >= start {
        i64::try_from(end - start).unwrap_or(i64::MAX)
    } else {
        i64::try_from(start - end).map(|d| -d).unwrap_or(i64::MIN)
    }
}

fn summarize(name: &str, samples: &VecDeque<OperationMetrics>) -> Option<OperationSummary> {
    let count = samples.len();
    if count == 0 {
        return None;
    }
    let total_ms: u64 = samples.iter().map(|m| m.duration_ms).sum();
    let total_delta: i64 = samples.iter().map(|m| m.memory_delta_bytes).fold(0, i64::saturating_add);
    Some(OperationSummary {
        name: name.to_string(),
        samples: count,
        avg_duration_ms: total_ms as f64 / count as f64,
        min_duration_ms: samples.iter().map(|m| m.duration_ms).min().unwrap_or(0),
        max_duration_ms: samples.iter().map(|m| m.duration_ms).max().unwrap_or(0),
        avg_memory_delta_bytes: total_delta as f64 / count as f64,
        total_memory_delta_bytes: total_delta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Memory grows by `step` bytes on every reading.
    #[derive(Debug, Default)]
    struct GrowingProbe {
        memory: AtomicU64,
        step: u64,
    }

    impl ResourceProbe for GrowingProbe {
        fn snapshot(&self) -> ResourceSnapshot {
            let memory_bytes = self.memory.fetch_add(self.step, Ordering::SeqCst) + self.step;
            ResourceSnapshot { memory_bytes, cpu_percent: 5.0 }
        }
    }

    fn monitor(clock: ManualClock, probe: Arc<dyn ResourceProbe>) -> PerformanceMonitor {
        PerformanceMonitor::with_parts(MonitorConfig::default(), probe, Arc::new(clock))
    }

    #[test]
    fn measures_duration() {
        let clock = ManualClock::new();
        let monitor = monitor(clock.clone(), Arc::new(NullProbe));
        monitor.start_operation("synthesize");
        clock.advance(Duration::from_millis(250));
        let metrics = monitor.end_operation("synthesize").unwrap();
        assert_eq!(metrics.duration(), Duration::from_millis(250));
        assert!(monitor.end_operation("synthesize").is_none());
        assert!(monitor.end_operation("never").is_none());
    }

    #[test]
    fn history_is_bounded() {
        let monitor = monitor(ManualClock::new(), Arc::new(NullProbe));
        for _ in 0..150 {
            monitor.start_operation("voices");
            monitor.end_operation("voices");
        }
        assert_eq!(monitor.samples("voices").len(), 100);
        assert_eq!(monitor.generate_report().operations[0].samples, 100);
    }

    #[test]
    fn report_aggregates_and_recommends() {
        let clock = ManualClock::new();
        let probe = Arc::new(GrowingProbe { memory: AtomicU64::new(0), step: 60 * MB });
        let monitor = monitor(clock.clone(), probe);
        for ms in [4_000, 8_000] {
            monitor.start_operation("synthesize");
            clock.advance(Duration::from_millis(ms));
            monitor.end_operation("synthesize");
        }

        let report = monitor.generate_report();
        let op = &report.operations[0];
        assert_eq!(op.avg_duration_ms, 6_000.0);
        assert_eq!(op.min_duration_ms, 4_000);
        assert_eq!(op.max_duration_ms, 8_000);
        assert_eq!(op.total_memory_delta_bytes, (120 * MB) as i64);
        assert_eq!(report.recommendations.len(), 2, "{:?}", report.recommendations);
        assert!(report.recommendations[0].contains("synthesize"));
    }

    #[test]
    fn cache_hit_rate_recommendation() {
        let monitor = monitor(ManualClock::new(), Arc::new(NullProbe));
        let stats = CacheStats { hits: 1, misses: 9, capacity: 10, ..CacheStats::default() };
        let report = monitor.generate_report_with_cache(stats);
        assert_eq!(report.recommendations.len(), 1);
        assert!(report.recommendations[0].contains("cache hit rate"));

        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["cache"]["misses"], 9);
    }

    #[test]
    fn nested_operations_end_lifo() {
        let clock = ManualClock::new();
        let monitor = monitor(clock.clone(), Arc::new(NullProbe));
        monitor.start_operation("call");
        clock.advance(Duration::from_millis(100));
        monitor.start_operation("call");
        clock.advance(Duration::from_millis(10));
        assert_eq!(monitor.end_operation("call").unwrap().duration_ms, 10);
        assert_eq!(monitor.end_operation("call").unwrap().duration_ms, 110);
    }

    #[tokio::test]
    async fn measure_wraps_future() {
        let monitor = monitor(ManualClock::new(), Arc::new(NullProbe));
        let value = monitor.measure("list_voices", async { 42 }).await;
        assert_eq!(value, 42);
        assert_eq!(monitor.samples("list_voices").len(), 1);
    }

    #[tokio::test]
    async fn overlapping_measurements_keep_their_own_start() {
        let clock = ManualClock::new();
        let monitor = monitor(clock.clone(), Arc::new(NullProbe));
        let (first_done, first_rx) = tokio::sync::oneshot::channel::<()>();
        let (second_done, second_rx) = tokio::sync::oneshot::channel::<()>();
        let mut first = Box::pin(monitor.measure("synthesize", async {
            let _ = first_rx.await;
        }));
        let mut second = Box::pin(monitor.measure("synthesize", async {
            let _ = second_rx.await;
        }));

        assert!(futures::poll!(&mut first).is_pending());
        clock.advance(Duration::from_millis(4_900));
        assert!(futures::poll!(&mut second).is_pending());
        clock.advance(Duration::from_millis(100));
        first_done.send(()).unwrap();
        first.await;
        clock.advance(Duration::from_millis(100));
        second_done.send(()).unwrap();
        second.await;

        let durations: Vec<u64> =
            monitor.samples("synthesize").iter().map(|m| m.duration_ms).collect();
        assert_eq!(durations, vec![5_000, 200]);
        let summary = &monitor.generate_report().operations[0];
        assert_eq!(summary.min_duration_ms, 200);
        assert_eq!(summary.max_duration_ms, 5_000);
    }

    #[tokio::test]
    async fn cancelled_measurement_leaves_nothing_behind() {
        let monitor = monitor(ManualClock::new(), Arc::new(NullProbe));
        for _ in 0..100 {
            let cancelled = tokio::time::timeout(
                Duration::ZERO,
                monitor.measure("synthesize", std::future::pending::<()>()),
            )
            .await;
            assert!(cancelled.is_err());
        }
        assert_eq!(monitor.in_flight(), 0);
        assert!(monitor.samples("synthesize").is_empty());

        monitor.start_operation("synthesize");
        assert_eq!(monitor.in_flight(), 1);
        assert_eq!(monitor.end_operation("synthesize").unwrap().name, "synthesize");
        assert_eq!(monitor.in_flight(), 0);
    }

    #[cfg(feature = "process-metrics")]
    #[test]
    fn sysinfo_probe_reads_current_process() {
        let snapshot = SysinfoProbe::default().snapshot();
        assert!(snapshot.memory_bytes > 0);
    }
}
