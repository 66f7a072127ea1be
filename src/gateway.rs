//! The call path.
//!
//! [`Gateway::execute`] wraps one logical vendor operation with every component, in this order:
//!
//! ```text
//! circuit breaker → concurrency limiter → connection pool → result cache → operation
//! ```
//!
//! On success the breaker records it and the value is cached (when the request has a cache
//! key). On failure the breaker records it, the error is classified, and recovery runs once per
//! (provider, error type) per call. Recovery may retry in place, retry with replacement
//! settings, move the call to a backup provider, or give up. Repeats of an already-recovered
//! error type are retried with the coordinator's backoff alone. Every call is bounded by
//! `retry.max_attempts` vendor calls.
//!
//! ```rust
//! use lifeline::config::RtlConfig;
//! use lifeline::gateway::{CallRequest, Gateway};
//! use lifeline::sleeper::InstantSleeper;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let gateway: Gateway<String> = Gateway::builder(RtlConfig::default())
//!     .provider("polly")
//!     .sleeper(InstantSleeper)
//!     .build();
//!
//! let voice = gateway
//!     .execute(CallRequest::new("polly", "list_voices").cached("polly:voices:en-US"), |_ctx| async {
//!         Ok::<_, std::io::Error>("Joanna".to_string())
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(voice, "Joanna");
//! # });
//! ```

use crate::adaptive::DynamicConfig;
use crate::cache::ResultCache;
use crate::circuit_breaker::CircuitState;
use crate::clock::{Clock, MonotonicClock};
use crate::config::RtlConfig;
use crate::error::{Disposition, FailureReport, ResilienceError};
use crate::limiter::ConcurrencyLimiter;
use crate::monitor::{PerformanceMonitor, PerformanceReport, ResourceProbe};
use crate::pool::PoolConfig;
use crate::recovery::{
    AlwaysReachable, ErrorClassifier, ErrorType, ReachabilityProbe, RecoveryEngine,
    RecoveryRequest, RecoveryStrategy, RecoveryVerdict,
};
use crate::registry::ProviderRegistry;
use crate::retry::{BuildError, RetryConfig, RetryCoordinator};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{RtlEvent, Telemetry};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One logical operation against a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub provider: String,
    /// Operation name used for performance metrics (`synthesize`, `list_voices`, ...).
    pub operation: String,
    pub cache_key: Option<String>,
    /// Artifact kind selecting the cache TTL.
    pub cache_kind: Option<String>,
    /// Providers recovery may fail over to. `None` means every other registered provider
    /// whose circuit is not open.
    pub alternatives: Option<Vec<String>>,
}

impl CallRequest {
    pub fn new(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
            cache_key: None,
            cache_kind: None,
            alternatives: None,
        }
    }

    /// Serve from and store into the result cache under `key`.
    pub fn cached(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn cache_kind(mut self, kind: impl Into<String>) -> Self {
        self.cache_kind = Some(kind.into());
        self
    }

    pub fn alternatives(mut self, providers: Vec<String>) -> Self {
        self.alternatives = Some(providers);
        self
    }
}

/// Handed to the operation on every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Provider this attempt runs against; changes after a failover.
    pub provider: String,
    /// Vendor call number within this request (1-based).
    pub attempt: u32,
    pub slot_id: Option<Uuid>,
    /// Provider settings, possibly replaced by recovery (another region, longer timeout).
    pub settings: HashMap<String, String>,
}

/// Resilience & throughput layer in front of the vendor-call code. Clones share all state.
pub struct Gateway<T> {
    registry: ProviderRegistry,
    limiter: ConcurrencyLimiter,
    limiter_wait: Option<Duration>,
    cache: Arc<ResultCache<T>>,
    engine: Arc<RecoveryEngine>,
    monitor: Arc<PerformanceMonitor>,
    retry: DynamicConfig<RetryConfig>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
    provider_settings: Arc<HashMap<String, HashMap<String, String>>>,
    failover: bool,
}

impl<T> Clone for Gateway<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            limiter: self.limiter.clone(),
            limiter_wait: self.limiter_wait,
            cache: Arc::clone(&self.cache),
            engine: Arc::clone(&self.engine),
            monitor: Arc::clone(&self.monitor),
            retry: self.retry.clone(),
            sleeper: Arc::clone(&self.sleeper),
            telemetry: self.telemetry.clone(),
            provider_settings: Arc::clone(&self.provider_settings),
            failover: self.failover,
        }
    }
}

impl<T> fmt::Debug for Gateway<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("providers", &self.registry.providers())
            .field("limiter", &self.limiter)
            .field("engine", &self.engine)
            .field("failover", &self.failover)
            .finish_non_exhaustive()
    }
}

impl<T> Gateway<T>
where
    T: Clone + Send + 'static,
{
    pub fn builder(config: RtlConfig) -> GatewayBuilder<T> {
        GatewayBuilder::new(config)
    }

    /// Gateway with production defaults for the given providers.
    pub fn from_config<I, S>(config: RtlConfig, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        providers.into_iter().fold(Self::builder(config), |b, p| b.provider(p)).build()
    }

    /// Run `op` through the layer.
    pub async fn execute<E, F, Fut>(
        &self,
        request: CallRequest,
        mut op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        E: fmt::Display,
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let coordinator = RetryCoordinator::new(RetryConfig::clone(&self.retry.get()));
        let max_attempts = coordinator.max_attempts();

        let mut provider = request.provider.clone();
        let mut settings = self.settings_for(&provider);
        let mut visited = vec![provider.clone()];
        let mut recovered: HashSet<(String, ErrorType)> = HashSet::new();
        let mut attempts: u32 = 0;
        let mut last_action: Option<String> = None;
        let mut backup: Option<String> = None;

        loop {
            let handle = self
                .registry
                .get(&provider)
                .ok_or_else(|| ResilienceError::UnknownProvider { provider: provider.clone() })?;

            let probe = handle.breaker.try_admit().map_err(|remaining| {
                tracing::debug!(%provider, ?remaining, "call rejected by open circuit");
                ResilienceError::CircuitOpen {
                    provider: provider.clone(),
                    failure_count: handle.breaker.failure_count(),
                    retry_after: remaining,
                }
            })?;

            let permit = match self.limiter.acquire(self.limiter_wait).await {
                Some(permit) => permit,
                None => {
                    return Err(ResilienceError::LimiterTimeout {
                        in_flight: self.limiter.in_flight(),
                        max: self.limiter.capacity(),
                        waited: self.limiter_wait.unwrap_or_default(),
                    })
                }
            };

            let mut lease = handle.pool.lease().await.map_err(|waited| {
                ResilienceError::PoolTimeout { provider: provider.clone(), waited }
            })?;

            if let Some(value) = request.cache_key.as_deref().and_then(|key| self.cache.get(key)) {
                tracing::trace!(%provider, operation = %request.operation, "served from cache");
                return Ok(value);
            }

            attempts += 1;
            let ctx = CallContext {
                provider: provider.clone(),
                attempt: attempts,
                slot_id: lease.slot().map(|slot| slot.id()),
                settings: settings.clone(),
            };
            let result = self.monitor.measure(&request.operation, op(ctx)).await;

            let error = match result {
                Ok(value) => {
                    handle.breaker.record_success();
                    drop(probe);
                    if let Some(key) = &request.cache_key {
                        let ttl = self.cache.config().ttl_for(request.cache_kind.as_deref());
                        self.cache.set(key.clone(), value.clone(), Some(ttl));
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            handle.breaker.record_failure();
            drop(probe);
            let message = error.to_string();
            let error_type = self.engine.classify(&message);
            if matches!(
                error_type,
                ErrorType::Timeout | ErrorType::DnsResolution | ErrorType::Connectivity
            ) {
                lease.invalidate();
            }
            drop(lease);
            drop(permit);
            tracing::debug!(%provider, attempt = attempts, %error_type, error = %message, "vendor call failed");

            let mut delay_applied = false;
            if recovered.insert((provider.clone(), error_type.clone())) {
                let alternatives = self.alternatives(&request, &visited);
                let report = self
                    .engine
                    .recover_classified(
                        error_type.clone(),
                        RecoveryRequest::new(provider.clone(), message)
                            .with_settings(settings.clone())
                            .with_alternatives(alternatives)
                            .with_coordinator(coordinator.clone()),
                    )
                    .await;
                last_action = Some(report.action.clone());

                let terminal = match report.verdict {
                    RecoveryVerdict::Retry => {
                        if let Some(replacement) = report.replacement_config {
                            settings = replacement;
                        }
                        delay_applied = report.delay_applied;
                        None
                    }
                    RecoveryVerdict::Failover { provider: to } => {
                        backup = Some(to.clone());
                        if self.failover && self.registry.contains(&to) && attempts < max_attempts {
                            self.telemetry.emit(RtlEvent::ProviderFailover {
                                from: provider.clone(),
                                to: to.clone(),
                            });
                            visited.push(to.clone());
                            settings = self.settings_for(&to);
                            provider = to;
                            continue;
                        }
                        let (reason, disposition) = if attempts >= max_attempts {
                            ("no attempts left for this call", Disposition::RetryExhausted)
                        } else if !self.failover {
                            ("failover is disabled", Disposition::Unrecoverable)
                        } else {
                            ("it is not registered", Disposition::Unrecoverable)
                        };
                        last_action = Some(format!(
                            "{} hit {}; did not switch to {} because {}",
                            provider, error_type, to, reason
                        ));
                        Some(disposition)
                    }
                    RecoveryVerdict::Exhausted => Some(Disposition::RecoveryExhausted),
                    RecoveryVerdict::ManualIntervention => Some(Disposition::ManualIntervention),
                    RecoveryVerdict::Declined => Some(Disposition::Unrecoverable),
                };
                if let Some(disposition) = terminal {
                    return Err(self.give_up(provider, error_type, attempts, last_action, disposition, backup, error));
                }
            }

            if attempts >= max_attempts {
                return Err(self.give_up(
                    provider,
                    error_type,
                    attempts,
                    last_action,
                    Disposition::RetryExhausted,
                    backup,
                    error,
                ));
            }
            if handle.breaker.state() == CircuitState::Open {
                return Err(self.give_up(
                    provider,
                    error_type,
                    attempts,
                    last_action,
                    Disposition::CircuitOpened,
                    backup,
                    error,
                ));
            }
            if !delay_applied {
                self.sleeper.sleep(coordinator.delay_for(attempts)).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn give_up<E>(
        &self,
        provider: String,
        error_type: ErrorType,
        attempts: u32,
        last_action: Option<String>,
        disposition: Disposition,
        backup_provider: Option<String>,
        error: E,
    ) -> ResilienceError<E> {
        let recommended_action = last_action.unwrap_or_else(|| match disposition {
            Disposition::CircuitOpened => {
                format!("{} keeps failing; wait for its circuit to half-open or use another provider", provider)
            }
            _ => format!("inspect the {} error reported by {}", error_type, provider),
        });
        tracing::warn!(%provider, %error_type, attempts, %disposition, "giving up on call");
        ResilienceError::failed(FailureReport {
            provider,
            error_type,
            attempts: attempts as usize,
            recommended_action,
            disposition,
            backup_provider,
            error,
        })
    }

    fn settings_for(&self, provider: &str) -> HashMap<String, String> {
        self.provider_settings.get(provider).cloned().unwrap_or_default()
    }

    fn alternatives(&self, request: &CallRequest, visited: &[String]) -> Vec<String> {
        let candidates = match &request.alternatives {
            Some(list) => list.clone(),
            None => self.registry.providers(),
        };
        candidates
            .into_iter()
            .filter(|p| !visited.contains(p))
            .filter(|p| {
                self.registry.breaker(p).is_some_and(|b| b.state() != CircuitState::Open)
            })
            .collect()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache<T>> {
        &self.cache
    }

    pub fn engine(&self) -> &Arc<RecoveryEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Live retry settings; changes apply to calls started afterwards.
    pub fn retry_config(&self) -> &DynamicConfig<RetryConfig> {
        &self.retry
    }

    /// Validate and swap in new retry settings.
    pub fn update_retry<F>(&self, f: F) -> Result<(), BuildError>
    where
        F: FnOnce(&RetryConfig) -> RetryConfig,
    {
        self.retry.try_update(|current| {
            let next = f(current);
            next.validate()?;
            Ok(next)
        })
    }

    /// Performance report including cache statistics.
    pub fn report(&self) -> PerformanceReport {
        self.monitor.generate_report_with_cache(self.cache.stats())
    }
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder<T> {
    config: RtlConfig,
    providers: Vec<String>,
    provider_settings: HashMap<String, HashMap<String, String>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
    reachability: Arc<dyn ReachabilityProbe>,
    resource_probe: Option<Arc<dyn ResourceProbe>>,
    classifier: Option<ErrorClassifier>,
    strategies: Vec<(ErrorType, Arc<dyn RecoveryStrategy>)>,
    failover: bool,
    _value: PhantomData<fn() -> T>,
}

impl<T> GatewayBuilder<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(config: RtlConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            provider_settings: HashMap::new(),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            telemetry: Telemetry::new(),
            reachability: Arc::new(AlwaysReachable),
            resource_probe: None,
            classifier: None,
            strategies: Vec::new(),
            failover: true,
            _value: PhantomData,
        }
    }

    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.providers.push(name.into());
        self
    }

    /// Settings handed to the operation and to recovery strategies for `provider`.
    pub fn provider_settings(mut self, provider: impl Into<String>, settings: HashMap<String, String>) -> Self {
        self.provider_settings.insert(provider.into(), settings);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn reachability_probe<P: ReachabilityProbe + 'static>(mut self, probe: P) -> Self {
        self.reachability = Arc::new(probe);
        self
    }

    pub fn resource_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.resource_probe = Some(probe);
        self
    }

    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn strategy(mut self, error_type: ErrorType, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategies.push((error_type, strategy));
        self
    }

    /// Whether recovery may move a call to a backup provider (default: on).
    pub fn failover(mut self, enabled: bool) -> Self {
        self.failover = enabled;
        self
    }

    pub fn build(self) -> Gateway<T> {
        let config = self.config;
        let registry = ProviderRegistry::with_parts(
            config.breaker.clone(),
            Arc::clone(&self.clock),
            self.telemetry.clone(),
        );
        for provider in &self.providers {
            let pool: PoolConfig = config.pool_for(provider);
            registry.register(provider.clone(), pool);
        }

        let mut engine = RecoveryEngine::builder()
            .history_policy(config.recovery)
            .coordinator(RetryCoordinator::new(config.retry.clone()))
            .clock(Arc::clone(&self.clock))
            .telemetry(self.telemetry.clone())
            .shared_sleeper(Arc::clone(&self.sleeper))
            .shared_probe(self.reachability);
        if let Some(classifier) = self.classifier {
            engine = engine.classifier(classifier);
        }
        for (error_type, strategy) in self.strategies {
            engine = engine.strategy(error_type, strategy);
        }
        let engine = engine.build();

        let monitor = match self.resource_probe {
            Some(probe) => PerformanceMonitor::with_parts(config.monitor.clone(), probe, Arc::clone(&self.clock)),
            None => PerformanceMonitor::new(config.monitor.clone()),
        };

        Gateway {
            registry,
            limiter: ConcurrencyLimiter::from_config(&config.limiter),
            limiter_wait: config.limiter.acquire_timeout,
            cache: Arc::new(ResultCache::with_parts(
                config.cache.clone(),
                Arc::clone(&self.clock),
                self.telemetry.clone(),
            )),
            engine: Arc::new(engine),
            monitor: Arc::new(monitor),
            retry: DynamicConfig::new(config.retry),
            sleeper: self.sleeper,
            telemetry: self.telemetry,
            provider_settings: Arc::new(self.provider_settings),
            failover: self.failover,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::monitor::NullProbe;
    use crate::sleeper::TrackingSleeper;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct VendorError(String);

    impl fmt::Display for VendorError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    fn gateway(providers: &[&str], sleeper: TrackingSleeper) -> Gateway<String> {
        let config = RtlConfig::from_settings([("retry.jitter_percent", "0")]).unwrap();
        providers
            .iter()
            .fold(Gateway::builder(config), |b, p| b.provider(*p))
            .clock(Arc::new(ManualClock::new()))
            .sleeper(sleeper)
            .resource_probe(Arc::new(NullProbe))
            .build()
    }

    #[tokio::test]
    async fn success_is_cached() {
        let gateway = gateway(&["polly"], TrackingSleeper::new());
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let value = gateway
                .execute(CallRequest::new("polly", "list_voices").cached("polly:voices:all"), |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, VendorError>("Joanna".to_string()) }
                })
                .await
                .unwrap();
            assert_eq!(value, "Joanna");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.cache().stats().hits, 2);
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let gateway = gateway(&["polly"], TrackingSleeper::new());
        let err = gateway
            .execute(CallRequest::new("nope", "synthesize"), |_| async {
                Ok::<_, VendorError>(String::new())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::UnknownProvider { .. }));
    }

    #[tokio::test]
    async fn transient_failure_recovers() {
        let sleeper = TrackingSleeper::new();
        let gateway = gateway(&["polly"], sleeper.clone());
        let calls = AtomicU32::new(0);
        let value = gateway
            .execute(CallRequest::new("polly", "synthesize"), |ctx| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(VendorError("429 Too Many Requests".into()))
                    } else {
                        Ok(format!("audio from {} on attempt {}", ctx.provider, ctx.attempt))
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "audio from polly on attempt 3");
        // recovery backoff for attempt 1, then coordinator backoff for attempt 2
        assert_eq!(sleeper.calls(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(gateway.engine().history().attempts("polly", &ErrorType::RateLimited), 1);
    }

    #[tokio::test]
    async fn authentication_is_not_retried() {
        let gateway = gateway(&["azure"], TrackingSleeper::new());
        let calls = AtomicU32::new(0);
        let err = gateway
            .execute(CallRequest::new("azure", "synthesize"), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<String, _>(VendorError("401 Unauthorized".into())) }
            })
            .await
            .unwrap_err();
        assert!(err.requires_manual_intervention());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let report = err.failure_report().unwrap();
        assert_eq!(report.error_type, ErrorType::Authentication);
        assert_eq!(report.error, VendorError("401 Unauthorized".into()));
    }

    #[tokio::test]
    async fn update_retry_validates() {
        let gateway = gateway(&["polly"], TrackingSleeper::new());
        assert!(gateway.update_retry(|c| RetryConfig { max_attempts: 0, ..c.clone() }).is_err());
        gateway.update_retry(|c| RetryConfig { max_attempts: 7, ..c.clone() }).unwrap();
        assert_eq!(gateway.retry_config().get().max_attempts, 7);
    }
}
