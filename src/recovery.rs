//! Error recovery engine.
//!
//! For each failure the engine:
//! 1. classifies the message into an [`ErrorType`] with the signature table,
//! 2. consults the per-(provider, type) history and refuses once the budget is spent,
//! 3. dispatches to the strategy registered for the type (or the generic fallback),
//! 4. turns the strategy's outcome into a [`RecoveryReport`] with a verdict the caller can act on.
//!
//! ```rust
//! use lifeline::recovery::{ErrorType, RecoveryEngine, RecoveryRequest, RecoveryVerdict};
//! use lifeline::sleeper::InstantSleeper;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let engine = RecoveryEngine::builder().sleeper(InstantSleeper).build();
//! let report = engine
//!     .attempt_recovery(RecoveryRequest::new("polly", "401 Unauthorized"))
//!     .await;
//! assert_eq!(report.error_type, ErrorType::Authentication);
//! assert_eq!(report.verdict, RecoveryVerdict::ManualIntervention);
//! # });
//! ```

pub mod classifier;
pub mod history;
pub mod strategies;

pub use classifier::{ClassifierError, ErrorClassifier};
pub use history::{HistoryDecision, HistoryPolicy, RecoveryHistory};
pub use strategies::{
    AlwaysReachable, BackoffRecovery, ConnectivityRepairRecovery, GenericRecovery,
    ManualInterventionRecovery, ProviderFailoverRecovery, ReachabilityProbe, RecoveryContext,
    RecoveryOutcome, RecoveryStrategy,
};

use crate::clock::{Clock, MonotonicClock};
use crate::registry::ProviderRegistry;
use crate::retry::RetryCoordinator;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{RtlEvent, Telemetry};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Failure classes recognised by the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorType {
    RateLimited,
    Authentication,
    QuotaExceeded,
    Timeout,
    DnsResolution,
    Connectivity,
    ServiceUnavailable,
    Generic,
    /// Registered at runtime under an arbitrary name.
    Custom(String),
}

impl ErrorType {
    pub fn custom(name: impl Into<String>) -> Self {
        ErrorType::Custom(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorType::RateLimited => "rate_limited",
            ErrorType::Authentication => "authentication",
            ErrorType::QuotaExceeded => "quota_exceeded",
            ErrorType::Timeout => "timeout",
            ErrorType::DnsResolution => "dns_resolution",
            ErrorType::Connectivity => "connectivity",
            ErrorType::ServiceUnavailable => "service_unavailable",
            ErrorType::Generic => "generic",
            ErrorType::Custom(name) => name,
        }
    }

    /// Built-in type for a known name, `Custom` otherwise.
    pub fn from_name(name: &str) -> Self {
        match name {
            "rate_limited" => ErrorType::RateLimited,
            "authentication" => ErrorType::Authentication,
            "quota_exceeded" => ErrorType::QuotaExceeded,
            "timeout" => ErrorType::Timeout,
            "dns_resolution" => ErrorType::DnsResolution,
            "connectivity" => ErrorType::Connectivity,
            "service_unavailable" => ErrorType::ServiceUnavailable,
            "generic" => ErrorType::Generic,
            other => ErrorType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure handed to the engine.
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub provider: String,
    pub message: String,
    pub settings: HashMap<String, String>,
    pub alternatives: Vec<String>,
    /// Overrides the engine's coordinator for this request.
    pub coordinator: Option<RetryCoordinator>,
}

impl RecoveryRequest {
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
            settings: HashMap::new(),
            alternatives: Vec::new(),
            coordinator: None,
        }
    }

    pub fn with_settings(mut self, settings: HashMap<String, String>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_alternatives(mut self, alternatives: Vec<String>) -> Self {
        self.alternatives = alternatives;
        self
    }

    pub fn with_coordinator(mut self, coordinator: RetryCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryVerdict {
    /// Try the same provider again.
    Retry,
    /// Try again on another provider.
    Failover { provider: String },
    /// The history budget is spent; no strategy ran.
    Exhausted,
    /// An operator must fix something first.
    ManualIntervention,
    /// The strategy ran and advises giving up.
    Declined,
}

/// Result of [`RecoveryEngine::attempt_recovery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub provider: String,
    pub error_type: ErrorType,
    /// Attempts recorded for (provider, type) in the current window.
    pub attempt: u32,
    pub verdict: RecoveryVerdict,
    pub action: String,
    /// Name of the strategy that ran, if any.
    pub strategy: Option<String>,
    pub replacement_config: Option<HashMap<String, String>>,
    pub delay_applied: bool,
}

impl RecoveryReport {
    pub fn should_retry(&self) -> bool {
        matches!(self.verdict, RecoveryVerdict::Retry | RecoveryVerdict::Failover { .. })
    }

    pub fn requires_manual_intervention(&self) -> bool {
        matches!(self.verdict, RecoveryVerdict::Exhausted | RecoveryVerdict::ManualIntervention)
    }

    pub fn backup_provider(&self) -> Option<&str> {
        match &self.verdict {
            RecoveryVerdict::Failover { provider } => Some(provider),
            _ => None,
        }
    }
}

/// Classifier, history and strategy table. Share it behind an `Arc`.
pub struct RecoveryEngine {
    classifier: RwLock<ErrorClassifier>,
    history: RecoveryHistory,
    strategies: RwLock<HashMap<ErrorType, Arc<dyn RecoveryStrategy>>>,
    fallback: Arc<dyn RecoveryStrategy>,
    sleeper: Arc<dyn Sleeper>,
    probe: Arc<dyn ReachabilityProbe>,
    coordinator: RetryCoordinator,
    breakers: Option<ProviderRegistry>,
    telemetry: Telemetry,
}

impl fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<ErrorType> = self.read_strategies().keys().cloned().collect();
        types.sort();
        f.debug_struct("RecoveryEngine")
            .field("history", &self.history.policy())
            .field("strategies", &types)
            .field("breaker_integrated", &self.breakers.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RecoveryEngine {
    pub fn builder() -> RecoveryEngineBuilder {
        RecoveryEngineBuilder::new()
    }

    pub fn classify(&self, message: &str) -> ErrorType {
        self.classifier.read().unwrap_or_else(PoisonError::into_inner).classify(message)
    }

    /// Append a signature to the classifier table.
    pub fn add_signature(&self, pattern: &str, error_type: ErrorType) -> Result<(), ClassifierError> {
        self.classifier.write().unwrap_or_else(PoisonError::into_inner).push_rule(pattern, error_type)
    }

    /// Register (or replace) the strategy for an error type.
    pub fn register_strategy(&self, error_type: ErrorType, strategy: Arc<dyn RecoveryStrategy>) {
        let mut map = self.strategies.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = map.insert(error_type.clone(), strategy) {
            tracing::debug!(%error_type, previous = previous.name(), "recovery strategy replaced");
        }
    }

    pub fn history(&self) -> &RecoveryHistory {
        &self.history
    }

    pub fn is_breaker_integrated(&self) -> bool {
        self.breakers.is_some()
    }

    /// Classify, gate on history, run a strategy.
    pub async fn attempt_recovery(&self, request: RecoveryRequest) -> RecoveryReport {
        let error_type = self.classify(&request.message);
        self.recover_classified(error_type, request).await
    }

    /// Same as [`attempt_recovery`](Self::attempt_recovery) for an already classified failure.
    pub async fn recover_classified(
        &self,
        error_type: ErrorType,
        request: RecoveryRequest,
    ) -> RecoveryReport {
        let RecoveryRequest { provider, message, settings, alternatives, coordinator } = request;

        let attempt = match self.history.check_and_record(&provider, &error_type) {
            HistoryDecision::Proceed { attempt } => attempt,
            HistoryDecision::Exhausted { attempts } => {
                tracing::warn!(%provider, %error_type, attempts, "recovery budget exhausted");
                self.telemetry.emit(RtlEvent::RecoveryExhausted {
                    provider: provider.clone(),
                    error_type: error_type.to_string(),
                    attempts,
                });
                self.feed_breaker(&provider, false);
                return RecoveryReport {
                    action: format!(
                        "{} recovery attempts for {} on {} within the window; manual intervention required",
                        attempts, error_type, provider
                    ),
                    provider,
                    error_type,
                    attempt: attempts,
                    verdict: RecoveryVerdict::Exhausted,
                    strategy: None,
                    replacement_config: None,
                    delay_applied: false,
                };
            }
        };

        let strategy = self.strategy_for(&error_type);
        let ctx = RecoveryContext {
            provider: provider.clone(),
            error_type: error_type.clone(),
            error_message: message,
            attempt,
            settings,
            alternatives,
            sleeper: Arc::clone(&self.sleeper),
            coordinator: coordinator.unwrap_or_else(|| self.coordinator.clone()),
            probe: Arc::clone(&self.probe),
        };
        let outcome = strategy.execute(&ctx).await;

        let verdict = if outcome.requires_manual_intervention {
            RecoveryVerdict::ManualIntervention
        } else if !outcome.success {
            RecoveryVerdict::Declined
        } else if let Some(backup) = outcome.backup_provider.clone() {
            RecoveryVerdict::Failover { provider: backup }
        } else if outcome.retry {
            RecoveryVerdict::Retry
        } else {
            RecoveryVerdict::Declined
        };

        tracing::info!(
            %provider,
            %error_type,
            attempt,
            strategy = strategy.name(),
            ?verdict,
            "recovery attempted"
        );
        self.telemetry.emit(RtlEvent::RecoveryAttempted {
            provider: provider.clone(),
            error_type: error_type.to_string(),
            attempt,
            action: outcome.action.clone(),
            success: outcome.success,
        });
        if verdict == RecoveryVerdict::ManualIntervention {
            self.telemetry.emit(RtlEvent::ManualInterventionRequired {
                provider: provider.clone(),
                error_type: error_type.to_string(),
            });
        }

        let report = RecoveryReport {
            provider,
            error_type,
            attempt,
            verdict,
            action: outcome.action,
            strategy: Some(strategy.name().to_string()),
            replacement_config: outcome.replacement_config,
            delay_applied: outcome.delay_applied,
        };
        self.feed_breaker(&report.provider, report.should_retry());
        report
    }

    fn strategy_for(&self, error_type: &ErrorType) -> Arc<dyn RecoveryStrategy> {
        self.read_strategies()
            .get(error_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    fn feed_breaker(&self, provider: &str, recovered: bool) {
        let Some(breaker) = self.breakers.as_ref().and_then(|r| r.breaker(provider)) else {
            return;
        };
        if recovered {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    fn read_strategies(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<ErrorType, Arc<dyn RecoveryStrategy>>> {
        self.strategies.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for [`RecoveryEngine`]; starts with the built-in strategy table.
pub struct RecoveryEngineBuilder {
    classifier: ErrorClassifier,
    policy: HistoryPolicy,
    strategies: HashMap<ErrorType, Arc<dyn RecoveryStrategy>>,
    fallback: Arc<dyn RecoveryStrategy>,
    sleeper: Arc<dyn Sleeper>,
    probe: Arc<dyn ReachabilityProbe>,
    coordinator: RetryCoordinator,
    clock: Arc<dyn Clock>,
    breakers: Option<ProviderRegistry>,
    telemetry: Telemetry,
}

impl RecoveryEngineBuilder {
    pub fn new() -> Self {
        let backoff: Arc<dyn RecoveryStrategy> = Arc::new(BackoffRecovery);
        let connectivity: Arc<dyn RecoveryStrategy> = Arc::new(ConnectivityRepairRecovery);
        let mut strategies: HashMap<ErrorType, Arc<dyn RecoveryStrategy>> = HashMap::new();
        strategies.insert(ErrorType::RateLimited, Arc::clone(&backoff));
        strategies.insert(ErrorType::ServiceUnavailable, backoff);
        strategies.insert(ErrorType::Authentication, Arc::new(ManualInterventionRecovery));
        strategies.insert(ErrorType::QuotaExceeded, Arc::new(ProviderFailoverRecovery));
        strategies.insert(ErrorType::Timeout, Arc::clone(&connectivity));
        strategies.insert(ErrorType::DnsResolution, Arc::clone(&connectivity));
        strategies.insert(ErrorType::Connectivity, connectivity);

        Self {
            classifier: ErrorClassifier::default(),
            policy: HistoryPolicy::default(),
            strategies,
            fallback: Arc::new(GenericRecovery),
            sleeper: Arc::new(TokioSleeper),
            probe: Arc::new(AlwaysReachable),
            coordinator: RetryCoordinator::default(),
            clock: Arc::new(MonotonicClock::default()),
            breakers: None,
            telemetry: Telemetry::new(),
        }
    }

    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn history_policy(mut self, policy: HistoryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn strategy(mut self, error_type: ErrorType, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategies.insert(error_type, strategy);
        self
    }

    /// Strategy used for types with no registration.
    pub fn fallback(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.fallback = strategy;
        self
    }

    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn probe<P: ReachabilityProbe + 'static>(mut self, probe: P) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Share a sleeper already held elsewhere.
    pub fn shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn shared_probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn coordinator(mut self, coordinator: RetryCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Feed recovery outcomes into the providers' circuit breakers.
    pub fn with_circuit_breakers(mut self, registry: ProviderRegistry) -> Self {
        self.breakers = Some(registry);
        self
    }

    pub fn build(self) -> RecoveryEngine {
        RecoveryEngine {
            classifier: RwLock::new(self.classifier),
            history: RecoveryHistory::new(self.policy, self.clock),
            strategies: RwLock::new(self.strategies),
            fallback: self.fallback,
            sleeper: self.sleeper,
            probe: self.probe,
            coordinator: self.coordinator,
            breakers: self.breakers,
            telemetry: self.telemetry,
        }
    }
}

impl Default for RecoveryEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
