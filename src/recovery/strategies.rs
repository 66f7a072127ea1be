//! Built-in recovery strategies.
//!
//! A strategy receives a [`RecoveryContext`] and answers with a [`RecoveryOutcome`]. Strategies
//! may wait (through the context's sleeper), probe the network, suggest a backup provider or
//! hand back replacement settings for the next attempt. They never call the vendor themselves.

use super::ErrorType;
use crate::retry::RetryCoordinator;
use crate::sleeper::Sleeper;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Checks whether a provider's endpoint can be reached at all.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync + fmt::Debug {
    async fn is_reachable(&self, provider: &str) -> bool;
}

/// Probe that assumes the network is fine.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReachable;

#[async_trait]
impl ReachabilityProbe for AlwaysReachable {
    async fn is_reachable(&self, _provider: &str) -> bool {
        true
    }
}

/// Everything a strategy may look at.
#[derive(Clone)]
pub struct RecoveryContext {
    pub provider: String,
    pub error_type: ErrorType,
    pub error_message: String,
    /// Attempt number within the history window (1-based).
    pub attempt: u32,
    /// Current provider settings.
    pub settings: HashMap<String, String>,
    /// Other providers the caller could switch to, in preference order.
    pub alternatives: Vec<String>,
    pub sleeper: Arc<dyn Sleeper>,
    pub coordinator: RetryCoordinator,
    pub probe: Arc<dyn ReachabilityProbe>,
}

impl fmt::Debug for RecoveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryContext")
            .field("provider", &self.provider)
            .field("error_type", &self.error_type)
            .field("attempt", &self.attempt)
            .field("alternatives", &self.alternatives)
            .finish_non_exhaustive()
    }
}

/// What a strategy did and what it recommends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub success: bool,
    /// Human-readable description of the action taken or required.
    pub action: String,
    /// Whether the caller should try the call again.
    pub retry: bool,
    /// Settings to use on the next attempt (another region, longer timeout, ...).
    pub replacement_config: Option<HashMap<String, String>>,
    pub backup_provider: Option<String>,
    /// The strategy already waited; the caller should not add its own delay.
    pub delay_applied: bool,
    pub requires_manual_intervention: bool,
}

impl RecoveryOutcome {
    pub fn retry(action: impl Into<String>) -> Self {
        Self { success: true, action: action.into(), retry: true, ..Self::default() }
    }

    pub fn failover(action: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            success: true,
            action: action.into(),
            retry: true,
            backup_provider: Some(provider.into()),
            ..Self::default()
        }
    }

    pub fn manual(action: impl Into<String>) -> Self {
        Self { action: action.into(), requires_manual_intervention: true, ..Self::default() }
    }

    pub fn declined(action: impl Into<String>) -> Self {
        Self { action: action.into(), ..Self::default() }
    }

    pub fn with_delay_applied(mut self) -> Self {
        self.delay_applied = true;
        self
    }

    pub fn with_replacement_config(mut self, config: HashMap<String, String>) -> Self {
        self.replacement_config = Some(config);
        self
    }
}

/// A remediation for one class of failure.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &RecoveryContext) -> RecoveryOutcome;
}

/// Wait out rate limits and transient 5xx with the coordinator's backoff.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackoffRecovery;

#[async_trait]
impl RecoveryStrategy for BackoffRecovery {
    fn name(&self) -> &str {
        "backoff"
    }

    async fn execute(&self, ctx: &RecoveryContext) -> RecoveryOutcome {
        let delay = ctx.coordinator.delay_for(ctx.attempt);
        tracing::debug!(provider = %ctx.provider, attempt = ctx.attempt, ?delay, "backing off");
        ctx.sleeper.sleep(delay).await;
        RecoveryOutcome::retry(format!("waited {:?} before retrying {}", delay, ctx.provider))
            .with_delay_applied()
    }
}

/// Credentials problems are never retried.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualInterventionRecovery;

#[async_trait]
impl RecoveryStrategy for ManualInterventionRecovery {
    fn name(&self) -> &str {
        "manual_intervention"
    }

    async fn execute(&self, ctx: &RecoveryContext) -> RecoveryOutcome {
        RecoveryOutcome::manual(format!(
            "verify the API key and account permissions configured for {}",
            ctx.provider
        ))
    }
}

/// Move to the first alternative provider when this one is out of quota.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProviderFailoverRecovery;

#[async_trait]
impl RecoveryStrategy for ProviderFailoverRecovery {
    fn name(&self) -> &str {
        "provider_failover"
    }

    async fn execute(&self, ctx: &RecoveryContext) -> RecoveryOutcome {
        match ctx.alternatives.first() {
            Some(backup) => RecoveryOutcome::failover(
                format!("{} is out of quota; switching to {}", ctx.provider, backup),
                backup.clone(),
            ),
            None => RecoveryOutcome::declined(format!(
                "{} is out of quota and no backup provider is configured; wait for the quota to reset or raise the plan limit",
                ctx.provider
            )),
        }
    }
}

/// Timeouts, DNS and connection failures.
///
/// Waits, probes the endpoint and retries when it answers. A configured `fallback_endpoint`
/// (or `fallback_region`) is swapped in through replacement settings; timeouts get a doubled
/// `timeout_ms`. An unreachable provider fails over when an alternative exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectivityRepairRecovery;

#[async_trait]
impl RecoveryStrategy for ConnectivityRepairRecovery {
    fn name(&self) -> &str {
        "connectivity_repair"
    }

    async fn execute(&self, ctx: &RecoveryContext) -> RecoveryOutcome {
        let delay = ctx.coordinator.delay_for(ctx.attempt);
        ctx.sleeper.sleep(delay).await;

        let mut replacement = HashMap::new();
        if let Some(endpoint) = ctx.settings.get("fallback_endpoint") {
            replacement.insert("endpoint".to_string(), endpoint.clone());
        }
        if let Some(region) = ctx.settings.get("fallback_region") {
            replacement.insert("region".to_string(), region.clone());
        }
        if ctx.error_type == ErrorType::Timeout {
            if let Some(timeout) = ctx.settings.get("timeout_ms").and_then(|v| v.parse::<u64>().ok()) {
                replacement.insert("timeout_ms".to_string(), timeout.saturating_mul(2).to_string());
            }
        }

        if ctx.probe.is_reachable(&ctx.provider).await || !replacement.is_empty() {
            let outcome = RecoveryOutcome::retry(format!(
                "{} after {:?}; retrying {}",
                ctx.error_type, delay, ctx.provider
            ))
            .with_delay_applied();
            if replacement.is_empty() {
                return outcome;
            }
            let mut settings = ctx.settings.clone();
            settings.extend(replacement);
            return outcome.with_replacement_config(settings);
        }

        match ctx.alternatives.first() {
            Some(backup) => RecoveryOutcome::failover(
                format!("{} is unreachable; switching to {}", ctx.provider, backup),
                backup.clone(),
            )
            .with_delay_applied(),
            None => RecoveryOutcome::declined(format!(
                "{} is unreachable; check network connectivity",
                ctx.provider
            ))
            .with_delay_applied(),
        }
    }
}

/// Best effort for anything unclassified: short wait, reachability check, opportunistic failover.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericRecovery;

#[async_trait]
impl RecoveryStrategy for GenericRecovery {
    fn name(&self) -> &str {
        "generic"
    }

    async fn execute(&self, ctx: &RecoveryContext) -> RecoveryOutcome {
        let delay = ctx.coordinator.delay_for(1);
        ctx.sleeper.sleep(delay).await;

        if ctx.probe.is_reachable(&ctx.provider).await {
            return RecoveryOutcome::retry(format!("waited {:?}; retrying {}", delay, ctx.provider))
                .with_delay_applied();
        }
        match ctx.alternatives.first() {
            Some(backup) => RecoveryOutcome::failover(
                format!("{} is not responding; switching to {}", ctx.provider, backup),
                backup.clone(),
            )
            .with_delay_applied(),
            None => RecoveryOutcome::declined(format!(
                "{} is not responding and no alternative provider is available",
                ctx.provider
            ))
            .with_delay_applied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::sleeper::TrackingSleeper;
    use std::time::Duration;

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl ReachabilityProbe for Unreachable {
        async fn is_reachable(&self, _provider: &str) -> bool {
            false
        }
    }

    fn ctx(error_type: ErrorType, sleeper: TrackingSleeper) -> RecoveryContext {
        let config = RetryConfig::builder()
            .base_delay(Duration::from_millis(100))
            .jitter_percent(0.0)
            .build()
            .unwrap();
        RecoveryContext {
            provider: "polly".into(),
            error_type,
            error_message: String::new(),
            attempt: 2,
            settings: HashMap::new(),
            alternatives: Vec::new(),
            sleeper: Arc::new(sleeper),
            coordinator: RetryCoordinator::new(config),
            probe: Arc::new(AlwaysReachable),
        }
    }

    #[tokio::test]
    async fn backoff_sleeps_coordinator_delay() {
        let sleeper = TrackingSleeper::new();
        let outcome = BackoffRecovery.execute(&ctx(ErrorType::RateLimited, sleeper.clone())).await;
        assert!(outcome.retry && outcome.delay_applied);
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(200)]);
    }

    #[tokio::test]
    async fn auth_requires_manual_intervention() {
        let outcome = ManualInterventionRecovery
            .execute(&ctx(ErrorType::Authentication, TrackingSleeper::new()))
            .await;
        assert!(outcome.requires_manual_intervention);
        assert!(!outcome.retry);
        assert!(outcome.action.contains("polly"));
    }

    #[tokio::test]
    async fn quota_fails_over_when_possible() {
        let mut context = ctx(ErrorType::QuotaExceeded, TrackingSleeper::new());
        let declined = ProviderFailoverRecovery.execute(&context).await;
        assert!(!declined.success);
        assert!(declined.backup_provider.is_none());

        context.alternatives = vec!["azure".into(), "google".into()];
        let outcome = ProviderFailoverRecovery.execute(&context).await;
        assert_eq!(outcome.backup_provider.as_deref(), Some("azure"));
    }

    #[tokio::test]
    async fn timeout_doubles_timeout_setting() {
        let mut context = ctx(ErrorType::Timeout, TrackingSleeper::new());
        context.settings.insert("timeout_ms".into(), "5000".into());
        context.settings.insert("fallback_region".into(), "westeurope".into());
        let outcome = ConnectivityRepairRecovery.execute(&context).await;
        let replacement = outcome.replacement_config.expect("replacement settings");
        assert_eq!(replacement.get("timeout_ms").map(String::as_str), Some("10000"));
        assert_eq!(replacement.get("region").map(String::as_str), Some("westeurope"));
        assert!(outcome.retry);
    }

    #[tokio::test]
    async fn unreachable_generic_fails_over() {
        let mut context = ctx(ErrorType::Generic, TrackingSleeper::new());
        context.probe = Arc::new(Unreachable);
        assert!(!GenericRecovery.execute(&context).await.success);

        context.alternatives = vec!["elevenlabs".into()];
        let outcome = GenericRecovery.execute(&context).await;
        assert_eq!(outcome.backup_provider.as_deref(), Some("elevenlabs"));
        assert!(outcome.delay_applied);
    }
}
