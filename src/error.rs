//! Error types for the resilience layer
use crate::circuit_breaker::CircuitBreakerError;
use crate::recovery::ErrorType;
use crate::retry::BuildError;
use std::fmt;
use std::time::Duration;

/// Why a call was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Recovery kept asking for retries until the attempt budget ran out.
    RetryExhausted,
    /// The recovery history for (provider, error type) is spent for this window.
    RecoveryExhausted,
    /// The failure can't be fixed automatically (bad credentials, ...).
    ManualIntervention,
    /// A strategy ran and declined to retry.
    Unrecoverable,
    /// The provider's circuit opened while the call was still retrying.
    CircuitOpened,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Disposition::RetryExhausted => "retries exhausted",
            Disposition::RecoveryExhausted => "recovery exhausted",
            Disposition::ManualIntervention => "manual intervention required",
            Disposition::Unrecoverable => "unrecoverable",
            Disposition::CircuitOpened => "circuit opened",
        };
        f.write_str(s)
    }
}

/// Structured terminal failure: enough detail to render an actionable message without
/// parsing the vendor error text.
#[derive(Debug, Clone)]
pub struct FailureReport<E> {
    /// Provider the last attempt ran against.
    pub provider: String,
    pub error_type: ErrorType,
    /// Vendor calls made, across providers if the call failed over.
    pub attempts: usize,
    pub recommended_action: String,
    pub disposition: Disposition,
    /// Alternative provider suggested by recovery, if any.
    pub backup_provider: Option<String>,
    /// The last vendor error, preserved as returned.
    pub error: E,
}

/// Unified error type for calls routed through the resilience layer
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The provider's circuit is open; the call was not attempted.
    CircuitOpen { provider: String, failure_count: u32, retry_after: Duration },
    /// No concurrency token became free within the configured wait.
    LimiterTimeout { in_flight: usize, max: usize, waited: Duration },
    /// No connection slot became free within the pool's connection timeout.
    PoolTimeout { provider: String, waited: Duration },
    /// The provider was never registered.
    UnknownProvider { provider: String },
    /// The vendor call failed and recovery options are exhausted or declined.
    Failed(Box<FailureReport<E>>),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { provider, failure_count, retry_after } => write!(
                f,
                "circuit breaker for '{}' open ({} failures, retry in {:?})",
                provider, failure_count, retry_after
            ),
            Self::LimiterTimeout { in_flight, max, waited } => write!(
                f,
                "concurrency limit reached ({} in-flight, max {}) after waiting {:?}",
                in_flight, max, waited
            ),
            Self::PoolTimeout { provider, waited } => {
                write!(f, "no connection slot for '{}' after {:?}", provider, waited)
            }
            Self::UnknownProvider { provider } => write!(f, "unknown provider '{}'", provider),
            Self::Failed(report) => write!(
                f,
                "{} on '{}' after {} attempts ({}): {}; last error: {}",
                report.error_type,
                report.provider,
                report.attempts,
                report.disposition,
                report.recommended_action,
                report.error
            ),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(report) => Some(&report.error),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    pub(crate) fn failed(report: FailureReport<E>) -> Self {
        Self::Failed(Box::new(report))
    }

    /// Check if the call was rejected by an open circuit
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if the call timed out waiting for a concurrency token or a slot
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::LimiterTimeout { .. } | Self::PoolTimeout { .. })
    }

    /// Check if an operator has to act before the provider can work again
    pub fn requires_manual_intervention(&self) -> bool {
        match self {
            Self::Failed(report) => report.disposition == Disposition::ManualIntervention,
            _ => false,
        }
    }

    /// Access the structured failure, if the vendor call itself failed
    pub fn failure_report(&self) -> Option<&FailureReport<E>> {
        match self {
            Self::Failed(report) => Some(report),
            _ => None,
        }
    }

    /// Get the vendor error if the call itself failed
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Failed(report) => Some(report.error),
            _ => None,
        }
    }

    /// Provider the error concerns, when known.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { provider, .. }
            | Self::PoolTimeout { provider, .. }
            | Self::UnknownProvider { provider } => Some(provider),
            Self::Failed(report) => Some(&report.provider),
            Self::LimiterTimeout { .. } => None,
        }
    }

    /// Remaining open time for circuit rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Errors produced while building configuration from settings.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for '{key}': {reason}")]
    InvalidValue { key: String, value: String, reason: String },
    #[error("{field} must be > 0")]
    MustBePositive { field: &'static str },
    #[error("pool min_size ({min}) exceeds max_size ({max})")]
    PoolBounds { min: usize, max: usize },
    #[error("breaker: {0}")]
    Breaker(#[from] CircuitBreakerError),
    #[error("retry: {0}")]
    Retry(#[from] BuildError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct VendorError(&'static str);

    impl fmt::Display for VendorError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for VendorError {}

    fn report(disposition: Disposition) -> FailureReport<VendorError> {
        FailureReport {
            provider: "azure".into(),
            error_type: ErrorType::Authentication,
            attempts: 1,
            recommended_action: "check the API key".into(),
            disposition,
            backup_provider: None,
            error: VendorError("401 unauthorized"),
        }
    }

    #[test]
    fn circuit_open_display() {
        let err: ResilienceError<VendorError> = ResilienceError::CircuitOpen {
            provider: "polly".into(),
            failure_count: 5,
            retry_after: Duration::from_secs(30),
        };
        let msg = err.to_string();
        assert!(msg.contains("polly"));
        assert!(msg.contains("5 failures"));
        assert!(err.is_circuit_open());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn failed_preserves_vendor_error_as_source() {
        let err = ResilienceError::failed(report(Disposition::ManualIntervention));
        assert!(err.requires_manual_intervention());
        assert_eq!(err.source().map(|e| e.to_string()), Some("401 unauthorized".to_string()));
        assert_eq!(err.provider(), Some("azure"));
        let msg = err.to_string();
        assert!(msg.contains("manual intervention required"));
        assert!(msg.contains("check the API key"));
        assert_eq!(err.into_inner(), Some(VendorError("401 unauthorized")));
    }

    #[test]
    fn backpressure_predicates() {
        let pool: ResilienceError<VendorError> =
            ResilienceError::PoolTimeout { provider: "x".into(), waited: Duration::from_secs(1) };
        let limiter: ResilienceError<VendorError> = ResilienceError::LimiterTimeout {
            in_flight: 4,
            max: 4,
            waited: Duration::from_millis(10),
        };
        assert!(pool.is_backpressure());
        assert!(limiter.is_backpressure());
        assert!(limiter.provider().is_none());
        assert!(!pool.requires_manual_intervention());
        assert!(pool.failure_report().is_none());
    }

    #[test]
    fn config_error_messages() {
        let err = ConfigError::PoolBounds { min: 8, max: 2 };
        assert_eq!(err.to_string(), "pool min_size (8) exceeds max_size (2)");
    }
}
