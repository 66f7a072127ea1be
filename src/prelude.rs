//! Convenient re-exports for common Lifeline types.
pub use crate::{
    backoff::{Backoff, BackoffError, RetryStrategy, MAX_BACKOFF},
    cache::{cache_key, CacheConfig, ResultCache},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState},
    config::RtlConfig,
    error::{ConfigError, Disposition, ResilienceError},
    gateway::{CallContext, CallRequest, Gateway},
    jitter::Jitter,
    layer::{GatewayLayer, ProviderRequest},
    recovery::{ErrorType, RecoveryEngine, RecoveryOutcome, RecoveryStrategy},
    registry::ProviderRegistry,
    retry::{BuildError, RetryConfig, RetryCoordinator},
};
