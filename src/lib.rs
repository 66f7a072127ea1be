#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Lifeline
//!
//! Resilience & throughput layer for calls to speech-synthesis vendors: pooled connection
//! slots, a process-wide concurrency limit, a TTL/LRU result cache, per-provider circuit
//! breakers, error classification with recovery strategies, and adaptive retries.
//!
//! ## Features
//!
//! - **Connection slot pools** per provider with lazy growth and stale-slot replacement
//! - **Concurrency limiter** with scoped permits
//! - **Result cache** with per-kind TTLs, exact LRU eviction and a background sweeper
//! - **Circuit breakers** (closed / open / half-open) held in an explicit provider registry
//! - **Retry coordinator** with exponential, linear, fixed and Fibonacci backoff plus jitter
//! - **Error recovery engine** classifying vendor messages and dispatching strategies
//! - **Performance monitor** with JSON reports and threshold-based recommendations
//! - **Tower layer** running any service through the gateway
//!
//! ## Quick Start
//!
//! ```rust
//! use lifeline::{CallRequest, Gateway, RtlConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let gateway: Gateway<Vec<u8>> = Gateway::from_config(RtlConfig::default(), ["polly", "azure"]);
//!
//!     let audio = gateway
//!         .execute(CallRequest::new("polly", "synthesize"), |ctx| async move {
//!             // vendor call against ctx.provider with ctx.settings
//!             Ok::<_, std::io::Error>(format!("audio from {}", ctx.provider).into_bytes())
//!         })
//!         .await;
//!     assert!(audio.is_ok());
//! }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod jitter;
pub mod layer;
pub mod limiter;
pub mod monitor;
pub mod pool;
pub mod prelude;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use backoff::{Backoff, RetryStrategy};
pub use cache::{cache_key, CacheConfig, CacheStats, ResultCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::RtlConfig;
pub use error::{ConfigError, Disposition, FailureReport, ResilienceError};
pub use gateway::{CallContext, CallRequest, Gateway, GatewayBuilder};
pub use jitter::Jitter;
pub use layer::{GatewayLayer, GatewayService, ProviderRequest};
pub use limiter::{ConcurrencyLimiter, LimiterConfig, LimiterPermit};
pub use monitor::{MonitorConfig, PerformanceMonitor, PerformanceReport};
pub use pool::{ConnectionPool, ConnectionSlot, PoolConfig, SlotLease};
pub use recovery::{ErrorType, RecoveryEngine, RecoveryReport, RecoveryStrategy};
pub use registry::ProviderRegistry;
pub use retry::{RetryConfig, RetryCoordinator};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{RtlEvent, Telemetry};
