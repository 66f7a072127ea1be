//! Startup configuration.
//!
//! Everything has a default; [`RtlConfig::from_settings`] overlays plain key/value settings
//! as they come out of the host application's configuration loader:
//!
//! ```rust
//! use lifeline::config::RtlConfig;
//! use std::time::Duration;
//!
//! let config = RtlConfig::from_settings([
//!     ("pool.max_size", "8"),
//!     ("providers.polly.pool.max_size", "2"),
//!     ("cache.ttl.voices_secs", "86400"),
//!     ("retry.strategy", "fibonacci"),
//! ])
//! .unwrap();
//! assert_eq!(config.pool_for("azure").max_size, 8);
//! assert_eq!(config.pool_for("polly").max_size, 2);
//! assert_eq!(config.cache.ttl_for(Some("voices")), Duration::from_secs(86_400));
//! ```
//!
//! Unknown keys are ignored (logged at debug). Malformed values are errors.

use crate::backoff::RetryStrategy;
use crate::cache::CacheConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::limiter::LimiterConfig;
use crate::monitor::MonitorConfig;
use crate::pool::PoolConfig;
use crate::recovery::HistoryPolicy;
use crate::retry::RetryConfig;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Partial pool settings for one provider; unset fields inherit the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolOverride {
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    pub connection_timeout: Option<Duration>,
}

/// Configuration for the whole layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RtlConfig {
    pub limiter: LimiterConfig,
    /// Pool defaults for every provider.
    pub pool: PoolConfig,
    pub provider_pools: HashMap<String, PoolOverride>,
    pub cache: CacheConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub recovery: HistoryPolicy,
    pub monitor: MonitorConfig,
}

impl Default for RtlConfig {
    fn default() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            pool: PoolConfig::default(),
            provider_pools: HashMap::new(),
            cache: CacheConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            recovery: HistoryPolicy::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

// Breaker fields are collected first and validated together.
#[derive(Debug)]
struct BreakerFields {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    half_open_max_probes: usize,
}

impl RtlConfig {
    /// Overlay `settings` on the defaults and validate the result.
    pub fn from_settings<I, K, V>(settings: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        let mut breaker = BreakerFields {
            failure_threshold: config.breaker.failure_threshold(),
            success_threshold: config.breaker.success_threshold(),
            timeout: config.breaker.timeout(),
            half_open_max_probes: config.breaker.half_open_max_probes(),
        };

        for (key, value) in settings {
            let (key, value) = (key.as_ref().trim(), value.as_ref().trim());
            config.apply(key, value, &mut breaker)?;
        }

        config.breaker = CircuitBreakerConfig::new(
            breaker.failure_threshold,
            breaker.success_threshold,
            breaker.timeout,
        )?
        .with_half_open_max_probes(breaker.half_open_max_probes)?;
        config.validate()?;
        Ok(config)
    }

    /// Pool settings for `provider`, with its overrides applied.
    pub fn pool_for(&self, provider: &str) -> PoolConfig {
        let mut pool = self.pool.clone();
        if let Some(o) = self.provider_pools.get(provider) {
            pool.min_size = o.min_size.unwrap_or(pool.min_size);
            pool.max_size = o.max_size.unwrap_or(pool.max_size);
            pool.connection_timeout = o.connection_timeout.unwrap_or(pool.connection_timeout);
        }
        pool
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limiter.max_concurrency == 0 {
            return Err(ConfigError::MustBePositive { field: "limiter.max_concurrency" });
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::MustBePositive { field: "cache.capacity" });
        }
        if self.recovery.max_attempts == 0 {
            return Err(ConfigError::MustBePositive { field: "recovery.max_attempts" });
        }
        if self.monitor.history_limit == 0 {
            return Err(ConfigError::MustBePositive { field: "monitor.history_limit" });
        }
        check_pool(&self.pool)?;
        for provider in self.provider_pools.keys() {
            check_pool(&self.pool_for(provider))?;
        }
        self.retry.validate()?;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str, breaker: &mut BreakerFields) -> Result<(), ConfigError> {
        match key {
            "limiter.max_concurrency" => self.limiter.max_concurrency = parse(key, value)?,
            "limiter.acquire_timeout_ms" => {
                self.limiter.acquire_timeout = match parse::<u64>(key, value)? {
                    0 => None,
                    ms => Some(Duration::from_millis(ms)),
                }
            }
            "pool.min_size" => self.pool.min_size = parse(key, value)?,
            "pool.max_size" => self.pool.max_size = parse(key, value)?,
            "pool.connection_timeout_ms" => self.pool.connection_timeout = parse_millis(key, value)?,
            "pool.freshness_secs" => self.pool.freshness = parse_secs(key, value)?,
            "cache.capacity" => self.cache.capacity = parse(key, value)?,
            "cache.default_ttl_secs" => self.cache.default_ttl = parse_secs(key, value)?,
            "breaker.failure_threshold" => breaker.failure_threshold = parse(key, value)?,
            "breaker.success_threshold" => breaker.success_threshold = parse(key, value)?,
            "breaker.timeout_ms" => breaker.timeout = parse_millis(key, value)?,
            "breaker.half_open_max_probes" => breaker.half_open_max_probes = parse(key, value)?,
            "retry.max_attempts" => self.retry.max_attempts = parse(key, value)?,
            "retry.strategy" => self.retry.strategy = parse::<RetryStrategy>(key, value)?,
            "retry.base_delay_ms" => self.retry.base_delay = parse_millis(key, value)?,
            "retry.max_delay_ms" => self.retry.max_delay = parse_millis(key, value)?,
            "retry.jitter_percent" => self.retry.jitter_percent = parse(key, value)?,
            "recovery.max_attempts" => self.recovery.max_attempts = parse(key, value)?,
            "recovery.history_ttl_secs" => self.recovery.ttl = parse_secs(key, value)?,
            "monitor.history_limit" => self.monitor.history_limit = parse(key, value)?,
            "monitor.slow_operation_ms" => self.monitor.slow_operation = parse_millis(key, value)?,
            "monitor.memory_delta_mb" => {
                self.monitor.memory_delta_bytes = parse::<u64>(key, value)?.saturating_mul(1024 * 1024)
            }
            _ => self.apply_prefixed(key, value)?,
        }
        Ok(())
    }

    fn apply_prefixed(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        if let Some(kind) = key.strip_prefix("cache.ttl.").and_then(|k| k.strip_suffix("_secs")) {
            if !kind.is_empty() {
                self.cache.kind_ttls.insert(kind.to_string(), parse_secs(key, value)?);
                return Ok(());
            }
        }

        if let Some((provider, field)) =
            key.strip_prefix("providers.").and_then(|rest| rest.split_once(".pool."))
        {
            if !provider.is_empty() {
                let entry = self.provider_pools.entry(provider.to_string()).or_default();
                match field {
                    "min_size" => entry.min_size = Some(parse(key, value)?),
                    "max_size" => entry.max_size = Some(parse(key, value)?),
                    "connection_timeout_ms" => {
                        entry.connection_timeout = Some(parse_millis(key, value)?)
                    }
                    _ => tracing::debug!(key, "ignoring unknown provider pool setting"),
                }
                return Ok(());
            }
        }

        tracing::debug!(key, "ignoring unknown setting");
        Ok(())
    }
}

fn check_pool(pool: &PoolConfig) -> Result<(), ConfigError> {
    if pool.max_size == 0 {
        return Err(ConfigError::MustBePositive { field: "pool.max_size" });
    }
    if pool.min_size > pool.max_size {
        return Err(ConfigError::PoolBounds { min: pool.min_size, max: pool.max_size });
    }
    Ok(())
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerError;

    #[test]
    fn defaults_match_documented_values() {
        let config = RtlConfig::default();
        assert_eq!(config.pool.min_size, 1);
        assert_eq!(config.pool.max_size, 5);
        assert_eq!(config.pool.freshness, Duration::from_secs(30 * 60));
        assert_eq!(config.breaker.failure_threshold(), 5);
        assert_eq!(config.breaker.success_threshold(), 2);
        assert_eq!(config.breaker.timeout(), Duration::from_secs(60));
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.recovery.ttl, Duration::from_secs(3600));
        assert_eq!(config.monitor.history_limit, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overlays_settings() {
        let config = RtlConfig::from_settings([
            ("limiter.max_concurrency", "3"),
            ("breaker.failure_threshold", "2"),
            ("breaker.timeout_ms", "1500"),
            ("retry.max_attempts", "5"),
            ("retry.jitter_percent", "0"),
            ("recovery.history_ttl_secs", "60"),
            ("monitor.memory_delta_mb", "10"),
            ("providers.azure.pool.connection_timeout_ms", "250"),
            ("some.unrelated.key", "whatever"),
        ])
        .unwrap();
        assert_eq!(config.limiter.max_concurrency, 3);
        assert_eq!(config.breaker.failure_threshold(), 2);
        assert_eq!(config.breaker.timeout(), Duration::from_millis(1500));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.jitter_percent, 0.0);
        assert_eq!(config.recovery.ttl, Duration::from_secs(60));
        assert_eq!(config.monitor.memory_delta_bytes, 10 * 1024 * 1024);
        assert_eq!(config.pool_for("azure").connection_timeout, Duration::from_millis(250));
        assert_eq!(config.pool_for("polly").connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn malformed_value_is_reported() {
        let err = RtlConfig::from_settings([("pool.max_size", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "pool.max_size"));

        let err = RtlConfig::from_settings([("retry.strategy", "cubic")]).unwrap_err();
        assert!(err.to_string().contains("cubic"));
    }

    #[test]
    fn validation_errors() {
        assert_eq!(
            RtlConfig::from_settings([("providers.polly.pool.min_size", "9")]).unwrap_err(),
            ConfigError::PoolBounds { min: 9, max: 5 }
        );
        assert_eq!(
            RtlConfig::from_settings([("cache.capacity", "0")]).unwrap_err(),
            ConfigError::MustBePositive { field: "cache.capacity" }
        );
        assert_eq!(
            RtlConfig::from_settings([("breaker.success_threshold", "0")]).unwrap_err(),
            ConfigError::Breaker(CircuitBreakerError::InvalidSuccessThreshold { provided: 0 })
        );
        assert!(matches!(
            RtlConfig::from_settings([("retry.max_attempts", "0")]).unwrap_err(),
            ConfigError::Retry(_)
        ));
    }

    #[test]
    fn owned_settings_are_accepted() {
        let settings: HashMap<String, String> =
            [("cache.ttl.audio_secs".to_string(), "120".to_string())].into_iter().collect();
        let config = RtlConfig::from_settings(settings).unwrap();
        assert_eq!(config.cache.ttl_for(Some("audio")), Duration::from_secs(120));
        assert_eq!(config.cache.ttl_for(Some("voices")), config.cache.default_ttl);
    }
}
