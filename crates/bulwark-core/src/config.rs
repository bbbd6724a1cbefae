//! Centralized configuration for Bulwark.
//!
//! `ResilienceDefaults` holds the built-in constants. `ResilienceConfig` is the
//! user-facing, serde-loadable form; every key is optional and falls back to
//! the matching default.

use crate::resilience::cache::CachePolicy;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::retry::RetryConfig;
use crate::{BulwarkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Built-in defaults for every resilience component.
pub struct ResilienceDefaults;

impl ResilienceDefaults {
    // Retry / backoff
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BASE_DELAY: Duration = Duration::from_millis(1000);
    pub const JITTER_WINDOW: Duration = Duration::from_millis(1000);
    pub const MAX_DELAY: Duration = Duration::from_secs(60);

    // Circuit breaker
    pub const FAILURE_THRESHOLD: u32 = 3;
    pub const COOLDOWN: Duration = Duration::from_secs(30);

    // Transport
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const USER_AGENT: &'static str = "Bulwark/0.1";

    // Snapshots
    pub const SNAPSHOT_MEMORY_CAPACITY: u64 = 256;
    pub const SNAPSHOT_FILE_PREFIX: &'static str = "snapshot-";
}

/// Resilience options, as read from a JSON config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResilienceConfig {
    /// Retries after the first attempt.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter_window_ms: u64,
    pub max_delay_ms: u64,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    /// `None` keeps cache entries until invalidated.
    pub cache_ttl_ms: Option<u64>,
    pub cache_failures: bool,
    pub request_timeout_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: ResilienceDefaults::MAX_ATTEMPTS,
            base_delay_ms: ResilienceDefaults::BASE_DELAY.as_millis() as u64,
            jitter_window_ms: ResilienceDefaults::JITTER_WINDOW.as_millis() as u64,
            max_delay_ms: ResilienceDefaults::MAX_DELAY.as_millis() as u64,
            failure_threshold: ResilienceDefaults::FAILURE_THRESHOLD,
            cooldown_ms: ResilienceDefaults::COOLDOWN.as_millis() as u64,
            cache_ttl_ms: None,
            cache_failures: false,
            request_timeout_ms: ResilienceDefaults::REQUEST_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ResilienceConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            BulwarkError::config(format!("Invalid resilience config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| BulwarkError::io_with_path(e, path))?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(BulwarkError::config("failureThreshold must be at least 1"));
        }
        if self.base_delay_ms == 0 {
            return Err(BulwarkError::config("baseDelayMs must be greater than 0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(BulwarkError::config("requestTimeoutMs must be greater than 0"));
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_jitter_window(Duration::from_millis(self.jitter_window_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            ttl: self.cache_ttl_ms.map(Duration::from_millis),
            cache_failures: self.cache_failures,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
