//! Resilience components for outbound requests.
//!
//! This module provides:
//! - Error classification (network / client / server / unknown)
//! - Retry logic with exponential backoff and jitter
//! - Circuit breaker pattern, one breaker per key
//! - Response cache with request coalescing
//! - Graceful degradation across ordered data sources

pub mod cache;
pub mod circuit_breaker;
pub mod classify;
pub mod degradation;
pub mod retry;

pub use cache::{CachePolicy, ResponseCache, ResponseCacheStats};
pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState,
};
pub use classify::{classify, user_message_for, ClassifiedError, ErrorCategory, RawError};
pub use degradation::{DataSource, DegradationChain, FnSource, GuaranteedChain, Resolved};
pub use retry::{retry_async, BackoffScheduler, RetryConfig, RetryState, RetryStats};
