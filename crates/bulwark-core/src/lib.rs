//! Bulwark - client-side HTTP resilience toolkit.
//!
//! This crate wraps outbound HTTP calls with error classification, retry with
//! exponential backoff, per-host circuit breaking, response caching with
//! request coalescing, and graceful degradation to stored snapshots or a
//! constant fallback. It can be used programmatically without the CLI.
//!
//! # Example
//!
//! ```rust,ignore
//! use bulwark::{ResilienceConfig, ResilientClient, SnapshotStore};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> bulwark::Result<()> {
//!     let client = ResilientClient::new(&ResilienceConfig::default())?
//!         .with_snapshots(SnapshotStore::new("/tmp/bulwark"));
//!
//!     // Full pipeline: cache, retry, breaker, transport
//!     let users = client.get_json("https://api.example.com/users").await?;
//!     println!("{}", users);
//!
//!     // Never fails; reports which tier answered
//!     let resolved = client
//!         .get_with_fallback("https://api.example.com/users", json!([]))
//!         .await;
//!     println!("served from {}", resolved.source);
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod http;
pub mod resilience;
pub mod snapshot;

mod client;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use client::{ResilientClient, SOURCE_API, SOURCE_CACHE, SOURCE_FALLBACK};
pub use config::{ResilienceConfig, ResilienceDefaults};
pub use error::{BulwarkError, Result};
pub use http::{extract_domain, HttpFetcher};
pub use resilience::{
    classify, retry_async, user_message_for, BackoffScheduler, CachePolicy, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
    ClassifiedError, DataSource, DegradationChain, ErrorCategory, GuaranteedChain, RawError,
    Resolved, ResponseCache, ResponseCacheStats, RetryConfig, RetryStats,
};
pub use snapshot::{Snapshot, SnapshotSource, SnapshotStore};
