//! ResilientClient - the composed request pipeline.
//!
//! A GET goes through, outermost first:
//! 1. Response cache keyed by URL (concurrent identical requests coalesce)
//! 2. Retry with exponential backoff for retryable failures
//! 3. Circuit breaker keyed by the URL's host
//! 4. The HTTP transport
//!
//! `get_with_fallback` wraps the pipeline in a degradation chain:
//! live request, then the stored snapshot, then a caller-supplied constant.

use crate::cancel::CancellationToken;
use crate::config::ResilienceConfig;
use crate::http::{extract_domain, HttpFetcher};
use crate::resilience::cache::{ResponseCache, ResponseCacheStats};
use crate::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
use crate::resilience::degradation::{DegradationChain, Resolved};
use crate::resilience::retry::{retry_async, BackoffScheduler};
use crate::snapshot::{SnapshotSource, SnapshotStore};
use crate::{BulwarkError, Result};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Source name reported when the live request answered.
pub const SOURCE_API: &str = "api";
/// Source name reported when a stored snapshot answered.
pub const SOURCE_CACHE: &str = "cache";
/// Source name reported when the constant fallback answered.
pub const SOURCE_FALLBACK: &str = "fallback";

/// HTTP client with classification, retry, circuit breaking, caching and
/// snapshot fallback.
///
/// Cloning is cheap; clones share breakers, cache and shutdown state.
#[derive(Clone)]
pub struct ResilientClient {
    http: HttpFetcher,
    scheduler: BackoffScheduler,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: ResponseCache<Value>,
    snapshots: Option<SnapshotStore>,
    shutdown: CancellationToken,
}

impl ResilientClient {
    /// Create a client from a validated config.
    pub fn new(config: &ResilienceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            http: HttpFetcher::with_timeout(config.request_timeout())?,
            scheduler: BackoffScheduler::new(config.retry_config()),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.breaker_config())),
            cache: ResponseCache::new(config.cache_policy()),
            snapshots: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Save successful responses to `store` and use it as the fallback tier.
    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// GET `url` as JSON through the full pipeline.
    pub async fn get_json(&self, url: &str) -> Result<Value> {
        self.cache.get_or_fetch(url, || self.live_fetch(url)).await
    }

    /// Like [`get_json`](Self::get_json), but the caller can stop waiting.
    ///
    /// Cancelling only abandons this caller's wait; other callers sharing
    /// the same request still receive its result.
    pub async fn get_json_cancellable(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.cache
            .get_or_fetch_cancellable(url, || self.live_fetch(url), cancel)
            .await
    }

    /// GET `url`, degrading to the stored snapshot and then to `fallback`.
    ///
    /// Never fails; the `source` field says which tier answered.
    pub async fn get_with_fallback(&self, url: &str, fallback: Value) -> Resolved<Value> {
        let client = self.clone();
        let live_url = url.to_string();
        let mut chain = DegradationChain::new().source_fn(SOURCE_API, move || {
            let client = client.clone();
            let url = live_url.clone();
            async move { client.get_json(&url).await }
        });

        if let Some(store) = &self.snapshots {
            chain = chain.source(SnapshotSource::new(SOURCE_CACHE, store.clone(), url));
        }

        chain.with_fallback(SOURCE_FALLBACK, fallback).resolve().await
    }

    /// Drop the cached response for `url`.
    pub fn invalidate(&self, url: &str) -> bool {
        self.cache.invalidate(url)
    }

    /// Force the breaker for `domain` closed.
    pub async fn reset_breaker(&self, domain: &str) -> bool {
        self.breakers.reset(domain).await
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub async fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.stats().await
    }

    pub fn cache_stats(&self) -> ResponseCacheStats {
        self.cache.stats()
    }

    /// Abort every pending backoff wait. In-flight requests resolve as
    /// `Cancelled`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn live_fetch(&self, url: &str) -> impl Future<Output = Result<Value>> + Send + 'static {
        let http = self.http.clone();
        let scheduler = self.scheduler.clone();
        let breakers = Arc::clone(&self.breakers);
        let snapshots = self.snapshots.clone();
        let shutdown = self.shutdown.clone();
        let url = url.to_string();

        async move {
            let domain = extract_domain(&url);
            let breaker = breakers.breaker(&domain).await;
            let breaker = &*breaker;
            let http = &http;
            let target = url.as_str();
            let mut attempts = 0;
            let (result, stats) = retry_async(&scheduler, &shutdown, move || {
                attempts += 1;
                let attempt = attempts;
                async move {
                    let result = breaker.execute(|| http.get_json::<Value>(target)).await;
                    stop_if_tripped(breaker, attempt, result)
                }
            })
            .await;

            debug!(
                "GET {} finished after {} attempts ({:?} backoff)",
                url, stats.attempts, stats.total_delay
            );

            if let (Ok(body), Some(store)) = (&result, &snapshots) {
                if let Err(e) = store.save(&url, body) {
                    warn!("Failed to save snapshot for {}: {}", url, e);
                }
            }
            result
        }
    }
}

/// End the retry loop once a failure has opened the breaker.
///
/// Further attempts would only be rejected locally, so the last classified
/// error is reported as exhausted instead of waiting out a backoff.
fn stop_if_tripped(
    breaker: &CircuitBreaker,
    attempt: u32,
    result: Result<Value>,
) -> Result<Value> {
    match result {
        Err(BulwarkError::Request(last))
            if last.retryable && breaker.state() == CircuitState::Open =>
        {
            warn!(
                "Circuit breaker for {} opened at attempt {}, not retrying",
                breaker.key(),
                attempt
            );
            Err(BulwarkError::RetriesExhausted {
                attempts: attempt,
                last,
            })
        }
        other => other,
    }
}
