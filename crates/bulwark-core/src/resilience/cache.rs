//! Response cache with request coalescing.
//!
//! Each key maps to one shared future. Every caller asking for the same key
//! while the entry is valid awaits that same future, so at most one
//! underlying fetch runs per key. Entries live until invalidated, until an
//! optional TTL passes, or (unless `cache_failures` is set) until their own
//! fetch fails.
//!
//! The shared fetch is driven by whichever caller polls it. If every caller
//! goes away mid-flight the fetch is parked, not dropped, and the next caller
//! for the key resumes it.

use crate::cancel::CancellationToken;
use crate::{BulwarkError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Expiry and failure policy for a [`ResponseCache`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePolicy {
    /// Lifetime of a completed entry. `None` keeps entries until invalidated.
    pub ttl: Option<Duration>,
    /// Keep failed results instead of dropping them.
    pub cache_failures: bool,
}

#[derive(Clone)]
struct CacheEntry<T: Clone> {
    id: u64,
    fetch: SharedFetch<T>,
    created_at: Instant,
}

struct CacheInner<T: Clone> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
    policy: CachePolicy,
    next_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: Clone> CacheInner<T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &CacheEntry<T>) -> bool {
        match self.policy.ttl {
            Some(ttl) => entry.fetch.peek().is_some() && entry.created_at.elapsed() >= ttl,
            None => false,
        }
    }

    /// Remove `key` only if it still holds the entry with `id`.
    fn remove_if_current(&self, key: &str, id: u64) {
        let mut entries = self.lock();
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key);
            debug!("Dropped failed cache entry for {}", key);
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseCacheStats {
    /// Lookups served by an existing entry (completed or in flight).
    pub hits: u64,
    /// Lookups that started a new fetch.
    pub misses: u64,
    pub entries: usize,
}

/// Keyed cache of shared fetch results.
///
/// Cloning is cheap; clones share entries.
pub struct ResponseCache<T: Clone> {
    inner: Arc<CacheInner<T>>,
}

impl<T: Clone> Clone for ResponseCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for ResponseCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl<T> ResponseCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                policy,
                next_id: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// Return the shared result for `key`, starting `fetch` only on a miss.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.entry(key, fetch).await
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch), but stops waiting when
    /// `cancel` fires. The shared fetch itself stays in the cache for other
    /// callers.
    pub async fn get_or_fetch_cancellable<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        cancel.check()?;
        let shared = self.entry(key, fetch);
        tokio::select! {
            _ = cancel.cancelled() => Err(BulwarkError::Cancelled),
            result = shared => result,
        }
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            debug!("Cache invalidated for {}", key);
        }
        removed
    }

    pub fn invalidate_all(&self) {
        self.inner.lock().clear();
    }

    /// Whether `key` currently has a valid entry.
    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .lock()
            .get(key)
            .is_some_and(|entry| !self.inner.is_expired(entry))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ResponseCacheStats {
        ResponseCacheStats {
            hits: self.inner.hits.load(Ordering::SeqCst),
            misses: self.inner.misses.load(Ordering::SeqCst),
            entries: self.len(),
        }
    }

    fn entry<F, Fut>(&self, key: &str, fetch: F) -> SharedFetch<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut entries = self.inner.lock();
        if let Some(entry) = entries.get(key) {
            if !self.inner.is_expired(entry) {
                self.inner.hits.fetch_add(1, Ordering::SeqCst);
                return entry.fetch.clone();
            }
            debug!("Cache entry for {} expired", key);
        }

        self.inner.misses.fetch_add(1, Ordering::SeqCst);
        if self.inner.policy.ttl.is_some() {
            let before = entries.len();
            entries.retain(|_, entry| !self.inner.is_expired(entry));
            if entries.len() < before {
                debug!("Swept {} expired cache entries", before - entries.len());
            }
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let fut = fetch();
        let fetch = if self.inner.policy.cache_failures {
            fut.boxed().shared()
        } else {
            let cache: Weak<CacheInner<T>> = Arc::downgrade(&self.inner);
            let owned_key = key.to_string();
            async move {
                let result = fut.await;
                if result.is_err() {
                    if let Some(cache) = cache.upgrade() {
                        cache.remove_if_current(&owned_key, id);
                    }
                }
                result
            }
            .boxed()
            .shared()
        };

        debug!("Cache miss for {}, starting fetch", key);
        entries.insert(
            key.to_string(),
            CacheEntry {
                id,
                fetch: fetch.clone(),
                created_at: Instant::now(),
            },
        );
        fetch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::classify::{classify, RawError};
    use std::sync::atomic::AtomicU32;

    fn counting_fetch(
        calls: &Arc<AtomicU32>,
        value: &'static str,
    ) -> impl Future<Output = Result<String>> + Send + 'static {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(value.to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let cache = ResponseCache::<String>::default();
        let calls = Arc::new(AtomicU32::new(0));

        let (a, b) = tokio::join!(
            cache.get_or_fetch("users", || counting_fetch(&calls, "alice")),
            cache.get_or_fetch("users", || counting_fetch(&calls, "bob")),
        );

        assert_eq!(a.unwrap(), "alice");
        assert_eq!(b.unwrap(), "alice");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_result_replayed() {
        let cache = ResponseCache::<String>::default();
        let calls = Arc::new(AtomicU32::new(0));

        cache.get_or_fetch("k", || counting_fetch(&calls, "v1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        let second = cache.get_or_fetch("k", || counting_fetch(&calls, "v2")).await;

        assert_eq!(second.unwrap(), "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_refetch() {
        let cache = ResponseCache::<String>::default();
        let calls = Arc::new(AtomicU32::new(0));

        cache.get_or_fetch("k", || counting_fetch(&calls, "v1")).await.unwrap();
        assert!(cache.invalidate("k"));
        assert!(!cache.invalidate("k"));
        let fresh = cache.get_or_fetch("k", || counting_fetch(&calls, "v2")).await;

        assert_eq!(fresh.unwrap(), "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_not_cached() {
        let cache = ResponseCache::<String>::default();
        let calls = Arc::new(AtomicU32::new(0));

        let failed = {
            let calls = Arc::clone(&calls);
            cache
                .get_or_fetch("k", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(classify(RawError::status(503, "down")).into())
                })
                .await
        };
        assert!(failed.is_err());
        assert!(!cache.contains("k"));

        let ok = cache.get_or_fetch("k", || counting_fetch(&calls, "v")).await;
        assert_eq!(ok.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_cached_when_policy_says_so() {
        let cache = ResponseCache::<String>::new(CachePolicy {
            ttl: None,
            cache_failures: true,
        });
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let result = cache
                .get_or_fetch("k", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(classify(RawError::network("offline")).into())
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_does_not_evict_newer_entry() {
        let cache = ResponseCache::<String>::default();
        let calls = Arc::new(AtomicU32::new(0));

        let slow_failure = cache.get_or_fetch("k", || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(classify(RawError::status(500, "late")).into())
        });
        let replace = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.invalidate("k");
            cache.get_or_fetch("k", || counting_fetch(&calls, "fresh")).await
        };

        let (failed, fresh) = tokio::join!(slow_failure, replace);
        assert!(failed.is_err());
        assert_eq!(fresh.unwrap(), "fresh");
        assert!(cache.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expires_completed_entries() {
        let cache = ResponseCache::<String>::new(CachePolicy {
            ttl: Some(Duration::from_secs(60)),
            cache_failures: false,
        });
        let calls = Arc::new(AtomicU32::new(0));

        cache.get_or_fetch("k", || counting_fetch(&calls, "v1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            cache.get_or_fetch("k", || counting_fetch(&calls, "v2")).await.unwrap(),
            "v1"
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!cache.contains("k"));
        assert_eq!(
            cache.get_or_fetch("k", || counting_fetch(&calls, "v2")).await.unwrap(),
            "v2"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_swept_on_miss() {
        let cache = ResponseCache::<String>::new(CachePolicy {
            ttl: Some(Duration::from_secs(60)),
            cache_failures: false,
        });
        let calls = Arc::new(AtomicU32::new(0));

        cache.get_or_fetch("a", || counting_fetch(&calls, "a")).await.unwrap();
        cache.get_or_fetch("b", || counting_fetch(&calls, "b")).await.unwrap();
        assert_eq!(cache.len(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.get_or_fetch("c", || counting_fetch(&calls, "c")).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_leaves_fetch_for_others() {
        let cache = ResponseCache::<String>::default();
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let waiting = cache.get_or_fetch_cancellable("k", || counting_fetch(&calls, "v"), &cancel);
        let cancelling = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(waiting, cancelling);
        assert!(matches!(result, Err(BulwarkError::Cancelled)));

        let later = cache.get_or_fetch("k", || counting_fetch(&calls, "other")).await;
        assert_eq!(later.unwrap(), "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_all() {
        let cache = ResponseCache::<u32>::default();
        drop(cache.entry("a", || async { Ok(1) }));
        drop(cache.entry("b", || async { Ok(2) }));
        assert_eq!(cache.len(), 2);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
