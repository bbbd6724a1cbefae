//! Graceful degradation across ordered data sources.
//!
//! A chain tries its sources in order and returns the first success together
//! with the name of the source that produced it. Typical chain: live API,
//! then a stored snapshot, then a constant placeholder.
//!
//! Ending a chain with [`DegradationChain::with_fallback`] yields a
//! [`GuaranteedChain`] whose `resolve` cannot fail.

use crate::{BulwarkError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use tracing::{debug, warn};

/// One tier of a degradation chain.
#[async_trait]
pub trait DataSource<T>: Send + Sync {
    /// Name reported when this source wins (e.g. "api", "cache").
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<T>;
}

/// Result of a chain: which source answered, and with what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolved<T> {
    pub source: String,
    pub data: T,
}

/// Adapter turning a closure into a [`DataSource`].
pub struct FnSource<F> {
    name: String,
    f: F,
}

impl<F> FnSource<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<T, F, Fut> DataSource<T> for FnSource<F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<T> {
        (self.f)().await
    }
}

/// Ordered list of fallible sources.
pub struct DegradationChain<T> {
    sources: Vec<Box<dyn DataSource<T>>>,
}

impl<T> Default for DegradationChain<T> {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
        }
    }
}

impl<T: Send + 'static> DegradationChain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source.
    pub fn source(mut self, source: impl DataSource<T> + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Append a closure-backed source.
    pub fn source_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.source(FnSource::new(name, f))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Try each source in order and return the first success.
    ///
    /// Fails with `SourcesExhausted` when every source failed, or with
    /// `Config` when the chain has no sources at all.
    pub async fn resolve(&self) -> Result<Resolved<T>> {
        let mut last = None;
        for source in &self.sources {
            match source.fetch().await {
                Ok(data) => {
                    debug!("Resolved from source {}", source.name());
                    return Ok(Resolved {
                        source: source.name().to_string(),
                        data,
                    });
                }
                Err(e) => {
                    warn!("Source {} failed: {}", source.name(), e);
                    last = Some(e);
                }
            }
        }

        match last {
            Some(last) => Err(BulwarkError::SourcesExhausted {
                tried: self.sources.len(),
                last: Box::new(last),
            }),
            None => Err(BulwarkError::config("Degradation chain has no sources")),
        }
    }

    /// Terminate the chain with a constant that is returned when every
    /// source fails.
    pub fn with_fallback(self, name: impl Into<String>, value: T) -> GuaranteedChain<T>
    where
        T: Clone,
    {
        GuaranteedChain {
            chain: self,
            fallback_name: name.into(),
            fallback: value,
        }
    }
}

/// A chain ending in an infallible constant source.
pub struct GuaranteedChain<T> {
    chain: DegradationChain<T>,
    fallback_name: String,
    fallback: T,
}

impl<T: Clone + Send + 'static> GuaranteedChain<T> {
    pub async fn resolve(&self) -> Resolved<T> {
        match self.chain.resolve().await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(
                    "Falling back to {} after source failures: {}",
                    self.fallback_name, e
                );
                Resolved {
                    source: self.fallback_name.clone(),
                    data: self.fallback.clone(),
                }
            }
        }
    }
}
