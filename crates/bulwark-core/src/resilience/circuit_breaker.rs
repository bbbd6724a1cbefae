//! Circuit breaker pattern for network resilience.
//!
//! Implements the circuit breaker pattern to prevent cascading failures:
//! - CLOSED: Normal operation, requests flow through
//! - OPEN: Failing, requests are rejected immediately
//! - HALF_OPEN: Testing recovery, a single probe request is allowed
//!
//! All transitions for one breaker happen under a single mutex, so
//! concurrent failure reports can never trip the circuit twice. Time comes
//! from `tokio::time::Instant` and follows a paused test clock.

use crate::config::ResilienceDefaults;
use crate::{BulwarkError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - requests flow through.
    Closed,
    /// Failing - requests are rejected immediately.
    Open,
    /// Testing recovery - one probe request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is allowed.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: ResilienceDefaults::FAILURE_THRESHOLD,
            cooldown: ResilienceDefaults::COOLDOWN,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for protecting against cascading failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    total_rejected: AtomicU64,
    /// Key (usually a domain) this circuit breaker protects.
    key: String,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration.
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_config(key, CircuitBreakerConfig::default())
    }

    /// Create a new circuit breaker with custom configuration.
    pub fn with_config(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the current state of the circuit.
    ///
    /// An open circuit whose cooldown has elapsed reports (and becomes)
    /// half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// Ask to run one request through the breaker.
    ///
    /// The returned permit must be resolved with `record_success` or
    /// `record_failure`. Dropping it unresolved releases a half-open probe
    /// slot without counting anything.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.lock();
        self.maybe_transition_to_half_open(&mut inner);

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => return Err(self.reject()),
            CircuitState::HalfOpen if inner.probe_in_flight => return Err(self.reject()),
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                debug!("Circuit breaker for {} admitting probe", self.key);
                true
            }
        };

        Ok(BreakerPermit {
            breaker: self,
            probe,
            resolved: false,
        })
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails fast with `CircuitOpen` without calling `operation` when the
    /// circuit is open or a half-open probe is already running. A
    /// `Cancelled` result is not counted as a failure.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(BulwarkError::Cancelled) => Err(BulwarkError::Cancelled),
            Err(e) => {
                permit.record_failure();
                Err(e)
            }
        }
    }

    /// Get statistics about this circuit breaker.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.maybe_transition_to_half_open(&mut inner);
        let time_in_state = match inner.state {
            CircuitState::Closed => Duration::ZERO,
            CircuitState::Open | CircuitState::HalfOpen => inner
                .opened_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO),
        };

        CircuitBreakerStats {
            key: self.key.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: self.total_failures.load(Ordering::SeqCst),
            total_successes: self.total_successes.load(Ordering::SeqCst),
            total_rejected: self.total_rejected.load(Ordering::SeqCst),
            time_in_state_ms: time_in_state.as_millis() as u64,
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        info!("Circuit breaker for {} reset to CLOSED", self.key);
    }

    // Internal state transitions

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reject(&self) -> BulwarkError {
        self.total_rejected.fetch_add(1, Ordering::SeqCst);
        BulwarkError::CircuitOpen {
            key: self.key.clone(),
        }
    }

    fn on_success(&self, probe: bool) {
        self.total_successes.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if probe => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!("Circuit breaker for {} recovered to CLOSED", self.key);
            }
            // Late results from calls admitted before the trip do not decide recovery.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition_to_open(&mut inner);
                }
            }
            CircuitState::HalfOpen if probe => {
                inner.consecutive_failures += 1;
                self.transition_to_open(&mut inner);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            debug!("Circuit breaker for {} probe abandoned", self.key);
        }
    }

    fn transition_to_open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probe_in_flight = false;
        warn!(
            "Circuit breaker for {} opened after {} consecutive failures",
            self.key, inner.consecutive_failures
        );
    }

    fn maybe_transition_to_half_open(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened) = inner.opened_at {
            if opened.elapsed() >= self.config.cooldown {
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = false;
                debug!("Circuit breaker for {} entering HALF_OPEN", self.key);
            }
        }
    }
}

/// Admission ticket for one request through a [`CircuitBreaker`].
#[must_use = "a permit must be resolved with record_success or record_failure"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl BreakerPermit<'_> {
    /// Whether this request is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Statistics about a circuit breaker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejected: u64,
    pub time_in_state_ms: u64,
}

/// Circuit breakers keyed by endpoint, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for `key`.
    pub async fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(cb) = self.breakers.read().await.get(key) {
            return Arc::clone(cb);
        }

        let mut breakers = self.breakers.write().await;
        Arc::clone(breakers.entry(key.to_string()).or_insert_with(|| {
            debug!("Creating circuit breaker for key: {}", key);
            Arc::new(CircuitBreaker::with_config(key, self.config.clone()))
        }))
    }

    /// Run `operation` through the breaker for `key`.
    pub async fn execute<F, Fut, T>(&self, key: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker(key).await.execute(operation).await
    }

    /// Current state for `key`; unknown keys are closed.
    pub async fn state(&self, key: &str) -> CircuitState {
        match self.breakers.read().await.get(key) {
            Some(cb) => cb.state(),
            None => CircuitState::Closed,
        }
    }

    /// Force the breaker for `key` closed. Returns false for unknown keys.
    pub async fn reset(&self, key: &str) -> bool {
        match self.breakers.read().await.get(key) {
            Some(cb) => {
                cb.reset();
                true
            }
            None => false,
        }
    }

    pub async fn reset_all(&self) {
        for cb in self.breakers.read().await.values() {
            cb.reset();
        }
    }

    /// Stats for every breaker, sorted by key.
    pub async fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self
            .breakers
            .read()
            .await
            .values()
            .map(|cb| cb.stats())
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }
}
