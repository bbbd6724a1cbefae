//! HTTP transport adapter.
//!
//! Provides a wrapper around reqwest that speaks the toolkit's error model:
//! - Transport failures (connect, DNS, timeout) become status 0
//! - Non-success statuses become classified errors, with `Retry-After`
//! - Configurable timeouts and user agent

use crate::config::ResilienceDefaults;
use crate::resilience::classify::{classify, RawError};
use crate::{BulwarkError, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// HTTP client that reports failures as classified errors.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a new fetcher with the default timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(ResilienceDefaults::REQUEST_TIMEOUT)
    }

    /// Create a new fetcher with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(ResilienceDefaults::USER_AGENT)
            .build()
            .map_err(|e| BulwarkError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    /// Get a reference to the underlying reqwest client.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GET `url` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(RawError::from(e)))?;

        let status = response.status();
        if !status.is_success() {
            let raw = RawError::from_response(&response, url);
            debug!("GET {} failed with {}", url, status);
            return Err(classify(raw).into());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify(RawError::from(e)))?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Extract the host of a URL, used as the circuit breaker key.
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|host| match u.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            })
        })
        .unwrap_or_else(|| "unknown".to_string())
}
