//! Error classification for failed requests.
//!
//! Maps a raw failure (status code plus diagnostic text) onto one of four
//! categories and decides whether the request is worth retrying:
//! - status 0: no response at all (offline, DNS, refused, timeout)
//! - 4xx: the request itself is wrong, only 429 is worth retrying
//! - 5xx: the server is struggling, always retryable
//! - anything else: unknown, not retried

use reqwest::{header, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Status signal used when no response was received.
pub const NETWORK_FAILURE_STATUS: u16 = 0;

/// The only client-side status that is retryable.
pub const RATE_LIMIT_STATUS: u16 = 429;

const DEFAULT_USER_MESSAGE: &str = "An unexpected error occurred.";

const USER_MESSAGES: &[(u16, &str)] = &[
    (400, "Please check your input and try again."),
    (401, "Please log in to continue."),
    (403, "You don't have permission to access this."),
    (404, "The requested resource was not found."),
    (500, "Something went wrong on our end. Please try later."),
    (503, "Service is temporarily unavailable. Please wait."),
];

/// Broad category of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// No response was received.
    Network,
    /// The server rejected the request (4xx).
    Client,
    /// The server failed to handle the request (5xx).
    Server,
    /// Any other status.
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Client => write!(f, "client"),
            ErrorCategory::Server => write!(f, "server"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

/// Opaque handle on the failure that produced a classification.
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync>;

/// An unclassified failure as reported by a transport.
#[derive(Debug, Clone)]
pub struct RawError {
    /// Status code, `0` when no response arrived.
    pub status: u16,
    /// Diagnostic text, for logs only.
    pub message: String,
    /// Minimum wait requested by the server.
    pub retry_after: Option<Duration>,
    pub cause: Option<ErrorCause>,
}

impl RawError {
    /// A failure where no response was received.
    pub fn network(message: impl Into<String>) -> Self {
        Self::status(NETWORK_FAILURE_STATUS, message)
    }

    /// A failure carrying a protocol status code.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Build from a non-success HTTP response, reading `Retry-After` when present.
    ///
    /// Only the delay-seconds form of `Retry-After` is understood.
    pub fn from_response(response: &Response, url: &str) -> Self {
        let status = response.status();
        let mut raw = Self::status(status.as_u16(), format!("GET {} returned {}", url, status));
        if let Some(secs) = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            raw.retry_after = Some(Duration::from_secs(secs));
        }
        raw
    }
}

impl From<reqwest::Error> for RawError {
    fn from(err: reqwest::Error) -> Self {
        // A status only exists on errors produced by `error_for_status`; every
        // send/connect/timeout failure means no response arrived.
        let status = err
            .status()
            .map(|s: StatusCode| s.as_u16())
            .unwrap_or(NETWORK_FAILURE_STATUS);
        Self::status(status, err.to_string()).with_cause(err)
    }
}

/// A failure after classification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub code: u16,
    pub category: ErrorCategory,
    pub retryable: bool,
    pub user_message: &'static str,
    /// Raw diagnostic text. Not for display to end users.
    #[serde(skip)]
    pub message: String,
    #[serde(skip)]
    pub retry_after: Option<Duration>,
    #[serde(skip)]
    pub cause: Option<ErrorCause>,
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error ({}): {}", self.category, self.code, self.message)
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Categorize a raw failure and decide whether it is retryable.
pub fn classify(raw: RawError) -> ClassifiedError {
    let (category, retryable) = match raw.status {
        NETWORK_FAILURE_STATUS => (ErrorCategory::Network, true),
        400..=499 => (ErrorCategory::Client, raw.status == RATE_LIMIT_STATUS),
        500.. => (ErrorCategory::Server, true),
        _ => (ErrorCategory::Unknown, false),
    };

    ClassifiedError {
        code: raw.status,
        category,
        retryable,
        user_message: user_message_for(raw.status),
        message: raw.message,
        retry_after: raw.retry_after,
        cause: raw.cause,
    }
}

/// Look up the end-user message for a status code.
pub fn user_message_for(code: u16) -> &'static str {
    USER_MESSAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, msg)| *msg)
        .unwrap_or(DEFAULT_USER_MESSAGE)
}
