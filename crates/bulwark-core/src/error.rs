//! Error types for Bulwark.
//!
//! Every failure the toolkit surfaces is a `BulwarkError`. Transport and
//! protocol failures travel as a [`ClassifiedError`]; local policy rejections
//! (open circuit, cancellation) have variants of their own so callers can
//! tell "the server said no" apart from "we did not ask".
//!
//! The enum is `Clone` because cached results are shared between callers.

use crate::resilience::classify::ClassifiedError;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for the Bulwark library.
#[derive(Debug, Clone, Error)]
pub enum BulwarkError {
    // Request errors
    #[error("Request failed: {0}")]
    Request(ClassifiedError),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ClassifiedError },

    // Policy rejections
    #[error("Circuit breaker open for {key}")]
    CircuitOpen { key: String },

    #[error("All {tried} data sources failed, last error: {last}")]
    SourcesExhausted {
        tried: usize,
        last: Box<BulwarkError>,
    },

    #[error("Operation was cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<Arc<serde_json::Error>>,
    },
}

/// Result type alias for Bulwark operations.
pub type Result<T> = std::result::Result<T, BulwarkError>;

/// Shown when a request was rejected locally by an open circuit.
pub const CIRCUIT_OPEN_MESSAGE: &str =
    "This service is failing right now. Please try again in a little while.";

/// Shown for failures that carry no classified request error.
pub const GENERIC_MESSAGE: &str = "An unexpected error occurred.";

impl From<ClassifiedError> for BulwarkError {
    fn from(err: ClassifiedError) -> Self {
        BulwarkError::Request(err)
    }
}

impl From<std::io::Error> for BulwarkError {
    fn from(err: std::io::Error) -> Self {
        BulwarkError::Io {
            message: err.to_string(),
            path: None,
            source: Some(Arc::new(err)),
        }
    }
}

impl From<serde_json::Error> for BulwarkError {
    fn from(err: serde_json::Error) -> Self {
        BulwarkError::Json {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl BulwarkError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BulwarkError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(Arc::new(err)),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        BulwarkError::Config {
            message: message.into(),
        }
    }

    /// The classified request error behind this failure, if there is one.
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            BulwarkError::Request(err) | BulwarkError::RetriesExhausted { last: err, .. } => {
                Some(err)
            }
            BulwarkError::SourcesExhausted { last, .. } => last.classified(),
            _ => None,
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// Only classified request errors are ever retryable. An exhausted retry
    /// sequence, an open circuit and a cancellation are all final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BulwarkError::Request(err) if err.retryable)
    }

    /// Check if this error is the local circuit-open rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BulwarkError::CircuitOpen { .. })
    }

    /// Human-readable message safe to show to end users.
    ///
    /// Never contains raw transport or parser text.
    pub fn user_message(&self) -> &'static str {
        match self {
            BulwarkError::CircuitOpen { .. } => CIRCUIT_OPEN_MESSAGE,
            other => other
                .classified()
                .map(|err| err.user_message)
                .unwrap_or(GENERIC_MESSAGE),
        }
    }
}
