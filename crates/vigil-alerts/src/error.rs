//! Error types for the vigil-alerts crate.

use thiserror::Error;

/// Errors that can occur in the alerting system.
#[derive(Debug, Error)]
pub enum AlertError {
    /// Invalid alert rule configuration.
    #[error("invalid alert rule: {reason}")]
    InvalidRule {
        /// The reason the rule is invalid.
        reason: String,
    },

    /// Alert rule with the given name was not found.
    #[error("rule not found: {name}")]
    RuleNotFound {
        /// The rule name that was not found.
        name: String,
    },

    /// Invalid duration specification.
    #[error("invalid duration: {reason}")]
    InvalidDuration {
        /// The reason the duration is invalid.
        reason: String,
    },

    /// Invalid notification channel configuration.
    #[error("invalid channel '{name}': {reason}")]
    InvalidChannel {
        /// The channel name.
        name: String,
        /// The reason the channel is invalid.
        reason: String,
    },

    /// A rule file or configuration file could not be read.
    #[error("failed to read {path}: {reason}")]
    Io {
        /// The path that could not be read.
        path: String,
        /// The underlying error.
        reason: String,
    },

    /// Metrics error.
    #[error("metrics error: {0}")]
    MetricsError(#[from] vigil_metrics::MetricsError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for AlertError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// A single rule rejected while loading a rule file.
///
/// The other rules of the file still load.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("rule #{index} ({}): {reason}", name.as_deref().unwrap_or("<unnamed>"))]
pub struct ConfigError {
    /// Position of the rule in the file, starting at 0.
    pub index: usize,
    /// The rule name, if it could be read.
    pub name: Option<String>,
    /// Why the rule was rejected.
    pub reason: String,
}

impl ConfigError {
    /// Creates a new config error.
    pub fn new(index: usize, name: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            index,
            name,
            reason: reason.into(),
        }
    }
}

/// Errors returned by a notification channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The delivery may succeed if retried (timeout, connection failure, 5xx, 429).
    #[error("retryable delivery error: {reason}")]
    Retryable {
        /// Description of the failure.
        reason: String,
    },

    /// The delivery will never succeed (bad payload, rejected request).
    #[error("fatal delivery error: {reason}")]
    Fatal {
        /// Description of the failure.
        reason: String,
    },
}

impl DeliveryError {
    /// Creates a retryable error.
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
        }
    }

    /// Creates a fatal error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Returns true if the error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Result type for alert operations.
pub type Result<T> = std::result::Result<T, AlertError>;
