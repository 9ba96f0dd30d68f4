//! Error types for the vigil-metrics crate.

use thiserror::Error;

/// Errors that can occur when building selectors or using the window store.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The series name is invalid (empty or contains invalid characters).
    #[error("invalid series name: {reason}")]
    InvalidSeriesName {
        /// The reason the name is invalid.
        reason: String,
    },

    /// The time range is invalid (start > end).
    #[error("invalid time range: start={start}, end={end}")]
    InvalidTimeRange {
        /// Start timestamp.
        start: i64,
        /// End timestamp.
        end: i64,
    },

    /// A label matcher could not be built.
    #[error("invalid label matcher for '{label}': {reason}")]
    InvalidMatcher {
        /// The label the matcher applies to.
        label: String,
        /// The reason the matcher is invalid.
        reason: String,
    },

    /// An aggregation function was configured with invalid parameters.
    #[error("invalid aggregation: {reason}")]
    InvalidAggregation {
        /// The reason the aggregation is invalid.
        reason: String,
    },

    /// A metric source could not be constructed.
    #[error("invalid metric source: {reason}")]
    InvalidSource {
        /// The reason the source is invalid.
        reason: String,
    },
}

/// Errors returned by a [`MetricSource`](crate::source::MetricSource) query.
///
/// Transient errors are expected to clear on their own (timeouts, connection
/// resets, 5xx responses). Permanent errors will not improve by retrying
/// (bad selector, 4xx responses, undecodable payloads).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// A failure that may succeed on a later attempt.
    #[error("transient query error: {reason}")]
    Transient {
        /// Description of the failure.
        reason: String,
    },

    /// A failure that will not succeed on retry.
    #[error("permanent query error: {reason}")]
    Permanent {
        /// Description of the failure.
        reason: String,
    },
}

impl QueryError {
    /// Creates a transient error.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Creates a permanent error.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// Returns true if the error is transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;
