//! Error types for vigild.

use thiserror::Error;
use vigil_alerts::AlertError;
use vigil_metrics::MetricsError;

/// Errors that can occur while configuring or starting the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Rule file or channel error.
    #[error(transparent)]
    Alerts(#[from] AlertError),

    /// Metric source error.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;
