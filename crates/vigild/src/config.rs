//! Daemon configuration.
//!
//! A single JSON file with one section per component:
//! - `source`: where metric samples come from
//! - `rules_path`: the rule file, re-read on SIGHUP
//! - `window`, `evaluator`, `manager`, `scheduler`, `notifier`: engine tuning
//! - `channels`: notification channels
//! - `health_interval`: how often a health snapshot is logged
//!
//! Every section has defaults, so `{}` is a valid configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_alerts::config::duration_str;
use vigil_alerts::{
    AlertManagerConfig, ChannelConfig, EvaluatorConfig, MAX_DURATION, NotifierConfig,
    SchedulerConfig, WebhookConfig, WebhookFormat,
};
use vigil_metrics::{MemorySource, MetricSource, PrometheusSource, WindowConfig};

use crate::error::{DaemonError, Result};

fn default_query_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Where metric samples are read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// A Prometheus-compatible HTTP API.
    Prometheus {
        /// Server base URL.
        url: String,
        /// Per-request timeout.
        #[serde(with = "duration_str", default = "default_query_timeout")]
        timeout: Duration,
    },
    /// An in-process source with no samples, for dry runs.
    Memory,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Prometheus {
            url: "http://localhost:9090".to_string(),
            timeout: default_query_timeout(),
        }
    }
}

impl SourceConfig {
    /// Builds the metric source.
    ///
    /// # Errors
    ///
    /// Returns an error if the Prometheus URL is invalid.
    pub fn build(&self) -> Result<Arc<dyn MetricSource>> {
        match self {
            Self::Prometheus { url, timeout } => {
                Ok(Arc::new(PrometheusSource::new(url.clone(), *timeout)?))
            }
            Self::Memory => Ok(Arc::new(MemorySource::new())),
        }
    }
}

/// Main daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Metric source.
    pub source: SourceConfig,
    /// Path of the rule file.
    pub rules_path: PathBuf,
    /// Sample window store.
    pub window: WindowConfig,
    /// Rule evaluation.
    pub evaluator: EvaluatorConfig,
    /// Alert instance housekeeping.
    pub manager: AlertManagerConfig,
    /// Rule scheduling.
    pub scheduler: SchedulerConfig,
    /// Notification delivery.
    pub notifier: NotifierConfig,
    /// Notification channels.
    pub channels: Vec<ChannelConfig>,
    /// Interval between health log lines.
    #[serde(with = "duration_str")]
    pub health_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            rules_path: PathBuf::from("/etc/vigil/rules.json"),
            window: WindowConfig::default(),
            evaluator: EvaluatorConfig::default(),
            manager: AlertManagerConfig::default(),
            scheduler: SchedulerConfig::default(),
            notifier: NotifierConfig::default(),
            channels: vec![ChannelConfig::Log {
                name: "log".to_string(),
            }],
            health_interval: Duration::from_secs(60),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DaemonError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| DaemonError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if let SourceConfig::Prometheus { url, timeout } = &self.source {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(DaemonError::Config(
                    "source.url must start with http:// or https://".to_string(),
                ));
            }
            if timeout.is_zero() {
                return Err(DaemonError::Config(
                    "source.timeout must be greater than 0".to_string(),
                ));
            }
        }

        if self.rules_path.as_os_str().is_empty() {
            return Err(DaemonError::Config("rules_path cannot be empty".to_string()));
        }

        if self.window.capacity == 0 {
            return Err(DaemonError::Config(
                "window.capacity must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.workers == 0 {
            return Err(DaemonError::Config(
                "scheduler.workers must be greater than 0".to_string(),
            ));
        }

        if self.notifier.workers == 0 {
            return Err(DaemonError::Config(
                "notifier.workers must be greater than 0".to_string(),
            ));
        }

        for (name, period) in [
            ("health_interval", self.health_interval),
            ("scheduler.housekeeping_interval", self.scheduler.housekeeping_interval),
        ] {
            if period.is_zero() {
                return Err(DaemonError::Config(format!("{name} must be greater than 0")));
            }
        }

        for (name, duration) in [
            ("health_interval", self.health_interval),
            ("scheduler.housekeeping_interval", self.scheduler.housekeeping_interval),
            ("evaluator.query_timeout", self.evaluator.query_timeout),
            ("evaluator.lookback", self.evaluator.lookback),
            ("manager.idle_timeout", self.manager.idle_timeout),
            ("notifier.delivery_timeout", self.notifier.delivery_timeout),
            ("notifier.dedup_window", self.notifier.dedup_window),
        ] {
            if duration > MAX_DURATION {
                return Err(DaemonError::Config(format!("{name} must not exceed 365d")));
            }
        }

        let mut names = HashSet::new();
        for channel in &self.channels {
            if !names.insert(channel.name()) {
                return Err(DaemonError::Config(format!(
                    "duplicate channel name '{}'",
                    channel.name()
                )));
            }
            if let ChannelConfig::Webhook(webhook) = channel {
                webhook.validate()?;
            }
        }

        Ok(())
    }

    /// The configuration written by `vigild init-config`.
    #[must_use]
    pub fn sample() -> Self {
        let mut webhook = WebhookConfig {
            name: "ops-chat".to_string(),
            url: "https://chat.example.com/hooks/alerts".to_string(),
            format: WebhookFormat::Chat,
            headers: Default::default(),
            timeout: Duration::from_secs(10),
        };
        webhook
            .headers
            .insert("Authorization".to_string(), "Bearer CHANGE_ME".to_string());

        Self {
            channels: vec![
                ChannelConfig::Log {
                    name: "log".to_string(),
                },
                ChannelConfig::Webhook(webhook),
            ],
            ..Self::default()
        }
    }

    /// Write the configuration as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
