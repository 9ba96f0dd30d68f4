//! Notification channels for alert delivery.
//!
//! This module provides the [`NotificationChannel`] trait and implementations
//! for delivering alert notifications through various channels.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vigil_metrics::LabelSet;

use crate::config::duration_str;
use crate::error::{AlertError, DeliveryError, Result};
use crate::template::format_value;
use crate::types::{NotificationEvent, RuleInstanceId, Severity, StateKind};

/// The structured payload handed to a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    /// The rule name.
    pub rule_name: String,
    /// The rule instance.
    pub instance: RuleInstanceId,
    /// Alert severity.
    pub severity: Severity,
    /// Alert labels.
    pub labels: LabelSet,
    /// `firing` or `resolved`.
    pub state: StateKind,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
    /// A one-line human readable message.
    pub message: String,
    /// The value that caused the transition.
    pub value: Option<f64>,
    /// Expanded annotations.
    pub annotations: BTreeMap<String, String>,
}

impl AlertPayload {
    /// Builds the payload of an event.
    ///
    /// The message is the `summary` annotation when the rule has one.
    #[must_use]
    pub fn from_event(event: &NotificationEvent) -> Self {
        let message = event.annotations.get("summary").cloned().unwrap_or_else(|| {
            format!(
                "{} is {} (value {})",
                event.rule_instance_id,
                event.to_state,
                format_value(event.value)
            )
        });

        Self {
            rule_name: event.rule_name.clone(),
            instance: event.rule_instance_id.clone(),
            severity: event.severity,
            labels: event.labels.clone(),
            state: event.to_state,
            timestamp: event.timestamp,
            message,
            value: event.value,
            annotations: event.annotations.clone(),
        }
    }

    /// Formats the payload as one chat line, e.g.
    /// `[FIRING:critical] HighErrorRate{route="/login"}: error rate 7%`.
    #[must_use]
    pub fn chat_text(&self) -> String {
        format!(
            "[{}:{}] {}: {}",
            self.state.as_str().to_uppercase(),
            self.severity,
            self.instance,
            self.message
        )
    }
}

/// Trait for notification channels.
///
/// Implement this trait to create custom notification channels for
/// delivering alerts via different protocols or services.
#[async_trait]
pub trait NotificationChannel: Send + Sync + fmt::Debug {
    /// Returns the name of this channel.
    fn name(&self) -> &str;

    /// Sends one alert.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Retryable` for failures that may clear on
    /// retry and `DeliveryError::Fatal` for the rest.
    async fn send(&self, payload: &AlertPayload) -> std::result::Result<(), DeliveryError>;
}

/// Body format of a webhook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookFormat {
    /// The full [`AlertPayload`] as JSON.
    #[default]
    Json,
    /// `{"text": "..."}`, accepted by most chat incoming webhooks.
    Chat,
}

/// Configuration for a webhook channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// The name of this webhook.
    pub name: String,
    /// The URL to send notifications to.
    pub url: String,
    /// Body format.
    #[serde(default)]
    pub format: WebhookFormat,
    /// HTTP headers to include with requests.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Timeout for HTTP requests.
    #[serde(with = "duration_str", default = "default_webhook_timeout")]
    pub timeout: Duration,
}

const fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

impl WebhookConfig {
    /// Creates a new webhook configuration.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidChannel` if the URL is not http(s).
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let config = Self {
            name: name.into(),
            url: url.into(),
            format: WebhookFormat::Json,
            headers: BTreeMap::new(),
            timeout: default_webhook_timeout(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Adds a header to the configuration.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the body format.
    #[must_use]
    pub const fn with_format(mut self, format: WebhookFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidChannel` for an empty name or a non-http(s) URL.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| AlertError::InvalidChannel {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(invalid("url must start with http:// or https://"));
        }
        Ok(())
    }
}

/// A webhook notification channel.
///
/// Sends each alert as a JSON POST request to a configured URL.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Creates a new webhook channel with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidChannel` if the configuration is invalid or
    /// the HTTP client cannot be built.
    pub fn new(config: WebhookConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AlertError::InvalidChannel {
                name: config.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { config, client })
    }

    /// Returns the webhook URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Formats the request body.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Fatal` if serialization fails.
    pub fn format_body(&self, payload: &AlertPayload) -> std::result::Result<Vec<u8>, DeliveryError> {
        let body = match self.config.format {
            WebhookFormat::Json => serde_json::to_vec(payload),
            WebhookFormat::Chat => serde_json::to_vec(&serde_json::json!({ "text": payload.chat_text() })),
        };
        body.map_err(|e| DeliveryError::fatal(format!("cannot serialize payload: {e}")))
    }
}

/// Maps an HTTP status to a delivery outcome.
fn classify_status(status: reqwest::StatusCode) -> std::result::Result<(), DeliveryError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        Err(DeliveryError::retryable(format!("server returned {status}")))
    } else {
        Err(DeliveryError::fatal(format!("server returned {status}")))
    }
}

fn classify_error(err: &reqwest::Error) -> DeliveryError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        DeliveryError::retryable(err.to_string())
    } else {
        DeliveryError::fatal(err.to_string())
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn send(&self, payload: &AlertPayload) -> std::result::Result<(), DeliveryError> {
        let body = self.format_body(payload)?;

        let mut request = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| classify_error(&e))?;
        let status = response.status();
        debug!(
            channel = %self.name(),
            instance = %payload.instance,
            %status,
            "webhook responded"
        );
        classify_status(status)
    }
}

/// A channel that writes alerts to the log. Never fails.
#[derive(Debug, Clone)]
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    /// Creates a log channel.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &AlertPayload) -> std::result::Result<(), DeliveryError> {
        info!(
            channel = %self.name,
            instance = %payload.instance,
            severity = %payload.severity,
            state = %payload.state,
            value = ?payload.value,
            "{}",
            payload.message
        );
        Ok(())
    }
}

/// A channel as written in the daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// An HTTP webhook.
    Webhook(WebhookConfig),
    /// The process log.
    Log {
        /// Channel name.
        name: String,
    },
}

impl ChannelConfig {
    /// Returns the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Webhook(config) => &config.name,
            Self::Log { name } => name,
        }
    }

    /// Builds the channel.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidChannel` if the configuration is invalid.
    pub fn build(&self) -> Result<Arc<dyn NotificationChannel>> {
        match self {
            Self::Webhook(config) => Ok(Arc::new(WebhookChannel::new(config.clone())?)),
            Self::Log { name } => Ok(Arc::new(LogChannel::new(name.clone()))),
        }
    }
}
