//! Threshold-and-duration alerting for the vigil alert engine.
//!
//! `vigil-alerts` evaluates declarative rules against windows of metric
//! samples, tracks the lifecycle of every `(rule, label set)` instance and
//! delivers Firing and Resolved notifications.
//!
//! # Features
//!
//! - **Rules**: a windowed series expression or a ratio of two, compared to a
//!   threshold, that must hold for a `for` duration before firing
//! - **Instances**: one state machine per label set, created lazily and
//!   evicted once idle
//! - **Notifications**: per-instance coalescing, a dedup window and
//!   exponential backoff for retryable channel failures
//! - **Scheduling**: one periodic task per rule on a bounded worker pool,
//!   skipping ticks that overrun
//! - **Self-monitoring**: evaluation counters, degraded rules and a
//!   serializable [`HealthSnapshot`]
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::{TimeZone, Utc};
//! use vigil_alerts::{
//!     AlertManager, AlertManagerConfig, Diagnostics, Evaluator, EvaluatorConfig, Notifier,
//!     NotifierConfig, parse_rules,
//! };
//! use vigil_metrics::{LabelSet, MemorySource, SampleWindowStore};
//!
//! let rules = parse_rules(r#"{"rules": [{
//!     "name": "QueueBacklog",
//!     "expr": {"series": {"series": "queue_depth", "function": "last", "window": "5m"}},
//!     "operator": ">",
//!     "threshold": 100,
//!     "interval": "1m",
//!     "severity": "critical"
//! }]}"#).unwrap();
//! assert!(rules.is_clean());
//!
//! let source = MemorySource::new();
//! let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
//! source.push("queue_depth", LabelSet::new().with("queue", "jobs"), now.timestamp_millis(), 250.0);
//!
//! let evaluator = Evaluator::new(
//!     Arc::new(source),
//!     SampleWindowStore::default(),
//!     Diagnostics::default(),
//!     EvaluatorConfig::default(),
//! );
//! let notifier = Notifier::new(NotifierConfig::default(), Vec::new());
//! let manager = AlertManager::new(AlertManagerConfig::default(), evaluator, notifier);
//! manager.load(rules.rules, now);
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let outcome = runtime.block_on(manager.tick_rule("QueueBacklog", now)).unwrap();
//! assert_eq!(outcome.fired.len(), 1);
//! ```

#![forbid(unsafe_code)]
#![doc(html_root_url = "https://docs.rs/vigil-alerts/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backoff;
pub mod channels;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod evaluator;
pub mod manager;
pub mod notifier;
pub mod scheduler;
pub mod state;
pub mod template;
pub mod types;

// Re-export main types at crate root
pub use backoff::BackoffConfig;
pub use channels::{
    AlertPayload, ChannelConfig, LogChannel, NotificationChannel, WebhookChannel, WebhookConfig,
    WebhookFormat,
};
pub use config::{RuleFile, RuleSet, RuleSpec, load_rules_file, parse_duration, parse_rules};
pub use diagnostics::{Diagnostics, EvaluationDegraded, EvaluationStats, HealthSnapshot};
pub use error::{AlertError, ConfigError, DeliveryError, Result};
pub use evaluator::{Condition, EvalResult, Evaluator, EvaluatorConfig, RuleEvaluation};
pub use manager::{AlertManager, AlertManagerConfig, ReloadSummary, TickOutcome};
pub use notifier::{DeliveryAttempt, DeliveryOutcome, Notifier, NotifierConfig, NotifierStats};
pub use scheduler::{Clock, Scheduler, SchedulerConfig};
pub use state::{AlertTable, RuleInstance, StateCounts};
pub use types::{
    AlertState, ComparisonOperator, Expr, MAX_DURATION, NotificationEvent, Rule, RuleBuilder,
    RuleInstanceId, SeriesExpr, Severity, StateKind,
};
