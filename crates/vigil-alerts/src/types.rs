//! Core types for the alerting system.
//!
//! This module provides the fundamental types used throughout the vigil-alerts crate:
//! - [`Severity`]: The severity level of an alert
//! - [`AlertState`]: The lifecycle state of a rule instance
//! - [`ComparisonOperator`]: Operators for comparing values against thresholds
//! - [`Expr`]: The series expression a rule evaluates
//! - [`Rule`]: A threshold-and-duration alerting rule
//! - [`RuleInstanceId`]: The identity of one `(rule, label set)` pair
//! - [`NotificationEvent`]: A Firing or Resolved transition queued for delivery

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_metrics::{Aggregation, LabelSet, SeriesSelector};

use crate::error::{AlertError, Result};

/// Longest accepted interval, `for` duration or window: 365 days.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 86_400);

/// The severity level of an alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational alert, no action required.
    Info,
    /// Warning alert, should be investigated.
    #[default]
    Warning,
    /// Critical alert, requires immediate attention.
    Critical,
}

impl Severity {
    /// Returns the severity as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lifecycle state of a rule instance.
///
/// `Resolved` is a marker: an instance that resolves is recorded as
/// `Resolved` for the transition and stored as `Inactive` right after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum AlertState {
    /// The condition is false.
    Inactive,
    /// The condition is true but has not held for the rule's `for` duration.
    Pending {
        /// When the condition became true.
        since: DateTime<Utc>,
    },
    /// The condition has held for at least the rule's `for` duration.
    Firing {
        /// When the alert started firing.
        since: DateTime<Utc>,
    },
    /// The alert stopped firing.
    Resolved {
        /// When the alert resolved.
        at: DateTime<Utc>,
    },
}

impl AlertState {
    /// Returns the state without its timestamp.
    #[must_use]
    pub const fn kind(&self) -> StateKind {
        match self {
            Self::Inactive => StateKind::Inactive,
            Self::Pending { .. } => StateKind::Pending,
            Self::Firing { .. } => StateKind::Firing,
            Self::Resolved { .. } => StateKind::Resolved,
        }
    }

    /// Returns true if the alert is pending or firing.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending { .. } | Self::Firing { .. })
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => f.write_str("inactive"),
            Self::Pending { since } => write!(f, "pending since {since}"),
            Self::Firing { since } => write!(f, "firing since {since}"),
            Self::Resolved { at } => write!(f, "resolved at {at}"),
        }
    }
}

/// An [`AlertState`] without its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// See [`AlertState::Inactive`].
    Inactive,
    /// See [`AlertState::Pending`].
    Pending,
    /// See [`AlertState::Firing`].
    Firing,
    /// See [`AlertState::Resolved`].
    Resolved,
}

impl StateKind {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Pending => "pending",
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison operators for alert conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    /// Greater than (>).
    #[serde(rename = ">")]
    GreaterThan,
    /// Greater than or equal (>=).
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    /// Less than (<).
    #[serde(rename = "<")]
    LessThan,
    /// Less than or equal (<=).
    #[serde(rename = "<=")]
    LessThanOrEqual,
    /// Equal (==).
    #[serde(rename = "==")]
    Equal,
    /// Not equal (!=).
    #[serde(rename = "!=")]
    NotEqual,
}

impl ComparisonOperator {
    /// Evaluates the comparison between two values.
    ///
    /// Any comparison involving NaN is false.
    #[must_use]
    pub fn evaluate(&self, left: f64, right: f64) -> bool {
        if left.is_nan() || right.is_nan() {
            return false;
        }
        match self {
            Self::GreaterThan => left > right,
            Self::GreaterThanOrEqual => left >= right,
            Self::LessThan => left < right,
            Self::LessThanOrEqual => left <= right,
            Self::Equal => (left - right).abs() < f64::EPSILON,
            Self::NotEqual => (left - right).abs() >= f64::EPSILON,
        }
    }

    /// Returns the operator as a string symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::GreaterThanOrEqual => ">=",
            Self::LessThan => "<",
            Self::LessThanOrEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_symbol())
    }
}

/// A window function applied to the samples of selected series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesExpr {
    /// The series and label matchers to select.
    pub selector: SeriesSelector,
    /// The function applied over the window.
    pub function: Aggregation,
    /// How far back from the evaluation time samples are considered.
    pub window: Duration,
    /// Fewer samples than this in the window yields no data.
    pub min_samples: usize,
    /// Label names defining instance identity. `None` means every distinct
    /// label set is its own instance.
    pub by: Option<Vec<String>>,
}

impl SeriesExpr {
    /// Creates an expression with `min_samples = 1` and no grouping.
    #[must_use]
    pub const fn new(selector: SeriesSelector, function: Aggregation, window: Duration) -> Self {
        Self {
            selector,
            function,
            window,
            min_samples: 1,
            by: None,
        }
    }

    /// Sets the minimum sample count.
    #[must_use]
    pub const fn min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Groups series by the given label names.
    #[must_use]
    pub fn by<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Validates the expression.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRule` for a zero window or one longer than
    /// [`MAX_DURATION`], a zero sample minimum, an empty grouping label, or
    /// invalid function parameters.
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(AlertError::InvalidRule {
                reason: format!("window of {} must be positive", self.selector),
            });
        }
        if self.window > MAX_DURATION {
            return Err(AlertError::InvalidRule {
                reason: format!("window of {} exceeds 365d", self.selector),
            });
        }
        if self.min_samples == 0 {
            return Err(AlertError::InvalidRule {
                reason: "min_samples must be at least 1".to_string(),
            });
        }
        if let Some(by) = &self.by {
            if by.iter().any(String::is_empty) {
                return Err(AlertError::InvalidRule {
                    reason: "grouping label names cannot be empty".to_string(),
                });
            }
        }
        self.function.validate()?;
        Ok(())
    }
}

impl fmt::Display for SeriesExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}[{}s])", self.function, self.selector, self.window.as_secs())?;
        if let Some(by) = &self.by {
            write!(f, " by ({})", by.join(","))?;
        }
        Ok(())
    }
}

/// The expression a rule compares against its threshold.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A single windowed series expression.
    Series(SeriesExpr),
    /// Two series expressions divided per label set.
    Ratio {
        /// The dividend.
        numerator: SeriesExpr,
        /// The divisor; zero or missing yields no data.
        denominator: SeriesExpr,
    },
}

impl Expr {
    /// Returns every series expression the rule reads.
    #[must_use]
    pub fn parts(&self) -> Vec<&SeriesExpr> {
        match self {
            Self::Series(expr) => vec![expr],
            Self::Ratio {
                numerator,
                denominator,
            } => vec![numerator, denominator],
        }
    }

    /// Validates every part of the expression.
    ///
    /// # Errors
    ///
    /// Returns the first validation error of any part.
    pub fn validate(&self) -> Result<()> {
        self.parts().into_iter().try_for_each(SeriesExpr::validate)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Series(expr) => write!(f, "{expr}"),
            Self::Ratio {
                numerator,
                denominator,
            } => write!(f, "{numerator} / {denominator}"),
        }
    }
}

/// A threshold-and-duration alerting rule.
///
/// Rules are immutable once loaded and keyed by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Unique rule name.
    pub name: String,
    /// The evaluated expression.
    pub expr: Expr,
    /// How the expression value is compared to the threshold.
    pub operator: ComparisonOperator,
    /// The threshold.
    pub threshold: f64,
    /// How long the condition must hold continuously before firing.
    pub for_duration: Duration,
    /// How often the rule is evaluated.
    pub interval: Duration,
    /// Severity of alerts raised by this rule.
    pub severity: Severity,
    /// Labels attached to every alert of this rule.
    pub labels: BTreeMap<String, String>,
    /// Annotation templates; see [`crate::template`].
    pub annotations: BTreeMap<String, String>,
}

impl Rule {
    /// Maximum allowed length for rule names.
    pub const MAX_NAME_LENGTH: usize = 256;

    /// Default evaluation interval.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

    /// Creates a new rule builder.
    pub fn builder(name: impl Into<String>, expr: Expr) -> RuleBuilder {
        RuleBuilder::new(name, expr)
    }

    /// Checks the condition for a value.
    #[must_use]
    pub fn condition(&self, value: f64) -> bool {
        self.operator.evaluate(value, self.threshold)
    }
}

/// Builder for creating [`Rule`] instances.
#[derive(Debug)]
pub struct RuleBuilder {
    name: String,
    expr: Expr,
    operator: ComparisonOperator,
    threshold: f64,
    for_duration: Duration,
    interval: Duration,
    severity: Severity,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
}

impl RuleBuilder {
    /// Creates a new builder with required fields.
    fn new(name: impl Into<String>, expr: Expr) -> Self {
        Self {
            name: name.into(),
            expr,
            operator: ComparisonOperator::GreaterThan,
            threshold: 0.0,
            for_duration: Duration::ZERO,
            interval: Rule::DEFAULT_INTERVAL,
            severity: Severity::Warning,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Sets the comparison operator and threshold.
    #[must_use]
    pub const fn condition(mut self, operator: ComparisonOperator, threshold: f64) -> Self {
        self.operator = operator;
        self.threshold = threshold;
        self
    }

    /// Sets the duration the condition must hold before firing.
    #[must_use]
    pub const fn for_duration(mut self, duration: Duration) -> Self {
        self.for_duration = duration;
        self
    }

    /// Sets the evaluation interval.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the severity level.
    #[must_use]
    pub const fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Adds a label to the rule.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds multiple labels to the rule.
    #[must_use]
    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// Adds an annotation to the rule.
    #[must_use]
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Adds multiple annotations to the rule.
    #[must_use]
    pub fn annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations.extend(annotations);
        self
    }

    /// Builds the [`Rule`].
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRule` if:
    /// - The name is empty or exceeds the maximum length
    /// - The interval is zero
    /// - The interval or `for` duration exceeds [`MAX_DURATION`]
    /// - The threshold is NaN
    /// - The expression is invalid
    pub fn build(self) -> Result<Rule> {
        if self.name.is_empty() {
            return Err(AlertError::InvalidRule {
                reason: "rule name cannot be empty".to_string(),
            });
        }

        if self.name.len() > Rule::MAX_NAME_LENGTH {
            return Err(AlertError::InvalidRule {
                reason: format!(
                    "rule name exceeds maximum length of {} characters",
                    Rule::MAX_NAME_LENGTH
                ),
            });
        }

        if self.interval.is_zero() {
            return Err(AlertError::InvalidRule {
                reason: "interval must be positive".to_string(),
            });
        }

        if self.interval > MAX_DURATION || self.for_duration > MAX_DURATION {
            return Err(AlertError::InvalidRule {
                reason: "interval and for duration must not exceed 365d".to_string(),
            });
        }

        if self.threshold.is_nan() {
            return Err(AlertError::InvalidRule {
                reason: "threshold cannot be NaN".to_string(),
            });
        }

        self.expr.validate()?;

        Ok(Rule {
            name: self.name,
            expr: self.expr,
            operator: self.operator,
            threshold: self.threshold,
            for_duration: self.for_duration,
            interval: self.interval,
            severity: self.severity,
            labels: self.labels,
            annotations: self.annotations,
        })
    }
}

/// Identity of a rule instance: `RuleName{k1="v1",k2="v2"}`.
///
/// Label names are sorted, so the identifier is deterministic. An instance
/// with no labels is identified by the bare rule name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleInstanceId(String);

impl RuleInstanceId {
    /// Creates the identifier of `rule_name` for `labels`.
    #[must_use]
    pub fn new(rule_name: &str, labels: &LabelSet) -> Self {
        if labels.is_empty() {
            Self(rule_name.to_string())
        } else {
            Self(format!("{rule_name}{labels}"))
        }
    }

    /// Returns the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A Firing or Resolved transition of a rule instance, queued for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Unique event ID.
    pub id: Uuid,
    /// The instance that transitioned.
    pub rule_instance_id: RuleInstanceId,
    /// The rule name.
    pub rule_name: String,
    /// Rule labels merged with the instance labels.
    pub labels: LabelSet,
    /// Severity copied from the rule.
    pub severity: Severity,
    /// The value that caused the transition, if there was one.
    pub value: Option<f64>,
    /// The state before the transition.
    pub from_state: StateKind,
    /// The state after the transition.
    pub to_state: StateKind,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
    /// Expanded annotations.
    pub annotations: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use vigil_metrics::SeriesName;

    fn selector(name: &str) -> SeriesSelector {
        SeriesSelector::new(SeriesName::new(name).unwrap())
    }

    fn expr() -> Expr {
        Expr::Series(SeriesExpr::new(
            selector("errors_total"),
            Aggregation::Rate,
            Duration::from_secs(300),
        ))
    }

    mod severity_tests {
        use super::*;

        #[test]
        fn test_severity_as_str() {
            assert_eq!(Severity::Info.as_str(), "info");
            assert_eq!(Severity::Warning.as_str(), "warning");
            assert_eq!(Severity::Critical.as_str(), "critical");
        }

        #[test]
        fn test_severity_default() {
            assert_eq!(Severity::default(), Severity::Warning);
        }

        #[test]
        fn test_severity_serialization() {
            let json = serde_json::to_string(&Severity::Critical).unwrap();
            assert_eq!(json, "\"critical\"");
            let parsed: Severity = serde_json::from_str("\"info\"").unwrap();
            assert_eq!(parsed, Severity::Info);
        }
    }

    mod state_tests {
        use super::*;

        #[test]
        fn test_kinds() {
            let now = Utc::now();
            assert_eq!(AlertState::Inactive.kind(), StateKind::Inactive);
            assert_eq!(AlertState::Pending { since: now }.kind(), StateKind::Pending);
            assert_eq!(AlertState::Firing { since: now }.kind(), StateKind::Firing);
            assert_eq!(AlertState::Resolved { at: now }.kind(), StateKind::Resolved);
        }

        #[test]
        fn test_is_active() {
            let now = Utc::now();
            assert!(!AlertState::Inactive.is_active());
            assert!(AlertState::Pending { since: now }.is_active());
            assert!(AlertState::Firing { since: now }.is_active());
            assert!(!AlertState::Resolved { at: now }.is_active());
        }

        #[test]
        fn test_state_kind_display() {
            assert_eq!(StateKind::Firing.to_string(), "firing");
            assert_eq!(
                serde_json::to_string(&StateKind::Resolved).unwrap(),
                "\"resolved\""
            );
        }
    }

    mod operator_tests {
        use super::*;
        use test_case::test_case;

        #[test_case(ComparisonOperator::GreaterThan, 10.0, 5.0 => true)]
        #[test_case(ComparisonOperator::GreaterThan, 5.0, 5.0 => false)]
        #[test_case(ComparisonOperator::GreaterThanOrEqual, 5.0, 5.0 => true)]
        #[test_case(ComparisonOperator::LessThan, 4.0, 5.0 => true)]
        #[test_case(ComparisonOperator::LessThan, 5.0, 5.0 => false)]
        #[test_case(ComparisonOperator::LessThanOrEqual, 5.0, 5.0 => true)]
        #[test_case(ComparisonOperator::Equal, 0.05, 0.05 => true)]
        #[test_case(ComparisonOperator::Equal, 0.05, 0.06 => false)]
        #[test_case(ComparisonOperator::NotEqual, 1.0, 2.0 => true)]
        #[test_case(ComparisonOperator::GreaterThan, f64::NAN, 0.0 => false)]
        #[test_case(ComparisonOperator::NotEqual, f64::NAN, 0.0 => false)]
        fn test_evaluate(op: ComparisonOperator, left: f64, right: f64) -> bool {
            op.evaluate(left, right)
        }

        #[test]
        fn test_operator_serialization() {
            let json = serde_json::to_string(&ComparisonOperator::GreaterThanOrEqual).unwrap();
            assert_eq!(json, "\">=\"");
            let parsed: ComparisonOperator = serde_json::from_str("\"<\"").unwrap();
            assert_eq!(parsed, ComparisonOperator::LessThan);
        }
    }

    mod expr_tests {
        use super::*;

        #[test]
        fn test_display() {
            let e = SeriesExpr::new(selector("latency"), Aggregation::Percentile(99.0), Duration::from_secs(600))
                .by(["route"]);
            assert_eq!(e.to_string(), "percentile(99)(latency[600s]) by (route)");
        }

        #[test]
        fn test_ratio_parts() {
            let ratio = Expr::Ratio {
                numerator: SeriesExpr::new(selector("errors_total"), Aggregation::Rate, Duration::from_secs(300)),
                denominator: SeriesExpr::new(selector("requests_total"), Aggregation::Rate, Duration::from_secs(300)),
            };
            assert_eq!(ratio.parts().len(), 2);
            assert!(ratio.validate().is_ok());
        }

        #[test]
        fn test_zero_window_rejected() {
            let e = SeriesExpr::new(selector("up"), Aggregation::Last, Duration::ZERO);
            assert!(e.validate().is_err());
        }

        #[test]
        fn test_zero_min_samples_rejected() {
            let e = SeriesExpr::new(selector("up"), Aggregation::Last, Duration::from_secs(60)).min_samples(0);
            assert!(e.validate().is_err());
        }

        #[test]
        fn test_window_over_a_year_rejected() {
            let e = SeriesExpr::new(selector("up"), Aggregation::Last, MAX_DURATION + Duration::from_secs(1));
            assert!(matches!(e.validate(), Err(AlertError::InvalidRule { .. })));
            let e = SeriesExpr::new(selector("up"), Aggregation::Last, MAX_DURATION);
            assert!(e.validate().is_ok());
        }

        #[test]
        fn test_bad_percentile_rejected() {
            let e = SeriesExpr::new(selector("up"), Aggregation::Percentile(101.0), Duration::from_secs(60));
            assert!(matches!(e.validate(), Err(AlertError::MetricsError(_))));
        }
    }

    mod rule_tests {
        use super::*;

        #[test]
        fn test_builder_basic() {
            let rule = Rule::builder("HighErrorRate", expr())
                .condition(ComparisonOperator::GreaterThan, 0.05)
                .for_duration(Duration::from_secs(600))
                .severity(Severity::Critical)
                .label("team", "web")
                .annotation("summary", "error rate is {{ $value }}")
                .build()
                .unwrap();

            assert_eq!(rule.name, "HighErrorRate");
            assert_eq!(rule.interval, Rule::DEFAULT_INTERVAL);
            assert_eq!(rule.for_duration, Duration::from_secs(600));
            assert_eq!(rule.labels.get("team").map(String::as_str), Some("web"));
            assert!(rule.condition(0.06));
            assert!(!rule.condition(0.05));
        }

        #[test]
        fn test_builder_empty_name() {
            let result = Rule::builder("", expr()).build();
            assert!(matches!(result, Err(AlertError::InvalidRule { .. })));
        }

        #[test]
        fn test_builder_name_too_long() {
            let long_name = "x".repeat(Rule::MAX_NAME_LENGTH + 1);
            assert!(Rule::builder(long_name, expr()).build().is_err());
        }

        #[test]
        fn test_builder_zero_interval() {
            let result = Rule::builder("r", expr()).interval(Duration::ZERO).build();
            assert!(result.is_err());
        }

        #[test]
        fn test_builder_rejects_durations_over_a_year() {
            let too_long = MAX_DURATION + Duration::from_secs(1);
            let result = Rule::builder("r", expr()).interval(too_long).build();
            assert!(matches!(result, Err(AlertError::InvalidRule { .. })));

            let result = Rule::builder("r", expr()).for_duration(too_long).build();
            assert!(matches!(result, Err(AlertError::InvalidRule { .. })));

            let rule = Rule::builder("r", expr())
                .interval(MAX_DURATION)
                .for_duration(MAX_DURATION)
                .build();
            assert!(rule.is_ok());
        }

        #[test]
        fn test_builder_nan_threshold() {
            let result = Rule::builder("r", expr())
                .condition(ComparisonOperator::GreaterThan, f64::NAN)
                .build();
            assert!(result.is_err());
        }
    }

    mod instance_id_tests {
        use super::*;

        #[test]
        fn test_format_sorted_labels() {
            let labels = LabelSet::new().with("status", "500").with("route", "/login");
            let id = RuleInstanceId::new("HighErrorRate", &labels);
            assert_eq!(id.as_str(), r#"HighErrorRate{route="/login",status="500"}"#);
        }

        #[test]
        fn test_no_labels() {
            let id = RuleInstanceId::new("Heartbeat", &LabelSet::new());
            assert_eq!(id.to_string(), "Heartbeat");
        }

        #[test]
        fn test_deterministic() {
            let a = LabelSet::new().with("a", "1").with("b", "2");
            let b = LabelSet::new().with("b", "2").with("a", "1");
            assert_eq!(RuleInstanceId::new("R", &a), RuleInstanceId::new("R", &b));
        }
    }
}
