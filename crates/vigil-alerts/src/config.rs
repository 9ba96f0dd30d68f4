//! Rule files and duration strings.
//!
//! A rule file is a JSON document with a `rules` array:
//!
//! ```json
//! {
//!   "rules": [
//!     {
//!       "name": "HighErrorRate",
//!       "expr": {
//!         "ratio": {
//!           "numerator": {"series": "http_requests_total", "matchers": [{"label": "status", "op": "=~", "value": "5.."}], "function": "rate", "window": "5m", "by": ["route"]},
//!           "denominator": {"series": "http_requests_total", "function": "rate", "window": "5m", "by": ["route"]}
//!         }
//!       },
//!       "operator": ">",
//!       "threshold": 0.05,
//!       "for": "10m",
//!       "interval": "1m",
//!       "severity": "critical",
//!       "annotations": {"summary": "{{ $labels.route }} error rate is {{ $value }}"}
//!     }
//!   ]
//! }
//! ```
//!
//! Each rule is decoded and validated on its own, so a malformed entry is
//! reported as a [`ConfigError`] while the remaining rules still load.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vigil_metrics::{Aggregation, LabelMatcher, SeriesName, SeriesSelector};

use crate::error::{AlertError, ConfigError, Result};
use crate::types::{ComparisonOperator, Expr, Rule, SeriesExpr, Severity};

static DURATION_PART: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d+)(ms|s|m|h|d)").ok());

/// Parses a duration string such as `"90s"`, `"10m"`, `"1h30m"` or `"500ms"`.
///
/// # Errors
///
/// Returns `AlertError::InvalidDuration` if the string is empty or contains
/// anything other than `<number><unit>` parts with units `ms`, `s`, `m`, `h`
/// or `d`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let invalid = |reason: &str| AlertError::InvalidDuration {
        reason: format!("'{s}': {reason}"),
    };

    let s_trimmed = s.trim();
    if s_trimmed.is_empty() {
        return Err(invalid("empty duration"));
    }
    if s_trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let re = DURATION_PART
        .as_ref()
        .ok_or_else(|| invalid("duration parser unavailable"))?;

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in re.captures_iter(s_trimmed) {
        let (Some(whole), Some(number), Some(unit)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            return Err(invalid("malformed duration"));
        };
        if whole.start() != consumed {
            return Err(invalid("unexpected characters"));
        }
        consumed = whole.end();

        let n: u64 = number
            .as_str()
            .parse()
            .map_err(|_| invalid("number out of range"))?;
        let part = match unit.as_str() {
            "ms" => Some(Duration::from_millis(n)),
            "s" => Some(Duration::from_secs(n)),
            "m" => n.checked_mul(60).map(Duration::from_secs),
            "h" => n.checked_mul(3600).map(Duration::from_secs),
            _ => n.checked_mul(86_400).map(Duration::from_secs),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| invalid("duration out of range"))?;
    }

    if consumed != s_trimmed.len() {
        return Err(invalid("expected <number><unit> with unit ms, s, m, h or d"));
    }
    Ok(total)
}

/// Formats a duration in the form accepted by [`parse_duration`].
#[must_use]
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d.subsec_millis() != 0 || d.as_secs() == 0 {
        return format!("{}ms", d.as_millis());
    }

    let mut secs = d.as_secs();
    let mut out = String::new();
    for (unit, size) in [("h", 3600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{unit}", secs / size));
            secs %= size;
        }
    }
    out
}

/// Serde support for [`Duration`] fields written as duration strings.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes a duration as a string like `"1h30m"`.
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    /// Deserializes a duration string.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// A series expression as written in a rule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeriesSpec {
    /// Series name.
    pub series: SeriesName,
    /// Label matchers.
    #[serde(default)]
    pub matchers: Vec<LabelMatcher>,
    /// Window function.
    pub function: Aggregation,
    /// Window length.
    #[serde(with = "duration_str")]
    pub window: Duration,
    /// Minimum samples in the window.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Grouping labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<Vec<String>>,
}

const fn default_min_samples() -> usize {
    1
}

impl From<SeriesSpec> for SeriesExpr {
    fn from(spec: SeriesSpec) -> Self {
        let mut selector = SeriesSelector::new(spec.series);
        selector.matchers = spec.matchers;
        Self {
            selector,
            function: spec.function,
            window: spec.window,
            min_samples: spec.min_samples,
            by: spec.by,
        }
    }
}

impl From<&SeriesExpr> for SeriesSpec {
    fn from(expr: &SeriesExpr) -> Self {
        Self {
            series: expr.selector.name.clone(),
            matchers: expr.selector.matchers.clone(),
            function: expr.function,
            window: expr.window,
            min_samples: expr.min_samples,
            by: expr.by.clone(),
        }
    }
}

/// A rule expression as written in a rule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExprSpec {
    /// A single series expression.
    Series(SeriesSpec),
    /// A ratio of two series expressions.
    Ratio {
        /// The dividend.
        numerator: SeriesSpec,
        /// The divisor.
        denominator: SeriesSpec,
    },
}

/// A rule as written in a rule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    /// Unique rule name.
    pub name: String,
    /// The evaluated expression.
    pub expr: ExprSpec,
    /// Comparison operator.
    pub operator: ComparisonOperator,
    /// Threshold.
    pub threshold: f64,
    /// Required continuous duration.
    #[serde(rename = "for", with = "duration_str", default)]
    pub for_duration: Duration,
    /// Evaluation interval.
    #[serde(with = "duration_str", default = "default_interval")]
    pub interval: Duration,
    /// Severity.
    #[serde(default)]
    pub severity: Severity,
    /// Rule labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotation templates.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

const fn default_interval() -> Duration {
    Rule::DEFAULT_INTERVAL
}

impl RuleSpec {
    /// Validates the entry and builds a [`Rule`].
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidRule` if the rule fails validation.
    pub fn into_rule(self) -> Result<Rule> {
        let expr = match self.expr {
            ExprSpec::Series(spec) => Expr::Series(spec.into()),
            ExprSpec::Ratio {
                numerator,
                denominator,
            } => Expr::Ratio {
                numerator: numerator.into(),
                denominator: denominator.into(),
            },
        };

        Rule::builder(self.name, expr)
            .condition(self.operator, self.threshold)
            .for_duration(self.for_duration)
            .interval(self.interval)
            .severity(self.severity)
            .labels(self.labels)
            .annotations(self.annotations)
            .build()
    }
}

impl From<&Rule> for RuleSpec {
    fn from(rule: &Rule) -> Self {
        let expr = match &rule.expr {
            Expr::Series(e) => ExprSpec::Series(e.into()),
            Expr::Ratio {
                numerator,
                denominator,
            } => ExprSpec::Ratio {
                numerator: numerator.into(),
                denominator: denominator.into(),
            },
        };
        Self {
            name: rule.name.clone(),
            expr,
            operator: rule.operator,
            threshold: rule.threshold,
            for_duration: rule.for_duration,
            interval: rule.interval,
            severity: rule.severity,
            labels: rule.labels.clone(),
            annotations: rule.annotations.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRuleFile {
    rules: Vec<serde_json::Value>,
}

/// A rule file written back out, used to generate samples.
#[derive(Debug, Serialize)]
pub struct RuleFile {
    /// The rules.
    pub rules: Vec<RuleSpec>,
}

/// The outcome of loading a rule file.
#[derive(Debug, Default)]
pub struct RuleSet {
    /// Rules that passed validation, in file order.
    pub rules: Vec<Rule>,
    /// One entry per rejected rule.
    pub errors: Vec<ConfigError>,
}

impl RuleSet {
    /// Returns true if every rule loaded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Parses a rule document.
///
/// Each entry is decoded and validated independently; duplicate names reject
/// every occurrence after the first.
///
/// # Errors
///
/// Returns `AlertError::SerializationError` only if the document itself is
/// not a JSON object with a `rules` array.
pub fn parse_rules(json: &str) -> Result<RuleSet> {
    let raw: RawRuleFile = serde_json::from_str(json)?;
    let mut set = RuleSet::default();
    let mut seen = HashSet::new();

    for (index, value) in raw.rules.into_iter().enumerate() {
        let name = value
            .get("name")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        let rule = serde_json::from_value::<RuleSpec>(value)
            .map_err(AlertError::from)
            .and_then(RuleSpec::into_rule);

        match rule {
            Ok(rule) if !seen.insert(rule.name.clone()) => {
                set.errors.push(ConfigError::new(index, name, "duplicate rule name"));
            }
            Ok(rule) => set.rules.push(rule),
            Err(e) => set.errors.push(ConfigError::new(index, name, e.to_string())),
        }
    }

    Ok(set)
}

/// Reads and parses a rule file, logging each rejected rule.
///
/// # Errors
///
/// Returns `AlertError::Io` if the file cannot be read, or
/// `AlertError::SerializationError` if it is not a rule document.
pub fn load_rules_file(path: impl AsRef<Path>) -> Result<RuleSet> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| AlertError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let set = parse_rules(&content)?;
    for err in &set.errors {
        warn!(
            path = %path.display(),
            index = err.index,
            rule = err.name.as_deref().unwrap_or("<unnamed>"),
            reason = %err.reason,
            "rejected rule"
        );
    }
    info!(
        path = %path.display(),
        loaded = set.rules.len(),
        rejected = set.errors.len(),
        "loaded rule file"
    );
    Ok(set)
}
