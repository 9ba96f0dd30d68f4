//! Core types for samples, label sets and series selection.
//!
//! - [`Sample`]: a single timestamped value
//! - [`LabelSet`]: an ordered set of label name/value pairs
//! - [`SeriesName`]: a validated series name
//! - [`LabelMatcher`] and [`SeriesSelector`]: series selection
//! - [`TimeRange`]: an inclusive time range for queries
//! - [`Aggregation`]: functions applied over a window of samples

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};

/// A single sample of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// The sampled value.
    pub value: f64,
}

impl Sample {
    /// Creates a new sample.
    #[must_use]
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Returns the current timestamp in milliseconds.
    #[must_use]
    pub fn now_timestamp() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A sample together with the label set of the series it belongs to.
///
/// This is the unit returned by a metric source query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSample {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// The sampled value.
    pub value: f64,
    /// Labels identifying the series.
    pub labels: LabelSet,
}

impl SeriesSample {
    /// Creates a new series sample.
    #[must_use]
    pub const fn new(timestamp: i64, value: f64, labels: LabelSet) -> Self {
        Self {
            timestamp,
            value,
            labels,
        }
    }

    /// Returns the bare sample.
    #[must_use]
    pub const fn sample(&self) -> Sample {
        Sample::new(self.timestamp, self.value)
    }
}

/// An ordered set of labels.
///
/// Ordering makes label sets usable as map keys and gives them a stable
/// textual form, `{a="1",b="2"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Creates an empty label set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds a label and returns self for chaining.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Inserts a label, returning the previous value if any.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    /// Returns the value of a label.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Returns true if there are no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over labels in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a label set containing only the given label names.
    ///
    /// Names missing from this set are omitted.
    #[must_use]
    pub fn project(&self, names: &[String]) -> Self {
        Self(
            names
                .iter()
                .filter_map(|n| self.0.get(n).map(|v| (n.clone(), v.clone())))
                .collect(),
        )
    }

    /// Merges `other` into this set; labels in `other` win.
    pub fn extend(&mut self, other: &Self) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Returns the labels as a plain map.
    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v:?}")?;
        }
        f.write_str("}")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<BTreeMap<String, String>> for LabelSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// A validated series name.
///
/// Series names must:
/// - Be non-empty
/// - Contain only alphanumeric characters, underscores, and colons
/// - Start with a letter, underscore or colon
/// - Be at most 256 characters long
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SeriesName(String);

impl SeriesName {
    /// Maximum allowed length for a series name.
    pub const MAX_LENGTH: usize = 256;

    /// Creates a new validated series name.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidSeriesName` if the name is invalid.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(MetricsError::InvalidSeriesName {
                reason: "series name cannot be empty".to_string(),
            });
        }

        if name.len() > Self::MAX_LENGTH {
            return Err(MetricsError::InvalidSeriesName {
                reason: format!(
                    "series name exceeds maximum length of {} characters",
                    Self::MAX_LENGTH
                ),
            });
        }

        if let Some(c) = name.chars().next() {
            if !c.is_ascii_alphabetic() && c != '_' && c != ':' {
                return Err(MetricsError::InvalidSeriesName {
                    reason: "series name must start with a letter, underscore or colon"
                        .to_string(),
                });
            }
        }

        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != ':')
        {
            return Err(MetricsError::InvalidSeriesName {
                reason: format!("invalid character '{c}' in series name"),
            });
        }

        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SeriesName {
    type Error = MetricsError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SeriesName> for String {
    fn from(name: SeriesName) -> Self {
        name.0
    }
}

impl fmt::Display for SeriesName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SeriesName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// How a label matcher compares a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOp {
    /// Value equals (`=`).
    #[serde(rename = "=")]
    Equal,
    /// Value differs (`!=`).
    #[serde(rename = "!=")]
    NotEqual,
    /// Value matches the regular expression (`=~`).
    #[serde(rename = "=~")]
    Regex,
    /// Value does not match the regular expression (`!~`).
    #[serde(rename = "!~")]
    NotRegex,
}

impl MatchOp {
    /// Returns the operator symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        }
    }
}

/// Serialized form of a [`LabelMatcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawMatcher {
    label: String,
    #[serde(default = "default_match_op")]
    op: MatchOp,
    value: String,
}

const fn default_match_op() -> MatchOp {
    MatchOp::Equal
}

/// A matcher on a single label.
///
/// A missing label is treated as the empty string, so `status!="500"` matches
/// series without a `status` label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawMatcher", into = "RawMatcher")]
pub struct LabelMatcher {
    label: String,
    op: MatchOp,
    value: String,
    regex: Option<Regex>,
}

impl LabelMatcher {
    /// Creates a new matcher. Regular expressions are fully anchored.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidMatcher` if the label is empty or the
    /// regular expression does not compile.
    pub fn new(label: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let value = value.into();

        if label.is_empty() {
            return Err(MetricsError::InvalidMatcher {
                label,
                reason: "label name cannot be empty".to_string(),
            });
        }

        let regex = match op {
            MatchOp::Regex | MatchOp::NotRegex => Some(
                Regex::new(&format!("^(?:{value})$")).map_err(|e| MetricsError::InvalidMatcher {
                    label: label.clone(),
                    reason: e.to_string(),
                })?,
            ),
            MatchOp::Equal | MatchOp::NotEqual => None,
        };

        Ok(Self {
            label,
            op,
            value,
            regex,
        })
    }

    /// Shorthand for an equality matcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the label name is empty.
    pub fn equal(label: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new(label, MatchOp::Equal, value)
    }

    /// Returns the label name.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the match operator.
    #[must_use]
    pub const fn op(&self) -> MatchOp {
        self.op
    }

    /// Returns the configured value or pattern.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Checks the matcher against a label set.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        let actual = labels.get(&self.label).unwrap_or("");
        match self.op {
            MatchOp::Equal => actual == self.value,
            MatchOp::NotEqual => actual != self.value,
            MatchOp::Regex => self.regex.as_ref().is_some_and(|re| re.is_match(actual)),
            MatchOp::NotRegex => self.regex.as_ref().is_some_and(|re| !re.is_match(actual)),
        }
    }
}

impl PartialEq for LabelMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label && self.op == other.op && self.value == other.value
    }
}

impl TryFrom<RawMatcher> for LabelMatcher {
    type Error = MetricsError;

    fn try_from(raw: RawMatcher) -> Result<Self> {
        Self::new(raw.label, raw.op, raw.value)
    }
}

impl From<LabelMatcher> for RawMatcher {
    fn from(m: LabelMatcher) -> Self {
        Self {
            label: m.label,
            op: m.op,
            value: m.value,
        }
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.label, self.op.as_symbol(), self.value)
    }
}

/// Selects the series of one name whose labels satisfy every matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSelector {
    /// The series name.
    pub name: SeriesName,
    /// Label matchers; all must match.
    #[serde(default)]
    pub matchers: Vec<LabelMatcher>,
}

impl SeriesSelector {
    /// Creates a selector with no label matchers.
    #[must_use]
    pub const fn new(name: SeriesName) -> Self {
        Self {
            name,
            matchers: Vec::new(),
        }
    }

    /// Adds a matcher and returns self for chaining.
    #[must_use]
    pub fn matching(mut self, matcher: LabelMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Checks whether a label set is selected.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.matchers.iter().all(|m| m.matches(labels))
    }
}

impl fmt::Display for SeriesSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.matchers.is_empty() {
            f.write_str("{")?;
            for (i, m) in self.matchers.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{m}")?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

/// A time range for queries.
///
/// Both start and end are inclusive Unix timestamps in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds.
    pub start: i64,
    /// End timestamp (inclusive), in milliseconds.
    pub end: i64,
}

impl TimeRange {
    /// Creates a new time range.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidTimeRange` if start > end.
    pub const fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(MetricsError::InvalidTimeRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Creates the range `[end - window, end]`.
    #[must_use]
    pub const fn ending_at(end: i64, window: Duration) -> Self {
        Self {
            start: end.saturating_sub(duration_to_millis(window)),
            end,
        }
    }

    /// Returns the duration of this time range in milliseconds.
    #[must_use]
    pub const fn duration_millis(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// Checks if a timestamp falls within this range (inclusive).
    #[must_use]
    pub const fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

/// Converts a `Duration` to whole milliseconds, saturating at `i64::MAX`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn duration_to_millis(duration: Duration) -> i64 {
    let millis = duration.as_millis();
    if millis > i64::MAX as u128 {
        i64::MAX
    } else {
        millis as i64
    }
}

/// Aggregation functions applied over a window of samples.
///
/// Serialized as a lowercase name (`"rate"`), or `{"percentile": 99}` for
/// percentiles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Sum of all values.
    Sum,
    /// Average (mean) of all values.
    Avg,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
    /// Last (most recent) value.
    Last,
    /// Count of samples.
    Count,
    /// Per-second increase of a counter, tolerating counter resets.
    Rate,
    /// The given percentile (0–100) of the values, linearly interpolated.
    Percentile(f64),
}

impl Aggregation {
    /// Validates the aggregation parameters.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidAggregation` for a percentile outside 0–100.
    pub fn validate(&self) -> Result<()> {
        if let Self::Percentile(p) = self {
            if !(0.0..=100.0).contains(p) {
                return Err(MetricsError::InvalidAggregation {
                    reason: format!("percentile must be within 0..=100, got {p}"),
                });
            }
        }
        Ok(())
    }

    /// The smallest number of samples this function can work with.
    #[must_use]
    pub const fn required_samples(&self) -> usize {
        match self {
            Self::Rate => 2,
            _ => 1,
        }
    }

    /// Applies the aggregation to timestamp-ordered samples.
    ///
    /// Returns `None` if there are not enough samples.
    #[must_use]
    pub fn apply(&self, samples: &[Sample]) -> Option<f64> {
        if samples.len() < self.required_samples() {
            return None;
        }

        let values = samples.iter().map(|s| s.value);
        match self {
            Self::Sum => Some(values.sum()),
            Self::Avg => Some(values.sum::<f64>() / samples.len() as f64),
            Self::Min => values.reduce(f64::min),
            Self::Max => values.reduce(f64::max),
            Self::Last => samples.last().map(|s| s.value),
            Self::Count => Some(samples.len() as f64),
            Self::Rate => rate(samples),
            Self::Percentile(p) => percentile(values.collect(), *p),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => f.write_str("sum"),
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Last => f.write_str("last"),
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Percentile(p) => write!(f, "percentile({p})"),
        }
    }
}

fn rate(samples: &[Sample]) -> Option<f64> {
    let first = samples.first()?;
    let last = samples.last()?;
    let elapsed_secs = (last.timestamp - first.timestamp) as f64 / 1000.0;
    if elapsed_secs <= 0.0 {
        return None;
    }

    // A drop in value means the counter restarted from zero.
    let increase: f64 = samples
        .windows(2)
        .map(|w| {
            if w[1].value < w[0].value {
                w[1].value
            } else {
                w[1].value - w[0].value
            }
        })
        .sum();

    Some(increase / elapsed_secs)
}

fn percentile(mut values: Vec<f64>, p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);

    let rank = (p / 100.0) * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(values[lower] + (values[upper] - values[lower]) * weight)
}
