//! Rule evaluation: refresh the window store from the metric source and
//! compute a condition per rule instance.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use vigil_metrics::{
    LabelSet, MetricSource, QueryError, SampleWindowStore, TimeRange, WindowValue, duration_to_millis,
    ratio,
};

use crate::config::duration_str;
use crate::diagnostics::{DEFAULT_DEGRADED_AFTER, Diagnostics};
use crate::types::{Expr, Rule, SeriesExpr};

/// Configuration for the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Per-query timeout; a timed out query is a transient error.
    #[serde(with = "duration_str")]
    pub query_timeout: Duration,
    /// Consecutive failed ticks after which a rule is reported as degraded.
    pub degraded_after: u32,
    /// How far before the previous query's end each refresh starts, so
    /// samples that reach the source late are still picked up.
    #[serde(with = "duration_str")]
    pub lookback: Duration,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
            degraded_after: DEFAULT_DEGRADED_AFTER,
            lookback: Duration::from_secs(60),
        }
    }
}

/// The outcome of the condition for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// The threshold comparison holds.
    True,
    /// The threshold comparison does not hold.
    False,
    /// Not enough data to decide. Treated as false.
    NoData,
}

impl Condition {
    /// Returns true only for [`Condition::True`].
    #[must_use]
    pub const fn holds(&self) -> bool {
        matches!(self, Self::True)
    }
}

/// The evaluation result for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    /// The condition.
    pub condition: Condition,
    /// The expression value, if there was data.
    pub value: Option<f64>,
}

impl EvalResult {
    /// A result without data.
    #[must_use]
    pub const fn no_data() -> Self {
        Self {
            condition: Condition::NoData,
            value: None,
        }
    }

    /// Compares a window value against the rule threshold.
    #[must_use]
    pub fn from_window(rule: &Rule, value: WindowValue) -> Self {
        match value {
            WindowValue::Value(v) => Self {
                condition: if rule.condition(v) {
                    Condition::True
                } else {
                    Condition::False
                },
                value: Some(v),
            },
            WindowValue::NoData => Self::no_data(),
        }
    }
}

/// The evaluation of one rule tick.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleEvaluation {
    /// One result per instance label set, sorted by labels.
    pub results: Vec<(LabelSet, EvalResult)>,
    /// The query error that turned every known instance into no data.
    pub error: Option<QueryError>,
}

/// Evaluates rules against a metric source through a shared window store.
#[derive(Clone)]
pub struct Evaluator {
    source: Arc<dyn MetricSource>,
    store: SampleWindowStore,
    diagnostics: Diagnostics,
    config: EvaluatorConfig,
    /// End of the last successful query per (rule, selector).
    cursors: Arc<RwLock<HashMap<(String, String), i64>>>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("source", &self.source.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Evaluator {
    /// Creates a new evaluator.
    #[must_use]
    pub fn new(
        source: Arc<dyn MetricSource>,
        store: SampleWindowStore,
        diagnostics: Diagnostics,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            source,
            store,
            diagnostics,
            config,
            cursors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the window store.
    #[must_use]
    pub const fn store(&self) -> &SampleWindowStore {
        &self.store
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Returns the diagnostics the evaluator reports to.
    #[must_use]
    pub const fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    async fn refresh_part(&self, rule: &Rule, part: &SeriesExpr, now: i64) -> Result<usize, QueryError> {
        let key = (rule.name.clone(), part.selector.to_string());
        let window_start = now.saturating_sub(duration_to_millis(part.window));
        let lookback = duration_to_millis(self.config.lookback);
        let start = self
            .cursors
            .read()
            .get(&key)
            .map_or(window_start, |cursor| cursor.saturating_sub(lookback).max(window_start));
        let range = TimeRange::new(start.min(now), now)
            .map_err(|e| QueryError::permanent(e.to_string()))?;

        let samples = tokio::time::timeout(
            self.config.query_timeout,
            self.source.query(&part.selector, range),
        )
        .await
        .map_err(|_| {
            QueryError::transient(format!(
                "query timed out after {}ms",
                self.config.query_timeout.as_millis()
            ))
        })??;

        let accepted = self
            .store
            .record_all(part.selector.name.as_str(), &samples);
        self.cursors.write().insert(key, now);
        Ok(accepted)
    }

    /// Queries the metric source for every selector of `rule` and records the
    /// samples in the window store.
    ///
    /// Each selector is queried from the configured lookback before the end of
    /// its previous successful query (or the start of its window, whichever is
    /// later) up to `now`. Samples already held are skipped by the store.
    pub async fn refresh(&self, rule: &Rule, now: DateTime<Utc>) -> Result<usize, QueryError> {
        let now = now.timestamp_millis();
        let mut accepted = 0;
        for part in rule.expr.parts() {
            accepted += self.refresh_part(rule, part, now).await?;
        }
        Ok(accepted)
    }

    fn values(&self, part: &SeriesExpr, now: i64) -> BTreeMap<LabelSet, WindowValue> {
        self.store.aggregate_group(
            &part.selector,
            part.by.as_deref(),
            part.window,
            part.function,
            part.min_samples,
            now,
        )
    }

    /// Computes the condition of every instance of `rule` from the window
    /// store.
    ///
    /// Every label set observed in the window gets a result, as does every
    /// label set in `known`; a known instance whose data vanished gets
    /// [`Condition::NoData`].
    #[must_use]
    pub fn evaluate(
        &self,
        rule: &Rule,
        known: &[LabelSet],
        now: DateTime<Utc>,
    ) -> Vec<(LabelSet, EvalResult)> {
        let now = now.timestamp_millis();
        let values = match &rule.expr {
            Expr::Series(part) => self.values(part, now),
            Expr::Ratio {
                numerator,
                denominator,
            } => ratio(&self.values(numerator, now), &self.values(denominator, now)),
        };

        let mut results: BTreeMap<LabelSet, EvalResult> = values
            .into_iter()
            .map(|(labels, value)| (labels, EvalResult::from_window(rule, value)))
            .collect();
        for labels in known {
            results
                .entry(labels.clone())
                .or_insert_with(EvalResult::no_data);
        }

        results.into_iter().collect()
    }

    /// Runs one tick of `rule`: refresh, then evaluate.
    ///
    /// A query error turns every known instance into no data for this tick;
    /// no new instances are discovered.
    pub async fn tick(&self, rule: &Rule, known: &[LabelSet], now: DateTime<Utc>) -> RuleEvaluation {
        match self.refresh(rule, now).await {
            Ok(accepted) => {
                self.diagnostics.record_success(&rule.name);
                let results = self.evaluate(rule, known, now);
                debug!(
                    rule = %rule.name,
                    accepted,
                    instances = results.len(),
                    "evaluated rule"
                );
                RuleEvaluation {
                    results,
                    error: None,
                }
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(rule = %rule.name, error = %err, "metric query failed");
                } else {
                    error!(
                        rule = %rule.name,
                        expr = %rule.expr,
                        source = self.source.name(),
                        error = %err,
                        "metric query failed permanently"
                    );
                }
                self.diagnostics.record_failure(&rule.name, &err, now);

                RuleEvaluation {
                    results: known
                        .iter()
                        .map(|labels| (labels.clone(), EvalResult::no_data()))
                        .collect(),
                    error: Some(err),
                }
            }
        }
    }

    /// Drops the query cursors of a removed rule.
    pub fn forget_rule(&self, rule_name: &str) {
        self.cursors.write().retain(|(rule, _), _| rule != rule_name);
        self.diagnostics.forget_rule(rule_name);
    }
}
