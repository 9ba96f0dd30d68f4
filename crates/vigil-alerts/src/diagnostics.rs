//! Self-monitoring: evaluation counters, degraded rules and the health snapshot.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use vigil_metrics::QueryError;

use crate::notifier::NotifierStats;
use crate::state::StateCounts;

/// Number of recent ticks the error rate is computed over.
pub const RECENT_TICKS: usize = 100;

/// Consecutive failed ticks after which a rule is reported as degraded.
pub const DEFAULT_DEGRADED_AFTER: u32 = 3;

/// A rule whose metric queries keep failing.
///
/// This is a diagnostic about the engine itself, never a user-facing alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationDegraded {
    /// The affected rule.
    pub rule: String,
    /// Failed ticks in a row.
    pub consecutive_failures: u32,
    /// When the first failure of the streak happened.
    pub since: DateTime<Utc>,
    /// The most recent error.
    pub last_error: String,
}

#[derive(Debug)]
struct FailureStreak {
    count: u32,
    since: DateTime<Utc>,
    last_error: String,
}

#[derive(Debug)]
struct DiagnosticsInner {
    degraded_after: u32,
    evaluations: AtomicU64,
    evaluation_errors: AtomicU64,
    skipped_ticks: AtomicU64,
    recent: Mutex<VecDeque<bool>>,
    streaks: RwLock<BTreeMap<String, FailureStreak>>,
}

/// Shared evaluation counters. Clones share the same counters.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    inner: Arc<DiagnosticsInner>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DEFAULT_DEGRADED_AFTER)
    }
}

impl Diagnostics {
    /// Creates counters that report a rule as degraded after `degraded_after`
    /// consecutive failed ticks.
    #[must_use]
    pub fn new(degraded_after: u32) -> Self {
        Self {
            inner: Arc::new(DiagnosticsInner {
                degraded_after: degraded_after.max(1),
                evaluations: AtomicU64::new(0),
                evaluation_errors: AtomicU64::new(0),
                skipped_ticks: AtomicU64::new(0),
                recent: Mutex::new(VecDeque::with_capacity(RECENT_TICKS)),
                streaks: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    fn push_recent(&self, failed: bool) {
        let mut recent = self.inner.recent.lock();
        if recent.len() == RECENT_TICKS {
            recent.pop_front();
        }
        recent.push_back(failed);
    }

    /// Records a successful tick, clearing any failure streak of the rule.
    pub fn record_success(&self, rule: &str) {
        self.inner.evaluations.fetch_add(1, Ordering::Relaxed);
        self.push_recent(false);

        if let Some(streak) = self.inner.streaks.write().remove(rule) {
            if streak.count >= self.inner.degraded_after {
                info!(
                    rule = %rule,
                    failures = streak.count,
                    "rule evaluation recovered"
                );
            }
        }
    }

    /// Records a failed tick.
    ///
    /// Returns the degraded record when this failure is the one that crosses
    /// the threshold, so the escalation is reported exactly once per streak.
    pub fn record_failure(
        &self,
        rule: &str,
        err: &QueryError,
        now: DateTime<Utc>,
    ) -> Option<EvaluationDegraded> {
        self.inner.evaluations.fetch_add(1, Ordering::Relaxed);
        self.inner.evaluation_errors.fetch_add(1, Ordering::Relaxed);
        self.push_recent(true);

        let mut streaks = self.inner.streaks.write();
        let streak = streaks.entry(rule.to_string()).or_insert_with(|| FailureStreak {
            count: 0,
            since: now,
            last_error: String::new(),
        });
        streak.count += 1;
        streak.last_error = err.to_string();

        if streak.count != self.inner.degraded_after {
            return None;
        }

        let degraded = EvaluationDegraded {
            rule: rule.to_string(),
            consecutive_failures: streak.count,
            since: streak.since,
            last_error: streak.last_error.clone(),
        };
        error!(
            rule = %rule,
            failures = streak.count,
            since = %streak.since,
            error = %err,
            "rule evaluation degraded"
        );
        Some(degraded)
    }

    /// Records a tick skipped because the previous one was still running.
    pub fn record_skipped(&self) {
        self.inner.skipped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops the failure streak of a removed rule.
    pub fn forget_rule(&self, rule: &str) {
        self.inner.streaks.write().remove(rule);
    }

    /// Returns every rule currently degraded.
    #[must_use]
    pub fn degraded(&self) -> Vec<EvaluationDegraded> {
        let threshold = self.inner.degraded_after;
        self.inner
            .streaks
            .read()
            .iter()
            .filter(|(_, s)| s.count >= threshold)
            .map(|(rule, s)| EvaluationDegraded {
                rule: rule.clone(),
                consecutive_failures: s.count,
                since: s.since,
                last_error: s.last_error.clone(),
            })
            .collect()
    }

    /// Returns the fraction of the last [`RECENT_TICKS`] ticks that failed.
    #[must_use]
    pub fn recent_error_rate(&self) -> f64 {
        let recent = self.inner.recent.lock();
        if recent.is_empty() {
            return 0.0;
        }
        recent.iter().filter(|failed| **failed).count() as f64 / recent.len() as f64
    }

    /// Returns a snapshot of the evaluation counters.
    #[must_use]
    pub fn evaluation_stats(&self) -> EvaluationStats {
        EvaluationStats {
            evaluations: self.inner.evaluations.load(Ordering::Relaxed),
            evaluation_errors: self.inner.evaluation_errors.load(Ordering::Relaxed),
            recent_error_rate: self.recent_error_rate(),
            skipped_ticks: self.inner.skipped_ticks.load(Ordering::Relaxed),
            degraded: self.degraded(),
        }
    }
}

/// Evaluation counters at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationStats {
    /// Ticks evaluated.
    pub evaluations: u64,
    /// Ticks whose metric query failed.
    pub evaluation_errors: u64,
    /// Failed fraction of the most recent ticks.
    pub recent_error_rate: f64,
    /// Ticks skipped because the previous evaluation overran.
    pub skipped_ticks: u64,
    /// Rules currently degraded.
    pub degraded: Vec<EvaluationDegraded>,
}

/// Point-in-time health of the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Loaded rules.
    pub rules: usize,
    /// Instances per state.
    pub instances: StateCounts,
    /// Series held in the window store.
    pub series: usize,
    /// Evaluation counters.
    pub evaluation: EvaluationStats,
    /// Notification counters.
    pub notifications: NotifierStats,
}
