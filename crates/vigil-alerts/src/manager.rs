//! Alert manager tying evaluation, instance state and notification together.
//!
//! This module provides the [`AlertManager`], which owns the loaded rule set
//! and runs single rule ticks. Scheduling ticks is the job of
//! [`crate::scheduler`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vigil_metrics::QueryError;

use crate::config::duration_str;
use crate::diagnostics::HealthSnapshot;
use crate::error::{AlertError, Result};
use crate::evaluator::Evaluator;
use crate::notifier::Notifier;
use crate::state::AlertTable;
use crate::types::{Rule, RuleInstanceId, StateKind};

/// Configuration for the alert manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertManagerConfig {
    /// Inactive instances without data for this long are dropped.
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// The result of one rule tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    /// The evaluated rule.
    pub rule: String,
    /// Instances evaluated.
    pub instances: usize,
    /// Instances that started firing.
    pub fired: Vec<RuleInstanceId>,
    /// Instances that resolved.
    pub resolved: Vec<RuleInstanceId>,
    /// The query error of the tick, if any.
    pub error: Option<QueryError>,
    /// The rule was removed while the tick ran; results were discarded.
    pub discarded: bool,
}

/// What a rule set reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Rules that did not exist before.
    pub added: Vec<String>,
    /// Rules whose definition changed; their instance state is kept.
    pub changed: Vec<String>,
    /// Rules no longer configured.
    pub removed: Vec<String>,
    /// Rules loaded as they were.
    pub unchanged: usize,
}

/// The alert manager evaluates rules and keeps the state of their instances.
///
/// Clones share the same rule set, instance table and notifier.
#[derive(Debug, Clone)]
pub struct AlertManager {
    config: AlertManagerConfig,
    evaluator: Evaluator,
    table: AlertTable,
    notifier: Notifier,
    rules: Arc<RwLock<BTreeMap<String, Arc<Rule>>>>,
}

impl AlertManager {
    /// Creates a manager with no rules.
    #[must_use]
    pub fn new(config: AlertManagerConfig, evaluator: Evaluator, notifier: Notifier) -> Self {
        Self {
            config,
            evaluator,
            table: AlertTable::new(),
            notifier,
            rules: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &AlertManagerConfig {
        &self.config
    }

    /// Returns the evaluator.
    #[must_use]
    pub const fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Returns the instance table.
    #[must_use]
    pub const fn table(&self) -> &AlertTable {
        &self.table
    }

    /// Returns the notifier.
    #[must_use]
    pub const fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // ============ Rule Management ============

    /// Gets a rule by name.
    #[must_use]
    pub fn rule(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.read().get(name).cloned()
    }

    /// Lists all rules, ordered by name.
    #[must_use]
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.rules.read().values().cloned().collect()
    }

    /// Returns the number of rules.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Replaces the rule set.
    ///
    /// Firing instances of removed rules are resolved and notified. Changed
    /// rules keep the state of their instances. A repeated name keeps the
    /// first definition.
    pub fn load(&self, rules: Vec<Rule>, now: DateTime<Utc>) -> ReloadSummary {
        let mut next: BTreeMap<String, Arc<Rule>> = BTreeMap::new();
        for rule in rules {
            if next.contains_key(&rule.name) {
                warn!(rule = %rule.name, "duplicate rule name ignored");
                continue;
            }
            next.insert(rule.name.clone(), Arc::new(rule));
        }

        let mut summary = ReloadSummary::default();
        let mut current = self.rules.write();

        for (name, rule) in &next {
            match current.get(name) {
                None => summary.added.push(name.clone()),
                Some(old) if **old != **rule => summary.changed.push(name.clone()),
                Some(_) => summary.unchanged += 1,
            }
        }

        for (name, old) in current.iter() {
            if next.contains_key(name) {
                continue;
            }
            for event in self.table.remove_rule(old, now) {
                self.notifier.enqueue(event);
            }
            self.evaluator.forget_rule(name);
            summary.removed.push(name.clone());
        }

        *current = next;
        drop(current);

        info!(
            rules = self.rule_count(),
            added = summary.added.len(),
            changed = summary.changed.len(),
            removed = summary.removed.len(),
            "rule set loaded"
        );
        summary
    }

    // ============ Evaluation ============

    /// Runs one tick of `rule`.
    ///
    /// Events produced by the tick are queued on the notifier. A tick of a
    /// rule removed while it ran is discarded.
    pub async fn tick(&self, rule: &Rule, now: DateTime<Utc>) -> TickOutcome {
        let known = self.table.known_labels(&rule.name);
        let evaluation = self.evaluator.tick(rule, &known, now).await;

        let mut outcome = TickOutcome {
            rule: rule.name.clone(),
            instances: evaluation.results.len(),
            error: evaluation.error,
            ..TickOutcome::default()
        };

        let rules = self.rules.read();
        if !rules.contains_key(&rule.name) {
            debug!(rule = %rule.name, "rule removed during tick, results discarded");
            outcome.discarded = true;
            return outcome;
        }
        let events = self
            .table
            .apply(rule, &evaluation.results, now, self.config.idle_timeout);
        drop(rules);

        for event in events {
            match event.to_state {
                StateKind::Firing => outcome.fired.push(event.rule_instance_id.clone()),
                StateKind::Resolved => outcome.resolved.push(event.rule_instance_id.clone()),
                StateKind::Inactive | StateKind::Pending => {}
            }
            self.notifier.enqueue(event);
        }
        outcome
    }

    /// Runs one tick of the loaded rule named `name`.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::RuleNotFound` if no such rule is loaded.
    pub async fn tick_rule(&self, name: &str, now: DateTime<Utc>) -> Result<TickOutcome> {
        let rule = self.rule(name).ok_or_else(|| AlertError::RuleNotFound {
            name: name.to_string(),
        })?;
        Ok(self.tick(&rule, now).await)
    }

    /// Drops window store series that received no samples within retention.
    pub fn housekeeping(&self, now: DateTime<Utc>) -> usize {
        self.evaluator.store().evict_idle(now.timestamp_millis())
    }

    /// Returns the health of the engine.
    #[must_use]
    pub fn health(&self, now: DateTime<Utc>) -> HealthSnapshot {
        HealthSnapshot {
            timestamp: now,
            rules: self.rule_count(),
            instances: self.table.counts(),
            series: self.evaluator.store().series_count(),
            evaluation: self.evaluator.diagnostics().evaluation_stats(),
            notifications: self.notifier.stats(),
        }
    }
}
