//! The alert state machine and the rule instance table.
//!
//! Transition table, applied once per tick (no data counts as false):
//!
//! | Current  | condition true                              | condition false        |
//! |----------|---------------------------------------------|------------------------|
//! | Inactive | Pending, or Firing if `for` is already met  | Inactive               |
//! | Pending  | Firing once held for `for`, else Pending    | Inactive               |
//! | Firing   | Firing                                      | Resolved, then Inactive |
//!
//! A true tick vouches for the condition over its own evaluation interval, so
//! the held duration is `now - since + interval`. It is compared with `for` to
//! the nearest interval: stamps a few milliseconds off schedule neither delay
//! nor advance firing by a tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;
use vigil_metrics::LabelSet;

use crate::evaluator::EvalResult;
use crate::template;
use crate::types::{AlertState, NotificationEvent, Rule, RuleInstanceId, StateKind};

/// A state change that must be notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// The state left.
    pub from: StateKind,
    /// The state entered.
    pub to: StateKind,
}

/// Computes the next state of an instance.
///
/// Returns the state to store and the notified transition, if any. Pending
/// transitions are never notified, and a resolved instance is stored as
/// [`AlertState::Inactive`].
#[must_use]
pub fn next_state(
    current: AlertState,
    condition: bool,
    now: DateTime<Utc>,
    for_duration: Duration,
    interval: Duration,
) -> (AlertState, Option<Transition>) {
    let held_enough = |since: DateTime<Utc>| {
        let held = (now - since)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .saturating_add(interval);
        held.saturating_add(interval / 2) > for_duration
    };

    match (current, condition) {
        (AlertState::Inactive | AlertState::Resolved { .. }, true) => {
            if held_enough(now) {
                (
                    AlertState::Firing { since: now },
                    Some(Transition {
                        from: StateKind::Pending,
                        to: StateKind::Firing,
                    }),
                )
            } else {
                (AlertState::Pending { since: now }, None)
            }
        }
        (AlertState::Pending { since }, true) => {
            if held_enough(since) {
                (
                    AlertState::Firing { since: now },
                    Some(Transition {
                        from: StateKind::Pending,
                        to: StateKind::Firing,
                    }),
                )
            } else {
                (current, None)
            }
        }
        (AlertState::Firing { .. }, true) => (current, None),
        (AlertState::Firing { .. }, false) => (
            AlertState::Inactive,
            Some(Transition {
                from: StateKind::Firing,
                to: StateKind::Resolved,
            }),
        ),
        (AlertState::Inactive | AlertState::Pending { .. } | AlertState::Resolved { .. }, false) => {
            (AlertState::Inactive, None)
        }
    }
}

/// One `(rule, label set)` evaluation target and its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleInstance {
    /// Instance identifier.
    pub id: RuleInstanceId,
    /// Instance labels.
    pub labels: LabelSet,
    /// Current state.
    pub state: AlertState,
    /// Most recent value, if the last tick had data.
    pub value: Option<f64>,
    /// Last tick that had data for this instance.
    pub last_seen: DateTime<Utc>,
    /// When the instance last resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl RuleInstance {
    /// Creates an inactive instance.
    #[must_use]
    pub fn new(rule_name: &str, labels: LabelSet, now: DateTime<Utc>) -> Self {
        Self {
            id: RuleInstanceId::new(rule_name, &labels),
            labels,
            state: AlertState::Inactive,
            value: None,
            last_seen: now,
            resolved_at: None,
        }
    }

    /// Applies one tick result, returning the updated instance and the event
    /// to notify, if any.
    #[must_use]
    pub fn step(
        &self,
        rule: &Rule,
        result: &EvalResult,
        now: DateTime<Utc>,
    ) -> (Self, Option<NotificationEvent>) {
        let (state, transition) = next_state(
            self.state,
            result.condition.holds(),
            now,
            rule.for_duration,
            rule.interval,
        );

        let mut next = self.clone();
        next.state = state;
        next.value = result.value;
        if result.value.is_some() {
            next.last_seen = now;
        }
        if transition.is_some_and(|t| t.to == StateKind::Resolved) {
            next.resolved_at = Some(now);
        }

        let event = transition.map(|t| next.event(rule, t, now));
        (next, event)
    }

    /// Builds the notification event for a transition of this instance.
    #[must_use]
    pub fn event(&self, rule: &Rule, transition: Transition, now: DateTime<Utc>) -> NotificationEvent {
        let mut labels: LabelSet = rule.labels.iter().collect();
        labels.extend(&self.labels);
        labels.insert("alertname", rule.name.clone());
        labels.insert("severity", rule.severity.as_str());

        NotificationEvent {
            id: Uuid::new_v4(),
            rule_instance_id: self.id.clone(),
            rule_name: rule.name.clone(),
            annotations: template::expand_all(&rule.annotations, self.value, &labels),
            labels,
            severity: rule.severity,
            value: self.value,
            from_state: transition.from,
            to_state: transition.to,
            timestamp: now,
        }
    }

    /// Returns true if the instance can be garbage-collected.
    #[must_use]
    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        self.state == AlertState::Inactive
            && (now - self.last_seen).to_std().unwrap_or(Duration::ZERO) >= idle_timeout
    }
}

/// Instance counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    /// Inactive instances.
    pub inactive: usize,
    /// Pending instances.
    pub pending: usize,
    /// Firing instances.
    pub firing: usize,
}

impl StateCounts {
    /// Total instances.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.inactive + self.pending + self.firing
    }
}

type InstanceGroup = Arc<BTreeMap<RuleInstanceId, RuleInstance>>;

/// The rule instance table.
///
/// Instances are grouped per rule. The table only guards lookup and insert of
/// groups; a group is replaced as a whole after each tick by the single worker
/// evaluating that rule, so readers always see a consistent group.
#[derive(Debug, Clone, Default)]
pub struct AlertTable {
    groups: Arc<RwLock<HashMap<String, InstanceGroup>>>,
}

impl AlertTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn group(&self, rule_name: &str) -> InstanceGroup {
        self.groups
            .read()
            .get(rule_name)
            .map(Arc::clone)
            .unwrap_or_default()
    }

    /// Returns the label sets of every known instance of a rule.
    #[must_use]
    pub fn known_labels(&self, rule_name: &str) -> Vec<LabelSet> {
        self.group(rule_name)
            .values()
            .map(|i| i.labels.clone())
            .collect()
    }

    /// Returns every instance of a rule.
    #[must_use]
    pub fn instances(&self, rule_name: &str) -> Vec<RuleInstance> {
        self.group(rule_name).values().cloned().collect()
    }

    /// Looks up one instance.
    #[must_use]
    pub fn get(&self, rule_name: &str, id: &RuleInstanceId) -> Option<RuleInstance> {
        self.group(rule_name).get(id).cloned()
    }

    /// Applies the results of one tick of `rule`.
    ///
    /// New label sets create instances lazily, inactive instances without data
    /// for `idle_timeout` are dropped, and the whole group is swapped in at
    /// once. Returns the events to notify in instance order.
    pub fn apply(
        &self,
        rule: &Rule,
        results: &[(LabelSet, EvalResult)],
        now: DateTime<Utc>,
        idle_timeout: Duration,
    ) -> Vec<NotificationEvent> {
        let current = self.group(&rule.name);
        let mut next = (*current).clone();
        let mut events = Vec::new();

        for (labels, result) in results {
            let id = RuleInstanceId::new(&rule.name, labels);
            let instance = current
                .get(&id)
                .cloned()
                .unwrap_or_else(|| RuleInstance::new(&rule.name, labels.clone(), now));

            let (updated, event) = instance.step(rule, result, now);
            if updated.state.kind() != instance.state.kind() {
                debug!(
                    instance = %id,
                    from = %instance.state.kind(),
                    to = %updated.state.kind(),
                    "instance state changed"
                );
            }
            if let Some(event) = event {
                info!(
                    instance = %id,
                    state = %event.to_state,
                    value = ?event.value,
                    "alert {}",
                    event.to_state
                );
                events.push(event);
            }
            next.insert(id, updated);
        }

        let before = next.len();
        next.retain(|_, instance| !instance.is_idle(now, idle_timeout));
        if next.len() < before {
            debug!(rule = %rule.name, evicted = before - next.len(), "evicted idle instances");
        }

        self.groups.write().insert(rule.name.clone(), Arc::new(next));
        events
    }

    /// Drops a rule and its instances, returning a Resolved event for every
    /// instance that was firing.
    pub fn remove_rule(&self, rule: &Rule, now: DateTime<Utc>) -> Vec<NotificationEvent> {
        let Some(group) = self.groups.write().remove(&rule.name) else {
            return Vec::new();
        };

        group
            .values()
            .filter(|i| matches!(i.state, AlertState::Firing { .. }))
            .map(|i| {
                info!(instance = %i.id, "alert resolved by rule removal");
                i.event(
                    rule,
                    Transition {
                        from: StateKind::Firing,
                        to: StateKind::Resolved,
                    },
                    now,
                )
            })
            .collect()
    }

    /// Counts instances per state across all rules.
    #[must_use]
    pub fn counts(&self) -> StateCounts {
        let groups = self.groups.read();
        let mut counts = StateCounts::default();
        for instance in groups.values().flat_map(|g| g.values()) {
            match instance.state.kind() {
                StateKind::Pending => counts.pending += 1,
                StateKind::Firing => counts.firing += 1,
                StateKind::Inactive | StateKind::Resolved => counts.inactive += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::Condition;
    use crate::types::{ComparisonOperator, Expr, SeriesExpr, Severity};
    use chrono::TimeZone;
    use vigil_metrics::{Aggregation, SeriesName, SeriesSelector};

    const MINUTE: Duration = Duration::from_secs(60);

    fn tick(n: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + n * 60, 0).unwrap()
    }

    fn rule(for_minutes: u64) -> Rule {
        Rule::builder(
            "HighErrorRate",
            Expr::Series(SeriesExpr::new(
                SeriesSelector::new(SeriesName::new("error_ratio").unwrap()),
                Aggregation::Last,
                Duration::from_secs(300),
            )),
        )
        .condition(ComparisonOperator::GreaterThan, 0.05)
        .for_duration(MINUTE * for_minutes as u32)
        .interval(MINUTE)
        .severity(Severity::Critical)
        .label("team", "web")
        .annotation("summary", "{{ $labels.route }} at {{ $value }}")
        .build()
        .unwrap()
    }

    fn truthy() -> EvalResult {
        EvalResult {
            condition: Condition::True,
            value: Some(0.07),
        }
    }

    fn falsy() -> EvalResult {
        EvalResult {
            condition: Condition::False,
            value: Some(0.01),
        }
    }

    fn route(r: &str) -> LabelSet {
        LabelSet::new().with("route", r)
    }

    mod transition_tests {
        use super::*;

        #[test]
        fn test_inactive_to_pending() {
            let (state, t) = next_state(AlertState::Inactive, true, tick(0), MINUTE * 10, MINUTE);
            assert_eq!(state, AlertState::Pending { since: tick(0) });
            assert!(t.is_none());
        }

        #[test]
        fn test_fires_immediately_when_for_within_interval() {
            let (state, t) = next_state(AlertState::Inactive, true, tick(0), MINUTE, MINUTE);
            assert_eq!(state, AlertState::Firing { since: tick(0) });
            assert_eq!(t.map(|t| t.to), Some(StateKind::Firing));

            let (state, _) = next_state(AlertState::Inactive, true, tick(0), Duration::ZERO, MINUTE);
            assert!(matches!(state, AlertState::Firing { .. }));
        }

        #[test]
        fn test_pending_fires_when_held() {
            let pending = AlertState::Pending { since: tick(0) };
            let (state, t) = next_state(pending, true, tick(8), MINUTE * 10, MINUTE);
            assert_eq!(state, pending);
            assert!(t.is_none());

            let (state, t) = next_state(pending, true, tick(9), MINUTE * 10, MINUTE);
            assert_eq!(state, AlertState::Firing { since: tick(9) });
            assert_eq!(
                t,
                Some(Transition {
                    from: StateKind::Pending,
                    to: StateKind::Firing
                })
            );
        }

        #[test]
        fn test_jittered_stamps_fire_on_schedule() {
            let for_duration = MINUTE * 10;
            let jitter = |n: i64, millis: i64| tick(n) + chrono::Duration::milliseconds(millis);

            let mut state = AlertState::Inactive;
            let mut fired_at = None;
            for n in 0..15 {
                let now = if n == 0 { jitter(0, 3) } else { jitter(n, 1) };
                let (next, t) = next_state(state, true, now, for_duration, MINUTE);
                if t.is_some_and(|t| t.to == StateKind::Firing) {
                    fired_at = Some(n);
                    break;
                }
                state = next;
            }
            // Tenth true tick.
            assert_eq!(fired_at, Some(9));
        }

        #[test]
        fn test_small_skew_does_not_fire_a_tick_early() {
            let pending = AlertState::Pending {
                since: tick(0) + chrono::Duration::milliseconds(-5),
            };
            let (state, t) = next_state(pending, true, tick(8), MINUTE * 10, MINUTE);
            assert_eq!(state, pending);
            assert!(t.is_none());
        }

        #[test]
        fn test_huge_durations_saturate() {
            let pending = AlertState::Pending { since: tick(0) };
            let (state, t) = next_state(pending, true, tick(1), Duration::MAX, Duration::MAX);
            assert!(matches!(state, AlertState::Pending { .. }));
            assert!(t.is_none());
        }

        #[test]
        fn test_pending_false_resets() {
            let (state, t) = next_state(
                AlertState::Pending { since: tick(0) },
                false,
                tick(3),
                MINUTE * 10,
                MINUTE,
            );
            assert_eq!(state, AlertState::Inactive);
            assert!(t.is_none());
        }

        #[test]
        fn test_firing_false_resolves_to_inactive() {
            let (state, t) = next_state(
                AlertState::Firing { since: tick(0) },
                false,
                tick(3),
                MINUTE * 10,
                MINUTE,
            );
            assert_eq!(state, AlertState::Inactive);
            assert_eq!(
                t,
                Some(Transition {
                    from: StateKind::Firing,
                    to: StateKind::Resolved
                })
            );
        }

        #[test]
        fn test_firing_true_stays() {
            let firing = AlertState::Firing { since: tick(0) };
            let (state, t) = next_state(firing, true, tick(30), MINUTE * 10, MINUTE);
            assert_eq!(state, firing);
            assert!(t.is_none());
        }
    }

    mod instance_tests {
        use super::*;

        #[test]
        fn test_event_copies_rule_metadata() {
            let r = rule(0);
            let instance = RuleInstance::new(&r.name, route("/login"), tick(0));
            let (next, event) = instance.step(&r, &truthy(), tick(0));

            assert!(matches!(next.state, AlertState::Firing { .. }));
            let event = event.unwrap();
            assert_eq!(event.rule_instance_id.as_str(), r#"HighErrorRate{route="/login"}"#);
            assert_eq!(event.severity, Severity::Critical);
            assert_eq!(event.labels.get("team"), Some("web"));
            assert_eq!(event.labels.get("alertname"), Some("HighErrorRate"));
            assert_eq!(event.labels.get("route"), Some("/login"));
            assert_eq!(event.annotations["summary"], "/login at 0.07");
            assert_eq!(event.value, Some(0.07));
            assert_eq!(event.from_state, StateKind::Pending);
            assert_eq!(event.to_state, StateKind::Firing);
        }

        #[test]
        fn test_no_data_does_not_touch_last_seen() {
            let r = rule(10);
            let instance = RuleInstance::new(&r.name, route("/a"), tick(0));
            let (next, _) = instance.step(&r, &EvalResult::no_data(), tick(5));
            assert_eq!(next.last_seen, tick(0));
            assert_eq!(next.value, None);
        }

        #[test]
        fn test_idle_only_when_inactive() {
            let r = rule(10);
            let mut instance = RuleInstance::new(&r.name, route("/a"), tick(0));
            assert!(instance.is_idle(tick(10), MINUTE * 10));
            assert!(!instance.is_idle(tick(9), MINUTE * 10));

            instance.state = AlertState::Pending { since: tick(0) };
            assert!(!instance.is_idle(tick(100), MINUTE * 10));
        }
    }

    mod table_tests {
        use super::*;

        const IDLE: Duration = Duration::from_secs(3600);

        fn run(table: &AlertTable, r: &Rule, n: i64, result: EvalResult) -> Vec<NotificationEvent> {
            table.apply(r, &[(route("/a"), result)], tick(n), IDLE)
        }

        #[test]
        fn test_fires_exactly_at_tenth_true_tick() {
            let table = AlertTable::new();
            let r = rule(10);

            for n in 0..9 {
                assert!(run(&table, &r, n, truthy()).is_empty(), "fired early at tick {}", n + 1);
            }
            let events = run(&table, &r, 9, truthy());
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].to_state, StateKind::Firing);
        }

        #[test]
        fn test_false_tick_restarts_timing() {
            let table = AlertTable::new();
            let r = rule(10);

            for n in 0..9 {
                assert!(run(&table, &r, n, truthy()).is_empty());
            }
            assert!(run(&table, &r, 9, falsy()).is_empty());

            // Timing restarts: nine more true ticks stay pending.
            for n in 10..19 {
                assert!(run(&table, &r, n, truthy()).is_empty(), "fired early at tick {n}");
            }
            assert_eq!(run(&table, &r, 19, truthy()).len(), 1);
        }

        #[test]
        fn test_one_event_per_transition() {
            let table = AlertTable::new();
            let r = rule(2);
            let mut events = Vec::new();

            for n in 0..20 {
                events.extend(run(&table, &r, n, truthy()));
            }
            for n in 20..25 {
                events.extend(run(&table, &r, n, falsy()));
            }

            let kinds: Vec<_> = events.iter().map(|e| e.to_state).collect();
            assert_eq!(kinds, vec![StateKind::Firing, StateKind::Resolved]);
        }

        #[test]
        fn test_no_data_resolves_firing_after_one_tick() {
            let table = AlertTable::new();
            let r = rule(0);

            assert_eq!(run(&table, &r, 0, truthy()).len(), 1);
            let events = run(&table, &r, 1, EvalResult::no_data());
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].to_state, StateKind::Resolved);
            assert_eq!(events[0].value, None);

            let id = RuleInstanceId::new(&r.name, &route("/a"));
            assert_eq!(table.get(&r.name, &id).unwrap().state, AlertState::Inactive);
        }

        #[test]
        fn test_no_data_never_advances_pending() {
            let table = AlertTable::new();
            let r = rule(3);

            run(&table, &r, 0, truthy());
            run(&table, &r, 1, truthy());
            run(&table, &r, 2, EvalResult::no_data());
            assert!(run(&table, &r, 3, truthy()).is_empty());
            assert!(run(&table, &r, 4, truthy()).is_empty());
            assert_eq!(run(&table, &r, 5, truthy()).len(), 1);
        }

        #[test]
        fn test_label_sets_are_independent() {
            let table = AlertTable::new();
            let r = rule(2);

            let mut events = Vec::new();
            for n in 0..3 {
                events.extend(table.apply(
                    &r,
                    &[(route("/a"), truthy()), (route("/b"), falsy())],
                    tick(n),
                    IDLE,
                ));
            }

            assert_eq!(events.len(), 1);
            assert_eq!(events[0].labels.get("route"), Some("/a"));
            let counts = table.counts();
            assert_eq!(counts.firing, 1);
            assert_eq!(counts.inactive, 1);
            assert_eq!(counts.total(), 2);
        }

        #[test]
        fn test_idle_instances_evicted() {
            let table = AlertTable::new();
            let r = rule(10);

            table.apply(&r, &[(route("/a"), falsy())], tick(0), MINUTE * 5);
            assert_eq!(table.known_labels(&r.name), vec![route("/a")]);

            table.apply(&r, &[(route("/a"), EvalResult::no_data())], tick(4), MINUTE * 5);
            assert_eq!(table.instances(&r.name).len(), 1);

            table.apply(&r, &[(route("/a"), EvalResult::no_data())], tick(5), MINUTE * 5);
            assert!(table.instances(&r.name).is_empty());
        }

        #[test]
        fn test_remove_rule_resolves_firing() {
            let table = AlertTable::new();
            let r = rule(0);

            table.apply(
                &r,
                &[(route("/a"), truthy()), (route("/b"), falsy())],
                tick(0),
                IDLE,
            );
            let events = table.remove_rule(&r, tick(1));

            assert_eq!(events.len(), 1);
            assert_eq!(events[0].to_state, StateKind::Resolved);
            assert_eq!(events[0].from_state, StateKind::Firing);
            assert!(table.instances(&r.name).is_empty());
            assert!(table.remove_rule(&r, tick(2)).is_empty());
        }
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Fires exactly when the run of true ticks reaches `for`, and
            /// resolves on the first false tick after firing.
            #[test]
            fn test_fires_only_after_continuous_hold(
                conditions in prop::collection::vec(any::<bool>(), 1..60),
                for_minutes in 0u32..15,
            ) {
                let for_duration = MINUTE * for_minutes;
                let needed = for_minutes.max(1) as usize;
                let mut state = AlertState::Inactive;
                let mut run = 0usize;
                let mut firing = false;

                for (n, &condition) in conditions.iter().enumerate() {
                    let (next, transition) =
                        next_state(state, condition, tick(n as i64), for_duration, MINUTE);
                    run = if condition { run + 1 } else { 0 };

                    let fired = transition.is_some_and(|t| t.to == StateKind::Firing);
                    let resolved = transition.is_some_and(|t| t.to == StateKind::Resolved);
                    prop_assert_eq!(fired, !firing && run == needed);
                    prop_assert_eq!(resolved, firing && !condition);

                    if fired {
                        firing = true;
                    }
                    if resolved {
                        firing = false;
                    }
                    prop_assert_eq!(matches!(next, AlertState::Firing { .. }), firing);
                    state = next;
                }
            }
        }
    }
}
