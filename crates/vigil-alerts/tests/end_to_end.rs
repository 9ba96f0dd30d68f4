//! End-to-end evaluation tests: metric source to notifications.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MINUTE, RecordingChannel, Traffic, at, high_error_rate, manager, manager_with};
use tokio::sync::{mpsc, watch};
use vigil_alerts::{
    Clock, ComparisonOperator, Expr, NotificationChannel, NotifierConfig, Rule, RuleInstanceId,
    Scheduler, SchedulerConfig, SeriesExpr, StateKind,
};
use vigil_metrics::{
    Aggregation, LabelSet, MemorySource, QueryError, SeriesName, SeriesSelector,
};

fn login() -> RuleInstanceId {
    RuleInstanceId::new("HighErrorRate", &LabelSet::new().with("route", "/login"))
}

/// Five minutes of history so the rate is defined from the first tick.
fn warm_up(traffic: &mut Traffic, source: &MemorySource, route: &str, errors: f64) {
    for minute in -5..0 {
        traffic.minute(source, route, minute, errors, 100.0);
    }
}

#[tokio::test]
async fn test_high_error_rate_fires_at_tenth_tick() {
    let source = MemorySource::new();
    let m = manager(&source);
    m.load(vec![high_error_rate()], at(0));

    let mut traffic = Traffic::default();
    warm_up(&mut traffic, &source, "/login", 7.0);

    for minute in 0..9 {
        traffic.minute(&source, "/login", minute, 7.0, 100.0);
        let outcome = m.tick_rule("HighErrorRate", at(minute)).await.unwrap();
        assert!(outcome.fired.is_empty(), "fired early at tick {}", minute + 1);
    }

    traffic.minute(&source, "/login", 9, 7.0, 100.0);
    let outcome = m.tick_rule("HighErrorRate", at(9)).await.unwrap();
    assert_eq!(outcome.fired, vec![login()]);
}

#[tokio::test]
async fn test_single_false_tick_restarts_pending_timer() {
    let rule = Rule::builder(
        "HighErrorRatio",
        Expr::Series(SeriesExpr::new(
            SeriesSelector::new(SeriesName::new("error_ratio").unwrap()),
            Aggregation::Last,
            Duration::from_secs(300),
        )),
    )
    .condition(ComparisonOperator::GreaterThan, 0.05)
    .for_duration(MINUTE * 10)
    .interval(MINUTE)
    .build()
    .unwrap();

    let source = MemorySource::new();
    let m = manager(&source);
    m.load(vec![rule], at(0));

    // Nine true ticks, one false, then true again.
    let mut fired_at = None;
    for minute in 0..30 {
        let ratio = if minute == 9 { 0.01 } else { 0.07 };
        source.push("error_ratio", LabelSet::new(), at(minute).timestamp_millis(), ratio);
        let outcome = m.tick_rule("HighErrorRatio", at(minute)).await.unwrap();
        if !outcome.fired.is_empty() {
            fired_at = Some(minute);
            break;
        }
    }

    // Ten consecutive true ticks starting at minute 10.
    assert_eq!(fired_at, Some(19));
}

#[tokio::test]
async fn test_label_sets_evaluate_independently() {
    let source = MemorySource::new();
    let m = manager(&source);
    m.load(vec![high_error_rate()], at(0));

    let mut traffic = Traffic::default();
    warm_up(&mut traffic, &source, "/login", 7.0);
    warm_up(&mut traffic, &source, "/search", 1.0);

    let mut fired = Vec::new();
    for minute in 0..12 {
        traffic.minute(&source, "/login", minute, 7.0, 100.0);
        traffic.minute(&source, "/search", minute, 1.0, 100.0);
        let outcome = m.tick_rule("HighErrorRate", at(minute)).await.unwrap();
        assert_eq!(outcome.instances, 2);
        fired.extend(outcome.fired);
    }

    assert_eq!(fired, vec![login()]);
    let counts = m.table().counts();
    assert_eq!(counts.firing, 1);
    assert_eq!(counts.inactive, 1);
}

#[tokio::test]
async fn test_one_firing_and_one_resolved_event_per_cycle() {
    let source = MemorySource::new();
    let channel = RecordingChannel::new();
    let m = manager_with(
        &source,
        vec![Arc::clone(&channel) as Arc<dyn NotificationChannel>],
        NotifierConfig::default(),
    );
    m.load(vec![high_error_rate()], at(0));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    m.notifier().start(shutdown_rx);

    let mut traffic = Traffic::default();
    warm_up(&mut traffic, &source, "/login", 7.0);
    for minute in 0..45 {
        let errors = if minute < 30 { 7.0 } else { 0.0 };
        traffic.minute(&source, "/login", minute, errors, 100.0);
        m.tick_rule("HighErrorRate", at(minute)).await.unwrap();
        m.notifier().wait_idle().await;
    }

    assert_eq!(channel.states(), vec![StateKind::Firing, StateKind::Resolved]);
    let firing = &channel.payloads()[0];
    assert_eq!(firing.instance, login());
    assert_eq!(firing.labels.get("team"), Some("web"));
    assert_eq!(firing.labels.get("alertname"), Some("HighErrorRate"));
    assert_eq!(firing.message, "/login error rate 0.07");
}

#[tokio::test]
async fn test_no_data_resolves_firing_alert() {
    let source = MemorySource::new();
    let m = manager(&source);
    m.load(vec![high_error_rate()], at(0));

    let mut traffic = Traffic::default();
    warm_up(&mut traffic, &source, "/login", 7.0);
    for minute in 0..10 {
        traffic.minute(&source, "/login", minute, 7.0, 100.0);
        m.tick_rule("HighErrorRate", at(minute)).await.unwrap();
    }
    assert_eq!(m.table().counts().firing, 1);

    // The series stops reporting; once the window is empty the instance has
    // no data and resolves on that tick.
    let mut resolved = Vec::new();
    for minute in 10..20 {
        resolved.extend(m.tick_rule("HighErrorRate", at(minute)).await.unwrap().resolved);
    }
    assert_eq!(resolved, vec![login()]);
}

#[tokio::test]
async fn test_failing_source_degrades_rule_and_resolves() {
    let source = MemorySource::new();
    let m = manager(&source);
    m.load(vec![high_error_rate()], at(0));

    let mut traffic = Traffic::default();
    warm_up(&mut traffic, &source, "/login", 7.0);
    for minute in 0..10 {
        traffic.minute(&source, "/login", minute, 7.0, 100.0);
        m.tick_rule("HighErrorRate", at(minute)).await.unwrap();
    }

    source.set_failure(Some(QueryError::transient("connection refused")));
    let outcome = m.tick_rule("HighErrorRate", at(10)).await.unwrap();
    assert!(outcome.error.is_some());
    assert_eq!(outcome.resolved, vec![login()]);

    m.tick_rule("HighErrorRate", at(11)).await.unwrap();
    assert!(m.health(at(11)).evaluation.degraded.is_empty());
    m.tick_rule("HighErrorRate", at(12)).await.unwrap();

    let health = m.health(at(12));
    assert_eq!(health.evaluation.degraded.len(), 1);
    assert_eq!(health.evaluation.degraded[0].rule, "HighErrorRate");
    assert_eq!(health.evaluation.degraded[0].consecutive_failures, 3);
    assert_eq!(health.evaluation.evaluation_errors, 3);

    // Recovery clears the degraded state.
    source.set_failure(None);
    traffic.minute(&source, "/login", 13, 7.0, 100.0);
    let outcome = m.tick_rule("HighErrorRate", at(13)).await.unwrap();
    assert!(outcome.error.is_none());
    assert!(m.health(at(13)).evaluation.degraded.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_rule_notifies_at_tenth_minute() {
    let source = MemorySource::new();
    let channel = RecordingChannel::new();
    let m = manager_with(
        &source,
        vec![Arc::clone(&channel) as Arc<dyn NotificationChannel>],
        NotifierConfig::default(),
    );

    // Samples are pushed ahead of time; each tick only queries up to its
    // own evaluation time.
    let mut traffic = Traffic::default();
    warm_up(&mut traffic, &source, "/login", 7.0);
    for minute in 0..20 {
        traffic.minute(&source, "/login", minute, 7.0, 100.0);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_reload_tx, reload_rx) = mpsc::channel(1);
    let notifier = m.notifier().start(shutdown_rx.clone());
    let scheduler = Scheduler::new(m.clone(), SchedulerConfig::default()).with_clock(Clock::starting_at(at(0)));
    let scheduler = tokio::spawn(scheduler.run(vec![high_error_rate()], reload_rx, shutdown_rx));

    tokio::time::sleep(Duration::from_secs(8 * 60 + 30)).await;
    assert!(channel.states().is_empty());

    tokio::time::sleep(Duration::from_secs(60)).await;
    m.notifier().wait_idle().await;
    let payloads = channel.payloads();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].state, StateKind::Firing);
    assert_eq!(payloads[0].timestamp, at(9));

    shutdown_tx.send_replace(true);
    scheduler.await.unwrap();
    notifier.await.unwrap();
}
