//! Test helpers for end-to-end tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use vigil_alerts::{
    AlertManager, AlertManagerConfig, AlertPayload, ComparisonOperator, DeliveryError, Diagnostics,
    Evaluator, EvaluatorConfig, Expr, NotificationChannel, Notifier, NotifierConfig, Rule,
    SeriesExpr, Severity, StateKind,
};
use vigil_metrics::{
    Aggregation, LabelSet, MemorySource, SampleWindowStore, SeriesName, SeriesSelector,
};

pub const MINUTE: Duration = Duration::from_secs(60);

/// Evaluation time of minute `n` of a test run.
pub fn at(minute: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + minute * 60, 0).unwrap()
}

fn rate_by_route(series: &str) -> SeriesExpr {
    SeriesExpr::new(
        SeriesSelector::new(SeriesName::new(series).unwrap()),
        Aggregation::Rate,
        Duration::from_secs(300),
    )
    .by(["route"])
}

/// `rate(errors) / rate(requests) > 5%` held for 10 minutes, ticking every minute.
pub fn high_error_rate() -> Rule {
    Rule::builder(
        "HighErrorRate",
        Expr::Ratio {
            numerator: rate_by_route("http_errors_total"),
            denominator: rate_by_route("http_requests_total"),
        },
    )
    .condition(ComparisonOperator::GreaterThan, 0.05)
    .for_duration(MINUTE * 10)
    .interval(MINUTE)
    .severity(Severity::Critical)
    .label("team", "web")
    .annotation("summary", "{{ $labels.route }} error rate {{ $value }}")
    .build()
    .unwrap()
}

/// Cumulative request and error counters per route.
#[derive(Debug, Default)]
pub struct Traffic {
    counters: BTreeMap<String, (f64, f64)>,
}

impl Traffic {
    /// Records one minute of traffic on `route` and pushes the counters.
    pub fn minute(&mut self, source: &MemorySource, route: &str, minute: i64, errors: f64, requests: f64) {
        let (err_total, req_total) = self.counters.entry(route.to_string()).or_default();
        *err_total += errors;
        *req_total += requests;

        let labels = LabelSet::new().with("route", route);
        let ts = at(minute).timestamp_millis();
        source.push("http_errors_total", labels.clone(), ts, *err_total);
        source.push("http_requests_total", labels, ts, *req_total);
    }
}

pub fn manager_with(
    source: &MemorySource,
    channels: Vec<Arc<dyn NotificationChannel>>,
    notifier: NotifierConfig,
) -> AlertManager {
    let evaluator = Evaluator::new(
        Arc::new(source.clone()),
        SampleWindowStore::default(),
        Diagnostics::default(),
        EvaluatorConfig::default(),
    );
    AlertManager::new(
        AlertManagerConfig::default(),
        evaluator,
        Notifier::new(notifier, channels),
    )
}

pub fn manager(source: &MemorySource) -> AlertManager {
    manager_with(source, Vec::new(), NotifierConfig::default())
}

/// A channel that replays scripted results and records every payload.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    script: Mutex<VecDeque<Result<(), DeliveryError>>>,
    received: Mutex<Vec<(AlertPayload, tokio::time::Instant)>>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(script: Vec<Result<(), DeliveryError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn payloads(&self) -> Vec<AlertPayload> {
        self.received.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn states(&self) -> Vec<StateKind> {
        self.received.lock().iter().map(|(p, _)| p.state).collect()
    }

    pub fn times(&self) -> Vec<tokio::time::Instant> {
        self.received.lock().iter().map(|(_, t)| *t).collect()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, payload: &AlertPayload) -> Result<(), DeliveryError> {
        self.received
            .lock()
            .push((payload.clone(), tokio::time::Instant::now()));
        self.script.lock().pop_front().unwrap_or(Ok(()))
    }
}
