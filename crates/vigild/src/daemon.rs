//! Wiring of the engine components and the periodic health log.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};
use vigil_alerts::{
    AlertManager, ChannelConfig, Diagnostics, Evaluator, Notifier, Rule, Scheduler,
    load_rules_file,
};
use vigil_metrics::SampleWindowStore;

use crate::config::DaemonConfig;
use crate::error::Result;

/// Builds the alert manager described by `config`.
///
/// # Errors
///
/// Returns an error if the metric source or a channel cannot be built.
pub fn build_manager(config: &DaemonConfig) -> Result<AlertManager> {
    let source = config.source.build()?;
    let evaluator = Evaluator::new(
        source,
        SampleWindowStore::new(config.window),
        Diagnostics::new(config.evaluator.degraded_after),
        config.evaluator,
    );

    let channels = config
        .channels
        .iter()
        .map(ChannelConfig::build)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    info!(
        channels = ?config.channels.iter().map(ChannelConfig::name).collect::<Vec<_>>(),
        "notification channels ready"
    );

    let notifier = Notifier::new(config.notifier, channels);
    Ok(AlertManager::new(config.manager, evaluator, notifier))
}

/// Reads the rule file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a rule document.
/// Individually invalid rules are skipped.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>> {
    let set = load_rules_file(path)?;
    info!(
        path = %path.display(),
        loaded = set.rules.len(),
        rejected = set.errors.len(),
        "rule file read"
    );
    Ok(set.rules)
}

/// The running engine: notifier workers, scheduler and health log.
///
/// The scheduler and the notifier have separate stop signals. Stopping waits
/// for the scheduler and its ticks in flight before the notifier stops, so
/// events from those ticks are delivered or logged as undelivered.
#[derive(Debug)]
pub struct Engine {
    manager: AlertManager,
    reload: mpsc::Sender<Vec<Rule>>,
    scheduler_stop: watch::Sender<bool>,
    notifier_stop: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    notifier: JoinHandle<()>,
    health: JoinHandle<()>,
    grace: Duration,
}

impl Engine {
    /// Starts the engine tasks for `manager` with the initial `rules`.
    #[must_use]
    pub fn spawn(manager: AlertManager, config: &DaemonConfig, rules: Vec<Rule>) -> Self {
        let (scheduler_stop, scheduler_rx) = watch::channel(false);
        let (notifier_stop, notifier_rx) = watch::channel(false);
        let (reload, reload_rx) = mpsc::channel(4);

        let notifier = manager.notifier().start(notifier_rx.clone());
        let scheduler = Scheduler::new(manager.clone(), config.scheduler);
        let scheduler = tokio::spawn(scheduler.run(rules, reload_rx, scheduler_rx));
        let health = tokio::spawn(log_health(manager.clone(), config.health_interval, notifier_rx));

        Self {
            manager,
            reload,
            scheduler_stop,
            notifier_stop,
            scheduler,
            notifier,
            health,
            grace: config.notifier.delivery_timeout,
        }
    }

    /// Hands a new rule set to the scheduler. Returns `false` if the
    /// scheduler has stopped.
    pub async fn reload(&self, rules: Vec<Rule>) -> bool {
        self.reload.send(rules).await.is_ok()
    }

    /// Stops the scheduler and waits for its running ticks, gives queued
    /// notifications up to one delivery timeout to go out, then stops the
    /// notifier.
    ///
    /// # Errors
    ///
    /// Returns an error if one of the engine tasks panicked.
    pub async fn stop(self) -> Result<()> {
        self.scheduler_stop.send_replace(true);
        self.scheduler.await?;

        let notifier = self.manager.notifier();
        if tokio::time::timeout(self.grace, notifier.wait_idle()).await.is_err() {
            warn!(
                queued = notifier.stats().queued,
                "notifications still pending, stopping anyway"
            );
        }

        self.notifier_stop.send_replace(true);
        self.notifier.await?;
        self.health.await?;
        Ok(())
    }
}

/// Logs a health snapshot every `interval` until `shutdown` turns `true`.
pub async fn log_health(manager: AlertManager, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let health = manager.health(Utc::now());
                info!(
                    rules = health.rules,
                    pending = health.instances.pending,
                    firing = health.instances.firing,
                    series = health.series,
                    evaluations = health.evaluation.evaluations,
                    evaluation_errors = health.evaluation.evaluation_errors,
                    recent_error_rate = health.evaluation.recent_error_rate,
                    skipped_ticks = health.evaluation.skipped_ticks,
                    delivered = health.notifications.delivered,
                    failed = health.notifications.failed,
                    queued = health.notifications.queued,
                    undelivered = health.notifications.undelivered,
                    "health"
                );
                for degraded in &health.evaluation.degraded {
                    warn!(
                        rule = %degraded.rule,
                        consecutive_failures = degraded.consecutive_failures,
                        last_error = %degraded.last_error,
                        "rule evaluation degraded"
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
