//! Periodic rule evaluation.
//!
//! Every rule is an independent periodic task kept on a min-heap by due
//! instant. Due ticks run on a bounded pool; a rule whose previous tick is
//! still running skips its turn instead of queueing up behind itself.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::duration_str;
use crate::manager::AlertManager;
use crate::notifier::signalled;
use crate::types::Rule;

/// Configuration for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of rule ticks running at once.
    pub workers: usize,
    /// How often idle series are evicted from the window store.
    #[serde(with = "duration_str")]
    pub housekeeping_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            housekeeping_interval: Duration::from_secs(60),
        }
    }
}

/// Wall clock driven by the runtime's monotonic clock.
///
/// Ticks are stamped with the wall time of their due instant, so neither
/// dispatch delay nor a paused runtime shifts evaluation times.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl Clock {
    /// Starts a clock at the current wall time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Starts a clock reading `wall` now.
    #[must_use]
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            origin: Instant::now(),
        }
    }

    /// Returns the current time.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.at(Instant::now())
    }

    /// Returns the wall time of `instant`. Instants before the clock started
    /// read as its start.
    #[must_use]
    pub fn at(&self, instant: Instant) -> DateTime<Utc> {
        chrono::Duration::from_std(instant.saturating_duration_since(self.origin))
            .ok()
            .and_then(|offset| self.wall.checked_add_signed(offset))
            .unwrap_or(self.wall)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ScheduledTick {
    due: Instant,
    generation: u64,
    rule: String,
}

/// First interval boundary after `now`, counted from `due`. `None` if it is
/// past the range of [`Instant`].
fn next_boundary(due: Instant, interval: Duration, now: Instant) -> Option<Instant> {
    let mut next = due.checked_add(interval)?;
    while next <= now {
        next = next.checked_add(interval)?;
    }
    Some(next)
}

/// Reports a finished tick when dropped, including on panic.
struct Completion {
    rule: String,
    done: mpsc::UnboundedSender<String>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let _ = self.done.send(std::mem::take(&mut self.rule));
    }
}

/// Runs the ticks of every loaded rule.
#[derive(Debug)]
pub struct Scheduler {
    manager: AlertManager,
    config: SchedulerConfig,
    clock: Clock,
    queue: BinaryHeap<Reverse<ScheduledTick>>,
    generations: HashMap<String, u64>,
    next_generation: u64,
    running: HashSet<String>,
}

impl Scheduler {
    /// Creates a scheduler for `manager`.
    #[must_use]
    pub fn new(manager: AlertManager, config: SchedulerConfig) -> Self {
        Self {
            manager,
            config,
            clock: Clock::new(),
            queue: BinaryHeap::new(),
            generations: HashMap::new(),
            next_generation: 0,
            running: HashSet::new(),
        }
    }

    /// Uses `clock` to stamp ticks.
    #[must_use]
    pub const fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn schedule_now(&mut self, rule: &str) {
        self.next_generation += 1;
        self.generations.insert(rule.to_string(), self.next_generation);
        self.queue.push(Reverse(ScheduledTick {
            due: Instant::now(),
            generation: self.next_generation,
            rule: rule.to_string(),
        }));
    }

    /// Loads `rules` into the manager and adjusts the schedule. New and
    /// changed rules tick immediately; removed rules stop.
    fn reload(&mut self, rules: Vec<Rule>) {
        let summary = self.manager.load(rules, self.clock.now());
        for name in &summary.removed {
            self.generations.remove(name);
        }
        for name in summary.added.iter().chain(&summary.changed) {
            self.schedule_now(name);
        }
    }

    /// Starts every tick that is due.
    fn dispatch_due(&mut self, semaphore: &Arc<Semaphore>, done: &mpsc::UnboundedSender<String>) {
        let now = Instant::now();
        while self.queue.peek().is_some_and(|Reverse(t)| t.due <= now) {
            let Some(Reverse(tick)) = self.queue.pop() else {
                break;
            };
            if self.generations.get(&tick.rule) != Some(&tick.generation) {
                continue;
            }
            let Some(rule) = self.manager.rule(&tick.rule) else {
                continue;
            };

            match next_boundary(tick.due, rule.interval, now) {
                Some(due) => self.queue.push(Reverse(ScheduledTick {
                    due,
                    generation: tick.generation,
                    rule: tick.rule.clone(),
                })),
                None => {
                    warn!(
                        rule = %tick.rule,
                        interval = ?rule.interval,
                        "next tick out of range, rule no longer scheduled"
                    );
                    self.generations.remove(&tick.rule);
                }
            }

            if self.running.contains(&tick.rule) {
                self.manager.evaluator().diagnostics().record_skipped();
                debug!(rule = %tick.rule, "previous tick still running, tick skipped");
                continue;
            }
            self.running.insert(tick.rule.clone());

            let completion = Completion {
                rule: tick.rule,
                done: done.clone(),
            };
            let manager = self.manager.clone();
            let semaphore = Arc::clone(semaphore);
            let stamp = self.clock.at(tick.due);
            tokio::spawn(async move {
                let _completion = completion;
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                manager.tick(&rule, stamp).await;
            });
        }
    }

    /// Runs until `shutdown` turns `true`.
    ///
    /// `rules` is the initial rule set; every message on `reload` replaces it.
    /// On shutdown no new tick starts and running ticks are awaited.
    pub async fn run(
        mut self,
        rules: Vec<Rule>,
        mut reload: mpsc::Receiver<Vec<Rule>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut housekeeping = tokio::time::interval_at(
            Instant::now() + self.config.housekeeping_interval,
            self.config.housekeeping_interval,
        );
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reload_open = true;

        self.reload(rules);
        info!(
            rules = self.manager.rule_count(),
            workers = self.config.workers,
            "scheduler started"
        );

        loop {
            let next_due = self.queue.peek().map(|Reverse(t)| t.due);
            tokio::select! {
                biased;
                () = signalled(&mut shutdown) => break,
                Some(rule) = done_rx.recv() => {
                    self.running.remove(&rule);
                }
                rules = reload.recv(), if reload_open => match rules {
                    Some(rules) => self.reload(rules),
                    None => reload_open = false,
                },
                () = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.dispatch_due(&semaphore, &done_tx);
                }
                _ = housekeeping.tick() => {
                    let evicted = self.manager.housekeeping(self.clock.now());
                    debug!(evicted, "housekeeping done");
                }
            }
        }

        info!(in_flight = self.running.len(), "scheduler stopping");
        while !self.running.is_empty() {
            match done_rx.recv().await {
                Some(rule) => {
                    self.running.remove(&rule);
                }
                None => {
                    warn!("tick completion channel closed");
                    break;
                }
            }
        }
        info!("scheduler stopped");
    }
}
