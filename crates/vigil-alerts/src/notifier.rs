//! Queued notification delivery.
//!
//! Events are kept in one slot per rule instance. A newer event replaces an
//! undelivered one, so only the latest state of an instance is sent. Slots are
//! drained by a fixed pool of workers; at most one event per instance is in
//! flight, which keeps delivery in order per instance.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffConfig;
use crate::channels::{AlertPayload, NotificationChannel};
use crate::config::duration_str;
use crate::error::DeliveryError;
use crate::types::{NotificationEvent, RuleInstanceId, StateKind};

/// Configuration for the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Number of delivery workers.
    pub workers: usize,
    /// Timeout of a single channel call.
    #[serde(with = "duration_str")]
    pub delivery_timeout: Duration,
    /// Window in which a repeated `(instance, state)` delivery is suppressed.
    #[serde(with = "duration_str")]
    pub dedup_window: Duration,
    /// Retry policy for retryable failures.
    pub backoff: BackoffConfig,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            delivery_timeout: Duration::from_secs(10),
            dedup_window: Duration::from_secs(300),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Notification counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifierStats {
    /// Successful channel deliveries.
    pub delivered: u64,
    /// Channel deliveries that failed fatally or ran out of attempts.
    pub failed: u64,
    /// Events dropped by the dedup window.
    pub suppressed: u64,
    /// Events replaced by a newer one before delivery.
    pub coalesced: u64,
    /// Events left undelivered at shutdown.
    pub undelivered: u64,
    /// Events waiting for delivery.
    pub queued: usize,
}

/// Progress of one event on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    /// The channel name.
    pub channel: String,
    /// Attempts made so far.
    pub attempts: u32,
    /// When the next attempt is due, while backing off.
    pub next_retry_at: Option<Instant>,
    /// The most recent failure.
    pub last_error: Option<DeliveryError>,
}

impl DeliveryAttempt {
    fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            attempts: 0,
            next_retry_at: None,
            last_error: None,
        }
    }
}

/// How a delivery to one channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The channel accepted the alert.
    Delivered,
    /// The channel rejected the alert for good, or retries ran out.
    Failed,
    /// Retrying stopped because a newer event arrived or shutdown began.
    Abandoned,
}

#[derive(Debug, Default)]
struct Slot {
    queued: Option<NotificationEvent>,
    in_flight: Option<watch::Sender<bool>>,
    last_delivered: Option<(StateKind, Instant)>,
}

#[derive(Debug, Default)]
struct Queue {
    slots: HashMap<RuleInstanceId, Slot>,
    ready: VecDeque<RuleInstanceId>,
    in_flight: usize,
    stopped: bool,
}

impl Queue {
    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.in_flight == 0
    }
}

struct Job {
    event: NotificationEvent,
    superseded: watch::Receiver<bool>,
}

struct NotifierInner {
    config: NotifierConfig,
    channels: Vec<Arc<dyn NotificationChannel>>,
    queue: Mutex<Queue>,
    work: Notify,
    idle: Notify,
    delivered: AtomicU64,
    failed: AtomicU64,
    suppressed: AtomicU64,
    coalesced: AtomicU64,
    undelivered: AtomicU64,
}

/// Delivers notification events to every configured channel.
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("config", &self.inner.config)
            .field("channels", &self.inner.channels)
            .finish_non_exhaustive()
    }
}

/// Resolves once `rx` holds `true`. Never resolves if the sender is gone.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|set| *set).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl Notifier {
    /// Creates a notifier delivering to `channels`.
    #[must_use]
    pub fn new(config: NotifierConfig, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                config,
                channels,
                queue: Mutex::new(Queue::default()),
                work: Notify::new(),
                idle: Notify::new(),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                undelivered: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &NotifierConfig {
        &self.inner.config
    }

    /// Queues an event.
    ///
    /// An undelivered event of the same instance is replaced. If an event of
    /// the instance is in flight, the new one waits for it and any pending
    /// retry of the older event is abandoned. Once the workers have stopped,
    /// the event is logged as undelivered instead.
    pub fn enqueue(&self, event: NotificationEvent) {
        let id = event.rule_instance_id.clone();
        let mut queue = self.inner.queue.lock();
        if queue.stopped {
            drop(queue);
            self.inner.undelivered.fetch_add(1, Ordering::Relaxed);
            warn!(instance = %id, state = %event.to_state, "notification undelivered at shutdown");
            return;
        }
        let slot = queue.slots.entry(id.clone()).or_default();

        let replaced = slot.queued.replace(event);
        if let Some(old) = &replaced {
            self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(instance = %id, replaced = %old.to_state, "coalesced notification");
        }
        if let Some(superseded) = &slot.in_flight {
            superseded.send_replace(true);
        }
        let schedule = replaced.is_none() && slot.in_flight.is_none();
        if schedule {
            queue.ready.push_back(id);
        }
        drop(queue);

        if schedule {
            self.inner.work.notify_one();
        }
    }

    /// Starts the delivery workers.
    ///
    /// The returned task completes once every worker stopped after `shutdown`
    /// turned `true`. Events still queued at that point, and any enqueued
    /// later, are logged as undelivered.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut workers = JoinSet::new();
        for worker in 0..self.inner.config.workers.max(1) {
            let notifier = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { notifier.worker(worker, shutdown).await });
        }

        let notifier = self.clone();
        tokio::spawn(async move {
            while workers.join_next().await.is_some() {}
            notifier.drain_undelivered();
        })
    }

    async fn worker(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "notification worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(job) = self.next_job() {
                self.run(job, shutdown.clone()).await;
                continue;
            }
            tokio::select! {
                () = self.inner.work.notified() => {}
                () = signalled(&mut shutdown) => break,
            }
        }
        debug!(worker, "notification worker stopped");
    }

    /// Takes the next event to deliver, dropping events inside the dedup window.
    fn next_job(&self) -> Option<Job> {
        let mut queue = self.inner.queue.lock();
        while let Some(id) = queue.ready.pop_front() {
            let Some(slot) = queue.slots.get_mut(&id) else {
                continue;
            };
            let Some(event) = slot.queued.take() else {
                continue;
            };

            let duplicate = slot.last_delivered.is_some_and(|(state, at)| {
                state == event.to_state && at.elapsed() < self.inner.config.dedup_window
            });
            if duplicate {
                self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(instance = %id, state = %event.to_state, "suppressed duplicate notification");
                continue;
            }

            let (tx, rx) = watch::channel(false);
            slot.in_flight = Some(tx);
            queue.in_flight += 1;
            return Some(Job {
                event,
                superseded: rx,
            });
        }
        drop(queue);
        self.inner.idle.notify_waiters();
        None
    }

    async fn run(&self, job: Job, shutdown: watch::Receiver<bool>) {
        let Job { event, superseded } = job;
        let payload = AlertPayload::from_event(&event);

        let outcomes = join_all(self.inner.channels.iter().map(|channel| {
            self.deliver(channel.as_ref(), &payload, superseded.clone(), shutdown.clone())
        }))
        .await;
        let delivered = outcomes.contains(&DeliveryOutcome::Delivered);

        let id = &event.rule_instance_id;
        let mut queue = self.inner.queue.lock();
        queue.in_flight -= 1;
        let window = self.inner.config.dedup_window;
        let mut reschedule = false;
        if let Some(slot) = queue.slots.get_mut(id) {
            slot.in_flight = None;
            if delivered {
                slot.last_delivered = Some((event.to_state, Instant::now()));
            }
            reschedule = slot.queued.is_some();
        }
        if reschedule {
            queue.ready.push_back(id.clone());
        }
        queue.slots.retain(|_, slot| {
            slot.queued.is_some()
                || slot.in_flight.is_some()
                || slot.last_delivered.is_some_and(|(_, at)| at.elapsed() < window)
        });
        let idle = queue.is_idle();
        drop(queue);

        if reschedule {
            self.inner.work.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Delivers one payload to one channel, retrying retryable failures.
    async fn deliver(
        &self,
        channel: &dyn NotificationChannel,
        payload: &AlertPayload,
        mut superseded: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> DeliveryOutcome {
        let config = &self.inner.config;
        let mut attempt = DeliveryAttempt::new(channel.name());

        loop {
            attempt.attempts += 1;
            let result = tokio::time::timeout(config.delivery_timeout, channel.send(payload))
                .await
                .unwrap_or_else(|_| {
                    Err(DeliveryError::retryable(format!(
                        "delivery timed out after {}ms",
                        config.delivery_timeout.as_millis()
                    )))
                });

            let err = match result {
                Ok(()) => {
                    self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                    info!(
                        channel = %attempt.channel,
                        instance = %payload.instance,
                        state = %payload.state,
                        attempts = attempt.attempts,
                        "notification delivered"
                    );
                    return DeliveryOutcome::Delivered;
                }
                Err(err) => err,
            };

            if !err.is_retryable() || !config.backoff.should_retry(attempt.attempts) {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    channel = %attempt.channel,
                    instance = %payload.instance,
                    state = %payload.state,
                    attempts = attempt.attempts,
                    error = %err,
                    "notification delivery failed"
                );
                return DeliveryOutcome::Failed;
            }

            let delay = config
                .backoff
                .jittered_delay(attempt.attempts, &mut rand::thread_rng());
            attempt.next_retry_at = Some(Instant::now() + delay);
            warn!(
                channel = %attempt.channel,
                instance = %payload.instance,
                attempts = attempt.attempts,
                retry_in_ms = delay.as_millis(),
                error = %err,
                "notification delivery failed, retrying"
            );
            attempt.last_error = Some(err);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = signalled(&mut superseded) => {
                    debug!(
                        channel = %attempt.channel,
                        instance = %payload.instance,
                        "retry abandoned for a newer notification"
                    );
                    return DeliveryOutcome::Abandoned;
                }
                () = signalled(&mut shutdown) => {
                    warn!(
                        channel = %attempt.channel,
                        instance = %payload.instance,
                        attempts = attempt.attempts,
                        last_error = ?attempt.last_error,
                        "notification undelivered at shutdown"
                    );
                    return DeliveryOutcome::Abandoned;
                }
            }
        }
    }

    fn drain_undelivered(&self) {
        let mut queue = self.inner.queue.lock();
        queue.stopped = true;
        queue.ready.clear();
        for (id, slot) in &mut queue.slots {
            if let Some(event) = slot.queued.take() {
                self.inner.undelivered.fetch_add(1, Ordering::Relaxed);
                warn!(instance = %id, state = %event.to_state, "notification undelivered at shutdown");
            }
        }
        drop(queue);
        self.inner.idle.notify_waiters();
    }

    /// Waits until no event is queued or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.queue.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Returns a snapshot of the notification counters.
    #[must_use]
    pub fn stats(&self) -> NotifierStats {
        let queued = self
            .inner
            .queue
            .lock()
            .slots
            .values()
            .filter(|s| s.queued.is_some())
            .count();
        NotifierStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            suppressed: self.inner.suppressed.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            undelivered: self.inner.undelivered.load(Ordering::Relaxed),
            queued,
        }
    }
}
