//! Bounded in-memory window of recent samples per series.
//!
//! The [`SampleWindowStore`] keeps the most recent samples of every series in
//! a fixed-capacity ring so windowed aggregations (rate over 5 minutes, p99
//! over 10 minutes) can be recomputed on every tick without re-querying the
//! metric source for overlapping ranges.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{
    Aggregation, LabelSet, Sample, SeriesSample, SeriesSelector, TimeRange, duration_to_millis,
};

/// Configuration for the window store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Maximum samples kept per series; the oldest sample is overwritten.
    pub capacity: usize,
    /// Samples older than this (relative to the newest sample of the series)
    /// are dropped.
    #[serde(with = "retention_secs")]
    pub retention: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            retention: Duration::from_secs(3600),
        }
    }
}

mod retention_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// The result of a windowed aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowValue {
    /// The aggregated value.
    Value(f64),
    /// Not enough samples in the window. Callers treat this as a false
    /// condition, never as an error.
    NoData,
}

impl WindowValue {
    /// Returns the value, if any.
    #[must_use]
    pub const fn value(&self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(*v),
            Self::NoData => None,
        }
    }

    /// Returns true if there is no data.
    #[must_use]
    pub const fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData)
    }
}

/// Ring buffer of samples for a single series, ordered by timestamp.
#[derive(Debug)]
struct SampleRing {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    /// Inserts a sample at its sorted position.
    ///
    /// A sample whose timestamp is already held is ignored, which makes
    /// overlapping refreshes idempotent. A sample older than the retention
    /// window, or older than every sample of a full ring, is dropped.
    fn push(&mut self, sample: Sample, retention_millis: i64) -> bool {
        let newest = self
            .newest_timestamp()
            .map_or(sample.timestamp, |t| t.max(sample.timestamp));
        let cutoff = newest.saturating_sub(retention_millis);
        if sample.timestamp < cutoff {
            return false;
        }

        let at = self
            .samples
            .partition_point(|s| s.timestamp < sample.timestamp);
        if self
            .samples
            .get(at)
            .is_some_and(|s| s.timestamp == sample.timestamp)
        {
            return false;
        }

        if self.samples.len() < self.capacity {
            self.samples.insert(at, sample);
        } else if at == 0 {
            return false;
        } else {
            self.samples.pop_front();
            self.samples.insert(at - 1, sample);
        }

        while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
            self.samples.pop_front();
        }
        true
    }

    fn newest_timestamp(&self) -> Option<i64> {
        self.samples.back().map(|s| s.timestamp)
    }

    fn in_range(&self, range: TimeRange) -> Vec<Sample> {
        // Samples are sorted, so skip to the start with a binary search.
        let start = self.samples.partition_point(|s| s.timestamp < range.start);
        self.samples
            .range(start..)
            .take_while(|s| s.timestamp <= range.end)
            .copied()
            .collect()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

type Ring = Arc<RwLock<SampleRing>>;

/// Thread-safe window store keyed by series name and label set.
///
/// Each series has its own lock, so writers of different series never contend
/// and readers only block the single series they touch. The series index
/// itself is read-mostly; it is write-locked only to add or evict series.
#[derive(Debug, Clone)]
pub struct SampleWindowStore {
    config: WindowConfig,
    series: Arc<RwLock<HashMap<String, HashMap<LabelSet, Ring>>>>,
}

impl SampleWindowStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config: WindowConfig {
                capacity: config.capacity.max(2),
                ..config
            },
            series: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the store configuration.
    #[must_use]
    pub const fn config(&self) -> &WindowConfig {
        &self.config
    }

    fn ring(&self, series: &str, labels: &LabelSet) -> Option<Ring> {
        self.series
            .read()
            .get(series)
            .and_then(|by_labels| by_labels.get(labels))
            .map(Arc::clone)
    }

    fn ring_or_insert(&self, series: &str, labels: &LabelSet) -> Ring {
        if let Some(ring) = self.ring(series, labels) {
            return ring;
        }

        let mut index = self.series.write();
        let capacity = self.config.capacity;
        Arc::clone(
            index
                .entry(series.to_string())
                .or_default()
                .entry(labels.clone())
                .or_insert_with(|| Arc::new(RwLock::new(SampleRing::new(capacity)))),
        )
    }

    /// Records a sample for a series.
    ///
    /// Out-of-order samples are kept in timestamp order. Returns `false` if
    /// the sample was ignored: its timestamp is already held, or it falls
    /// outside retention or capacity.
    pub fn record(&self, series: &str, labels: &LabelSet, timestamp: i64, value: f64) -> bool {
        let ring = self.ring_or_insert(series, labels);
        let retention = duration_to_millis(self.config.retention);
        ring.write().push(Sample::new(timestamp, value), retention)
    }

    /// Records the samples returned by a source query. Returns how many were
    /// accepted.
    pub fn record_all<'a>(
        &self,
        series: &str,
        samples: impl IntoIterator<Item = &'a SeriesSample>,
    ) -> usize {
        let mut accepted = 0;
        for s in samples {
            if self.record(series, &s.labels, s.timestamp, s.value) {
                accepted += 1;
            }
        }
        debug!(series, accepted, "recorded samples");
        accepted
    }

    /// Returns the samples of one series within `[now - window, now]`.
    #[must_use]
    pub fn samples(&self, series: &str, labels: &LabelSet, window: Duration, now: i64) -> Vec<Sample> {
        self.ring(series, labels)
            .map(|ring| ring.read().in_range(TimeRange::ending_at(now, window)))
            .unwrap_or_default()
    }

    /// Computes `func` over the samples of one series within
    /// `[now - window, now]`.
    ///
    /// Returns [`WindowValue::NoData`] if fewer than `min_samples` samples (or
    /// fewer than the function itself needs) fall within the window.
    #[must_use]
    pub fn aggregate(
        &self,
        series: &str,
        labels: &LabelSet,
        window: Duration,
        func: Aggregation,
        min_samples: usize,
        now: i64,
    ) -> WindowValue {
        let samples = self.samples(series, labels, window, now);
        apply_min(func, &samples, min_samples)
    }

    /// Returns the label sets of `selector` that have at least one sample in
    /// `[now - window, now]`.
    #[must_use]
    pub fn label_sets(&self, selector: &SeriesSelector, window: Duration, now: i64) -> Vec<LabelSet> {
        let range = TimeRange::ending_at(now, window);
        self.matching(selector)
            .into_iter()
            .filter(|(_, ring)| !ring.read().in_range(range).is_empty())
            .map(|(labels, _)| labels)
            .collect()
    }

    fn matching(&self, selector: &SeriesSelector) -> Vec<(LabelSet, Ring)> {
        let index = self.series.read();
        index
            .get(selector.name.as_str())
            .map(|by_labels| {
                by_labels
                    .iter()
                    .filter(|(labels, _)| selector.matches(labels))
                    .map(|(labels, ring)| (labels.clone(), Arc::clone(ring)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Aggregates every series matched by `selector`, fanning out into one
    /// result per group.
    ///
    /// Without `by`, every distinct label set with samples in the window is
    /// its own group. With `by`, series are grouped on the projection of their
    /// labels onto those names: `rate` is computed per series and summed, all
    /// other functions pool the samples of the group.
    #[must_use]
    pub fn aggregate_group(
        &self,
        selector: &SeriesSelector,
        by: Option<&[String]>,
        window: Duration,
        func: Aggregation,
        min_samples: usize,
        now: i64,
    ) -> BTreeMap<LabelSet, WindowValue> {
        let range = TimeRange::ending_at(now, window);
        let mut groups: BTreeMap<LabelSet, Vec<Vec<Sample>>> = BTreeMap::new();

        for (labels, ring) in self.matching(selector) {
            let samples = ring.read().in_range(range);
            if samples.is_empty() {
                continue;
            }
            let key = by.map_or_else(|| labels.clone(), |names| labels.project(names));
            groups.entry(key).or_default().push(samples);
        }

        groups
            .into_iter()
            .map(|(key, members)| {
                let value = if by.is_some() {
                    aggregate_members(func, members, min_samples)
                } else {
                    members
                        .first()
                        .map_or(WindowValue::NoData, |s| apply_min(func, s, min_samples))
                };
                (key, value)
            })
            .collect()
    }

    /// Returns the total number of series held.
    #[must_use]
    pub fn series_count(&self) -> usize {
        self.series.read().values().map(HashMap::len).sum()
    }

    /// Returns the number of samples held for a series.
    #[must_use]
    pub fn sample_count(&self, series: &str, labels: &LabelSet) -> usize {
        self.ring(series, labels).map_or(0, |ring| ring.read().len())
    }

    /// Drops series whose newest sample is older than the retention window.
    /// Returns the number of series removed.
    pub fn evict_idle(&self, now: i64) -> usize {
        let cutoff = now - duration_to_millis(self.config.retention);
        let mut index = self.series.write();
        let before: usize = index.values().map(HashMap::len).sum();

        for by_labels in index.values_mut() {
            by_labels.retain(|_, ring| ring.read().newest_timestamp().is_some_and(|t| t >= cutoff));
        }
        index.retain(|_, by_labels| !by_labels.is_empty());

        let after: usize = index.values().map(HashMap::len).sum();
        let evicted = before - after;
        if evicted > 0 {
            debug!(evicted, remaining = after, "evicted idle series");
        }
        evicted
    }
}

impl Default for SampleWindowStore {
    fn default() -> Self {
        Self::new(WindowConfig::default())
    }
}

fn apply_min(func: Aggregation, samples: &[Sample], min_samples: usize) -> WindowValue {
    if samples.len() < min_samples {
        return WindowValue::NoData;
    }
    func.apply(samples).map_or(WindowValue::NoData, WindowValue::Value)
}

fn aggregate_members(func: Aggregation, members: Vec<Vec<Sample>>, min_samples: usize) -> WindowValue {
    if func == Aggregation::Rate {
        let rates: Vec<f64> = members
            .iter()
            .filter_map(|s| apply_min(func, s, min_samples).value())
            .collect();
        if rates.is_empty() {
            return WindowValue::NoData;
        }
        return WindowValue::Value(rates.iter().sum());
    }

    let mut pooled: Vec<Sample> = members.into_iter().flatten().collect();
    pooled.sort_by_key(|s| s.timestamp);
    apply_min(func, &pooled, min_samples)
}

/// Divides two grouped results label set by label set.
///
/// A group is [`WindowValue::NoData`] when either side is missing or has no
/// data, or when the denominator is zero.
#[must_use]
pub fn ratio(
    numerator: &BTreeMap<LabelSet, WindowValue>,
    denominator: &BTreeMap<LabelSet, WindowValue>,
) -> BTreeMap<LabelSet, WindowValue> {
    numerator
        .keys()
        .chain(denominator.keys())
        .map(|labels| {
            let value = match (
                numerator.get(labels).and_then(WindowValue::value),
                denominator.get(labels).and_then(WindowValue::value),
            ) {
                (Some(n), Some(d)) if d != 0.0 => WindowValue::Value(n / d),
                _ => WindowValue::NoData,
            };
            (labels.clone(), value)
        })
        .collect()
}
