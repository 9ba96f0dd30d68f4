//! The metric source interface and an in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::QueryError;
use crate::types::{LabelSet, SeriesSample, SeriesSelector, TimeRange};

/// A backend that returns raw samples for a selector over a time range.
///
/// Implementations return every sample of every matching series whose
/// timestamp falls within the range, tagged with the series labels. An empty
/// result is not an error.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Fetches raw samples for `selector` within `range`.
    async fn query(
        &self,
        selector: &SeriesSelector,
        range: TimeRange,
    ) -> Result<Vec<SeriesSample>, QueryError>;

    /// A short name used in logs.
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: MetricSource + ?Sized> MetricSource for Arc<T> {
    async fn query(
        &self,
        selector: &SeriesSelector,
        range: TimeRange,
    ) -> Result<Vec<SeriesSample>, QueryError> {
        (**self).query(selector, range).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// An in-memory metric source.
///
/// Samples are pushed directly, and a failure can be injected so callers can
/// exercise their error paths. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    series: Arc<RwLock<HashMap<String, Vec<SeriesSample>>>>,
    failure: Arc<RwLock<Option<QueryError>>>,
    queries: Arc<AtomicU64>,
}

impl MemorySource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a sample for a series.
    pub fn push(&self, series: &str, labels: LabelSet, timestamp: i64, value: f64) {
        let mut data = self.series.write();
        let samples = data.entry(series.to_string()).or_default();
        samples.push(SeriesSample::new(timestamp, value, labels));
        samples.sort_by_key(|s| s.timestamp);
    }

    /// Makes every following query fail with `error`, or succeed again with
    /// `None`.
    pub fn set_failure(&self, error: Option<QueryError>) {
        *self.failure.write() = error;
    }

    /// Returns how many queries were served, including failed ones.
    #[must_use]
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Drops all samples.
    pub fn clear(&self) {
        self.series.write().clear();
    }
}

#[async_trait]
impl MetricSource for MemorySource {
    async fn query(
        &self,
        selector: &SeriesSelector,
        range: TimeRange,
    ) -> Result<Vec<SeriesSample>, QueryError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.failure.read().clone() {
            return Err(err);
        }

        let data = self.series.read();
        Ok(data
            .get(selector.name.as_str())
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| range.contains(s.timestamp) && selector.matches(&s.labels))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LabelMatcher, SeriesName};

    fn selector(name: &str) -> SeriesSelector {
        SeriesSelector::new(SeriesName::new(name).unwrap())
    }

    #[tokio::test]
    async fn test_query_filters_by_range_and_labels() {
        let source = MemorySource::new();
        let a = LabelSet::new().with("job", "api");
        let b = LabelSet::new().with("job", "worker");
        source.push("up", a.clone(), 1_000, 1.0);
        source.push("up", a.clone(), 5_000, 1.0);
        source.push("up", b, 2_000, 0.0);

        let sel = selector("up").matching(LabelMatcher::equal("job", "api").unwrap());
        let samples = source
            .query(&sel, TimeRange::new(0, 3_000).unwrap())
            .await
            .unwrap();

        assert_eq!(samples, vec![SeriesSample::new(1_000, 1.0, a)]);
    }

    #[tokio::test]
    async fn test_unknown_series_is_empty() {
        let source = MemorySource::new();
        let samples = source
            .query(&selector("missing"), TimeRange::new(0, 1).unwrap())
            .await
            .unwrap();
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let source = MemorySource::new();
        source.set_failure(Some(QueryError::transient("connection refused")));

        let err = source
            .query(&selector("up"), TimeRange::new(0, 1).unwrap())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        source.set_failure(None);
        assert!(
            source
                .query(&selector("up"), TimeRange::new(0, 1).unwrap())
                .await
                .is_ok()
        );
        assert_eq!(source.query_count(), 2);
    }

    #[tokio::test]
    async fn test_shared_through_arc() {
        let source = MemorySource::new();
        source.push("up", LabelSet::new(), 10, 1.0);
        let shared: Arc<dyn MetricSource> = Arc::new(source.clone());

        let samples = shared
            .query(&selector("up"), TimeRange::new(0, 10).unwrap())
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(shared.name(), "memory");
    }
}
