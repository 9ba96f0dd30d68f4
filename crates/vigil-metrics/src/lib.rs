//! Sample windows and metric sources for the vigil alert engine.
//!
//! `vigil-metrics` holds the recent samples an alert rule is evaluated over
//! and the interface used to fetch them from a metric backend.
//!
//! # Features
//!
//! - **Bounded windows**: a fixed-capacity ring per series, with retention
//! - **Window functions**: sum, avg, min, max, last, count, rate, percentile
//! - **Label matching**: `=`, `!=`, `=~` and `!~` matchers over label sets
//! - **Sources**: an async [`MetricSource`] trait, an in-memory source and a
//!   Prometheus HTTP source (feature `prometheus`)
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use vigil_metrics::{Aggregation, LabelSet, SampleWindowStore, WindowConfig, WindowValue};
//!
//! let store = SampleWindowStore::new(WindowConfig::default());
//! let labels = LabelSet::new().with("route", "/login");
//!
//! store.record("http_requests_total", &labels, 0, 100.0);
//! store.record("http_requests_total", &labels, 60_000, 160.0);
//!
//! let rate = store.aggregate(
//!     "http_requests_total",
//!     &labels,
//!     Duration::from_secs(300),
//!     Aggregation::Rate,
//!     2,
//!     60_000,
//! );
//! assert_eq!(rate, WindowValue::Value(1.0));
//! ```

#![forbid(unsafe_code)]
#![doc(html_root_url = "https://docs.rs/vigil-metrics/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod types;
pub mod window;
pub mod source;
#[cfg(feature = "prometheus")]
pub mod prometheus;

// Re-export main types at crate root
pub use error::{MetricsError, QueryError, Result};
pub use types::{
    Aggregation, LabelMatcher, LabelSet, MatchOp, Sample, SeriesName, SeriesSample,
    SeriesSelector, TimeRange, duration_to_millis,
};
pub use window::{SampleWindowStore, WindowConfig, WindowValue, ratio};
pub use source::{MemorySource, MetricSource};
#[cfg(feature = "prometheus")]
pub use prometheus::PrometheusSource;
