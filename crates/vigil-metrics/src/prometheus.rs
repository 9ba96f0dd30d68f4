//! A [`MetricSource`] backed by the Prometheus HTTP query API.
//!
//! Raw samples are fetched with an instant query of a range-vector selector
//! evaluated at the end of the range, so the server returns every stored
//! sample in the window instead of a resampled series:
//!
//! ```text
//! GET /api/v1/query?query=http_requests_total{job="api"}[300000ms]&time=1700000000.000
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{MetricsError, QueryError, Result};
use crate::source::MetricSource;
use crate::types::{LabelSet, SeriesSample, SeriesSelector, TimeRange};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Queries a Prometheus-compatible server.
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusSource {
    /// Creates a source for the server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::InvalidSource` if the URL is not http(s) or the
    /// HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(MetricsError::InvalidSource {
                reason: format!("url must start with http:// or https://, got '{base_url}'"),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetricsError::InvalidSource {
                reason: e.to_string(),
            })?;

        Ok(Self { client, base_url })
    }

    /// Returns the server base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Builds the range-vector selector sent as `query`.
fn range_query(selector: &SeriesSelector, range: TimeRange) -> String {
    format!("{selector}[{}ms]", range.duration_millis().max(1))
}

/// Formats a millisecond timestamp as Prometheus' fractional seconds.
fn eval_time(millis: i64) -> String {
    format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000))
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum ApiData {
    Matrix(Vec<MatrixSeries>),
    Vector(Vec<VectorSample>),
    Scalar(serde_json::Value),
    String(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct MatrixSeries {
    metric: BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

fn series_labels(mut metric: BTreeMap<String, String>) -> LabelSet {
    metric.remove("__name__");
    LabelSet::from(metric)
}

fn parse_point(labels: &LabelSet, (ts, raw): (f64, String)) -> std::result::Result<SeriesSample, QueryError> {
    let value = match raw.as_str() {
        "NaN" => f64::NAN,
        "+Inf" => f64::INFINITY,
        "-Inf" => f64::NEG_INFINITY,
        other => other
            .parse()
            .map_err(|_| QueryError::permanent(format!("invalid sample value '{other}'")))?,
    };
    Ok(SeriesSample::new((ts * 1000.0).round() as i64, value, labels.clone()))
}

/// Decodes a query API response body into samples.
fn parse_response(body: &[u8]) -> std::result::Result<Vec<SeriesSample>, QueryError> {
    let response: ApiResponse = serde_json::from_slice(body)
        .map_err(|e| QueryError::permanent(format!("undecodable response: {e}")))?;

    if response.status != "success" {
        return Err(QueryError::permanent(
            response.error.unwrap_or_else(|| "query failed".to_string()),
        ));
    }

    let mut samples = Vec::new();
    match response.data {
        Some(ApiData::Matrix(series)) => {
            for s in series {
                let labels = series_labels(s.metric);
                for point in s.values {
                    samples.push(parse_point(&labels, point)?);
                }
            }
        }
        Some(ApiData::Vector(vector)) => {
            for s in vector {
                let labels = series_labels(s.metric);
                samples.push(parse_point(&labels, s.value)?);
            }
        }
        Some(ApiData::Scalar(_) | ApiData::String(_)) => {
            return Err(QueryError::permanent("expected a matrix result"));
        }
        None => {}
    }
    Ok(samples)
}

fn classify(err: &reqwest::Error) -> QueryError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        QueryError::transient(err.to_string())
    } else {
        QueryError::permanent(err.to_string())
    }
}

#[async_trait]
impl MetricSource for PrometheusSource {
    async fn query(
        &self,
        selector: &SeriesSelector,
        range: TimeRange,
    ) -> std::result::Result<Vec<SeriesSample>, QueryError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let query = range_query(selector, range);
        let time = eval_time(range.end);
        debug!(%url, %query, "querying prometheus");

        let response = self
            .client
            .get(&url)
            .query(&[("query", query.as_str()), ("time", time.as_str())])
            .send()
            .await
            .map_err(|e| classify(&e))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| classify(&e))?;

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!(%status, "prometheus query failed");
            return Err(QueryError::transient(format!("server returned {status}")));
        }
        if !status.is_success() {
            // Prometheus reports bad queries as 400 with a JSON error body.
            let reason = parse_response(&body)
                .err()
                .map_or_else(|| format!("server returned {status}"), |e| e.to_string());
            return Err(QueryError::permanent(reason));
        }

        parse_response(&body)
    }

    fn name(&self) -> &str {
        "prometheus"
    }
}
