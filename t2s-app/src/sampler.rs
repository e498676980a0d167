use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use t2s_core::{MetricSample, MetricSampler, SamplerError};

/// Samples host metrics through the Prometheus instant-query API, one PromQL
/// expression per metric name.
pub struct PrometheusSampler {
    http: reqwest::Client,
    endpoint: String,
    queries: BTreeMap<String, String>,
}

impl PrometheusSampler {
    pub fn new(base_url: &str, queries: BTreeMap<String, String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/api/v1/query", base_url.trim_end_matches('/')),
            queries,
        })
    }

    async fn query(&self, expr: &str) -> Result<Option<f64>, SamplerError> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("query", expr)])
            .send()
            .await
            .map_err(|e| SamplerError::SamplerUnavailable(format!("prometheus request: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SamplerError::SamplerUnavailable(format!("prometheus body: {e}")))?;
        if !status.is_success() {
            return Err(SamplerError::SamplerUnavailable(format!(
                "prometheus returned {status}"
            )));
        }
        parse_query_response(&body)
    }
}

#[async_trait]
impl MetricSampler for PrometheusSampler {
    #[tracing::instrument(level = "debug", skip_all, fields(queries = self.queries.len()))]
    async fn sample(&self) -> Result<Vec<MetricSample>, SamplerError> {
        let at = Utc::now();
        let mut samples = Vec::with_capacity(self.queries.len());
        let mut last_error = None;
        let mut failed = 0;
        for (metric, expr) in &self.queries {
            match self.query(expr).await {
                Ok(Some(value)) => samples.push(MetricSample::new(metric.clone(), value, at)),
                Ok(None) => tracing::debug!(metric = %metric, "query returned no series"),
                Err(err) => {
                    tracing::warn!(metric = %metric, error = %err, "metric query failed; skipping");
                    failed += 1;
                    last_error = Some(err);
                }
            }
        }
        // Only a sampler that could answer nothing counts as down.
        match last_error {
            Some(err) if failed == self.queries.len() => Err(err),
            _ => Ok(samples),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Vector(Vec<VectorSeries>),
    Scalar(SampleValue),
    Matrix(serde_json::Value),
    String(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct VectorSeries {
    value: SampleValue,
}

/// `[<unix seconds>, "<value>"]`; the evaluation uses the sampling time instead.
#[derive(Debug, Deserialize)]
struct SampleValue(serde::de::IgnoredAny, String);

impl SampleValue {
    fn parse(&self) -> Result<f64, SamplerError> {
        self.1
            .parse::<f64>()
            .map_err(|_| SamplerError::SamplerUnavailable(format!("non-numeric sample {:?}", self.1)))
    }
}

/// Reduces an instant-query response to one value. Vectors with several
/// series report the largest finite value (the worst disk, the hottest GPU).
fn parse_query_response(body: &str) -> Result<Option<f64>, SamplerError> {
    let parsed: QueryResponse = serde_json::from_str(body)
        .map_err(|e| SamplerError::SamplerUnavailable(format!("prometheus response: {e}")))?;
    if parsed.status != "success" {
        return Err(SamplerError::SamplerUnavailable(
            parsed.error.unwrap_or_else(|| format!("query status {}", parsed.status)),
        ));
    }
    match parsed.data {
        Some(QueryData::Scalar(value)) => Ok(Some(value.parse()?).filter(|v| v.is_finite())),
        Some(QueryData::Vector(series)) => {
            let mut best: Option<f64> = None;
            for s in &series {
                let v = s.value.parse()?;
                if v.is_finite() {
                    best = Some(best.map_or(v, |b| b.max(v)));
                }
            }
            Ok(best)
        }
        Some(QueryData::Matrix(_)) | Some(QueryData::String(_)) => Err(
            SamplerError::SamplerUnavailable("query must return a vector or scalar".to_string()),
        ),
        None => Ok(None),
    }
}
