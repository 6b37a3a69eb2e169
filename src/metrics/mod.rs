//! Prometheus query client for per-function traffic readings
//!
//! Readings feed status decoration and external scalers. Every query is
//! best effort: failures come back as plain error values and the caller
//! decides whether to omit the reading or retry later.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Per-request timeout against the metrics backend
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Instant-query client against a Prometheus-compatible backend
#[derive(Debug, Clone)]
pub struct PrometheusQuery {
    client: Client,
    base_url: String,
}

/// Envelope of the Prometheus query API
#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<VectorSample>,
}

/// One sample of an instant vector, `value` is `[unix_time, "number"]`
#[derive(Debug, Deserialize)]
struct VectorSample {
    value: (f64, String),
}

impl PrometheusQuery {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(QUERY_TIMEOUT)
            .user_agent(concat!("fnstack-k8s/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpError)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Requests per second hitting a function, summed across replicas.
    ///
    /// Returns 0.0 when the series does not exist yet, which is how a
    /// scaled-to-zero function with no traffic reads.
    pub async fn query_rate(&self, function_name: &str, namespace: &str) -> Result<f64> {
        let query = format!(
            "sum(rate(fnstack_function_invocation_total{{function_name=\"{function_name}.{namespace}\"}}[30s]))"
        );
        self.instant_query(&query).await
    }

    /// Total invocations recorded for a function across all replicas
    pub async fn query_invocation_total(&self, function_name: &str, namespace: &str) -> Result<f64> {
        let query = format!(
            "sum(fnstack_function_invocation_total{{function_name=\"{function_name}.{namespace}\"}})"
        );
        self.instant_query(&query).await
    }

    async fn instant_query(&self, query: &str) -> Result<f64> {
        let url = format!("{}/api/v1/query", self.base_url);
        debug!(query, "querying metrics backend");

        let resp = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(Error::HttpError)?;

        if !resp.status().is_success() {
            return Err(Error::MetricsQuery(format!(
                "HTTP {} from {url}",
                resp.status()
            )));
        }

        let envelope: QueryResponse = resp
            .json()
            .await
            .map_err(|e| Error::MetricsQuery(format!("malformed query response: {e}")))?;

        if envelope.status != "success" {
            return Err(Error::MetricsQuery(
                envelope
                    .error
                    .unwrap_or_else(|| format!("query status {:?}", envelope.status)),
            ));
        }

        let data = envelope
            .data
            .ok_or_else(|| Error::MetricsQuery("query response without data".to_string()))?;

        // An absent series yields an empty vector, not an error.
        let mut total = 0.0;
        for sample in &data.result {
            let value: f64 = sample
                .value
                .1
                .parse()
                .map_err(|_| Error::MetricsQuery(format!("non-numeric sample {:?}", sample.value.1)))?;
            if value.is_finite() {
                total += value;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn vector_body(values: &[&str]) -> String {
        let samples = values
            .iter()
            .map(|v| format!(r#"{{"metric":{{}},"value":[1724300000.0,"{v}"]}}"#))
            .collect::<Vec<_>>()
            .join(",");
        format!(r#"{{"status":"success","data":{{"resultType":"vector","result":[{samples}]}}}}"#)
    }

    #[tokio::test]
    async fn test_query_rate_parses_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param(
                "query",
                "sum(rate(fnstack_function_invocation_total{function_name=\"figlet.fnstack-fn\"}[30s]))",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string(vector_body(&["1.5"])))
            .mount(&server)
            .await;

        let prometheus = PrometheusQuery::new(server.uri()).unwrap();
        let rate = prometheus.query_rate("figlet", "fnstack-fn").await.unwrap();
        assert!((rate - 1.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_query_rate_absent_series_is_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(vector_body(&[])))
            .mount(&server)
            .await;

        let prometheus = PrometheusQuery::new(server.uri()).unwrap();
        let rate = prometheus.query_rate("figlet", "fnstack-fn").await.unwrap();
        assert_eq!(rate, 0.0);
    }

    #[tokio::test]
    async fn test_query_sums_multiple_samples() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(vector_body(&["2.0", "0.5"])))
            .mount(&server)
            .await;

        let prometheus = PrometheusQuery::new(server.uri()).unwrap();
        let total = prometheus
            .query_invocation_total("figlet", "fnstack-fn")
            .await
            .unwrap();
        assert!((total - 2.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_query_http_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let prometheus = PrometheusQuery::new(server.uri()).unwrap();
        let err = prometheus
            .query_rate("figlet", "fnstack-fn")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MetricsQuery(msg) if msg.contains("502")));
    }

    #[tokio::test]
    async fn test_query_error_status_carries_message() {
        let server = MockServer::start().await;
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error at char 4"}"#;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let prometheus = PrometheusQuery::new(server.uri()).unwrap();
        let err = prometheus
            .query_rate("figlet", "fnstack-fn")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MetricsQuery(msg) if msg.contains("parse error")));
    }

    #[tokio::test]
    async fn test_query_malformed_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let prometheus = PrometheusQuery::new(server.uri()).unwrap();
        let err = prometheus
            .query_rate("figlet", "fnstack-fn")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MetricsQuery(msg) if msg.contains("malformed")));
    }
}
