//! REST Klines Client
//!
//! [`KlineSource`] adapter for `GET /api/v3/klines`. Retrying and request
//! pacing belong to the backfill worker; this client performs exactly one
//! HTTP request per call and classifies the outcome.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::messages::RestKlineRow;
use crate::application::ports::{KlineQuery, KlineSource, MAX_KLINES_PER_REQUEST, SourceError};
use crate::domain::streaming::RawKline;

const KLINES_PATH: &str = "/api/v3/klines";

/// HTTP client for the klines endpoint.
#[derive(Debug, Clone)]
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
}

impl BinanceRestClient {
    /// Create a client for `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl KlineSource for BinanceRestClient {
    async fn fetch_klines(&self, query: &KlineQuery) -> Result<Vec<RawKline>, SourceError> {
        let url = format!("{}{KLINES_PATH}", self.base_url);
        let limit = query.limit.clamp(1, MAX_KLINES_PER_REQUEST);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", query.symbol.clone()),
                ("interval", query.interval.as_str().to_string()),
                ("startTime", query.start_time.to_string()),
                ("endTime", query.end_time.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(SourceError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SourceError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let rows: Vec<RestKlineRow> = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        tracing::debug!(
            symbol = %query.symbol,
            interval = %query.interval,
            rows = rows.len(),
            "Fetched klines"
        );

        Ok(rows
            .into_iter()
            .map(|row| row.into_raw(&query.symbol, query.interval))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::domain::streaming::Interval;

    fn query() -> KlineQuery {
        KlineQuery {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::OneMinute,
            start_time: 60_000,
            end_time: 180_000,
            limit: 3,
        }
    }

    fn client(server: &MockServer) -> BinanceRestClient {
        BinanceRestClient::new(&server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn fetches_and_converts_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/klines"))
            .and(query_param("symbol", "BTCUSDT"))
            .and(query_param("interval", "1m"))
            .and(query_param("startTime", "60000"))
            .and(query_param("limit", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                [60000, "10", "12", "9", "11", "1", 119_999, "11", 5, "0", "0", "0"],
                [120_000, "11", "13", "10", "12", "1", 179_999, "12", 6, "0", "0", "0"]
            ])))
            .mount(&server)
            .await;

        let rows = client(&server).fetch_klines(&query()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].open_time, Some(120_000));
        assert_eq!(rows[1].interval.as_deref(), Some("1m"));
        assert_eq!(rows[0].is_final, Some(true));
    }

    #[tokio::test]
    async fn too_many_requests_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let err = client(&server).fetch_klines(&query()).await.unwrap_err();
        assert_eq!(
            err,
            SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[tokio::test]
    async fn server_error_is_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client(&server).fetch_klines(&query()).await.unwrap_err();
        assert!(matches!(err, SourceError::Http { status: 503, ref message } if message == "maintenance"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"oops\":1}"))
            .mount(&server)
            .await;

        let err = client(&server).fetch_klines(&query()).await.unwrap_err();
        assert!(matches!(err, SourceError::Decode(_)));
    }
}
