//! Tiingo REST client.
//!
//! Fetches CSV bodies from Tiingo's end-of-day and fundamentals APIs. Each
//! request is made exactly once; the only protection against quota exhaustion
//! is the shared circuit breaker. Request timeouts are enforced here, since
//! the orchestration core has no timeout of its own.
//!
//! Tiingo answers `200 OK` with the literal body `None` when it has no data
//! for a ticker. The same body can come back when the subscription does not
//! cover the request, and the two cases cannot be told apart.

use super::circuit_breaker::CircuitBreaker;
use super::{Endpoint, MarketDataSource, SourceError};
use crate::entity::EntityId;
use chrono::NaiveDate;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// Connection settings for the Tiingo API.
#[derive(Debug, Clone)]
pub struct TiingoSettings {
    pub base_url: String,
    pub supported_tickers_url: String,
    pub token: String,
    pub timeout: Duration,
    pub history_start_date: NaiveDate,
    pub fundamentals_start_date: NaiveDate,
}

/// Tiingo data source.
pub struct TiingoClient {
    client: Client,
    settings: TiingoSettings,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl TiingoClient {
    pub fn new(
        settings: TiingoSettings,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("tickerflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::NetworkUnreachable(format!("build HTTP client: {e}")))?;

        Ok(Self {
            client,
            settings,
            circuit_breaker,
        })
    }

    fn base(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }

    /// Build the request for a per-entity endpoint.
    fn endpoint_request(&self, endpoint: Endpoint, entity: &EntityId) -> RequestBuilder {
        let base = self.base();
        let (url, start) = match endpoint {
            Endpoint::History => (
                format!("{base}/tiingo/daily/{entity}/prices"),
                self.settings.history_start_date,
            ),
            Endpoint::DailyFundamentals => (
                format!("{base}/tiingo/fundamentals/{entity}/daily"),
                self.settings.fundamentals_start_date,
            ),
            Endpoint::Statements => (
                format!("{base}/tiingo/fundamentals/{entity}/statements"),
                self.settings.fundamentals_start_date,
            ),
        };
        let start = start.format("%Y-%m-%d").to_string();
        self.client.get(url).query(&[
            ("startDate", start.as_str()),
            ("format", "csv"),
            ("token", self.settings.token.as_str()),
        ])
    }

    fn metadata_request(&self, entity: Option<&EntityId>) -> RequestBuilder {
        let url = format!("{}/tiingo/fundamentals/meta", self.base());
        let mut request = self.client.get(url).query(&[("format", "csv")]);
        if let Some(entity) = entity {
            request = request.query(&[("tickers", entity.as_str())]);
        }
        request.query(&[("token", self.settings.token.as_str())])
    }

    fn last_trading_day_request(&self) -> RequestBuilder {
        let url = format!("{}/tiingo/daily/prices", self.base());
        self.client
            .get(url)
            .query(&[("format", "csv"), ("token", self.settings.token.as_str())])
    }

    /// Send a request once, mapping HTTP failures and feeding the circuit breaker.
    fn execute(&self, request: RequestBuilder, what: &str) -> Result<Vec<u8>, SourceError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(SourceError::CircuitBreakerTripped);
        }

        let resp = request.send().map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout(format!("{what}: {e}"))
            } else {
                SourceError::NetworkUnreachable(format!("{what}: {e}"))
            }
        })?;

        let status = resp.status();

        if status == StatusCode::FORBIDDEN {
            self.circuit_breaker.trip();
            return Err(SourceError::CircuitBreakerTripped);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            self.circuit_breaker.record_failure();
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(3600);
            return Err(SourceError::RateLimited { retry_after_secs });
        }

        if status == StatusCode::UNAUTHORIZED {
            return Err(SourceError::AuthenticationRequired(format!(
                "Tiingo rejected the API token for {what}"
            )));
        }

        if !status.is_success() {
            if status.is_server_error() {
                self.circuit_breaker.record_failure();
            }
            let body = resp.text().unwrap_or_default();
            return Err(SourceError::Http {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        let bytes = resp
            .bytes()
            .map_err(|e| SourceError::UnexpectedResponse(format!("{what}: read body: {e}")))?;
        self.circuit_breaker.record_success();
        Ok(bytes.to_vec())
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

impl MarketDataSource for TiingoClient {
    fn name(&self) -> &str {
        "tiingo"
    }

    fn fetch(&self, endpoint: Endpoint, entity: &EntityId) -> Result<Vec<u8>, SourceError> {
        let what = format!("{} for {entity}", endpoint.name());
        self.execute(self.endpoint_request(endpoint, entity), &what)
    }

    fn fetch_metadata(&self, entity: Option<&EntityId>) -> Result<Vec<u8>, SourceError> {
        self.execute(self.metadata_request(entity), "fundamentals metadata")
    }

    fn fetch_supported_entities(&self) -> Result<Vec<u8>, SourceError> {
        let request = self.client.get(&self.settings.supported_tickers_url);
        self.execute(request, "supported tickers")
    }

    fn fetch_last_trading_day(&self) -> Result<Vec<u8>, SourceError> {
        self.execute(self.last_trading_day_request(), "last trading day")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> TiingoClient {
        let settings = TiingoSettings {
            base_url: "https://api.tiingo.com/".into(),
            supported_tickers_url: "https://apimedia.tiingo.com/docs/tiingo/daily/supported_tickers.zip"
                .into(),
            token: "secret".into(),
            timeout: Duration::from_secs(5),
            history_start_date: NaiveDate::from_ymd_opt(1995, 1, 1).unwrap(),
            fundamentals_start_date: NaiveDate::from_ymd_opt(2000, 1, 3).unwrap(),
        };
        TiingoClient::new(settings, Arc::new(CircuitBreaker::default_provider())).unwrap()
    }

    #[test]
    fn history_url() {
        let c = client();
        let req = c
            .endpoint_request(Endpoint::History, &EntityId::new("aapl"))
            .build()
            .unwrap();
        assert_eq!(
            req.url().as_str(),
            "https://api.tiingo.com/tiingo/daily/AAPL/prices?startDate=1995-01-01&format=csv&token=secret"
        );
    }

    #[test]
    fn fundamentals_urls_use_fundamentals_start() {
        let c = client();
        let daily = c
            .endpoint_request(Endpoint::DailyFundamentals, &EntityId::new("MSFT"))
            .build()
            .unwrap();
        assert!(daily
            .url()
            .as_str()
            .starts_with("https://api.tiingo.com/tiingo/fundamentals/MSFT/daily?startDate=2000-01-03"));

        let statements = c
            .endpoint_request(Endpoint::Statements, &EntityId::new("MSFT"))
            .build()
            .unwrap();
        assert!(statements.url().path().ends_with("/MSFT/statements"));
    }

    #[test]
    fn metadata_url_with_and_without_ticker() {
        let c = client();
        let all = c.metadata_request(None).build().unwrap();
        assert_eq!(
            all.url().as_str(),
            "https://api.tiingo.com/tiingo/fundamentals/meta?format=csv&token=secret"
        );

        let one = c
            .metadata_request(Some(&EntityId::new("spy")))
            .build()
            .unwrap();
        assert_eq!(
            one.url().query(),
            Some("format=csv&tickers=SPY&token=secret")
        );
    }

    #[test]
    fn open_breaker_refuses_without_network() {
        let c = client();
        c.circuit_breaker.trip();
        let err = c.fetch(Endpoint::History, &EntityId::new("AAPL")).unwrap_err();
        assert!(matches!(err, SourceError::CircuitBreakerTripped));
        assert!(!c.circuit_breaker.is_allowed());
    }

    #[test]
    fn truncate_long_bodies() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
