//! Remote data source trait and structured error types.
//!
//! The `MarketDataSource` trait abstracts over the remote API so the
//! orchestration core only ever sees "fetch this endpoint for this entity,
//! give me raw bytes". Tests plug in closures or mock sources.

pub mod circuit_breaker;
pub mod tiingo;
pub mod unzip;

pub use circuit_breaker::CircuitBreaker;
pub use tiingo::TiingoClient;
pub use unzip::unzip_single_csv;

use crate::entity::EntityId;
use thiserror::Error;

/// Structured error types for remote fetches.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("hard stop: provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Per-entity endpoints that return one CSV body per ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Full end-of-day price history.
    History,
    /// Daily fundamentals (market cap, ratios, ...).
    DailyFundamentals,
    /// Financial statements.
    Statements,
}

impl Endpoint {
    pub fn name(self) -> &'static str {
        match self {
            Endpoint::History => "history",
            Endpoint::DailyFundamentals => "daily fundamentals",
            Endpoint::Statements => "statements",
        }
    }
}

/// A per-entity fetch function: entity in, raw body out.
///
/// This is the only view of the remote source the core orchestrators get.
pub type FetchFn<'a> = dyn Fn(&EntityId) -> Result<Vec<u8>, SourceError> + Sync + 'a;

/// Trait for remote market data sources.
pub trait MarketDataSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch one per-entity endpoint as CSV bytes.
    ///
    /// A body of `None` means "no data for this entity" and is not an error.
    fn fetch(&self, endpoint: Endpoint, entity: &EntityId) -> Result<Vec<u8>, SourceError>;

    /// Fundamentals metadata as CSV, for one entity or for all (`None`).
    fn fetch_metadata(&self, entity: Option<&EntityId>) -> Result<Vec<u8>, SourceError>;

    /// Zipped CSV listing every supported ticker.
    fn fetch_supported_entities(&self) -> Result<Vec<u8>, SourceError>;

    /// Prices of all tickers on the last trading day, as CSV.
    fn fetch_last_trading_day(&self) -> Result<Vec<u8>, SourceError>;
}
