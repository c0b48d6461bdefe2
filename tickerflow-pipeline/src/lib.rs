//! tickerflow pipeline: configuration and the scheduled runs built on `tickerflow-core`.
//!
//! - Layered TOML configuration (base + environment overlay)
//! - Supported tickers and fundamentals metadata refresh
//! - Daily end-of-day load with selective history backfill
//! - Batched daily fundamentals and statements loads

pub mod config;
pub mod pipeline;

pub use config::{ConfigError, EtlConfig};
pub use pipeline::{FundamentalsRequest, Pipeline, PipelineError};
