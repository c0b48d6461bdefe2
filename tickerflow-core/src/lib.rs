//! tickerflow core: batched, bounded-concurrency fetch → transform → load.
//!
//! - Entity normalization and quota halves
//! - Bounded fan-out over a per-entity fetch function
//! - Sentinel classification, entity tagging and CSV merging
//! - Batch scheduler and failure-tolerant backfill
//! - Sink trait with a Parquet table store, remote source trait with a Tiingo client

pub mod backfill;
pub mod classify;
pub mod clock;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod merge;
pub mod observer;
pub mod quota;
pub mod scheduler;
pub mod sink;
pub mod source;

pub use backfill::{Backfill, BackfillConfig, BackfillSummary};
pub use entity::EntityId;
pub use error::{BatchRange, EtlError, FailureSet, TransformError};
pub use fetch::{BoundedFetcher, FetchOutcome};
pub use merge::CsvPayload;
pub use scheduler::{BatchRunSummary, BatchScheduler, FailurePolicy, SchedulerConfig};
