//! Storage sink contract.
//!
//! The orchestration core only ever hands a sink a CSV payload and a table
//! name. How rows are stored and queried is the sink's business:
//! `ParquetSink` keeps Parquet part files per table and answers SQL through
//! polars, `MemorySink` records writes in memory.

pub mod memory;
pub mod parquet;
pub mod template;

pub use memory::{MemorySink, RecordedWrite};
pub use parquet::{ParquetSink, TableMeta};
pub use template::{render, LoadTemplate, TemplateParams};

use crate::merge::CsvPayload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors from sink operations.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid table name '{0}' (use letters, digits and underscores)")]
    InvalidTableName(String),

    #[error("table '{0}' does not exist")]
    UnknownTable(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("payload rejected: {0}")]
    Payload(String),
}

/// Whether a write adds to a table or replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Append,
    Replace,
}

/// Result of a read query: column name → values rendered as strings.
///
/// Nulls come back as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    columns: BTreeMap<String, Vec<String>>,
}

impl QueryResult {
    pub fn new(columns: BTreeMap<String, Vec<String>>) -> Self {
        Self { columns }
    }

    /// Single-column result, convenient for entity selection lists.
    pub fn single(column: impl Into<String>, values: Vec<String>) -> Self {
        let mut columns = BTreeMap::new();
        columns.insert(column.into(), values);
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&[String]> {
        self.columns.get(name).map(|v| v.as_slice())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|s| s.as_str())
    }

    pub fn row_count(&self) -> usize {
        self.columns.values().map(|v| v.len()).max().unwrap_or(0)
    }
}

/// A storage sink.
///
/// A zero-row `Append` is a successful no-op. A zero-row `Replace` empties
/// the table. The core never issues two writes concurrently, but
/// implementations are still shared across threads, hence `Send + Sync`.
pub trait Sink: Send + Sync {
    /// Load a CSV payload into `table`. Returns rows written.
    fn write(&self, payload: &CsvPayload, table: &str, mode: WriteMode) -> Result<usize, SinkError>;

    /// Load a payload through a query template. Returns rows affected.
    ///
    /// The payload is exposed to the template's query as the table `payload`.
    fn write_with_template(
        &self,
        payload: &CsvPayload,
        template: &LoadTemplate,
        params: &TemplateParams,
    ) -> Result<usize, SinkError>;

    /// Swap out every row of `table` whose `key` value occurs in `payload`
    /// for the payload's rows, as a single commit. Returns rows written.
    ///
    /// A missing table is created. A zero-row payload is a no-op.
    fn replace_keyed(&self, payload: &CsvPayload, table: &str, key: &str) -> Result<usize, SinkError>;

    /// Run a read query.
    fn query(&self, sql: &str) -> Result<QueryResult, SinkError>;
}

/// Table names double as directory names and SQL identifiers.
pub fn validate_table_name(table: &str) -> Result<(), SinkError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(SinkError::InvalidTableName(table.to_string()))
    }
}
