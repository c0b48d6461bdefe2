//! In-process sink that records every write.
//!
//! Used by tests. Writes are logged as they arrive and also applied to
//! in-memory tables with the same append / replace / keyed-replace rules
//! as the Parquet store. Query answers are canned: each registered answer
//! is returned for any SQL containing its key.

use super::template::{LoadTemplate, TemplateParams};
use super::{validate_table_name, QueryResult, Sink, SinkError, WriteMode};
use crate::merge::CsvPayload;
use csv::ReaderBuilder;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// One write as the sink saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub table: String,
    pub mode: WriteMode,
    pub rows: usize,
    pub bytes: Vec<u8>,
    /// Rendered query text for template loads.
    pub template_sql: Option<String>,
}

#[derive(Debug, Default)]
struct StoredTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl StoredTable {
    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

#[derive(Default)]
struct State {
    writes: Vec<RecordedWrite>,
    queries: Vec<String>,
    tables: BTreeMap<String, StoredTable>,
}

/// A sink that keeps everything in memory.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<State>,
    answers: Vec<(String, QueryResult)>,
    failing_tables: HashSet<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer any query containing `needle` with `result`.
    pub fn with_query_result(mut self, needle: impl Into<String>, result: QueryResult) -> Self {
        self.answers.push((needle.into(), result));
        self
    }

    /// Reject every write to `table`.
    pub fn failing_table(mut self, table: impl Into<String>) -> Self {
        self.failing_tables.insert(table.into());
        self
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }

    pub fn writes_to(&self, table: &str) -> Vec<RecordedWrite> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.table == table)
            .cloned()
            .collect()
    }

    /// Rows currently held in `table`.
    pub fn rows_in(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Values of `column` in `table`, in storage order.
    pub fn column_in(&self, table: &str, column: &str) -> Vec<String> {
        let state = self.lock();
        let Some(stored) = state.tables.get(table) else {
            return Vec::new();
        };
        match stored.position(column) {
            Some(i) => stored.rows.iter().map(|r| r[i].clone()).collect(),
            None => Vec::new(),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.lock().queries.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(
        &self,
        payload: &CsvPayload,
        table: &str,
        mode: WriteMode,
        template_sql: Option<String>,
    ) -> Result<usize, SinkError> {
        validate_table_name(table)?;
        if self.failing_tables.contains(table) {
            return Err(SinkError::Io(format!("writes to {table} are disabled")));
        }
        let (columns, rows) = split(payload)?;

        let mut state = self.lock();
        let stored = state.tables.entry(table.to_string()).or_default();
        match mode {
            WriteMode::Append if rows.is_empty() => {}
            WriteMode::Append => {
                if stored.columns.is_empty() {
                    stored.columns = columns;
                }
                stored.rows.extend(rows);
            }
            WriteMode::Replace => {
                if !columns.is_empty() {
                    stored.columns = columns;
                }
                stored.rows = rows;
            }
        }
        state.writes.push(RecordedWrite {
            table: table.to_string(),
            mode,
            rows: payload.rows(),
            bytes: payload.bytes().to_vec(),
            template_sql,
        });
        Ok(payload.rows())
    }
}

/// Header and data rows of a payload.
fn split(payload: &CsvPayload) -> Result<(Vec<String>, Vec<Vec<String>>), SinkError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(payload.bytes());
    let rows = reader
        .records()
        .map(|r| r.map(|rec| rec.iter().map(str::to_string).collect()))
        .collect::<Result<Vec<Vec<String>>, _>>()
        .map_err(|e| SinkError::Payload(format!("parse CSV: {e}")))?;
    Ok((payload.header(), rows))
}

impl Sink for MemorySink {
    fn write(&self, payload: &CsvPayload, table: &str, mode: WriteMode) -> Result<usize, SinkError> {
        self.record(payload, table, mode, None)
    }

    fn write_with_template(
        &self,
        payload: &CsvPayload,
        template: &LoadTemplate,
        params: &TemplateParams,
    ) -> Result<usize, SinkError> {
        let sql = template.render(params)?;
        self.record(payload, &template.target, template.mode, Some(sql))
    }

    fn replace_keyed(&self, payload: &CsvPayload, table: &str, key: &str) -> Result<usize, SinkError> {
        validate_table_name(table)?;
        if self.failing_tables.contains(table) {
            return Err(SinkError::Io(format!("writes to {table} are disabled")));
        }
        if payload.is_empty() {
            return Ok(0);
        }
        let columns = payload.header();
        let key_at = columns
            .iter()
            .position(|c| c == key)
            .ok_or_else(|| SinkError::Payload(format!("key column {key} not in payload")))?;
        let keys: HashSet<String> = split(payload)?.1.into_iter().map(|r| r[key_at].clone()).collect();

        {
            let mut state = self.lock();
            if let Some(stored) = state.tables.get_mut(table) {
                if let Some(i) = stored.position(key) {
                    stored.rows.retain(|r| !keys.contains(&r[i]));
                }
            }
        }
        self.record(payload, table, WriteMode::Append, None)
    }

    fn query(&self, sql: &str) -> Result<QueryResult, SinkError> {
        self.lock().queries.push(sql.to_string());
        self.answers
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, result)| result.clone())
            .ok_or_else(|| SinkError::Query(format!("no canned answer for: {sql}")))
    }
}
