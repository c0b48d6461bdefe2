//! Parquet-backed table store.
//!
//! Layout: `{root}/{table}/part-{seq:06}.parquet` plus `{root}/{table}/meta.json`.
//!
//! - Every append adds one part file; a replace swaps all parts for one.
//!   A zero-row replace leaves a single empty part, so the table reads as empty.
//! - Parts and `meta.json` are written to .tmp and renamed into place;
//!   superseded parts are removed last.
//! - Columns are stored as text exactly as they came off the wire; queries
//!   cast what they need.
//! - Reads go through polars' SQL context, with every table referenced by the
//!   query registered under its own name.

use super::template::{LoadTemplate, TemplateParams};
use super::{validate_table_name, QueryResult, Sink, SinkError, WriteMode};
use crate::merge::CsvPayload;
use polars::prelude::*;
use polars::sql::SQLContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Table name under which template loads see their payload.
pub const PAYLOAD_TABLE: &str = "payload";

/// Metadata sidecar for a stored table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub table: String,
    pub columns: Vec<String>,
    pub parts: Vec<String>,
    pub row_count: usize,
    /// BLAKE3 of the most recent payload written.
    pub last_write_hash: String,
    pub updated_at: chrono::NaiveDateTime,
}

/// The Parquet table store.
pub struct ParquetSink {
    root: PathBuf,
}

impl ParquetSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    fn meta_path(&self, table: &str) -> PathBuf {
        self.table_dir(table).join("meta.json")
    }

    pub fn get_meta(&self, table: &str) -> Option<TableMeta> {
        let content = fs::read_to_string(self.meta_path(table)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Names of all tables with at least one committed part.
    pub fn tables(&self) -> Result<Vec<String>, SinkError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root).map_err(|e| SinkError::Io(format!("read root: {e}")))?;

        let mut tables = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SinkError::Io(format!("dir entry: {e}")))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_table_name(&name).is_ok() && self.get_meta(&name).is_some() {
                tables.push(name);
            }
        }
        tables.sort();
        Ok(tables)
    }

    /// Load every part of a table into one DataFrame.
    pub fn read_table(&self, table: &str) -> Result<DataFrame, SinkError> {
        validate_table_name(table)?;
        let meta = self
            .get_meta(table)
            .ok_or_else(|| SinkError::UnknownTable(table.to_string()))?;

        let dir = self.table_dir(table);
        let mut frames = meta.parts.iter().map(|part| read_parquet(&dir.join(part)));

        let mut combined = match frames.next() {
            Some(first) => first?,
            None => return Err(SinkError::UnknownTable(table.to_string())),
        };
        for frame in frames {
            combined
                .vstack_mut(&frame?)
                .map_err(|e| SinkError::Parquet(format!("combine parts of {table}: {e}")))?;
        }
        Ok(combined)
    }

    fn sql_context(&self, sql: &str) -> Result<SQLContext, SinkError> {
        let mut ctx = SQLContext::new();
        for table in self.tables()? {
            if references(sql, &table) {
                ctx.register(&table, self.read_table(&table)?.lazy());
            }
        }
        Ok(ctx)
    }

    /// Commit a frame to `table`, as one more part (`Append`) or as its only
    /// part (`Replace`).
    ///
    /// The new part and `meta.json` are renamed into place before any
    /// superseded part is removed.
    fn commit(
        &self,
        df: &mut DataFrame,
        table: &str,
        mode: WriteMode,
        payload_hash: String,
    ) -> Result<usize, SinkError> {
        validate_table_name(table)?;
        let columns = frame_columns(df);
        let previous = self.get_meta(table);

        if let (WriteMode::Append, Some(meta)) = (mode, &previous) {
            check_columns(table, &meta.columns, &columns)?;
        }

        let dir = self.table_dir(table);
        fs::create_dir_all(&dir).map_err(|e| SinkError::Io(format!("create {}: {e}", dir.display())))?;

        let seq = previous.as_ref().map_or(0, |m| next_part_seq(&m.parts));
        let part = format!("part-{seq:06}.parquet");
        let path = dir.join(&part);
        let tmp_path = path.with_extension("parquet.tmp");
        write_parquet(df, &tmp_path)?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            SinkError::Io(format!("atomic rename failed: {e}"))
        })?;

        let rows = df.height();
        let (mut parts, prior_rows, superseded) = match (mode, previous) {
            (WriteMode::Append, Some(meta)) => (meta.parts, meta.row_count, Vec::new()),
            (WriteMode::Replace, Some(meta)) => (Vec::new(), 0, meta.parts),
            (_, None) => (Vec::new(), 0, Vec::new()),
        };
        parts.push(part);
        let meta = TableMeta {
            table: table.to_string(),
            columns,
            parts,
            row_count: prior_rows + rows,
            last_write_hash: payload_hash,
            updated_at: chrono::Local::now().naive_local(),
        };
        if let Err(e) = self.write_meta(table, &meta) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        for old in superseded {
            if let Err(e) = fs::remove_file(dir.join(&old)) {
                tracing::warn!(table, part = %old, error = %e, "could not remove superseded part");
            }
        }
        Ok(rows)
    }

    fn write_meta(&self, table: &str, meta: &TableMeta) -> Result<(), SinkError> {
        let meta_json = serde_json::to_string_pretty(meta)
            .map_err(|e| SinkError::Io(format!("meta serialization: {e}")))?;
        let path = self.meta_path(table);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, meta_json).map_err(|e| SinkError::Io(format!("meta write: {e}")))?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            SinkError::Io(format!("meta rename: {e}"))
        })
    }

    /// Empty `table`, keeping `columns` or, failing that, its current ones.
    /// A table that does not exist and has no known columns is left alone.
    fn truncate(&self, table: &str, columns: Vec<String>, payload_hash: String) -> Result<usize, SinkError> {
        let columns = match columns {
            c if !c.is_empty() => c,
            _ => match self.get_meta(table) {
                Some(meta) => meta.columns,
                None => return Ok(0),
            },
        };
        self.commit(&mut empty_frame(&columns), table, WriteMode::Replace, payload_hash)
    }
}

impl Sink for ParquetSink {
    fn write(&self, payload: &CsvPayload, table: &str, mode: WriteMode) -> Result<usize, SinkError> {
        validate_table_name(table)?;
        if payload.is_empty() {
            return match mode {
                WriteMode::Append => Ok(0),
                WriteMode::Replace => self.truncate(table, payload.header(), hash(payload)),
            };
        }
        let mut df = csv_to_frame(payload)?;
        self.commit(&mut df, table, mode, hash(payload))
    }

    fn write_with_template(
        &self,
        payload: &CsvPayload,
        template: &LoadTemplate,
        params: &TemplateParams,
    ) -> Result<usize, SinkError> {
        if payload.is_empty() && template.mode == WriteMode::Append {
            return Ok(0);
        }
        let sql = template.render(params)?;
        if payload.header().is_empty() {
            return self.truncate(&template.target, Vec::new(), hash(payload));
        }

        let mut ctx = self.sql_context(&sql)?;
        ctx.register(PAYLOAD_TABLE, csv_to_frame(payload)?.lazy());
        let mut df = ctx
            .execute(&sql)
            .and_then(|lf| lf.collect())
            .map_err(|e| SinkError::Query(format!("{e}")))?;
        if df.height() == 0 && template.mode == WriteMode::Append {
            return Ok(0);
        }
        self.commit(&mut df, &template.target, template.mode, hash(payload))
    }

    fn replace_keyed(&self, payload: &CsvPayload, table: &str, key: &str) -> Result<usize, SinkError> {
        validate_table_name(table)?;
        if payload.is_empty() {
            return Ok(0);
        }
        let mut incoming = csv_to_frame(payload)?;
        let Some(meta) = self.get_meta(table) else {
            return self.commit(&mut incoming, table, WriteMode::Append, hash(payload));
        };
        check_columns(table, &meta.columns, &frame_columns(&incoming))?;

        let existing = self.read_table(table)?;
        let keys: HashSet<&str> = text_values(&incoming, key)?.into_iter().flatten().collect();
        let keep: BooleanChunked = text_values(&existing, key)?
            .into_iter()
            .map(|v| !v.is_some_and(|k| keys.contains(k)))
            .collect();
        let mut kept = existing
            .filter(&keep)
            .map_err(|e| SinkError::Parquet(format!("filter {table}: {e}")))?;
        tracing::debug!(
            table,
            key,
            replaced = existing.height() - kept.height(),
            added = incoming.height(),
            "keyed replace"
        );
        kept.vstack_mut(&incoming)
            .map_err(|e| SinkError::Parquet(format!("combine {table}: {e}")))?;

        self.commit(&mut kept, table, WriteMode::Replace, hash(payload))?;
        Ok(incoming.height())
    }

    fn query(&self, sql: &str) -> Result<QueryResult, SinkError> {
        let mut ctx = self.sql_context(sql)?;
        let df = ctx
            .execute(sql)
            .and_then(|lf| lf.collect())
            .map_err(|e| SinkError::Query(format!("{e}")))?;
        frame_to_result(&df)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn frame_columns(df: &DataFrame) -> Vec<String> {
    df.get_column_names().iter().map(|c| c.to_string()).collect()
}

fn check_columns(table: &str, stored: &[String], incoming: &[String]) -> Result<(), SinkError> {
    if stored == incoming {
        return Ok(());
    }
    Err(SinkError::Payload(format!(
        "columns [{}] do not match table {table} [{}]",
        incoming.join(","),
        stored.join(",")
    )))
}

/// Sequence number after the highest `part-NNNNNN.parquet` in `parts`.
fn next_part_seq(parts: &[String]) -> usize {
    parts
        .iter()
        .filter_map(|p| p.strip_prefix("part-")?.strip_suffix(".parquet")?.parse::<usize>().ok())
        .max()
        .map_or(0, |n| n + 1)
}

fn text_values<'a>(df: &'a DataFrame, column: &str) -> Result<&'a StringChunked, SinkError> {
    df.column(column)
        .and_then(|c| c.str())
        .map_err(|e| SinkError::Payload(format!("key column {column}: {e}")))
}

fn empty_frame(columns: &[String]) -> DataFrame {
    let schema = Schema::from_iter(
        columns
            .iter()
            .map(|name| Field::new(name.as_str().into(), DataType::String)),
    );
    DataFrame::empty_with_schema(&schema)
}

fn hash(payload: &CsvPayload) -> String {
    blake3::hash(payload.bytes()).to_hex().to_string()
}

/// Whether `sql` mentions `table` as a whole identifier.
fn references(sql: &str, table: &str) -> bool {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|token| token.eq_ignore_ascii_case(table))
}

/// Parse a CSV payload with every column typed as text.
fn csv_to_frame(payload: &CsvPayload) -> Result<DataFrame, SinkError> {
    if payload.is_empty() {
        return Ok(empty_frame(&payload.header()));
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(payload.bytes());
    let header = reader
        .headers()
        .map_err(|e| SinkError::Payload(format!("read header: {e}")))?;
    let schema = Schema::from_iter(
        header
            .iter()
            .map(|name| Field::new(name.into(), DataType::String)),
    );

    CsvReadOptions::default()
        .with_has_header(true)
        .with_schema(Some(Arc::new(schema)))
        .into_reader_with_file_handle(Cursor::new(payload.bytes().to_vec()))
        .finish()
        .map_err(|e| SinkError::Payload(format!("parse CSV: {e}")))
}

fn frame_to_result(df: &DataFrame) -> Result<QueryResult, SinkError> {
    let mut columns = BTreeMap::new();
    for column in df.get_columns() {
        let as_text = column
            .cast(&DataType::String)
            .map_err(|e| SinkError::Query(format!("cast {}: {e}", column.name())))?;
        let values = as_text
            .str()
            .map_err(|e| SinkError::Query(format!("read {}: {e}", column.name())))?
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect();
        columns.insert(column.name().to_string(), values);
    }
    Ok(QueryResult::new(columns))
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), SinkError> {
    let file = fs::File::create(path).map_err(|e| SinkError::Parquet(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| SinkError::Parquet(format!("write parquet: {e}")))?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<DataFrame, SinkError> {
    let file = fs::File::open(path).map_err(|e| SinkError::Parquet(format!("open {}: {e}", path.display())))?;
    ParquetReader::new(file)
        .finish()
        .map_err(|e| SinkError::Parquet(format!("read {}: {e}", path.display())))
}
