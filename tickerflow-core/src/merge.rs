//! Tagging per-entity CSV payloads and merging them for bulk load.
//!
//! Each per-entity body gets a leading `ticker` column holding the entity id
//! on every data row. The tagged bodies of one batch are then concatenated
//! under a single header, so the sink sees one rectangular CSV per batch.

use crate::entity::EntityId;
use crate::error::{EtlError, TransformError};
use csv::{ByteRecord, ReaderBuilder, StringRecord, WriterBuilder};

/// Name of the column injected into every tagged payload.
pub const ENTITY_COLUMN: &str = "ticker";

/// A CSV payload with a known data-row count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvPayload {
    bytes: Vec<u8>,
    rows: usize,
}

impl CsvPayload {
    /// A payload with no header and no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate raw CSV (header + rectangular rows) and count its data rows.
    pub fn parse(bytes: Vec<u8>) -> Result<Self, TransformError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::empty());
        }
        let rows = {
            let mut reader = ReaderBuilder::new().has_headers(true).from_reader(bytes.as_slice());
            if reader.byte_headers()?.is_empty() {
                return Err(TransformError::MissingHeader);
            }
            let mut rows = 0;
            let mut record = ByteRecord::new();
            while reader.read_byte_record(&mut record)? {
                rows += 1;
            }
            rows
        };
        Ok(Self { bytes, rows })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Number of data rows (header excluded).
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Column names from the header; empty when there is no header.
    pub fn header(&self) -> Vec<String> {
        ReaderBuilder::new()
            .has_headers(true)
            .from_reader(self.bytes.as_slice())
            .headers()
            .map(|h| h.iter().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// One payload after tagging, still split into header and rows.
#[derive(Debug, Clone)]
pub struct TaggedCsv {
    pub header: StringRecord,
    pub rows: Vec<ByteRecord>,
}

/// Prepend the entity column to the header and to every data row.
pub fn tag_entity(entity: &EntityId, body: &[u8]) -> Result<TaggedCsv, TransformError> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(body);

    let original = reader.headers()?.clone();
    if original.is_empty() {
        return Err(TransformError::MissingHeader);
    }
    if original
        .iter()
        .any(|h| h.trim().eq_ignore_ascii_case(ENTITY_COLUMN))
    {
        return Err(TransformError::DuplicateColumn(ENTITY_COLUMN.to_string()));
    }

    let mut header = StringRecord::with_capacity(original.as_slice().len() + 8, original.len() + 1);
    header.push_field(ENTITY_COLUMN);
    header.extend(original.iter());

    let mut rows = Vec::new();
    let mut record = ByteRecord::new();
    while reader.read_byte_record(&mut record)? {
        let mut tagged = ByteRecord::with_capacity(record.as_slice().len() + 8, record.len() + 1);
        tagged.push_field(entity.as_str().as_bytes());
        tagged.extend(record.iter());
        rows.push(tagged);
    }

    Ok(TaggedCsv { header, rows })
}

/// Tag a single body and serialize it straight back to CSV.
pub fn tag_payload(entity: &EntityId, body: &[u8]) -> Result<CsvPayload, EtlError> {
    let wrap = |source| EtlError::Transform {
        entity: entity.clone(),
        source,
    };
    let tagged = tag_entity(entity, body).map_err(wrap)?;
    write_payload(&tagged.header, tagged.rows.iter()).map_err(wrap)
}

/// Tag every payload with its entity and concatenate them under one header.
///
/// Zero payloads produce an empty payload. A payload whose header differs
/// from the first one fails the merge as a transform error of its entity.
pub fn tag_and_merge(payloads: &[(EntityId, Vec<u8>)]) -> Result<CsvPayload, EtlError> {
    let mut header: Option<StringRecord> = None;
    let mut rows: Vec<ByteRecord> = Vec::new();

    for (entity, body) in payloads {
        let wrap = |source| EtlError::Transform {
            entity: entity.clone(),
            source,
        };
        let tagged = tag_entity(entity, body).map_err(wrap)?;

        if let Some(expected) = &header {
            if *expected != tagged.header {
                return Err(wrap(TransformError::HeaderMismatch {
                    expected: join_record(expected),
                    found: join_record(&tagged.header),
                }));
            }
        } else {
            header = Some(tagged.header);
        }
        rows.extend(tagged.rows);
    }

    match header {
        None => Ok(CsvPayload::empty()),
        // `header` is only set once at least one payload was seen.
        Some(header) => write_payload(&header, rows.iter()).map_err(|source| EtlError::Transform {
            entity: payloads[0].0.clone(),
            source,
        }),
    }
}

fn write_payload<'a>(
    header: &StringRecord,
    rows: impl Iterator<Item = &'a ByteRecord>,
) -> Result<CsvPayload, TransformError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(header)?;
    let mut count = 0;
    for row in rows {
        writer.write_byte_record(row)?;
        count += 1;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| TransformError::Io(e.into_error()))?;
    Ok(CsvPayload { bytes, rows: count })
}

fn join_record(record: &StringRecord) -> String {
    record.iter().collect::<Vec<_>>().join(",")
}
