//! Error taxonomy for fetch/transform/load runs.
//!
//! Every per-entity failure carries the entity it belongs to; every sink
//! failure carries the batch range it was loading.

use crate::entity::EntityId;
use crate::sink::SinkError;
use crate::source::SourceError;
use std::fmt;
use thiserror::Error;

/// Half-open range `[start, end)` of positions in the entity sequence.
///
/// Displayed inclusively (`0-99`), the way operators read batch logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    pub start: usize,
    pub end: usize,
}

impl BatchRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Range covering the single entity at `index`.
    pub fn single(index: usize) -> Self {
        Self::new(index, index + 1)
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for BatchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end.saturating_sub(1).max(self.start))
    }
}

/// Failure to tag or merge a CSV payload.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("payload has no header row")]
    MissingHeader,

    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("header mismatch: expected [{expected}], found [{found}]")]
    HeaderMismatch { expected: String, found: String },

    #[error("payload already has a '{0}' column")]
    DuplicateColumn(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by the orchestration core.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("error fetching data for ticker {entity}: {source}")]
    Fetch {
        entity: EntityId,
        #[source]
        source: SourceError,
    },

    #[error("error adding ticker column for ticker {entity}: {source}")]
    Transform {
        entity: EntityId,
        #[source]
        source: TransformError,
    },

    #[error("error loading {table} for batch {range}: {source}")]
    Write {
        table: String,
        range: BatchRange,
        #[source]
        source: SinkError,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Joined(FailureSet),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}

impl EtlError {
    /// The entity this error is about, if it is a per-entity error.
    pub fn entity(&self) -> Option<&EntityId> {
        match self {
            EtlError::Fetch { entity, .. } | EtlError::Transform { entity, .. } => Some(entity),
            _ => None,
        }
    }
}

/// One recorded per-entity failure.
#[derive(Debug)]
pub struct EntityFailure {
    pub entity: EntityId,
    pub error: EtlError,
}

/// Ordered collection of per-entity failures, joined into one error value.
#[derive(Debug, Default)]
pub struct FailureSet(pub Vec<EntityFailure>);

impl FailureSet {
    pub fn push(&mut self, entity: EntityId, error: EtlError) {
        self.0.push(EntityFailure { entity, error });
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityId> {
        self.0.iter().map(|f| &f.entity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityFailure> {
        self.0.iter()
    }

    /// `None` when nothing failed, otherwise the joined error.
    pub fn into_error(self) -> Option<EtlError> {
        if self.is_empty() {
            None
        } else {
            Some(EtlError::Joined(self))
        }
    }
}

impl fmt::Display for FailureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", failure.error)?;
        }
        Ok(())
    }
}
