//! Per-entity backfill that survives individual failures.
//!
//! Each entity is fetched, tagged and appended on its own. A failure at any
//! step is recorded against the entity and the loop moves on; the joined
//! failures come back next to the success count.
//!
//! By default each body is appended. `reload_by(key)` makes every body
//! replace the rows already stored for its entity instead, so a full
//! history reload never duplicates what was there.
//!
//! With `max_concurrency == 1` the loop is strictly sequential. A larger
//! bound fetches windows of that many entities concurrently; tagging and
//! writing stay sequential in input order.

use crate::entity::EntityId;
use crate::error::{BatchRange, EtlError, FailureSet};
use crate::fetch::{BoundedFetcher, FetchOutcome};
use crate::merge::tag_payload;
use crate::observer::{BackfillProgress, RunKind, RunObserver, RunReport};
use crate::sink::{Sink, WriteMode};
use crate::source::FetchFn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub max_concurrency: usize,
    /// Emit progress after every `progress_every`-th entity; 0 disables it.
    pub progress_every: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            progress_every: 20,
        }
    }
}

/// Outcome of a backfill run.
#[derive(Debug)]
pub struct BackfillSummary {
    pub total: usize,
    pub succeeded: usize,
    pub empty_responses: Vec<EntityId>,
    pub failures: FailureSet,
}

impl BackfillSummary {
    /// `(succeeded, joined error)`.
    pub fn into_parts(self) -> (usize, Option<EtlError>) {
        (self.succeeded, self.failures.into_error())
    }
}

pub struct Backfill<'a> {
    config: BackfillConfig,
    fetcher: BoundedFetcher,
    sink: &'a dyn Sink,
    observer: &'a dyn RunObserver,
    reload_key: Option<&'a str>,
}

enum Loaded {
    Rows,
    Empty,
}

impl<'a> Backfill<'a> {
    pub fn new(
        config: BackfillConfig,
        sink: &'a dyn Sink,
        observer: &'a dyn RunObserver,
    ) -> Result<Self, EtlError> {
        Ok(Self {
            fetcher: BoundedFetcher::new(config.max_concurrency)?,
            config,
            sink,
            observer,
            reload_key: None,
        })
    }

    /// Replace each entity's stored rows, matched on column `key`, instead of appending.
    pub fn reload_by(mut self, key: &'a str) -> Self {
        self.reload_key = Some(key);
        self
    }

    pub fn run(&self, entities: &[EntityId], fetch: &FetchFn<'_>, table: &str) -> BackfillSummary {
        let total = entities.len();
        let mut failures = FailureSet::default();
        let mut empty_responses = Vec::new();

        let window = self.fetcher.max_concurrency();
        for (w, chunk) in entities.chunks(window).enumerate() {
            let outcomes = self.fetcher.fetch_outcomes(chunk, fetch);

            for (offset, (entity, outcome)) in chunk.iter().zip(outcomes).enumerate() {
                let index = w * window + offset;
                match self.load(index, entity, outcome, table) {
                    Ok(Loaded::Rows) => {}
                    Ok(Loaded::Empty) => empty_responses.push(entity.clone()),
                    Err(e) => {
                        tracing::debug!(ticker = %entity, error = %e, "backfill failed");
                        failures.push(entity.clone(), e);
                    }
                }

                let every = self.config.progress_every;
                if every > 0 && index > 0 && index % every == 0 {
                    self.observer.on_backfill_progress(
                        table,
                        &BackfillProgress {
                            index,
                            total,
                            succeeded: index + 1 - failures.len(),
                            failed: failures.len(),
                        },
                    );
                }
            }
        }

        let succeeded = total - failures.len();
        self.observer.on_run_complete(&RunReport {
            kind: RunKind::Backfill,
            table: table.to_string(),
            processed: succeeded,
            empty_responses: empty_responses.len(),
            failed: failures.len(),
        });

        BackfillSummary {
            total,
            succeeded,
            empty_responses,
            failures,
        }
    }

    fn load(
        &self,
        index: usize,
        entity: &EntityId,
        outcome: FetchOutcome,
        table: &str,
    ) -> Result<Loaded, EtlError> {
        let body = match outcome {
            FetchOutcome::Payload(body) => body,
            FetchOutcome::Empty => return Ok(Loaded::Empty),
            FetchOutcome::Failure(source) => {
                return Err(EtlError::Fetch {
                    entity: entity.clone(),
                    source,
                })
            }
        };

        let payload = tag_payload(entity, &body)?;
        let written = match self.reload_key {
            Some(key) => self.sink.replace_keyed(&payload, table, key),
            None => self.sink.write(&payload, table, WriteMode::Append),
        };
        written.map_err(|source| EtlError::Write {
            table: table.to_string(),
            range: BatchRange::single(index),
            source,
        })?;
        Ok(Loaded::Rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{CsvPayload, ENTITY_COLUMN};
    use crate::observer::{NullObserver, RecordingObserver};
    use crate::sink::MemorySink;
    use crate::source::SourceError;

    fn ids(n: usize) -> Vec<EntityId> {
        (0..n).map(|i| EntityId::new(format!("E{i}"))).collect()
    }

    fn history(_: &EntityId) -> Result<Vec<u8>, SourceError> {
        Ok(b"date,close\n2024-01-02,1\n2024-01-03,2\n".to_vec())
    }

    #[test]
    fn all_success() {
        let sink = MemorySink::new();
        let backfill = Backfill::new(BackfillConfig::default(), &sink, &NullObserver).unwrap();
        let (n, err) = backfill.run(&ids(3), &history, "daily_adjusted").into_parts();
        assert_eq!(n, 3);
        assert!(err.is_none());
        assert_eq!(sink.rows_in("daily_adjusted"), 6);
    }

    #[test]
    fn write_failures_are_recorded() {
        let sink = MemorySink::new().failing_table("daily_adjusted");
        let backfill = Backfill::new(BackfillConfig::default(), &sink, &NullObserver).unwrap();
        let summary = backfill.run(&ids(2), &history, "daily_adjusted");
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failures.len(), 2);
        assert!(summary
            .failures
            .iter()
            .all(|f| matches!(f.error, EtlError::Write { .. })));
    }

    #[test]
    fn empty_body_counts_as_success() {
        let sink = MemorySink::new();
        let backfill = Backfill::new(BackfillConfig::default(), &sink, &NullObserver).unwrap();
        let fetch = |_: &EntityId| -> Result<Vec<u8>, SourceError> { Ok(b"None".to_vec()) };
        let summary = backfill.run(&ids(4), &fetch, "daily_adjusted");
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.empty_responses.len(), 4);
        assert!(sink.writes().is_empty());
    }

    #[test]
    fn reload_replaces_stored_rows_of_each_entity() {
        let sink = MemorySink::new();
        let stored = CsvPayload::parse(b"ticker,date,close\nE0,2024-01-03,9\nKEEP,2024-01-03,5\n".to_vec())
            .unwrap();
        sink.write(&stored, "daily_adjusted", WriteMode::Append).unwrap();

        let backfill = Backfill::new(BackfillConfig::default(), &sink, &NullObserver)
            .unwrap()
            .reload_by(ENTITY_COLUMN);
        let summary = backfill.run(&ids(1), &history, "daily_adjusted");

        assert_eq!(summary.succeeded, 1);
        assert_eq!(sink.rows_in("daily_adjusted"), 3);
        assert_eq!(
            sink.column_in("daily_adjusted", "ticker"),
            vec!["KEEP", "E0", "E0"]
        );
        assert_eq!(
            sink.column_in("daily_adjusted", "date"),
            vec!["2024-01-03", "2024-01-02", "2024-01-03"]
        );
    }

    #[test]
    fn windows_keep_progress_positions() {
        let sink = MemorySink::new();
        let observer = RecordingObserver::new();
        let config = BackfillConfig {
            max_concurrency: 4,
            progress_every: 5,
        };
        let backfill = Backfill::new(config, &sink, &observer).unwrap();
        backfill.run(&ids(12), &history, "daily_adjusted");
        let indices: Vec<usize> = observer.progress().iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![5, 10]);
        assert_eq!(sink.writes().len(), 12);
    }
}
