//! Batch scheduler: fetch → classify → merge → write, one batch at a time.
//!
//! Batches run strictly in order and batch `k + 1` never starts before the
//! write of batch `k` has returned, which bounds memory to one batch of
//! payloads. Nothing spans batches transactionally: when batch `k` fails,
//! batches before it stay committed in the sink and the returned count says
//! how far the run got.

use crate::entity::EntityId;
use crate::error::{BatchRange, EtlError, FailureSet};
use crate::fetch::{BoundedFetcher, FetchOutcome};
use crate::merge::{tag_and_merge, CsvPayload};
use crate::observer::{BatchReport, RunKind, RunObserver, RunReport};
use crate::sink::{Sink, WriteMode};
use crate::source::FetchFn;
use serde::{Deserialize, Serialize};

/// What to do with the rest of a batch when one entity fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Drop the whole batch and stop the run.
    #[default]
    FailFast,
    /// Write what succeeded, record the failures, keep going.
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Entities per batch; 0 runs everything as one batch.
    pub batch_size: usize,
    pub max_concurrency: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_concurrency: 20,
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

/// Split `len` positions into consecutive ranges of at most `batch_size`.
pub fn batch_ranges(len: usize, batch_size: usize) -> Vec<BatchRange> {
    if len == 0 {
        return Vec::new();
    }
    if batch_size == 0 {
        return vec![BatchRange::new(0, len)];
    }
    (0..len)
        .step_by(batch_size)
        .map(|start| BatchRange::new(start, (start + batch_size).min(len)))
        .collect()
}

/// Running totals owned by one orchestration call.
#[derive(Debug, Default)]
pub struct RunAccumulator {
    pub processed: usize,
    pub empty_responses: Vec<EntityId>,
    pub failures: FailureSet,
}

impl RunAccumulator {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of a batched run.
#[derive(Debug)]
pub struct BatchRunSummary {
    pub processed: usize,
    pub empty_responses: Vec<EntityId>,
    pub batches: Vec<BatchReport>,
    pub error: Option<EtlError>,
}

impl BatchRunSummary {
    /// `(processed, error)`; an error with a nonzero count is partial success.
    pub fn into_parts(self) -> (usize, Option<EtlError>) {
        (self.processed, self.error)
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives batched runs against one sink.
pub struct BatchScheduler<'a> {
    config: SchedulerConfig,
    fetcher: BoundedFetcher,
    sink: &'a dyn Sink,
    observer: &'a dyn RunObserver,
}

/// A batch that made it through fetch and merge.
struct PreparedBatch {
    payload: CsvPayload,
    processed: usize,
    empty: Vec<EntityId>,
    failures: FailureSet,
}

impl<'a> BatchScheduler<'a> {
    pub fn new(
        config: SchedulerConfig,
        sink: &'a dyn Sink,
        observer: &'a dyn RunObserver,
    ) -> Result<Self, EtlError> {
        Ok(Self {
            fetcher: BoundedFetcher::new(config.max_concurrency)?,
            config,
            sink,
            observer,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Fetch, merge and append every entity into `table`, batch by batch.
    pub fn run(&self, entities: &[EntityId], fetch: &FetchFn<'_>, table: &str) -> BatchRunSummary {
        let mut acc = RunAccumulator::new();
        let mut reports = Vec::new();
        let mut abort: Option<EtlError> = None;

        for range in batch_ranges(entities.len(), self.config.batch_size) {
            let batch = &entities[range.start..range.end];
            let prepared = match self.config.failure_policy {
                FailurePolicy::FailFast => self.prepare_fail_fast(batch, fetch),
                FailurePolicy::BestEffort => Ok(self.prepare_best_effort(batch, fetch)),
            };
            let prepared = match prepared {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(table, batch = %range, error = %e, "batch aborted");
                    abort = Some(e);
                    break;
                }
            };

            if let Err(source) = self.sink.write(&prepared.payload, table, WriteMode::Append) {
                tracing::warn!(table, batch = %range, error = %source, "batch write failed");
                abort = Some(EtlError::Write {
                    table: table.to_string(),
                    range,
                    source,
                });
                break;
            }

            let report = BatchReport {
                range,
                processed: prepared.processed,
                empty: prepared.empty.len(),
            };
            acc.processed += prepared.processed;
            acc.empty_responses.extend(prepared.empty);
            acc.failures.0.extend(prepared.failures.0);
            self.observer.on_batch_complete(table, &report);
            reports.push(report);
        }

        let failed = acc.failures.len() + usize::from(abort.is_some());
        self.observer.on_run_complete(&RunReport {
            kind: RunKind::Batched,
            table: table.to_string(),
            processed: acc.processed,
            empty_responses: acc.empty_responses.len(),
            failed,
        });

        BatchRunSummary {
            processed: acc.processed,
            empty_responses: acc.empty_responses,
            batches: reports,
            error: abort.or_else(|| acc.failures.into_error()),
        }
    }

    fn prepare_fail_fast(&self, batch: &[EntityId], fetch: &FetchFn<'_>) -> Result<PreparedBatch, EtlError> {
        let slots = self.fetcher.fetch_all(batch, fetch)?;

        let mut payloads = Vec::new();
        let mut empty = Vec::new();
        for (entity, slot) in batch.iter().zip(slots) {
            match slot {
                Some(body) => payloads.push((entity.clone(), body)),
                None => empty.push(entity.clone()),
            }
        }

        let payload = tag_and_merge(&payloads)?;
        Ok(PreparedBatch {
            payload,
            processed: payloads.len(),
            empty,
            failures: FailureSet::default(),
        })
    }

    fn prepare_best_effort(&self, batch: &[EntityId], fetch: &FetchFn<'_>) -> PreparedBatch {
        let outcomes = self.fetcher.fetch_outcomes(batch, fetch);

        let mut payloads = Vec::new();
        let mut empty = Vec::new();
        let mut failures = FailureSet::default();
        for (entity, outcome) in batch.iter().zip(outcomes) {
            match outcome {
                FetchOutcome::Payload(body) => payloads.push((entity.clone(), body)),
                FetchOutcome::Empty => empty.push(entity.clone()),
                FetchOutcome::Failure(source) => failures.push(
                    entity.clone(),
                    EtlError::Fetch {
                        entity: entity.clone(),
                        source,
                    },
                ),
            }
        }

        // Drop payloads that fail to merge one at a time until the rest merge.
        let payload = loop {
            match tag_and_merge(&payloads) {
                Ok(merged) => break merged,
                Err(err) => {
                    let position = err
                        .entity()
                        .and_then(|bad| payloads.iter().position(|(e, _)| e == bad))
                        .unwrap_or(0);
                    let (entity, _) = payloads.remove(position);
                    failures.push(entity, err);
                }
            }
        };

        PreparedBatch {
            payload,
            processed: payloads.len(),
            empty,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{NullObserver, RecordingObserver};
    use crate::sink::MemorySink;
    use crate::source::SourceError;

    fn ids(n: usize) -> Vec<EntityId> {
        (0..n).map(|i| EntityId::new(format!("T{i:02}"))).collect()
    }

    fn csv_for(e: &EntityId) -> Result<Vec<u8>, SourceError> {
        Ok(format!("date,close\n2024-01-02,{}\n", e.as_str().len()).into_bytes())
    }

    #[test]
    fn ranges_cover_everything() {
        assert!(batch_ranges(0, 10).is_empty());
        assert_eq!(batch_ranges(5, 0), vec![BatchRange::new(0, 5)]);
        assert_eq!(
            batch_ranges(7, 3),
            vec![BatchRange::new(0, 3), BatchRange::new(3, 6), BatchRange::new(6, 7)]
        );
    }

    #[test]
    fn single_batch_when_size_zero() {
        let sink = MemorySink::new();
        let observer = RecordingObserver::new();
        let config = SchedulerConfig {
            batch_size: 0,
            max_concurrency: 4,
            failure_policy: FailurePolicy::FailFast,
        };
        let scheduler = BatchScheduler::new(config, &sink, &observer).unwrap();
        let summary = scheduler.run(&ids(9), &csv_for, "fundamentals_daily");
        assert!(summary.is_ok());
        assert_eq!(summary.processed, 9);
        assert_eq!(sink.writes().len(), 1);
        assert_eq!(observer.batches()[0].range, BatchRange::new(0, 9));
        assert_eq!(observer.runs().len(), 1);
    }

    #[test]
    fn write_failure_stops_run() {
        let sink = MemorySink::new().failing_table("blocked");
        let config = SchedulerConfig {
            batch_size: 2,
            ..SchedulerConfig::default()
        };
        let scheduler = BatchScheduler::new(config, &sink, &NullObserver).unwrap();
        let (processed, err) = scheduler.run(&ids(6), &csv_for, "blocked").into_parts();
        assert_eq!(processed, 0);
        match err {
            Some(EtlError::Write { range, .. }) => assert_eq!(range, BatchRange::new(0, 2)),
            other => panic!("expected write error, got {other:?}"),
        }
    }

    #[test]
    fn best_effort_writes_survivors() {
        let sink = MemorySink::new();
        let config = SchedulerConfig {
            batch_size: 4,
            max_concurrency: 2,
            failure_policy: FailurePolicy::BestEffort,
        };
        let scheduler = BatchScheduler::new(config, &sink, &NullObserver).unwrap();
        let fetch = |e: &EntityId| -> Result<Vec<u8>, SourceError> {
            match e.as_str() {
                "T01" => Err(SourceError::Timeout("slow".into())),
                "T05" => Ok(b"other,header\n1,2\n".to_vec()),
                _ => csv_for(e),
            }
        };
        let summary = scheduler.run(&ids(8), &fetch, "fundamentals_daily");
        assert_eq!(summary.processed, 6);
        assert_eq!(summary.batches.len(), 2);
        assert_eq!(sink.rows_in("fundamentals_daily"), 6);

        let msg = summary.error.unwrap().to_string();
        assert!(msg.contains("T01"));
        assert!(msg.contains("T05"));
    }
}
