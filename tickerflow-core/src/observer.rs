//! Progress observations emitted by the orchestrators.

use crate::error::BatchRange;
use std::sync::Mutex;

/// One committed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub range: BatchRange,
    pub processed: usize,
    pub empty: usize,
}

/// Periodic backfill progress. `index` is the position of the last entity handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillProgress {
    pub index: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Which orchestrator produced a run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Batched,
    Backfill,
}

/// Final summary of one orchestration call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub kind: RunKind,
    pub table: String,
    pub processed: usize,
    pub empty_responses: usize,
    pub failed: usize,
}

/// Receives progress events. All methods default to no-ops.
pub trait RunObserver: Send + Sync {
    fn on_batch_complete(&self, _table: &str, _report: &BatchReport) {}

    fn on_backfill_progress(&self, _table: &str, _progress: &BackfillProgress) {}

    fn on_run_complete(&self, _report: &RunReport) {}
}

/// Observer that discards everything.
pub struct NullObserver;

impl RunObserver for NullObserver {}

/// Emits every observation as a `tracing` event.
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_batch_complete(&self, table: &str, report: &BatchReport) {
        tracing::info!(
            table,
            batch = %report.range,
            processed = report.processed,
            empty_responses = report.empty,
            "batch complete"
        );
    }

    fn on_backfill_progress(&self, table: &str, progress: &BackfillProgress) {
        tracing::info!(
            table,
            index = progress.index,
            total = progress.total,
            succeeded = progress.succeeded,
            failed = progress.failed,
            "backfill progress"
        );
    }

    fn on_run_complete(&self, report: &RunReport) {
        if report.failed > 0 {
            tracing::warn!(
                table = %report.table,
                kind = ?report.kind,
                processed = report.processed,
                empty_responses = report.empty_responses,
                failed = report.failed,
                "run finished with failures"
            );
        } else {
            tracing::info!(
                table = %report.table,
                kind = ?report.kind,
                processed = report.processed,
                empty_responses = report.empty_responses,
                "run finished"
            );
        }
    }
}

/// Keeps every observation, for assertions.
#[derive(Default)]
pub struct RecordingObserver {
    batches: Mutex<Vec<BatchReport>>,
    progress: Mutex<Vec<BackfillProgress>>,
    runs: Mutex<Vec<RunReport>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<BatchReport> {
        self.batches.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn progress(&self) -> Vec<BackfillProgress> {
        self.progress.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn runs(&self) -> Vec<RunReport> {
        self.runs.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl RunObserver for RecordingObserver {
    fn on_batch_complete(&self, _table: &str, report: &BatchReport) {
        if let Ok(mut v) = self.batches.lock() {
            v.push(report.clone());
        }
    }

    fn on_backfill_progress(&self, _table: &str, progress: &BackfillProgress) {
        if let Ok(mut v) = self.progress.lock() {
            v.push(progress.clone());
        }
    }

    fn on_run_complete(&self, report: &RunReport) {
        if let Ok(mut v) = self.runs.lock() {
            v.push(report.clone());
        }
    }
}
