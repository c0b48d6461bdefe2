//! End-to-end runs: supported tickers, metadata, daily EOD, fundamentals, backfill.
//!
//! A `Pipeline` wires a remote source, a sink, a clock and an observer to the
//! orchestration core. Every run returns the number of entities it handled;
//! a run that committed some work before failing returns
//! `PipelineError::Partial` carrying that count.

use crate::config::{ConfigError, EtlConfig};
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tickerflow_core::backfill::Backfill;
use tickerflow_core::clock::Clock;
use tickerflow_core::entity::{exclude, normalize, EntityId};
use tickerflow_core::error::{EtlError, TransformError};
use tickerflow_core::merge::{CsvPayload, ENTITY_COLUMN};
use tickerflow_core::observer::RunObserver;
use tickerflow_core::quota::{half, Half};
use tickerflow_core::scheduler::BatchScheduler;
use tickerflow_core::sink::{LoadTemplate, Sink, SinkError, TemplateParams, WriteMode};
use tickerflow_core::source::{unzip_single_csv, Endpoint, MarketDataSource, SourceError};

pub const SUPPORTED_TICKERS: &str = "supported_tickers";
pub const FUNDAMENTALS_META: &str = "fundamentals_meta";
pub const FUNDAMENTALS_DAILY: &str = "fundamentals_daily";
pub const FUNDAMENTALS_STATEMENTS: &str = "fundamentals_statements";
pub const LAST_TRADING_DAY: &str = "last_trading_day";
pub const DAILY_ADJUSTED: &str = "daily_adjusted";

pub const INSERT_FUNDAMENTALS_META_SQL: &str = "insert__fundamentals_meta.sql";
pub const INSERT_DAILY_ADJUSTED_SQL: &str = "insert__daily_adjusted.sql";
pub const SELECTED_BACKFILL_SQL: &str = "query__selected_backfill.sql";
pub const SELECTED_FUNDAMENTALS_SQL: &str = "query__selected_fundamentals.sql";

/// Column every selection query must return.
const TICKER_COLUMN: &str = "ticker";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("error {context}: {source}")]
    Source {
        context: &'static str,
        #[source]
        source: SourceError,
    },

    #[error("error {context}: {source}")]
    Transform {
        context: &'static str,
        #[source]
        source: TransformError,
    },

    #[error("error {context}: {source}")]
    Sink {
        context: &'static str,
        #[source]
        source: SinkError,
    },

    #[error("error reading {path}: {source}")]
    SqlFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Etl(#[from] EtlError),

    #[error("{succeeded} succeeded before failure: {source}")]
    Partial {
        succeeded: usize,
        #[source]
        source: EtlError,
    },
}

impl PipelineError {
    /// Entities committed before the error, for partial-success reporting.
    pub fn succeeded(&self) -> usize {
        match self {
            PipelineError::Partial { succeeded, .. } => *succeeded,
            _ => 0,
        }
    }
}

/// Ticker selection for a fundamentals run.
#[derive(Debug, Clone, Default)]
pub struct FundamentalsRequest {
    /// Explicit tickers; empty means "use the selection query".
    pub tickers: Vec<String>,
    /// Process only the half of the selection picked by the clock.
    pub half: bool,
    /// Overrides `fundamentals.batch_size`.
    pub batch_size: Option<usize>,
    pub skip: Vec<String>,
}

pub struct Pipeline<'a> {
    config: EtlConfig,
    sql_dir: PathBuf,
    source: &'a dyn MarketDataSource,
    sink: &'a dyn Sink,
    clock: &'a dyn Clock,
    observer: &'a dyn RunObserver,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: EtlConfig,
        source: &'a dyn MarketDataSource,
        sink: &'a dyn Sink,
        clock: &'a dyn Clock,
        observer: &'a dyn RunObserver,
    ) -> Result<Self, PipelineError> {
        let sql_dir = config.storage.resolve_sql_dir()?;
        tracing::debug!(sql_dir = %sql_dir.display(), source = source.name(), "pipeline ready");
        Ok(Self {
            config,
            sql_dir,
            source,
            sink,
            clock,
            observer,
        })
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub fn sql_dir(&self) -> &Path {
        &self.sql_dir
    }

    fn sql_path(&self, file: &str) -> PathBuf {
        self.sql_dir.join(file)
    }

    fn read_sql(&self, file: &str) -> Result<String, PipelineError> {
        let path = self.sql_path(file);
        std::fs::read_to_string(&path).map_err(|source| PipelineError::SqlFile { path, source })
    }

    fn template(&self, file: &str, target: &str, mode: WriteMode) -> Result<LoadTemplate, PipelineError> {
        let sql = self.read_sql(file)?;
        LoadTemplate::new(sql, target, mode).map_err(|source| PipelineError::Sink {
            context: "building load template",
            source,
        })
    }

    /// Download the supported tickers archive and replace `supported_tickers`.
    pub fn refresh_supported_tickers(&self) -> Result<usize, PipelineError> {
        let archive = self
            .source
            .fetch_supported_entities()
            .map_err(|source| PipelineError::Source {
                context: "getting supported_tickers.zip",
                source,
            })?;
        let csv = unzip_single_csv(&archive).map_err(|source| PipelineError::Transform {
            context: "unzipping supported_tickers.zip",
            source,
        })?;
        let payload = parse(csv, "reading supported_tickers.csv")?;

        let rows = self
            .sink
            .write(&payload, SUPPORTED_TICKERS, WriteMode::Replace)
            .map_err(|source| PipelineError::Sink {
                context: "loading supported_tickers.csv",
                source,
            })?;
        tracing::info!(rows, "refreshed supported tickers");
        Ok(rows)
    }

    /// Refresh supported tickers, then reload fundamentals metadata for all tickers.
    pub fn update_metadata(&self) -> Result<usize, PipelineError> {
        self.refresh_supported_tickers()?;

        let metadata = self
            .source
            .fetch_metadata(None)
            .map_err(|source| PipelineError::Source {
                context: "fetching fundamentals metadata",
                source,
            })?;
        let payload = parse(metadata, "reading fundamentals metadata")?;

        let template = self.template(
            INSERT_FUNDAMENTALS_META_SQL,
            FUNDAMENTALS_META,
            WriteMode::Replace,
        )?;
        let rows = self
            .sink
            .write_with_template(&payload, &template, &payload_params())
            .map_err(|source| PipelineError::Sink {
                context: "loading fundamentals metadata",
                source,
            })?;
        tracing::info!(rows, "updated fundamentals metadata");
        Ok(rows)
    }

    /// Load the last trading day and backfill every ticker the backfill query selects.
    ///
    /// Returns how many tickers were selected.
    pub fn daily_end_of_day(&self) -> Result<usize, PipelineError> {
        self.refresh_supported_tickers()?;

        let last_day = self
            .source
            .fetch_last_trading_day()
            .map_err(|source| PipelineError::Source {
                context: "getting ticker data from last trading day",
                source,
            })?;
        let payload = parse(last_day, "reading last trading day")?;

        self.sink
            .write(&payload, LAST_TRADING_DAY, WriteMode::Replace)
            .map_err(|source| PipelineError::Sink {
                context: "loading last_trading_day",
                source,
            })?;

        let template = self.template(INSERT_DAILY_ADJUSTED_SQL, DAILY_ADJUSTED, WriteMode::Append)?;
        let inserted = self
            .sink
            .write_with_template(&payload, &template, &payload_params())
            .map_err(|source| PipelineError::Sink {
                context: "inserting last trading day into daily_adjusted",
                source,
            })?;
        tracing::info!(rows = inserted, "inserted last trading day");

        let tickers = self.select_tickers(SELECTED_BACKFILL_SQL)?;
        if tickers.is_empty() {
            tracing::info!("no tickers selected for backfill");
            return Ok(0);
        }

        tracing::info!(tickers = tickers.len(), "backfilling selected tickers");
        self.backfill_end_of_day(&tickers)?;
        Ok(tickers.len())
    }

    /// Reload full history for each ticker into `daily_adjusted`, replacing
    /// whatever rows the table already holds for it.
    pub fn backfill_end_of_day(&self, tickers: &[EntityId]) -> Result<usize, PipelineError> {
        let backfill =
            Backfill::new(self.config.backfill, self.sink, self.observer)?.reload_by(ENTITY_COLUMN);
        let fetch = |entity: &EntityId| self.source.fetch(Endpoint::History, entity);

        let (succeeded, error) = backfill.run(tickers, &fetch, DAILY_ADJUSTED).into_parts();
        match error {
            None => Ok(succeeded),
            Some(source) => Err(PipelineError::Partial { succeeded, source }),
        }
    }

    pub fn daily_fundamentals(&self, request: &FundamentalsRequest) -> Result<usize, PipelineError> {
        self.fundamentals(request, Endpoint::DailyFundamentals, FUNDAMENTALS_DAILY)
    }

    pub fn statements(&self, request: &FundamentalsRequest) -> Result<usize, PipelineError> {
        self.fundamentals(request, Endpoint::Statements, FUNDAMENTALS_STATEMENTS)
    }

    fn fundamentals(
        &self,
        request: &FundamentalsRequest,
        endpoint: Endpoint,
        table: &str,
    ) -> Result<usize, PipelineError> {
        self.update_metadata()?;

        let mut tickers = normalize(&request.tickers);
        if tickers.is_empty() {
            tickers = self.selected_fundamentals()?;
            if request.half {
                let which = Half::from_clock(self.clock);
                tickers = half(&tickers, which.is_upper()).to_vec();
                tracing::info!(half = ?which, tickers = tickers.len(), "processing half of the selection");
            }
        }
        let tickers = exclude(tickers, &request.skip);

        let config = self.config.fundamentals.scheduler_config(request.batch_size);
        let scheduler = BatchScheduler::new(config, self.sink, self.observer)?;
        let fetch = |entity: &EntityId| self.source.fetch(endpoint, entity);

        let summary = scheduler.run(&tickers, &fetch, table);
        tracing::info!(
            data = endpoint.name(),
            empty_responses = summary.empty_responses.len(),
            "total number of empty responses"
        );

        let (processed, error) = summary.into_parts();
        match error {
            None => Ok(processed),
            Some(source) => Err(PipelineError::Partial {
                succeeded: processed,
                source,
            }),
        }
    }

    /// Tickers from the fundamentals selection query, sampled outside prod.
    fn selected_fundamentals(&self) -> Result<Vec<EntityId>, PipelineError> {
        let mut tickers = self.select_tickers(SELECTED_FUNDAMENTALS_SQL)?;
        if tickers.is_empty() {
            return Err(EtlError::Configuration(format!(
                "no tickers found in {SELECTED_FUNDAMENTALS_SQL} results"
            ))
            .into());
        }

        if let (false, Some(n)) = (self.config.is_prod(), self.config.fundamentals.selection_sample) {
            if n < tickers.len() {
                let mut rng = rand::thread_rng();
                tickers = tickers.choose_multiple(&mut rng, n).cloned().collect();
                tickers.sort();
                tracing::info!(sample = n, "sampled fundamentals selection");
            }
        }
        Ok(tickers)
    }

    fn select_tickers(&self, file: &str) -> Result<Vec<EntityId>, PipelineError> {
        let sql = self.read_sql(file)?;
        let result = self.sink.query(&sql).map_err(|source| PipelineError::Sink {
            context: "running selection query",
            source,
        })?;
        let tickers = result.column(TICKER_COLUMN).ok_or_else(|| {
            EtlError::Configuration(format!("{TICKER_COLUMN} column not found in {file} results"))
        })?;
        Ok(normalize(tickers))
    }
}

fn parse(bytes: Vec<u8>, context: &'static str) -> Result<CsvPayload, PipelineError> {
    CsvPayload::parse(bytes).map_err(|source| PipelineError::Transform { context, source })
}

/// Templates read their input from the table named by `csv_table`.
fn payload_params() -> TemplateParams {
    let mut params = TemplateParams::new();
    params.insert(
        "csv_table".into(),
        serde_json::Value::String(tickerflow_core::sink::parquet::PAYLOAD_TABLE.into()),
    );
    params
}
