//! BDD tests for the pipeline runs against a scripted data source.
//!
//! The source answers from fixed CSV bodies; sinks are either the in-memory
//! recorder or a Parquet store in a temp directory.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Cursor, Write};
use std::path::PathBuf;
use tickerflow_core::clock::FixedClock;
use tickerflow_core::entity::EntityId;
use tickerflow_core::error::EtlError;
use tickerflow_core::observer::{NullObserver, RecordingObserver};
use tickerflow_core::sink::{MemorySink, ParquetSink, QueryResult, Sink};
use tickerflow_core::source::{Endpoint, MarketDataSource, SourceError};
use tickerflow_pipeline::pipeline::{
    DAILY_ADJUSTED, FUNDAMENTALS_DAILY, FUNDAMENTALS_META, FUNDAMENTALS_STATEMENTS,
    LAST_TRADING_DAY, SUPPORTED_TICKERS,
};
use tickerflow_pipeline::{EtlConfig, FundamentalsRequest, Pipeline, PipelineError};

// ── Scripted source ──────────────────────────────────────────────────

const SUPPORTED_CSV: &str = "ticker,exchange,assetType,priceCurrency,startDate,endDate\n\
aapl,NASDAQ,Stock,USD,1980-12-12,2024-01-03\n\
msft,NASDAQ,Stock,USD,1986-03-13,2024-01-03\n\
xom,NYSE,Stock,USD,1970-01-02,2024-01-03\n";

const META_CSV: &str = "permaTicker,ticker,name,isActive,isADR,sector,industry,sicCode,reportingCurrency,statementLastUpdated,dailyLastUpdated\n\
US000000000038,aapl,Apple Inc,True,False,Technology,Consumer Electronics,3571,usd,2024-01-02,2024-01-03\n\
US000000000042,msft,Microsoft Corp,True,False,Technology,Software,7372,usd,2024-01-02,2024-01-03\n\
US000000000091,xom,Exxon Mobil Corp,True,False,Energy,Oil & Gas,2911,usd,2024-01-02,2024-01-03\n\
US000000000099,gone,Delisted Co,False,False,Energy,Oil & Gas,2911,usd,2019-01-02,2019-01-03\n";

const LAST_DAY_CSV: &str = "ticker,date,close,high,low,open,volume,adjClose,adjHigh,adjLow,adjOpen,adjVolume,divCash,splitFactor\n\
aapl,2024-01-03,184.25,185.88,183.43,184.22,58414460,184.25,185.88,183.43,184.22,58414460,0.0,1.0\n\
msft,2024-01-03,370.6,373.26,368.51,369.01,23083465,370.6,373.26,368.51,369.01,23083465,0.75,1.0\n\
xom,2024-01-03,104.2,104.86,102.8,102.96,25160741,104.2,104.86,102.8,102.96,25160741,0.0,2.0\n";

const HISTORY_CSV: &str = "date,close,high,low,open,volume,adjClose,adjHigh,adjLow,adjOpen,adjVolume,divCash,splitFactor\n\
2024-01-02,1.0,1.0,1.0,1.0,100,1.0,1.0,1.0,1.0,100,0.0,1.0\n\
2024-01-03,2.0,2.0,2.0,2.0,100,2.0,2.0,2.0,2.0,100,0.0,1.0\n";

const DAILY_CSV: &str = "date,marketCap,enterpriseVal,peRatio,pbRatio,trailingPEG1Y\n\
2024-01-03,2.9e12,2.95e12,28.6,45.1,2.1\n";

const HEADER_ONLY_LAST_DAY_CSV: &str = "ticker,date,close,high,low,open,volume,adjClose,adjHigh,adjLow,adjOpen,adjVolume,divCash,splitFactor\n";

#[derive(Default)]
struct ScriptedSource {
    failing: Vec<EntityId>,
    empty: Vec<EntityId>,
    /// Last-trading-day bodies served in order; `LAST_DAY_CSV` once exhausted.
    last_days: std::sync::Mutex<VecDeque<&'static str>>,
    calls: std::sync::Mutex<HashMap<&'static str, usize>>,
}

impl ScriptedSource {
    fn failing(tickers: &[&str]) -> Self {
        Self {
            failing: tickers.iter().map(EntityId::new).collect(),
            ..Self::default()
        }
    }

    fn with_last_days(days: &[&'static str]) -> Self {
        Self {
            last_days: std::sync::Mutex::new(days.iter().copied().collect()),
            ..Self::default()
        }
    }

    fn count(&self, what: &'static str) {
        *self.calls.lock().unwrap().entry(what).or_default() += 1;
    }

    fn calls(&self, what: &'static str) -> usize {
        self.calls.lock().unwrap().get(what).copied().unwrap_or(0)
    }
}

fn zipped(name: &str, body: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file(name, zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(body.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

impl MarketDataSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(&self, endpoint: Endpoint, entity: &EntityId) -> Result<Vec<u8>, SourceError> {
        self.count(endpoint.name());
        if self.failing.contains(entity) {
            return Err(SourceError::Http {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        if self.empty.contains(entity) {
            return Ok(b"None".to_vec());
        }
        Ok(match endpoint {
            Endpoint::History => HISTORY_CSV,
            Endpoint::DailyFundamentals | Endpoint::Statements => DAILY_CSV,
        }
        .as_bytes()
        .to_vec())
    }

    fn fetch_metadata(&self, _entity: Option<&EntityId>) -> Result<Vec<u8>, SourceError> {
        self.count("metadata");
        Ok(META_CSV.as_bytes().to_vec())
    }

    fn fetch_supported_entities(&self) -> Result<Vec<u8>, SourceError> {
        self.count("supported");
        Ok(zipped("supported_tickers.csv", SUPPORTED_CSV))
    }

    fn fetch_last_trading_day(&self) -> Result<Vec<u8>, SourceError> {
        self.count("last day");
        let body = self.last_days.lock().unwrap().pop_front().unwrap_or(LAST_DAY_CSV);
        Ok(body.as_bytes().to_vec())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn test_config(root: PathBuf) -> EtlConfig {
    let mut config = EtlConfig::default();
    config.storage.root = root;
    config.storage.sql_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../sql");
    config.fundamentals.selection_sample = None;
    config.fundamentals.max_concurrency = 4;
    config
}

fn tickers(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn ticker_dates(sink: &ParquetSink) -> Vec<(String, String)> {
    let result = sink
        .query("SELECT \"ticker\", \"date\" FROM daily_adjusted")
        .unwrap();
    let tickers = result.column("ticker").unwrap();
    let dates = result.column("date").unwrap();
    tickers.iter().cloned().zip(dates.iter().cloned()).collect()
}

// ── Fundamentals ─────────────────────────────────────────────────────

#[test]
fn bdd_scenario_daily_fundamentals_for_explicit_tickers() {
    // GIVEN explicit tickers, one of them skipped
    let source = ScriptedSource::default();
    let sink = MemorySink::new();
    let clock = FixedClock::at_hour(10).unwrap();
    let pipeline = Pipeline::new(test_config(PathBuf::from("unused")), &source, &sink, &clock, &NullObserver)
        .unwrap();
    let request = FundamentalsRequest {
        tickers: tickers(&["aapl", "msft", "xom"]),
        skip: tickers(&["XOM"]),
        ..FundamentalsRequest::default()
    };

    // WHEN daily fundamentals run
    let processed = pipeline.daily_fundamentals(&request).unwrap();

    // THEN supported tickers and metadata were refreshed first
    assert_eq!(processed, 2);
    assert_eq!(sink.writes_to(SUPPORTED_TICKERS).len(), 1);
    let meta = sink.writes_to(FUNDAMENTALS_META);
    assert_eq!(meta.len(), 1);
    assert!(meta[0].template_sql.as_deref().unwrap().contains("FROM payload"));

    // AND only the two remaining tickers were fetched and loaded
    assert_eq!(source.calls("daily fundamentals"), 2);
    let loaded = String::from_utf8(sink.writes_to(FUNDAMENTALS_DAILY)[0].bytes.clone()).unwrap();
    assert!(loaded.starts_with("ticker,date,marketCap"));
    assert!(loaded.contains("AAPL,"));
    assert!(!loaded.contains("XOM,"));
}

#[test]
fn bdd_scenario_statements_use_selection_half() {
    // GIVEN a selection of five tickers and a clock at an odd hour
    let source = ScriptedSource::default();
    let selection = QueryResult::single("ticker", tickers(&["a", "b", "c", "d", "e"]));
    let sink = MemorySink::new().with_query_result("fundamentals_meta", selection);
    let clock = FixedClock::at_hour(3).unwrap();
    let pipeline = Pipeline::new(test_config(PathBuf::from("unused")), &source, &sink, &clock, &NullObserver)
        .unwrap();

    // WHEN statements run with the half flag
    let request = FundamentalsRequest {
        half: true,
        batch_size: Some(1),
        ..FundamentalsRequest::default()
    };
    let processed = pipeline.statements(&request).unwrap();

    // THEN the upper half (D, E) is loaded, one batch each
    assert_eq!(processed, 2);
    let writes = sink.writes_to(FUNDAMENTALS_STATEMENTS);
    assert_eq!(writes.len(), 2);
    assert!(String::from_utf8_lossy(&writes[0].bytes).contains("D,"));
    assert!(String::from_utf8_lossy(&writes[1].bytes).contains("E,"));
}

#[test]
fn bdd_scenario_empty_selection_is_configuration_error() {
    let source = ScriptedSource::default();
    let sink = MemorySink::new().with_query_result("fundamentals_meta", QueryResult::single("ticker", vec![]));
    let clock = FixedClock::at_hour(0).unwrap();
    let pipeline = Pipeline::new(test_config(PathBuf::from("unused")), &source, &sink, &clock, &NullObserver)
        .unwrap();

    let err = pipeline.daily_fundamentals(&FundamentalsRequest::default()).unwrap_err();
    assert!(matches!(err, PipelineError::Etl(EtlError::Configuration(_))));
    assert_eq!(source.calls("daily fundamentals"), 0);
}

#[test]
fn bdd_scenario_failed_batch_reports_partial_success() {
    // GIVEN batches of two where the second batch has a failing ticker
    let source = ScriptedSource::failing(&["C"]);
    let sink = MemorySink::new();
    let clock = FixedClock::at_hour(0).unwrap();
    let pipeline = Pipeline::new(test_config(PathBuf::from("unused")), &source, &sink, &clock, &NullObserver)
        .unwrap();
    let request = FundamentalsRequest {
        tickers: tickers(&["a", "b", "c", "d"]),
        batch_size: Some(2),
        ..FundamentalsRequest::default()
    };

    // WHEN daily fundamentals run
    let err = pipeline.daily_fundamentals(&request).unwrap_err();

    // THEN the first batch stays committed and the error carries its count
    assert_eq!(err.succeeded(), 2);
    assert!(matches!(err, PipelineError::Partial { .. }));
    assert_eq!(sink.rows_in(FUNDAMENTALS_DAILY), 2);
}

// ── End of day ───────────────────────────────────────────────────────

#[test]
fn bdd_scenario_daily_eod_backfills_selected_tickers() {
    // GIVEN a backfill selection of two tickers, one of which fails
    let source = ScriptedSource::failing(&["XOM"]);
    let selection = QueryResult::single("ticker", tickers(&["msft", "xom"]));
    let sink = MemorySink::new().with_query_result("last_trading_day", selection);
    let clock = FixedClock::at_hour(0).unwrap();
    let observer = RecordingObserver::new();
    let pipeline = Pipeline::new(test_config(PathBuf::from("unused")), &source, &sink, &clock, &observer)
        .unwrap();

    // WHEN the daily EOD run executes
    let err = pipeline.daily_end_of_day().unwrap_err();

    // THEN the last trading day was loaded and appended to daily_adjusted
    assert_eq!(sink.writes_to(LAST_TRADING_DAY).len(), 1);
    let adjusted = sink.writes_to(DAILY_ADJUSTED);
    assert!(adjusted[0].template_sql.is_some());

    // AND one ticker backfilled while the other is reported
    assert_eq!(err.succeeded(), 1);
    assert!(err.to_string().contains("XOM"));
    assert_eq!(source.calls("history"), 2);
    assert_eq!(observer.runs().len(), 1);
}

#[test]
fn bdd_scenario_backfill_query_without_ticker_column() {
    let source = ScriptedSource::default();
    let sink = MemorySink::new().with_query_result(
        "last_trading_day",
        QueryResult::single("symbol", tickers(&["AAPL"])),
    );
    let clock = FixedClock::at_hour(0).unwrap();
    let pipeline = Pipeline::new(test_config(PathBuf::from("unused")), &source, &sink, &clock, &NullObserver)
        .unwrap();

    let err = pipeline.daily_end_of_day().unwrap_err();
    assert!(matches!(err, PipelineError::Etl(EtlError::Configuration(_))));
}

#[test]
fn bdd_scenario_nothing_to_backfill() {
    let source = ScriptedSource::default();
    let sink = MemorySink::new()
        .with_query_result("last_trading_day", QueryResult::single("ticker", vec![]));
    let clock = FixedClock::at_hour(0).unwrap();
    let pipeline = Pipeline::new(test_config(PathBuf::from("unused")), &source, &sink, &clock, &NullObserver)
        .unwrap();

    assert_eq!(pipeline.daily_end_of_day().unwrap(), 0);
    assert_eq!(source.calls("history"), 0);
}

#[test]
fn bdd_scenario_missing_sql_dir_fails_construction() {
    let source = ScriptedSource::default();
    let sink = MemorySink::new();
    let clock = FixedClock::at_hour(0).unwrap();
    let mut config = test_config(PathBuf::from("unused"));
    config.storage.sql_dir = PathBuf::from("/definitely/not/here");

    assert!(matches!(
        Pipeline::new(config, &source, &sink, &clock, &NullObserver),
        Err(PipelineError::Config(_))
    ));
}

// ── Parquet store end to end ─────────────────────────────────────────

#[test]
fn bdd_scenario_parquet_store_end_to_end() {
    // GIVEN an empty Parquet store
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::default();
    let sink = ParquetSink::new(dir.path());
    let clock = FixedClock::at_hour(0).unwrap();
    let pipeline = Pipeline::new(test_config(dir.path().to_path_buf()), &source, &sink, &clock, &NullObserver)
        .unwrap();

    // WHEN metadata is refreshed
    let meta_rows = pipeline.update_metadata().unwrap();

    // THEN every metadata row is stored with upper-cased tickers
    assert_eq!(meta_rows, 4);
    let meta = sink.query("SELECT \"ticker\" FROM fundamentals_meta ORDER BY \"ticker\"").unwrap();
    assert_eq!(meta.column("ticker").unwrap(), &tickers(&["AAPL", "GONE", "MSFT", "XOM"])[..]);

    // WHEN fundamentals run off the selection query
    let processed = pipeline.daily_fundamentals(&FundamentalsRequest::default()).unwrap();

    // THEN only active tickers are loaded
    assert_eq!(processed, 3);
    assert_eq!(sink.get_meta(FUNDAMENTALS_DAILY).unwrap().row_count, 3);

    // WHEN the daily EOD run executes
    let selected = pipeline.daily_end_of_day().unwrap();

    // THEN MSFT (dividend) and XOM (split) are backfilled
    assert_eq!(selected, 2);
    let adjusted = sink
        .query("SELECT \"ticker\" FROM daily_adjusted WHERE \"date\" = '2024-01-02' ORDER BY \"ticker\"")
        .unwrap();
    assert_eq!(adjusted.column("ticker").unwrap(), &tickers(&["MSFT", "XOM"])[..]);

    // AND their reloaded history replaced the rows inserted for the last day
    let rows = ticker_dates(&sink);
    assert_eq!(rows.len(), 1 + 2 * 2);
    let unique: HashSet<_> = rows.iter().collect();
    assert_eq!(unique.len(), rows.len());
    assert_eq!(sink.get_meta(DAILY_ADJUSTED).unwrap().row_count, 5);
}

#[test]
fn bdd_scenario_repeated_backfill_keeps_one_row_per_day() {
    // GIVEN tickers already backfilled once
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::default();
    let sink = ParquetSink::new(dir.path());
    let clock = FixedClock::at_hour(0).unwrap();
    let pipeline = Pipeline::new(test_config(dir.path().to_path_buf()), &source, &sink, &clock, &NullObserver)
        .unwrap();
    let backfilled = [EntityId::new("MSFT"), EntityId::new("XOM")];
    assert_eq!(pipeline.backfill_end_of_day(&backfilled).unwrap(), 2);

    // WHEN the same tickers are backfilled again
    assert_eq!(pipeline.backfill_end_of_day(&backfilled).unwrap(), 2);

    // THEN each (ticker, date) is stored exactly once
    let rows = ticker_dates(&sink);
    assert_eq!(rows.len(), 4);
    let unique: HashSet<_> = rows.iter().collect();
    assert_eq!(unique.len(), 4);
}

#[test]
fn bdd_scenario_header_only_last_day_clears_previous_day() {
    // GIVEN a first EOD run that selected MSFT and XOM for backfill
    let dir = tempfile::tempdir().unwrap();
    let source = ScriptedSource::with_last_days(&[LAST_DAY_CSV, HEADER_ONLY_LAST_DAY_CSV]);
    let sink = ParquetSink::new(dir.path());
    let clock = FixedClock::at_hour(0).unwrap();
    let pipeline = Pipeline::new(test_config(dir.path().to_path_buf()), &source, &sink, &clock, &NullObserver)
        .unwrap();
    assert_eq!(pipeline.daily_end_of_day().unwrap(), 2);
    assert_eq!(source.calls("history"), 2);

    // WHEN the next day's file carries only a header
    let selected = pipeline.daily_end_of_day().unwrap();

    // THEN last_trading_day is empty and nothing is backfilled again
    assert_eq!(selected, 0);
    assert_eq!(source.calls("history"), 2);
    assert_eq!(sink.get_meta(LAST_TRADING_DAY).unwrap().row_count, 0);
    let last_day = sink.query("SELECT \"ticker\" FROM last_trading_day").unwrap();
    assert_eq!(last_day.row_count(), 0);
    assert_eq!(ticker_dates(&sink).len(), 5);
}
