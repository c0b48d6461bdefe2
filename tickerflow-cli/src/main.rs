//! tickerflow CLI: end-of-day, backfill, fundamentals and docs commands.
//!
//! Commands:
//! - `eod daily`: load the last trading day and backfill selected tickers
//! - `eod backfill AAPL,MSFT`: load full history for the given tickers
//! - `fundamentals daily|statements`: batched fundamentals loads
//! - `fundamentals metadata`: refresh fundamentals metadata
//! - `docs [OUTPUT]`: Markdown help for every command

use anyhow::{bail, Context, Result};
use clap::{Args, Command, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tickerflow_core::clock::SystemClock;
use tickerflow_core::entity::parse_list;
use tickerflow_core::observer::TracingObserver;
use tickerflow_core::sink::ParquetSink;
use tickerflow_core::source::{CircuitBreaker, TiingoClient};
use tickerflow_pipeline::{EtlConfig, FundamentalsRequest, Pipeline, PipelineError};

#[derive(Parser)]
#[command(
    name = "tickerflow",
    about = "ETL pipeline for Tiingo end-of-day prices and fundamentals",
    long_about = "Fetches end-of-day prices and fundamentals from Tiingo's APIs and loads them \
into a local Parquet table store, as configured by the config.*.toml files."
)]
struct Cli {
    /// Directory holding config.base.toml and config.{env}.toml.
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    /// Environment overlay to apply. Defaults to $APP_ENV, then "dev".
    #[arg(long, global = true, env = "APP_ENV", default_value = "dev")]
    env: String,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// End-of-day price commands.
    Eod {
        #[command(subcommand)]
        action: EodAction,
    },
    /// Fundamentals commands.
    Fundamentals {
        #[command(subcommand)]
        action: FundamentalsAction,
    },
    /// Generate Markdown documentation for all commands.
    Docs {
        /// Output file. Prints to stdout when omitted.
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum EodAction {
    /// Load the last trading day and backfill tickers with splits or dividends.
    Daily,
    /// Backfill full history for the given tickers.
    Backfill {
        /// Comma-separated tickers, e.g. AAPL,MSFT.
        tickers: String,
    },
}

#[derive(Subcommand)]
enum FundamentalsAction {
    /// Load daily fundamentals for selected tickers.
    Daily(FundamentalsArgs),
    /// Load financial statements for selected tickers.
    Statements(FundamentalsArgs),
    /// Refresh fundamentals metadata for all tickers.
    Metadata,
}

#[derive(Args)]
struct FundamentalsArgs {
    /// Comma-separated tickers. Uses the selection query when omitted.
    #[arg(long)]
    tickers: Option<String>,

    /// Process only the half of the selection picked by the current hour.
    #[arg(long, default_value_t = false)]
    half: bool,

    /// Tickers per batch (0 = one batch). Defaults to the configured value.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Comma-separated tickers to skip.
    #[arg(long)]
    skip: Option<String>,
}

impl FundamentalsArgs {
    fn into_request(self) -> FundamentalsRequest {
        let list = |raw: Option<String>| -> Vec<String> {
            raw.as_deref()
                .map(parse_list)
                .unwrap_or_default()
                .into_iter()
                .map(|e| e.to_string())
                .collect()
        };
        FundamentalsRequest {
            tickers: list(self.tickers),
            half: self.half,
            batch_size: self.batch_size,
            skip: list(self.skip),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tickerflow_core::logging::init(cli.verbose);

    match cli.command {
        Commands::Docs { output } => run_docs(output.as_deref()),
        Commands::Eod { action } => {
            let config = EtlConfig::load(&cli.config_dir, &cli.env)?;
            match action {
                EodAction::Daily => with_pipeline(config, |p| {
                    let n = p.daily_end_of_day()?;
                    tracing::info!("Backfilled {n} selected tickers");
                    Ok(())
                }),
                EodAction::Backfill { tickers } => {
                    let tickers = parse_list(&tickers);
                    if tickers.is_empty() {
                        bail!("no tickers given");
                    }
                    with_pipeline(config, |p| {
                        let n = p.backfill_end_of_day(&tickers)?;
                        tracing::info!("Backfilled {n} tickers");
                        Ok(())
                    })
                }
            }
        }
        Commands::Fundamentals { action } => {
            let config = EtlConfig::load(&cli.config_dir, &cli.env)?;
            match action {
                FundamentalsAction::Daily(args) => {
                    let request = args.into_request();
                    with_pipeline(config, |p| {
                        let n = p.daily_fundamentals(&request)?;
                        tracing::info!("Successfully updated daily fundamentals for {n} tickers");
                        Ok(())
                    })
                }
                FundamentalsAction::Statements(args) => {
                    let request = args.into_request();
                    with_pipeline(config, |p| {
                        let n = p.statements(&request)?;
                        tracing::info!("Successfully updated statements for {n} tickers");
                        Ok(())
                    })
                }
                FundamentalsAction::Metadata => with_pipeline(config, |p| {
                    let n = p.update_metadata()?;
                    tracing::info!("Successfully updated metadata for {n} tickers");
                    Ok(())
                }),
            }
        }
    }
}

/// Build the Tiingo client and Parquet store, run `f`, report partial success.
fn with_pipeline<F>(config: EtlConfig, f: F) -> Result<()>
where
    F: FnOnce(&Pipeline<'_>) -> Result<(), PipelineError>,
{
    let settings = config.tiingo.settings()?;
    let circuit_breaker = Arc::new(CircuitBreaker::default_provider());
    let source = TiingoClient::new(settings, circuit_breaker).context("creating Tiingo client")?;
    let sink = ParquetSink::new(config.storage.root.clone());
    let clock = SystemClock;
    let observer = TracingObserver;

    let pipeline = Pipeline::new(config, &source, &sink, &clock, &observer)
        .context("creating pipeline")?;

    match f(&pipeline) {
        Ok(()) => Ok(()),
        Err(err) => {
            let succeeded = err.succeeded();
            if succeeded > 0 {
                tracing::error!(succeeded, "run partially succeeded");
            }
            Err(err.into())
        }
    }
}

fn run_docs(output: Option<&Path>) -> Result<()> {
    let mut cmd = Cli::command();
    cmd.build();

    let mut doc = String::from("# tickerflow CLI Documentation\n\n## Overview\n\n");
    if let Some(about) = cmd.get_long_about() {
        doc.push_str(&format!("{about}\n\n"));
    }
    for group in cmd.get_subcommands_mut() {
        if group.get_name() == "docs" || group.get_name() == "help" {
            continue;
        }
        document(group, &mut doc);
    }

    match output {
        Some(path) => std::fs::write(path, doc)
            .with_context(|| format!("writing {}", path.display()))?,
        None => print!("{doc}"),
    }
    Ok(())
}

fn document(group: &mut Command, doc: &mut String) {
    let group_name = group.get_name().to_string();
    doc.push_str(&format!("## {group_name}\n\n"));
    for sub in group.get_subcommands_mut() {
        if sub.get_name() == "help" {
            continue;
        }
        doc.push_str(&format!("### {group_name} {}\n\n", sub.get_name()));
        doc.push_str(&format!("```\n{}\n```\n\n", sub.render_long_help()));
    }
}
