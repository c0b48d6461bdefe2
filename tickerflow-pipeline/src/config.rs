//! Layered TOML configuration.
//!
//! `config.base.toml` holds every default; `config.{env}.toml`, when present,
//! is deep-merged over it. Tables merge key by key, everything else in the
//! overlay replaces the base value.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tickerflow_core::backfill::BackfillConfig;
use tickerflow_core::scheduler::{FailurePolicy, SchedulerConfig};
use tickerflow_core::source::tiingo::TiingoSettings;

pub const BASE_FILE: &str = "config.base.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {0} is not set")]
    MissingToken(String),

    #[error("cannot find SQL directory (tried {0})")]
    SqlDirNotFound(String),
}

/// Full application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    /// Deployment environment; `prod` disables selection sampling.
    pub env: String,
    pub tiingo: TiingoConfig,
    pub storage: StorageConfig,
    pub fundamentals: FundamentalsConfig,
    pub backfill: BackfillConfig,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            env: "dev".into(),
            tiingo: TiingoConfig::default(),
            storage: StorageConfig::default(),
            fundamentals: FundamentalsConfig::default(),
            backfill: BackfillConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiingoConfig {
    pub base_url: String,
    pub supported_tickers_url: String,
    /// Name of the environment variable holding the API token.
    pub token_env: String,
    pub timeout_secs: u64,
    pub history_start_date: NaiveDate,
    pub fundamentals_start_date: NaiveDate,
}

impl Default for TiingoConfig {
    fn default() -> Self {
        let start = NaiveDate::from_ymd_opt(1995, 1, 1).unwrap_or_default();
        Self {
            base_url: "https://api.tiingo.com".into(),
            supported_tickers_url:
                "https://apimedia.tiingo.com/docs/tiingo/daily/supported_tickers.zip".into(),
            token_env: "TIINGO_TOKEN".into(),
            timeout_secs: 30,
            history_start_date: start,
            fundamentals_start_date: start,
        }
    }
}

impl TiingoConfig {
    /// Client settings with the token read from `token_env`.
    pub fn settings(&self) -> Result<TiingoSettings, ConfigError> {
        let token = std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingToken(self.token_env.clone()))?;
        Ok(self.settings_with_token(token))
    }

    pub fn settings_with_token(&self, token: impl Into<String>) -> TiingoSettings {
        TiingoSettings {
            base_url: self.base_url.clone(),
            supported_tickers_url: self.supported_tickers_url.clone(),
            token: token.into(),
            timeout: Duration::from_secs(self.timeout_secs),
            history_start_date: self.history_start_date,
            fundamentals_start_date: self.fundamentals_start_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the Parquet table store.
    pub root: PathBuf,
    /// Directory with the query templates; `../{sql_dir}` is tried next.
    pub sql_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            sql_dir: PathBuf::from("sql"),
        }
    }
}

impl StorageConfig {
    pub fn resolve_sql_dir(&self) -> Result<PathBuf, ConfigError> {
        let candidates = [self.sql_dir.clone(), Path::new("..").join(&self.sql_dir)];
        candidates
            .iter()
            .find(|dir| dir.is_dir())
            .cloned()
            .ok_or_else(|| {
                ConfigError::SqlDirNotFound(
                    candidates
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FundamentalsConfig {
    pub max_concurrency: usize,
    /// Entities per batch; 0 loads everything in one batch.
    pub batch_size: usize,
    pub failure_policy: FailurePolicy,
    /// Random sample size for the selection query outside `prod`.
    pub selection_sample: Option<usize>,
}

impl Default for FundamentalsConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 20,
            batch_size: 500,
            failure_policy: FailurePolicy::FailFast,
            selection_sample: Some(20),
        }
    }
}

impl FundamentalsConfig {
    pub fn scheduler_config(&self, batch_size: Option<usize>) -> SchedulerConfig {
        SchedulerConfig {
            batch_size: batch_size.unwrap_or(self.batch_size),
            max_concurrency: self.max_concurrency,
            failure_policy: self.failure_policy,
        }
    }
}

impl EtlConfig {
    /// Load `config.base.toml` from `dir` and overlay `config.{env}.toml`.
    pub fn load(dir: &Path, env: &str) -> Result<Self, ConfigError> {
        let base_path = dir.join(BASE_FILE);
        let mut merged = read_table(&base_path)?;

        let overlay_path = dir.join(format!("config.{env}.toml"));
        if overlay_path.exists() {
            merge(&mut merged, read_table(&overlay_path)?);
            tracing::debug!(path = %overlay_path.display(), "applied config overlay");
        }

        let mut config: EtlConfig = toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: base_path,
                message: e.to_string(),
            })?;
        config.env = env.to_string();
        config.validate()?;
        Ok(config)
    }

    /// Parse a single TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EtlConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn is_prod(&self) -> bool {
        self.env == "prod"
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fundamentals.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "fundamentals.max_concurrency must be at least 1".into(),
            ));
        }
        if self.backfill.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "backfill.max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    content.parse::<toml::Table>().map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
