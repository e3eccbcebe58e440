use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::db::CurtailmentDb;
use crate::elexon::bmu::BmuMapping;
use crate::elexon::{ElexonClient, DEFAULT_BASE_URL};
use crate::eligibility::Eligibility;
use crate::error::{Error, Result};
use crate::ingest::Ingestor;
use crate::mining::{parse_models, MinerModel};
use crate::retry::RetryPolicy;

/// Settings of a run, read from `CURTAIL_*` and `ELEXON_*` environment
/// variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub duckdb_path: String,
    pub pool_size: u32,
    pub elexon_base_url: String,
    #[serde(skip)]
    pub elexon_api_key: Option<String>,
    pub bmu_mapping: Option<PathBuf>,
    pub eligibility: Eligibility,
    pub miner_models: Vec<MinerModel>,
    pub retry: RetryPolicy,
    pub fetch_concurrency: usize,
    pub request_delay: Duration,
    pub batch_size: usize,
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse::<T>()
            .map_err(|e| Error::Config(format!("{}={}: {}", key, v, e))),
    }
}

fn millis(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    let ms = parse_var(get, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

impl Config {
    /// Load the `.env/{env}.env` file if there is one, then read the
    /// environment.
    pub fn load(env: &str) -> Result<Config> {
        let path = format!(".env/{}.env", env);
        match dotenvy::from_path(Path::new(&path)) {
            Ok(()) => info!("loaded settings from {}", path),
            Err(e) if e.not_found() => warn!("{} not found, using the environment only", path),
            Err(e) => return Err(Error::Config(format!("{}: {}", path, e))),
        }
        Config::from_vars(|key| std::env::var(key).ok())
    }

    /// Build the config from a variable lookup.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let duckdb_path = get("CURTAIL_DUCKDB_PATH")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::Config("CURTAIL_DUCKDB_PATH is not set".to_string()))?;

        let miner_models = match get("CURTAIL_MINER_MODELS") {
            Some(v) if !v.trim().is_empty() => parse_models(&v)
                .map_err(|e| Error::Config(format!("CURTAIL_MINER_MODELS={}: {}", v, e)))?,
            _ => MinerModel::ALL.to_vec(),
        };
        if miner_models.is_empty() {
            return Err(Error::Config("no miner model configured".to_string()));
        }

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_var(&get, "CURTAIL_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
            initial_wait: millis(&get, "CURTAIL_RETRY_INITIAL_WAIT_MS", defaults.initial_wait)?,
            max_wait: millis(&get, "CURTAIL_RETRY_MAX_WAIT_MS", defaults.max_wait)?,
            rate_limit_wait: millis(&get, "CURTAIL_RATE_LIMIT_WAIT_MS", defaults.rate_limit_wait)?,
        };
        if retry.max_attempts == 0 {
            return Err(Error::Config("CURTAIL_RETRY_MAX_ATTEMPTS must be at least 1".to_string()));
        }

        let config = Config {
            duckdb_path: duckdb_path.trim().to_string(),
            pool_size: parse_var(&get, "CURTAIL_POOL_SIZE", 4)?,
            elexon_base_url: get("ELEXON_BASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            elexon_api_key: get("ELEXON_API_KEY").filter(|v| !v.trim().is_empty()),
            bmu_mapping: get("CURTAIL_BMU_MAPPING")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            eligibility: parse_var(&get, "CURTAIL_ELIGIBILITY", Eligibility::default())?,
            miner_models,
            retry,
            fetch_concurrency: parse_var(&get, "CURTAIL_FETCH_CONCURRENCY", 3)?,
            request_delay: millis(&get, "CURTAIL_REQUEST_DELAY_MS", Duration::from_millis(200))?,
            batch_size: parse_var(&get, "CURTAIL_BATCH_SIZE", 5)?,
        };
        if config.pool_size == 0 || config.fetch_concurrency == 0 || config.batch_size == 0 {
            return Err(Error::Config(
                "pool size, fetch concurrency and batch size must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn open_db(&self) -> Result<CurtailmentDb> {
        CurtailmentDb::open(&self.duckdb_path, self.pool_size)
    }

    pub fn elexon_client(&self) -> Result<ElexonClient> {
        let client = ElexonClient::new(&self.elexon_base_url, self.elexon_api_key.clone())?;
        match &self.bmu_mapping {
            Some(path) => Ok(client.with_mapping(BmuMapping::load(path)?)),
            None => Ok(client),
        }
    }

    pub fn ingestor(&self, db: &CurtailmentDb) -> Result<Ingestor<ElexonClient>> {
        Ok(Ingestor::new(db.clone(), self.elexon_client()?, self.eligibility)
            .with_retry(self.retry.clone())
            .with_concurrency(self.fetch_concurrency)
            .with_request_delay(self.request_delay))
    }
}
