use jiff::civil::Date;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited (HTTP 429) by {url}")]
    RateLimited { url: String },

    #[error("Unexpected HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Unknown miner model: {0}")]
    UnknownMinerModel(String),

    #[error("Invalid difficulty {0}, must be a positive number")]
    InvalidDifficulty(f64),

    #[error("Invalid curtailed energy {0} MWh, must be a non-negative number")]
    InvalidEnergy(f64),

    #[error("No difficulty available for {0}")]
    MissingDifficulty(Date),

    #[error("Difficulty provider unavailable: {0}")]
    DifficultyUnavailable(String),

    #[error("Malformed record for {date} period {period}: {reason}")]
    MalformedRecord {
        date: Date,
        period: u8,
        reason: String,
    },

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date error: {0}")]
    Jiff(#[from] jiff::Error),

    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Transport failures are worth another attempt, data and consistency
    /// errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Pool(_) | Error::RateLimited { .. } | Error::DifficultyUnavailable(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Error::HttpStatus { status, .. } => *status >= 500,
            Error::Database(e) => is_transient_duckdb(e),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }
}

/// DuckDB reports lock contention and IO trouble as plain messages.
fn is_transient_duckdb(e: &duckdb::Error) -> bool {
    let msg = e.to_string();
    msg.contains("Could not set lock")
        || msg.contains("IO Error")
        || msg.contains("Conflicting lock")
        || msg.contains("TransactionContext Error")
}

pub type Result<T> = std::result::Result<T, Error>;
