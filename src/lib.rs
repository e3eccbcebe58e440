pub mod config;
pub mod db;
pub mod difficulty;
pub mod elexon;
pub mod eligibility;
pub mod error;
pub mod ingest;
pub mod interval;
pub mod mining;
pub mod model;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod rollup;

pub use error::{Error, Result};
