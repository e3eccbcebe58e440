pub mod calculations;
pub mod checkpoints;
pub mod curtailment_db;
pub mod difficulty;
pub mod lib_duckdb;
pub mod records;
pub mod summaries;

pub use curtailment_db::CurtailmentDb;
