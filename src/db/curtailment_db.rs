use std::time::Duration;

use duckdb::DuckdbConnectionManager;
use log::info;
use r2d2::{Pool, PooledConnection};

use crate::db::lib_duckdb::open_pool_with_retry;
use crate::error::Result;

/// The relational store behind the pipeline: raw curtailment records, the
/// derived bitcoin calculations, the summary tables, the difficulty history
/// and the reconciliation checkpoints all live in one DuckDB database.
///
/// Every write is either a delete by date, or a delete by key followed by an
/// insert.  The tables carry no primary key constraint; uniqueness of the
/// keys is maintained by those two operations.
#[derive(Clone)]
pub struct CurtailmentDb {
    pub duckdb_path: String,
    pool: Pool<DuckdbConnectionManager>,
}

impl CurtailmentDb {
    pub fn open(duckdb_path: &str, pool_size: u32) -> Result<CurtailmentDb> {
        let pool = open_pool_with_retry(duckdb_path, pool_size, 8, Duration::from_millis(25))?;
        let db = CurtailmentDb {
            duckdb_path: duckdb_path.to_string(),
            pool,
        };
        db.setup()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<CurtailmentDb> {
        let manager = DuckdbConnectionManager::memory()?;
        let pool = Pool::builder().max_size(4).build(manager)?;
        let db = CurtailmentDb {
            duckdb_path: ":memory:".to_string(),
            pool,
        };
        db.setup()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection<DuckdbConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Create the tables if they don't exist.
    pub fn setup(&self) -> Result<()> {
        info!("initializing curtailment tables in {} ...", self.duckdb_path);
        let conn = self.conn()?;
        conn.execute_batch(
            r"
    BEGIN;
    CREATE TABLE IF NOT EXISTS curtailment_records (
        settlement_date DATE NOT NULL,
        settlement_period INTEGER NOT NULL,
        farm_id VARCHAR NOT NULL,
        lead_party_name VARCHAR,
        volume DECIMAL(18,6) NOT NULL,
        original_price DECIMAL(18,6) NOT NULL,
        final_price DECIMAL(18,6) NOT NULL,
        payment DECIMAL(18,6) NOT NULL,
        so_flag BOOLEAN NOT NULL,
        cadl_flag BOOLEAN NOT NULL,
    );
    CREATE TABLE IF NOT EXISTS bitcoin_calculations (
        settlement_date DATE NOT NULL,
        settlement_period INTEGER NOT NULL,
        farm_id VARCHAR NOT NULL,
        miner_model VARCHAR NOT NULL,
        curtailed_energy DECIMAL(18,6) NOT NULL,
        bitcoin_mined DECIMAL(18,8) NOT NULL,
        difficulty DOUBLE NOT NULL,
    );
    CREATE TABLE IF NOT EXISTS daily_summaries (
        summary_date DATE NOT NULL,
        total_curtailed_energy DECIMAL(18,6) NOT NULL,
        total_payment DECIMAL(18,6) NOT NULL,
    );
    CREATE TABLE IF NOT EXISTS monthly_summaries (
        year_month VARCHAR NOT NULL,
        total_curtailed_energy DECIMAL(18,6) NOT NULL,
        total_payment DECIMAL(18,6) NOT NULL,
    );
    CREATE TABLE IF NOT EXISTS yearly_summaries (
        year INTEGER NOT NULL,
        total_curtailed_energy DECIMAL(18,6) NOT NULL,
        total_payment DECIMAL(18,6) NOT NULL,
    );
    CREATE TABLE IF NOT EXISTS bitcoin_daily_summaries (
        summary_date DATE NOT NULL,
        miner_model VARCHAR NOT NULL,
        bitcoin_mined DECIMAL(18,8) NOT NULL,
    );
    CREATE TABLE IF NOT EXISTS bitcoin_monthly_summaries (
        year_month VARCHAR NOT NULL,
        miner_model VARCHAR NOT NULL,
        bitcoin_mined DECIMAL(18,8) NOT NULL,
    );
    CREATE TABLE IF NOT EXISTS bitcoin_yearly_summaries (
        year INTEGER NOT NULL,
        miner_model VARCHAR NOT NULL,
        bitcoin_mined DECIMAL(18,8) NOT NULL,
    );
    CREATE TABLE IF NOT EXISTS difficulty_history (
        effective_date DATE NOT NULL,
        difficulty DOUBLE NOT NULL,
    );
    CREATE TABLE IF NOT EXISTS reconciliation_runs (
        run_id VARCHAR NOT NULL,
        mode VARCHAR NOT NULL,
        start_date DATE NOT NULL,
        end_date DATE NOT NULL,
        status VARCHAR NOT NULL,
        last_completed_date DATE,
        records_processed BIGINT NOT NULL,
        calculations_written BIGINT NOT NULL,
        started_at VARCHAR NOT NULL,
        updated_at VARCHAR NOT NULL,
    );
    CREATE TABLE IF NOT EXISTS reconciliation_run_dates (
        run_id VARCHAR NOT NULL,
        settlement_date DATE NOT NULL,
        status VARCHAR NOT NULL,
        attempts INTEGER NOT NULL,
        error VARCHAR,
    );
    COMMIT;
    ",
        )?;
        Ok(())
    }
}
