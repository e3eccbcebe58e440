use std::path::Path;

use duckdb::params;
use jiff::civil::Date;
use log::info;
use serde::Deserialize;

use crate::db::CurtailmentDb;
use crate::difficulty::DifficultyProvider;
use crate::error::{Error, Result};
use crate::mining::validate_difficulty;

/// One line of a difficulty CSV file, e.g. `2025-03-31,113757508810854`.
#[derive(Debug, Deserialize)]
struct DifficultyRow {
    date: Date,
    difficulty: f64,
}

impl CurtailmentDb {
    pub fn upsert_difficulty(&self, effective_date: Date, difficulty: f64) -> Result<()> {
        validate_difficulty(difficulty)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM difficulty_history WHERE effective_date = CAST(? AS DATE)",
            params![effective_date.to_string()],
        )?;
        tx.execute(
            "INSERT INTO difficulty_history VALUES (CAST(? AS DATE), ?)",
            params![effective_date.to_string(), difficulty],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Load a CSV file with a `date,difficulty` header.  Return the number of
    /// rows loaded.
    pub fn import_difficulty_csv(&self, path: &Path) -> Result<usize> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut n = 0;
        for result in rdr.deserialize() {
            let row: DifficultyRow = result?;
            self.upsert_difficulty(row.date, row.difficulty)?;
            n += 1;
        }
        info!("loaded {} difficulty values from {}", n, path.display());
        Ok(n)
    }

    /// Latest difficulty on or before the date.
    pub fn difficulty_on(&self, date: Date) -> Result<Option<f64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
    SELECT difficulty FROM difficulty_history
    WHERE effective_date <= CAST(? AS DATE)
    ORDER BY effective_date DESC
    LIMIT 1",
        )?;
        let rows = stmt.query_map(params![date.to_string()], |row| row.get::<usize, f64>(0))?;
        let mut results: Vec<f64> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results.pop())
    }
}

impl DifficultyProvider for CurtailmentDb {
    fn difficulty(&self, date: Date) -> Result<f64> {
        match self.difficulty_on(date) {
            Ok(Some(v)) => Ok(v),
            Ok(None) => Err(Error::MissingDifficulty(date)),
            Err(e) if e.is_retryable() => Err(Error::DifficultyUnavailable(e.to_string())),
            Err(e) => Err(e),
        }
    }
}
