use std::collections::HashSet;

use duckdb::{params, Connection, Row};
use jiff::civil::Date;
use log::warn;

use crate::db::lib_duckdb::{date_at, date_range_filter, decimal_at};
use crate::db::CurtailmentDb;
use crate::eligibility::Eligibility;
use crate::error::Result;
use crate::mining::MinerModel;
use crate::model::BitcoinCalculation;

const SELECT_CALCULATIONS: &str = r#"
SELECT
    CAST(c.settlement_date AS VARCHAR),
    c.settlement_period,
    c.farm_id,
    c.miner_model,
    c.curtailed_energy,
    c.bitcoin_mined,
    c.difficulty
FROM bitcoin_calculations c"#;

/// Rows with a miner model this build doesn't know are skipped with a warning.
fn from_row(row: &Row) -> duckdb::Result<Option<BitcoinCalculation>> {
    let period: i32 = row.get(1)?;
    let model: String = row.get(3)?;
    let miner_model = match model.parse::<MinerModel>() {
        Ok(m) => m,
        Err(e) => {
            warn!("Skipping bitcoin calculation row: {}", e);
            return Ok(None);
        }
    };
    Ok(Some(BitcoinCalculation {
        settlement_date: date_at(row, 0)?,
        settlement_period: period as u8,
        farm_id: row.get(2)?,
        miner_model,
        curtailed_energy: decimal_at(row, 4)?,
        bitcoin_mined: decimal_at(row, 5)?,
        difficulty: row.get(6)?,
    }))
}

fn query(conn: &Connection, sql: &str, date: Date) -> Result<Vec<BitcoinCalculation>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![date.to_string()], from_row)?;
    let results: Vec<Option<BitcoinCalculation>> = rows.collect::<duckdb::Result<_>>()?;
    Ok(results.into_iter().flatten().collect())
}

impl CurtailmentDb {
    /// Insert the calculations, each one replacing the row with the same
    /// (date, period, farm, model) key.  One transaction for all of them.
    pub fn upsert_calculations(&self, calculations: &[BitcoinCalculation]) -> Result<usize> {
        if calculations.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut n = 0;
        for c in calculations {
            tx.execute(
                r"
    DELETE FROM bitcoin_calculations
    WHERE settlement_date = CAST(? AS DATE)
    AND settlement_period = ?
    AND farm_id = ?
    AND miner_model = ?",
                params![
                    c.settlement_date.to_string(),
                    c.settlement_period as i32,
                    c.farm_id,
                    c.miner_model.as_str()
                ],
            )?;
            n += tx.execute(
                r"
    INSERT INTO bitcoin_calculations VALUES (
        CAST(? AS DATE), ?, ?, ?,
        CAST(? AS DECIMAL(18,6)), CAST(? AS DECIMAL(18,8)), ?
    )",
                params![
                    c.settlement_date.to_string(),
                    c.settlement_period as i32,
                    c.farm_id,
                    c.miner_model.as_str(),
                    c.curtailed_energy.to_string(),
                    c.bitcoin_mined.to_string(),
                    c.difficulty,
                ],
            )?;
        }
        tx.commit()?;
        Ok(n)
    }

    pub fn get_calculations(&self, date: Date) -> Result<Vec<BitcoinCalculation>> {
        let conn = self.conn()?;
        let sql = format!(
            "{}\nWHERE c.settlement_date = CAST(? AS DATE)\nORDER BY c.settlement_period, c.farm_id, c.miner_model;",
            SELECT_CALCULATIONS
        );
        query(&conn, &sql, date)
    }

    /// Calculations of the day that belong to an eligible record.
    pub fn get_eligible_calculations(
        &self,
        date: Date,
        rule: Eligibility,
    ) -> Result<Vec<BitcoinCalculation>> {
        let conn = self.conn()?;
        let sql = format!(
            r"{}
WHERE c.settlement_date = CAST(? AS DATE)
    AND EXISTS (
        SELECT 1 FROM curtailment_records r
        WHERE r.settlement_date = c.settlement_date
        AND r.settlement_period = c.settlement_period
        AND r.farm_id = c.farm_id
        AND {}
    )
ORDER BY c.settlement_period, c.farm_id, c.miner_model;",
            SELECT_CALCULATIONS,
            rule.sql_predicate("r")
        );
        query(&conn, &sql, date)
    }

    /// The (period, farm) keys of the day already calculated for a model.
    pub fn calculation_keys(&self, date: Date, model: MinerModel) -> Result<HashSet<(u8, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
    SELECT settlement_period, farm_id FROM bitcoin_calculations
    WHERE settlement_date = CAST(? AS DATE)
    AND miner_model = ?",
        )?;
        let rows = stmt.query_map(params![date.to_string(), model.as_str()], |row| {
            let period: i32 = row.get(0)?;
            let farm_id: String = row.get(1)?;
            Ok((period as u8, farm_id))
        })?;
        let results: HashSet<(u8, String)> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results)
    }

    pub fn delete_calculations(&self, date: Date) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM bitcoin_calculations WHERE settlement_date = CAST(? AS DATE)",
            params![date.to_string()],
        )?;
        Ok(n)
    }

    pub fn delete_calculation(
        &self,
        date: Date,
        period: u8,
        farm_id: &str,
        model: MinerModel,
    ) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            r"
    DELETE FROM bitcoin_calculations
    WHERE settlement_date = CAST(? AS DATE)
    AND settlement_period = ?
    AND farm_id = ?
    AND miner_model = ?",
            params![date.to_string(), period as i32, farm_id, model.as_str()],
        )?;
        Ok(n)
    }

    /// Delete the calculations of one (date, period, farm) key, all models.
    pub fn delete_calculations_for_key(&self, date: Date, period: u8, farm_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            r"
    DELETE FROM bitcoin_calculations
    WHERE settlement_date = CAST(? AS DATE)
    AND settlement_period = ?
    AND farm_id = ?",
            params![date.to_string(), period as i32, farm_id],
        )?;
        Ok(n)
    }

    /// Delete the calculations of the day whose record is gone or no longer
    /// eligible.
    pub fn delete_orphan_calculations(&self, date: Date, rule: Eligibility) -> Result<usize> {
        let conn = self.conn()?;
        let sql = format!(
            r"
    DELETE FROM bitcoin_calculations c
    WHERE c.settlement_date = CAST(? AS DATE)
    AND NOT EXISTS (
        SELECT 1 FROM curtailment_records r
        WHERE r.settlement_date = c.settlement_date
        AND r.settlement_period = c.settlement_period
        AND r.farm_id = c.farm_id
        AND {}
    )",
            rule.sql_predicate("r")
        );
        let n = conn.execute(&sql, params![date.to_string()])?;
        Ok(n)
    }

    pub fn count_calculations(&self, range: Option<(Date, Date)>) -> Result<u64> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT COUNT(*) FROM bitcoin_calculations c WHERE 1=1{};",
            date_range_filter("c.settlement_date", range)
        );
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Calculations for one of `models` that have a matching eligible record.
    pub fn count_matched_calculations(
        &self,
        rule: Eligibility,
        models: &[MinerModel],
        range: Option<(Date, Date)>,
    ) -> Result<u64> {
        if models.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let sql = format!(
            r"
SELECT COUNT(*)
FROM bitcoin_calculations c
JOIN curtailment_records r
    ON r.settlement_date = c.settlement_date
    AND r.settlement_period = c.settlement_period
    AND r.farm_id = c.farm_id
WHERE {}
    AND c.miner_model IN ({}){};",
            rule.sql_predicate("r"),
            models
                .iter()
                .map(|m| format!("'{}'", m.as_str()))
                .collect::<Vec<_>>()
                .join(","),
            date_range_filter("c.settlement_date", range)
        );
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }
}
