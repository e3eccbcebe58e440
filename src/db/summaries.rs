use duckdb::{params, Row};
use jiff::civil::Date;
use log::warn;

use crate::db::lib_duckdb::{date_at, decimal_at};
use crate::db::CurtailmentDb;
use crate::error::Result;
use crate::interval::month::Month;
use crate::mining::MinerModel;
use crate::model::{
    BitcoinDailySummary, BitcoinMonthlySummary, BitcoinYearlySummary, DailySummary,
    MonthlySummary, YearlySummary,
};

fn model_at(row: &Row, idx: usize) -> duckdb::Result<Option<MinerModel>> {
    let name: String = row.get(idx)?;
    match name.parse::<MinerModel>() {
        Ok(m) => Ok(Some(m)),
        Err(e) => {
            warn!("Skipping summary row: {}", e);
            Ok(None)
        }
    }
}

fn month_at(row: &Row, idx: usize) -> duckdb::Result<Month> {
    let s: String = row.get(idx)?;
    s.parse::<Month>().map_err(|e| {
        duckdb::Error::FromSqlConversionFailure(idx, duckdb::types::Type::Text, Box::new(e))
    })
}

impl CurtailmentDb {
    //
    // Daily
    //
    pub fn upsert_daily_summary(&self, summary: &DailySummary) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM daily_summaries WHERE summary_date = CAST(? AS DATE)",
            params![summary.summary_date.to_string()],
        )?;
        tx.execute(
            "INSERT INTO daily_summaries VALUES (CAST(? AS DATE), CAST(? AS DECIMAL(18,6)), CAST(? AS DECIMAL(18,6)))",
            params![
                summary.summary_date.to_string(),
                summary.total_curtailed_energy.to_string(),
                summary.total_payment.to_string()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_daily_summary(&self, date: Date) -> Result<Option<DailySummary>> {
        let mut xs = self.get_daily_summaries(date, date)?;
        Ok(xs.pop())
    }

    /// Daily summaries between `start` and `end`, inclusive.
    pub fn get_daily_summaries(&self, start: Date, end: Date) -> Result<Vec<DailySummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
    SELECT CAST(summary_date AS VARCHAR), total_curtailed_energy, total_payment
    FROM daily_summaries
    WHERE summary_date >= CAST(? AS DATE) AND summary_date <= CAST(? AS DATE)
    ORDER BY summary_date",
        )?;
        let rows = stmt.query_map(params![start.to_string(), end.to_string()], |row| {
            Ok(DailySummary {
                summary_date: date_at(row, 0)?,
                total_curtailed_energy: decimal_at(row, 1)?,
                total_payment: decimal_at(row, 2)?,
            })
        })?;
        let results: Vec<DailySummary> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results)
    }

    /// Replace all the bitcoin summaries of the day, so models that no longer
    /// have calculations lose their row.
    pub fn replace_bitcoin_daily_summaries(
        &self,
        date: Date,
        summaries: &[BitcoinDailySummary],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM bitcoin_daily_summaries WHERE summary_date = CAST(? AS DATE)",
            params![date.to_string()],
        )?;
        for s in summaries.iter().filter(|s| s.summary_date == date) {
            tx.execute(
                "INSERT INTO bitcoin_daily_summaries VALUES (CAST(? AS DATE), ?, CAST(? AS DECIMAL(18,8)))",
                params![
                    s.summary_date.to_string(),
                    s.miner_model.as_str(),
                    s.bitcoin_mined.to_string()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_bitcoin_daily_summaries(
        &self,
        start: Date,
        end: Date,
    ) -> Result<Vec<BitcoinDailySummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
    SELECT CAST(summary_date AS VARCHAR), miner_model, bitcoin_mined
    FROM bitcoin_daily_summaries
    WHERE summary_date >= CAST(? AS DATE) AND summary_date <= CAST(? AS DATE)
    ORDER BY summary_date, miner_model",
        )?;
        let rows = stmt.query_map(params![start.to_string(), end.to_string()], |row| {
            let summary_date = date_at(row, 0)?;
            let bitcoin_mined = decimal_at(row, 2)?;
            Ok(model_at(row, 1)?.map(|miner_model| BitcoinDailySummary {
                summary_date,
                miner_model,
                bitcoin_mined,
            }))
        })?;
        let results: Vec<Option<BitcoinDailySummary>> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results.into_iter().flatten().collect())
    }

    //
    // Monthly
    //
    pub fn upsert_monthly_summary(&self, summary: &MonthlySummary) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM monthly_summaries WHERE year_month = ?",
            params![summary.year_month.to_string()],
        )?;
        tx.execute(
            "INSERT INTO monthly_summaries VALUES (?, CAST(? AS DECIMAL(18,6)), CAST(? AS DECIMAL(18,6)))",
            params![
                summary.year_month.to_string(),
                summary.total_curtailed_energy.to_string(),
                summary.total_payment.to_string()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_monthly_summary(&self, month: Month) -> Result<Option<MonthlySummary>> {
        let xs = self.get_monthly_summaries(month.year())?;
        Ok(xs.into_iter().find(|s| s.year_month == month))
    }

    /// Monthly summaries of a year.
    pub fn get_monthly_summaries(&self, year: i16) -> Result<Vec<MonthlySummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
    SELECT year_month, total_curtailed_energy, total_payment
    FROM monthly_summaries
    WHERE year_month LIKE ?
    ORDER BY year_month",
        )?;
        let rows = stmt.query_map(params![format!("{}-%", year)], |row| {
            Ok(MonthlySummary {
                year_month: month_at(row, 0)?,
                total_curtailed_energy: decimal_at(row, 1)?,
                total_payment: decimal_at(row, 2)?,
            })
        })?;
        let results: Vec<MonthlySummary> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results)
    }

    pub fn replace_bitcoin_monthly_summaries(
        &self,
        month: Month,
        summaries: &[BitcoinMonthlySummary],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM bitcoin_monthly_summaries WHERE year_month = ?",
            params![month.to_string()],
        )?;
        for s in summaries.iter().filter(|s| s.year_month == month) {
            tx.execute(
                "INSERT INTO bitcoin_monthly_summaries VALUES (?, ?, CAST(? AS DECIMAL(18,8)))",
                params![
                    s.year_month.to_string(),
                    s.miner_model.as_str(),
                    s.bitcoin_mined.to_string()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Bitcoin monthly summaries of a year.
    pub fn get_bitcoin_monthly_summaries(&self, year: i16) -> Result<Vec<BitcoinMonthlySummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
    SELECT year_month, miner_model, bitcoin_mined
    FROM bitcoin_monthly_summaries
    WHERE year_month LIKE ?
    ORDER BY year_month, miner_model",
        )?;
        let rows = stmt.query_map(params![format!("{}-%", year)], |row| {
            let year_month = month_at(row, 0)?;
            let bitcoin_mined = decimal_at(row, 2)?;
            Ok(model_at(row, 1)?.map(|miner_model| BitcoinMonthlySummary {
                year_month,
                miner_model,
                bitcoin_mined,
            }))
        })?;
        let results: Vec<Option<BitcoinMonthlySummary>> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results.into_iter().flatten().collect())
    }

    //
    // Yearly
    //
    pub fn upsert_yearly_summary(&self, summary: &YearlySummary) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM yearly_summaries WHERE year = ?",
            params![summary.year as i32],
        )?;
        tx.execute(
            "INSERT INTO yearly_summaries VALUES (?, CAST(? AS DECIMAL(18,6)), CAST(? AS DECIMAL(18,6)))",
            params![
                summary.year as i32,
                summary.total_curtailed_energy.to_string(),
                summary.total_payment.to_string()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_yearly_summary(&self, year: i16) -> Result<Option<YearlySummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT year, total_curtailed_energy, total_payment FROM yearly_summaries WHERE year = ?",
        )?;
        let rows = stmt.query_map(params![year as i32], |row| {
            let year: i32 = row.get(0)?;
            Ok(YearlySummary {
                year: year as i16,
                total_curtailed_energy: decimal_at(row, 1)?,
                total_payment: decimal_at(row, 2)?,
            })
        })?;
        let mut results: Vec<YearlySummary> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results.pop())
    }

    pub fn replace_bitcoin_yearly_summaries(
        &self,
        year: i16,
        summaries: &[BitcoinYearlySummary],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM bitcoin_yearly_summaries WHERE year = ?",
            params![year as i32],
        )?;
        for s in summaries.iter().filter(|s| s.year == year) {
            tx.execute(
                "INSERT INTO bitcoin_yearly_summaries VALUES (?, ?, CAST(? AS DECIMAL(18,8)))",
                params![s.year as i32, s.miner_model.as_str(), s.bitcoin_mined.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_bitcoin_yearly_summaries(&self, year: i16) -> Result<Vec<BitcoinYearlySummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
    SELECT year, miner_model, bitcoin_mined
    FROM bitcoin_yearly_summaries
    WHERE year = ?
    ORDER BY miner_model",
        )?;
        let rows = stmt.query_map(params![year as i32], |row| {
            let year: i32 = row.get(0)?;
            let bitcoin_mined = decimal_at(row, 2)?;
            Ok(model_at(row, 1)?.map(|miner_model| BitcoinYearlySummary {
                year: year as i16,
                miner_model,
                bitcoin_mined,
            }))
        })?;
        let results: Vec<Option<BitcoinYearlySummary>> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results.into_iter().flatten().collect())
    }
}
