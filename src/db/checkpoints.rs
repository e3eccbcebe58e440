use std::fmt;

use duckdb::{params, Row};
use jiff::civil::Date;
use jiff::{Timestamp, Unit};
use serde::Serialize;

use crate::db::lib_duckdb::{date_at, opt_date_at};
use crate::db::CurtailmentDb;
use crate::error::Result;
use crate::interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Incomplete,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Incomplete => "incomplete",
        }
    }

    fn parse(s: &str) -> RunStatus {
        match s {
            "completed" => RunStatus::Completed,
            "incomplete" => RunStatus::Incomplete,
            _ => RunStatus::Running,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DateStatus {
    Pending,
    Done,
    Failed,
}

impl DateStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DateStatus::Pending => "pending",
            DateStatus::Done => "done",
            DateStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> DateStatus {
        match s {
            "done" => DateStatus::Done,
            "failed" => DateStatus::Failed,
            _ => DateStatus::Pending,
        }
    }
}

/// Progress of a range run, as persisted after every date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunCheckpoint {
    pub run_id: String,
    pub mode: String,
    pub start_date: Date,
    pub end_date: Date,
    pub status: RunStatus,
    pub last_completed_date: Option<Date>,
    pub records_processed: u64,
    pub calculations_written: u64,
    pub dates_done: u64,
    pub dates_failed: u64,
    pub dates_pending: u64,
    pub started_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDate {
    pub date: Date,
    pub status: DateStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

/// A run opened by [`CurtailmentDb::open_run`].
#[derive(Debug, Clone)]
pub struct OpenedRun {
    pub checkpoint: RunCheckpoint,
    /// Dates still to process, in order
    pub pending: Vec<Date>,
    /// Dates already done by an earlier, interrupted attempt
    pub already_done: Vec<Date>,
    pub resumed: bool,
}

/// Current time to the second, in a sortable form.
fn timestamp_now() -> String {
    let ts = Timestamp::now();
    ts.round(Unit::Second).unwrap_or(ts).to_string()
}

pub fn run_id(mode: &str, start: Date, end: Date) -> String {
    format!("{}:{}:{}", mode, start, end)
}

const SELECT_RUN: &str = r#"
SELECT
    r.run_id,
    r.mode,
    CAST(r.start_date AS VARCHAR),
    CAST(r.end_date AS VARCHAR),
    r.status,
    CAST(r.last_completed_date AS VARCHAR),
    r.records_processed,
    r.calculations_written,
    (SELECT COUNT(*) FROM reconciliation_run_dates d WHERE d.run_id = r.run_id AND d.status = 'done'),
    (SELECT COUNT(*) FROM reconciliation_run_dates d WHERE d.run_id = r.run_id AND d.status = 'failed'),
    (SELECT COUNT(*) FROM reconciliation_run_dates d WHERE d.run_id = r.run_id AND d.status = 'pending'),
    r.started_at,
    r.updated_at
FROM reconciliation_runs r"#;

fn from_row(row: &Row) -> duckdb::Result<RunCheckpoint> {
    let status: String = row.get(4)?;
    let records: i64 = row.get(6)?;
    let calculations: i64 = row.get(7)?;
    let done: i64 = row.get(8)?;
    let failed: i64 = row.get(9)?;
    let pending: i64 = row.get(10)?;
    Ok(RunCheckpoint {
        run_id: row.get(0)?,
        mode: row.get(1)?,
        start_date: date_at(row, 2)?,
        end_date: date_at(row, 3)?,
        status: RunStatus::parse(&status),
        last_completed_date: opt_date_at(row, 5)?,
        records_processed: records as u64,
        calculations_written: calculations as u64,
        dates_done: done as u64,
        dates_failed: failed as u64,
        dates_pending: pending as u64,
        started_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl CurtailmentDb {
    /// Start a run over a date range, or resume the unfinished run with the
    /// same mode and range.  A run that completed before starts over.
    pub fn open_run(&self, mode: &str, start: Date, end: Date) -> Result<OpenedRun> {
        let id = run_id(mode, start, end);
        let existing = self.get_run(&id)?;
        let now = timestamp_now();

        let resumed = matches!(&existing, Some(run) if run.status != RunStatus::Completed);
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            if resumed {
                tx.execute(
                    "UPDATE reconciliation_runs SET status = ?, updated_at = ? WHERE run_id = ?",
                    params![RunStatus::Running.as_str(), now, id],
                )?;
            } else {
                tx.execute("DELETE FROM reconciliation_run_dates WHERE run_id = ?", params![id])?;
                tx.execute("DELETE FROM reconciliation_runs WHERE run_id = ?", params![id])?;
                tx.execute(
                    r"
    INSERT INTO reconciliation_runs VALUES
    (?, ?, CAST(? AS DATE), CAST(? AS DATE), ?, NULL, 0, 0, ?, ?)",
                    params![
                        id,
                        mode,
                        start.to_string(),
                        end.to_string(),
                        RunStatus::Running.as_str(),
                        now,
                        now
                    ],
                )?;
                for day in interval::days(start, end)? {
                    tx.execute(
                        "INSERT INTO reconciliation_run_dates VALUES (?, CAST(? AS DATE), 'pending', 0, NULL)",
                        params![id, day.to_string()],
                    )?;
                }
            }
            tx.commit()?;
        }

        let dates = self.get_run_dates(&id)?;
        let pending = dates
            .iter()
            .filter(|d| d.status != DateStatus::Done)
            .map(|d| d.date)
            .collect();
        let already_done = dates
            .iter()
            .filter(|d| d.status == DateStatus::Done)
            .map(|d| d.date)
            .collect();
        let checkpoint = self
            .get_run(&id)?
            .ok_or_else(|| crate::Error::Consistency(format!("run {} was not saved", id)))?;
        Ok(OpenedRun {
            checkpoint,
            pending,
            already_done,
            resumed,
        })
    }

    /// Mark a date done and add its counts to the run totals.
    pub fn record_date_done(
        &self,
        run_id: &str,
        date: Date,
        attempts: u32,
        records_processed: u64,
        calculations_written: u64,
    ) -> Result<()> {
        let now = timestamp_now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r"
    UPDATE reconciliation_run_dates SET status = ?, attempts = attempts + ?, error = NULL
    WHERE run_id = ? AND settlement_date = CAST(? AS DATE)",
            params![DateStatus::Done.as_str(), attempts as i32, run_id, date.to_string()],
        )?;
        tx.execute(
            r"
    UPDATE reconciliation_runs SET
        records_processed = records_processed + ?,
        calculations_written = calculations_written + ?,
        last_completed_date = CASE
            WHEN last_completed_date IS NULL OR last_completed_date < CAST(? AS DATE)
            THEN CAST(? AS DATE)
            ELSE last_completed_date END,
        updated_at = ?
    WHERE run_id = ?",
            params![
                records_processed as i64,
                calculations_written as i64,
                date.to_string(),
                date.to_string(),
                now,
                run_id
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn record_date_failed(&self, run_id: &str, date: Date, attempts: u32, error: &str) -> Result<()> {
        let now = timestamp_now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r"
    UPDATE reconciliation_run_dates SET status = ?, attempts = attempts + ?, error = ?
    WHERE run_id = ? AND settlement_date = CAST(? AS DATE)",
            params![
                DateStatus::Failed.as_str(),
                attempts as i32,
                error,
                run_id,
                date.to_string()
            ],
        )?;
        tx.execute(
            "UPDATE reconciliation_runs SET updated_at = ? WHERE run_id = ?",
            params![now, run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Close the run: completed when every date is done, incomplete otherwise.
    pub fn finish_run(&self, run_id: &str) -> Result<Option<RunCheckpoint>> {
        let conn = self.conn()?;
        conn.execute(
            r"
    UPDATE reconciliation_runs SET
        status = CASE WHEN EXISTS (
            SELECT 1 FROM reconciliation_run_dates d
            WHERE d.run_id = reconciliation_runs.run_id AND d.status <> 'done'
        ) THEN 'incomplete' ELSE 'completed' END,
        updated_at = ?
    WHERE run_id = ?",
            params![timestamp_now(), run_id],
        )?;
        drop(conn);
        self.get_run(run_id)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunCheckpoint>> {
        let conn = self.conn()?;
        let query = format!("{}\nWHERE r.run_id = ?;", SELECT_RUN);
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params![run_id], from_row)?;
        let mut results: Vec<RunCheckpoint> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results.pop())
    }

    /// The run updated last, if any.
    pub fn latest_run(&self) -> Result<Option<RunCheckpoint>> {
        let conn = self.conn()?;
        let query = format!("{}\nORDER BY r.updated_at DESC\nLIMIT 1;", SELECT_RUN);
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map([], from_row)?;
        let mut results: Vec<RunCheckpoint> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results.pop())
    }

    pub fn get_run_dates(&self, run_id: &str) -> Result<Vec<RunDate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
    SELECT CAST(settlement_date AS VARCHAR), status, attempts, error
    FROM reconciliation_run_dates
    WHERE run_id = ?
    ORDER BY settlement_date",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let status: String = row.get(1)?;
            let attempts: i32 = row.get(2)?;
            Ok(RunDate {
                date: date_at(row, 0)?,
                status: DateStatus::parse(&status),
                attempts: attempts as u32,
                error: row.get(3)?,
            })
        })?;
        let results: Vec<RunDate> = rows.collect::<duckdb::Result<_>>()?;
        Ok(results)
    }
}
