use std::collections::BTreeMap;

use itertools::Itertools;
use jiff::civil::Date;
use rust_decimal::Decimal;
use serde::Serialize;
use tabled::{builder::Builder, settings::Style, Table};

use crate::db::CurtailmentDb;
use crate::eligibility::Eligibility;
use crate::error::Result;
use crate::mining::MinerModel;
use crate::model::{BitcoinDailySummary, DailySummary};
use crate::reconcile::{DateOutcome, DateResult, RangeReport, SpotFix, Status};

/// State of one date after a fix: what the records say, what the
/// calculations and the daily summary hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    pub date: Date,
    pub eligible_records: usize,
    pub record_energy: Decimal,
    pub calculations: BTreeMap<MinerModel, usize>,
    pub summary: Option<DailySummary>,
    pub bitcoin: Vec<BitcoinDailySummary>,
    /// Every model has one calculation per record and the summary matches
    /// the records
    pub consistent: bool,
}

pub fn verify_date(
    db: &CurtailmentDb,
    date: Date,
    eligibility: Eligibility,
    models: &[MinerModel],
) -> Result<Verification> {
    let records = db.get_eligible_records(date, eligibility)?;
    let record_energy: Decimal = records.iter().map(|r| r.curtailed_energy()).sum();
    let calculations = db
        .get_eligible_calculations(date, eligibility)?
        .into_iter()
        .counts_by(|c| c.miner_model)
        .into_iter()
        .collect::<BTreeMap<_, _>>();
    let summary = db.get_daily_summary(date)?;
    let consistent = models
        .iter()
        .all(|m| calculations.get(m).copied().unwrap_or(0) == records.len())
        && summary
            .as_ref()
            .is_some_and(|s| s.total_curtailed_energy == record_energy);
    Ok(Verification {
        date,
        eligible_records: records.len(),
        record_energy,
        calculations,
        summary,
        bitcoin: db.get_bitcoin_daily_summaries(date, date)?,
        consistent,
    })
}

fn styled(builder: Builder) -> Table {
    let mut table = builder.build();
    table.with(Style::empty());
    table
}

pub fn status_table(status: &Status) -> Table {
    let mut builder = Builder::new();
    let range = match status.range {
        Some((start, end)) => format!("{} to {}", start, end),
        None => "all dates".to_string(),
    };
    builder.push_record(["Range".to_string(), range]);
    builder.push_record(["Eligibility".to_string(), status.eligibility.to_string()]);
    builder.push_record(["Miner models".to_string(), status.models.iter().join(", ")]);
    builder.push_record(["Eligible records".to_string(), status.total_records.to_string()]);
    builder.push_record(["Calculations".to_string(), status.total_calculations.to_string()]);
    builder.push_record(["Expected".to_string(), status.expected_calculations.to_string()]);
    builder.push_record(["Missing".to_string(), status.missing_count.to_string()]);
    builder.push_record([
        "Completion".to_string(),
        format!("{:.2}%", status.completion_percentage),
    ]);
    if let Some(run) = &status.latest_run {
        builder.push_record([
            "Latest run".to_string(),
            format!(
                "{} ({}, {} done, {} failed, {} pending, updated {})",
                run.run_id,
                run.status,
                run.dates_done,
                run.dates_failed,
                run.dates_pending,
                run.updated_at
            ),
        ]);
    }
    styled(builder)
}

pub fn outcome_table(outcomes: &[&DateOutcome]) -> Table {
    let mut builder = Builder::new();
    builder.push_record([
        "Date",
        "Records",
        "Written",
        "Removed",
        "Skipped",
        "Energy MWh",
        "Payment",
    ]);
    for o in outcomes {
        builder.push_record([
            o.date.to_string(),
            o.records_processed.to_string(),
            o.calculations_written.to_string(),
            o.calculations_removed.to_string(),
            o.skipped.to_string(),
            o.daily.summary.total_curtailed_energy.to_string(),
            o.daily.summary.total_payment.to_string(),
        ]);
    }
    styled(builder)
}

pub fn range_table(report: &RangeReport) -> Table {
    let mut builder = Builder::new();
    builder.push_record(["Date", "Result", "Attempts", "Records", "Written", "Error"]);
    for d in &report.dates {
        let result = match d.result {
            DateResult::Succeeded => "ok",
            DateResult::RetriedThenSucceeded => "ok after retry",
            DateResult::Failed => "FAILED",
        };
        builder.push_record([
            d.date.to_string(),
            result.to_string(),
            d.attempts.to_string(),
            d.outcome
                .as_ref()
                .map(|o| o.records_processed.to_string())
                .unwrap_or_default(),
            d.outcome
                .as_ref()
                .map(|o| o.calculations_written.to_string())
                .unwrap_or_default(),
            d.error.clone().unwrap_or_default(),
        ]);
    }
    styled(builder)
}

/// One line per run outcome, e.g. for the end of a log.
pub fn range_summary(report: &RangeReport) -> String {
    let mut out = format!(
        "run {}: {} succeeded, {} succeeded after retries, {} failed",
        report.run_id,
        report.succeeded().len(),
        report.retried().len(),
        report.failed().len()
    );
    if !report.already_done.is_empty() {
        out.push_str(&format!(", {} done earlier", report.already_done.len()));
    }
    let failed = report.failed();
    if !failed.is_empty() {
        out.push_str(&format!(" ({})", failed.iter().join(", ")));
    }
    out
}

pub fn spot_fix_table(fix: &SpotFix) -> Table {
    let mut builder = Builder::new();
    builder.push_record(["Date", "Period", "Farm", "Eligible", "Removed", "Written"]);
    builder.push_record([
        fix.date.to_string(),
        fix.period.to_string(),
        fix.farm_id.clone(),
        fix.eligible.to_string(),
        fix.calculations_removed.to_string(),
        fix.calculations_written.to_string(),
    ]);
    styled(builder)
}

pub fn verification_table(v: &Verification) -> Table {
    let mut builder = Builder::new();
    builder.push_record(["Date".to_string(), v.date.to_string()]);
    builder.push_record(["Eligible records".to_string(), v.eligible_records.to_string()]);
    builder.push_record(["Record energy MWh".to_string(), v.record_energy.to_string()]);
    match &v.summary {
        Some(s) => {
            builder.push_record([
                "Summary energy MWh".to_string(),
                s.total_curtailed_energy.to_string(),
            ]);
            builder.push_record(["Summary payment".to_string(), s.total_payment.to_string()]);
        }
        None => builder.push_record(["Summary".to_string(), "missing".to_string()]),
    }
    for (model, n) in &v.calculations {
        let btc = v
            .bitcoin
            .iter()
            .find(|b| b.miner_model == *model)
            .map(|b| b.bitcoin_mined)
            .unwrap_or_default();
        builder.push_record([
            model.to_string(),
            format!("{} calculations, {} BTC", n, btc),
        ]);
    }
    builder.push_record(["Consistent".to_string(), v.consistent.to_string()]);
    styled(builder)
}
