use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use jiff::civil::Date;
use log::{error, info, warn};
use serde::Serialize;

use crate::db::checkpoints::RunCheckpoint;
use crate::db::CurtailmentDb;
use crate::difficulty::DifficultyProvider;
use crate::eligibility::Eligibility;
use crate::error::Result;
use crate::ingest::{CurtailmentSource, IngestOutcome, Ingestor};
use crate::mining::{calculate_yield, validate_difficulty, MinerModel};
use crate::model::{BitcoinCalculation, CurtailmentRecord};
use crate::retry::{Exhausted, RetryPolicy};
use crate::rollup::{DailyRollup, RollupEngine};

/// Completeness of the calculation table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub range: Option<(Date, Date)>,
    pub eligibility: Eligibility,
    pub models: Vec<MinerModel>,
    pub total_records: u64,
    pub total_calculations: u64,
    pub expected_calculations: u64,
    pub missing_count: u64,
    pub completion_percentage: f64,
    pub latest_run: Option<RunCheckpoint>,
}

/// What reconciling one date did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateOutcome {
    pub date: Date,
    pub records_processed: usize,
    pub calculations_written: usize,
    pub calculations_removed: usize,
    /// (record, model) pairs that could not be calculated
    pub skipped: usize,
    pub ingested: Option<IngestOutcome>,
    pub daily: DailyRollup,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotFix {
    pub date: Date,
    pub period: u8,
    pub farm_id: String,
    pub eligible: bool,
    pub calculations_removed: usize,
    pub calculations_written: usize,
    pub daily: DailyRollup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DateResult {
    Succeeded,
    RetriedThenSucceeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateReport {
    pub date: Date,
    pub result: DateResult,
    pub attempts: u32,
    pub outcome: Option<DateOutcome>,
    pub error: Option<String>,
}

/// Result of a checkpointed run over a date range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeReport {
    pub run_id: String,
    pub resumed: bool,
    /// Dates done by an earlier attempt of the same run, not processed again
    pub already_done: Vec<Date>,
    pub dates: Vec<DateReport>,
    pub checkpoint: Option<RunCheckpoint>,
}

impl RangeReport {
    fn dates_with(&self, result: DateResult) -> Vec<Date> {
        self.dates
            .iter()
            .filter(|d| d.result == result)
            .map(|d| d.date)
            .collect()
    }

    pub fn succeeded(&self) -> Vec<Date> {
        self.dates_with(DateResult::Succeeded)
    }

    pub fn retried(&self) -> Vec<Date> {
        self.dates_with(DateResult::RetriedThenSucceeded)
    }

    pub fn failed(&self) -> Vec<Date> {
        self.dates_with(DateResult::Failed)
    }
}

/// Brings the calculations and the summaries back in line with the records.
///
/// The records are the source of truth.  For every eligible record there must
/// be one calculation per configured miner model, no calculation may exist
/// without an eligible record, and the summaries must be the sums of their
/// children.  Every operation here converges to that state and can be re-run
/// any number of times.
///
/// Only one process should reconcile a given date at a time; nothing here
/// locks across processes.  Within a process, range runs reconcile up to
/// `batch_size` dates at once on the blocking pool, each date on its own
/// pooled connection.
pub struct Reconciler<D> {
    db: CurtailmentDb,
    difficulty: Arc<D>,
    eligibility: Eligibility,
    models: Vec<MinerModel>,
    retry: RetryPolicy,
    rollup: RollupEngine,
}

impl<D> Clone for Reconciler<D> {
    fn clone(&self) -> Self {
        Reconciler {
            db: self.db.clone(),
            difficulty: Arc::clone(&self.difficulty),
            eligibility: self.eligibility,
            models: self.models.clone(),
            retry: self.retry.clone(),
            rollup: self.rollup.clone(),
        }
    }
}

impl<D: DifficultyProvider> Reconciler<D> {
    pub fn new(
        db: CurtailmentDb,
        difficulty: D,
        eligibility: Eligibility,
        models: Vec<MinerModel>,
    ) -> Self {
        let rollup = RollupEngine::new(db.clone(), eligibility);
        Reconciler {
            db,
            difficulty: Arc::new(difficulty),
            eligibility,
            models,
            retry: RetryPolicy::default(),
            rollup,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn db(&self) -> &CurtailmentDb {
        &self.db
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn models(&self) -> &[MinerModel] {
        &self.models
    }

    pub fn status(&self, range: Option<(Date, Date)>) -> Result<Status> {
        let total_records = self.db.count_eligible_records(self.eligibility, range)?;
        let total_calculations = self.db.count_calculations(range)?;
        let matched = self
            .db
            .count_matched_calculations(self.eligibility, &self.models, range)?;
        let expected = total_records * self.models.len() as u64;
        let missing_count = expected.saturating_sub(matched);
        let completion_percentage = if expected == 0 {
            100.0
        } else {
            (matched as f64 / expected as f64 * 10_000.0).round() / 100.0
        };
        Ok(Status {
            range,
            eligibility: self.eligibility,
            models: self.models.clone(),
            total_records,
            total_calculations,
            expected_calculations: expected,
            missing_count,
            completion_percentage,
            latest_run: self.db.latest_run()?,
        })
    }

    /// Write the calculations missing for the eligible records of the day,
    /// remove the ones without an eligible record, then roll the day, its
    /// month and its year up.  With `force` every calculation of the day is
    /// recomputed.
    pub fn reconcile_date(&self, date: Date, force: bool) -> Result<DateOutcome> {
        let records = self.db.get_eligible_records(date, self.eligibility)?;

        let mut work: Vec<(&CurtailmentRecord, MinerModel)> = Vec::new();
        for model in &self.models {
            let existing = if force {
                Default::default()
            } else {
                self.db.calculation_keys(date, *model)?
            };
            for record in &records {
                if !existing.contains(&(record.settlement_period, record.farm_id.clone())) {
                    work.push((record, *model));
                }
            }
        }

        // the difficulty is only needed when there is something to calculate
        let difficulty = if work.is_empty() {
            None
        } else {
            let d = self.difficulty.difficulty(date)?;
            validate_difficulty(d)?;
            Some(d)
        };

        let calculations_removed = if force {
            self.db.delete_calculations(date)?
        } else {
            self.db.delete_orphan_calculations(date, self.eligibility)?
        };

        let mut calculations = Vec::with_capacity(work.len());
        let mut skipped = 0;
        if let Some(difficulty) = difficulty {
            for (record, model) in work {
                match calculation(record, model, difficulty) {
                    Ok(c) => calculations.push(c),
                    Err(e) => {
                        warn!(
                            "skipping {} period {} farm {} model {}: {}",
                            date, record.settlement_period, record.farm_id, model, e
                        );
                        skipped += 1;
                    }
                }
            }
        }
        let calculations_written = self.db.upsert_calculations(&calculations)?;

        let cascade = self.rollup.cascade(date)?;
        info!(
            "reconciled {}: {} records, {} calculations written, {} removed, {} skipped",
            date,
            records.len(),
            calculations_written,
            calculations_removed,
            skipped
        );
        Ok(DateOutcome {
            date,
            records_processed: records.len(),
            calculations_written,
            calculations_removed,
            skipped,
            ingested: None,
            daily: cascade.daily,
        })
    }

    /// Recompute the calculations of one (date, period, farm) for all the
    /// models, then roll up.  If the record is gone or not eligible its
    /// calculations are just removed.
    pub fn spot_fix(&self, date: Date, period: u8, farm_id: &str) -> Result<SpotFix> {
        let record = self
            .db
            .get_record(date, period, farm_id)?
            .filter(|r| r.is_eligible(self.eligibility));

        let mut calculations = Vec::new();
        if let Some(record) = &record {
            let difficulty = self.difficulty.difficulty(date)?;
            validate_difficulty(difficulty)?;
            for model in &self.models {
                calculations.push(calculation(record, *model, difficulty)?);
            }
        } else {
            warn!(
                "no eligible record for {} period {} farm {}, removing its calculations",
                date, period, farm_id
            );
        }
        let calculations_removed = self.db.delete_calculations_for_key(date, period, farm_id)?;
        let calculations_written = self.db.upsert_calculations(&calculations)?;
        let cascade = self.rollup.cascade(date)?;
        Ok(SpotFix {
            date,
            period,
            farm_id: farm_id.to_string(),
            eligible: record.is_some(),
            calculations_removed,
            calculations_written,
            daily: cascade.daily,
        })
    }

    async fn run_range<F, Fut>(
        &self,
        mode: &str,
        start: Date,
        end: Date,
        batch_size: usize,
        work: F,
    ) -> Result<RangeReport>
    where
        F: Fn(Date) -> Fut,
        Fut: Future<Output = std::result::Result<(DateOutcome, u32), Exhausted>>,
    {
        let opened = self.db.open_run(mode, start, end)?;
        let run_id = opened.checkpoint.run_id.clone();
        if opened.resumed {
            info!(
                "resuming run {}: {} dates done, {} to go",
                run_id,
                opened.already_done.len(),
                opened.pending.len()
            );
        } else {
            info!("starting run {} over {} dates", run_id, opened.pending.len());
        }

        let mut dates: Vec<DateReport> = stream::iter(opened.pending.clone())
            .map(|day| {
                let attempt = work(day);
                async move { (day, attempt.await) }
            })
            .buffer_unordered(batch_size.max(1))
            .map(|(day, result)| self.checkpoint(&run_id, day, result))
            .collect()
            .await;
        dates.sort_by_key(|d| d.date);

        let checkpoint = self.db.finish_run(&run_id)?;
        let report = RangeReport {
            run_id,
            resumed: opened.resumed,
            already_done: opened.already_done,
            dates,
            checkpoint,
        };
        info!(
            "run {} finished: {} succeeded, {} after retries, {} failed",
            report.run_id,
            report.succeeded().len(),
            report.retried().len(),
            report.failed().len()
        );
        Ok(report)
    }

    /// Persist the result of one date.  The stores are already up to date,
    /// so a failure to save progress is only logged.
    fn checkpoint(
        &self,
        run_id: &str,
        day: Date,
        result: std::result::Result<(DateOutcome, u32), Exhausted>,
    ) -> DateReport {
        match result {
            Ok((outcome, attempts)) => {
                if let Err(e) = self.db.record_date_done(
                    run_id,
                    day,
                    attempts,
                    outcome.records_processed as u64,
                    outcome.calculations_written as u64,
                ) {
                    error!("could not checkpoint {} for run {}: {}", day, run_id, e);
                }
                DateReport {
                    date: day,
                    result: if attempts > 1 {
                        DateResult::RetriedThenSucceeded
                    } else {
                        DateResult::Succeeded
                    },
                    attempts,
                    outcome: Some(outcome),
                    error: None,
                }
            }
            Err(Exhausted { error: e, attempts }) => {
                error!("{} failed after {} attempts: {}", day, attempts, e);
                let message = e.to_string();
                if let Err(e) = self.db.record_date_failed(run_id, day, attempts, &message) {
                    error!("could not checkpoint {} for run {}: {}", day, run_id, e);
                }
                DateReport {
                    date: day,
                    result: DateResult::Failed,
                    attempts,
                    outcome: None,
                    error: Some(message),
                }
            }
        }
    }
}

impl<D: DifficultyProvider + Send + Sync + 'static> Reconciler<D> {
    /// Reconcile every date of the range, `batch_size` dates at a time.  A
    /// run over the same range that did not complete is resumed.
    pub async fn reconcile_range(
        &self,
        start: Date,
        end: Date,
        batch_size: usize,
        force: bool,
    ) -> Result<RangeReport> {
        let mode = if force { "reconcile-force" } else { "reconcile" };
        self.run_range(mode, start, end, batch_size, |day| async move {
            let label = format!("{} {}", mode, day);
            self.retry
                .run(&label, || self.blocking(move |r| r.reconcile_date(day, force)))
                .await
        })
        .await
    }

    /// Fetch the day again from the source, then recompute all of its
    /// calculations.
    pub async fn reingest_date<S: CurtailmentSource>(
        &self,
        ingestor: &Ingestor<S>,
        date: Date,
    ) -> Result<DateOutcome> {
        self.reingest(ingestor, date)
            .await
            .map(|(outcome, _)| outcome)
            .map_err(|e| e.error)
    }

    /// Re-ingest every date of the range, `batch_size` dates at a time.
    pub async fn reingest_range<S: CurtailmentSource>(
        &self,
        ingestor: &Ingestor<S>,
        start: Date,
        end: Date,
        batch_size: usize,
    ) -> Result<RangeReport> {
        self.run_range("reingest", start, end, batch_size, |day| {
            self.reingest(ingestor, day)
        })
        .await
    }

    /// Fetches are retried by the ingestor.  Once the day is in hand, writing
    /// its records and recomputing it is retried as one step; both parts
    /// give the same rows when repeated.  The attempts are those of that step.
    async fn reingest<S: CurtailmentSource>(
        &self,
        ingestor: &Ingestor<S>,
        date: Date,
    ) -> std::result::Result<(DateOutcome, u32), Exhausted> {
        let fetched = ingestor
            .fetch_day(date)
            .await
            .map(Arc::new)
            .map_err(|error| Exhausted { error, attempts: 1 })?;
        let label = format!("reingest {}", date);
        self.retry
            .run(&label, || {
                let fetched = Arc::clone(&fetched);
                self.blocking(move |r| {
                    let ingested = fetched.write(&r.db)?;
                    let mut outcome = r.reconcile_date(date, true)?;
                    outcome.ingested = Some(ingested);
                    Ok(outcome)
                })
            })
            .await
    }

    /// Store calls and difficulty lookups block, so they run off the async
    /// workers.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Reconciler<D>) -> Result<T> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(&this)).await?
    }
}

fn calculation(
    record: &CurtailmentRecord,
    model: MinerModel,
    difficulty: f64,
) -> Result<BitcoinCalculation> {
    let energy = record.curtailed_energy();
    let bitcoin_mined = calculate_yield(energy, model, difficulty, record.settlement_date)?;
    Ok(BitcoinCalculation {
        settlement_date: record.settlement_date,
        settlement_period: record.settlement_period,
        farm_id: record.farm_id.clone(),
        miner_model: model,
        curtailed_energy: energy,
        bitcoin_mined,
        difficulty,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use jiff::civil::date;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::db::checkpoints::RunStatus;
    use crate::db::curtailment_db::tests::{record, test_db};
    use crate::difficulty::StaticDifficulty;
    use crate::error::Error;
    use crate::ingest::tests::{obs, FakeSource};
    use crate::interval::month::month;

    const DIFFICULTY: f64 = 113_757_508_810_854.0;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(2),
            rate_limit_wait: Duration::from_millis(2),
        }
    }

    fn reconciler(db: &CurtailmentDb) -> Reconciler<StaticDifficulty> {
        Reconciler::new(
            db.clone(),
            StaticDifficulty::constant(DIFFICULTY),
            Eligibility::VolumeAndFlag,
            MinerModel::ALL.to_vec(),
        )
        .with_retry(fast())
    }

    /// Three periods of one farm on 2025-03-31, the last one with no volume.
    fn seed(db: &CurtailmentDb) -> Date {
        let day = date(2025, 3, 31);
        db.replace_records(
            day,
            &[
                record(day, 1, "T_X-1", dec!(-10), true, false),
                record(day, 2, "T_X-1", dec!(-20), true, false),
                record(day, 3, "T_X-1", dec!(0), true, false),
            ],
        )
        .unwrap();
        day
    }

    #[test]
    fn reconcile_three_periods() -> Result<()> {
        let db = test_db();
        let day = seed(&db);
        let outcome = reconciler(&db).reconcile_date(day, false)?;
        assert_eq!(outcome.records_processed, 2);
        assert_eq!(outcome.calculations_written, 6);
        assert_eq!(outcome.skipped, 0);

        let calcs = db.get_calculations(day)?;
        assert_eq!(calcs.len(), 6);
        assert!(calcs.iter().all(|c| c.settlement_period != 3));
        for model in MinerModel::ALL {
            for (period, energy) in [(1, dec!(10)), (2, dec!(20))] {
                let c = calcs
                    .iter()
                    .find(|c| c.settlement_period == period && c.miner_model == model)
                    .unwrap();
                assert_eq!(c.bitcoin_mined, calculate_yield(energy, model, DIFFICULTY, day)?);
            }
        }

        let daily = db.get_daily_summary(day)?.unwrap();
        assert_eq!(daily.total_curtailed_energy, dec!(30));
        assert_eq!(outcome.daily.summary, daily);
        assert_eq!(outcome.daily.bitcoin.len(), 3);
        let monthly = db.get_monthly_summary(month(2025, 3))?.unwrap();
        assert_eq!(monthly.total_curtailed_energy, dec!(30));
        Ok(())
    }

    #[test]
    fn deleted_calculation_is_restored() -> Result<()> {
        let db = test_db();
        let day = seed(&db);
        let reconciler = reconciler(&db);
        reconciler.reconcile_date(day, false)?;
        let before = db.get_calculations(day)?;
        let bitcoin_before = db.get_bitcoin_daily_summaries(day, day)?;

        assert_eq!(db.delete_calculation(day, 2, "T_X-1", MinerModel::S9)?, 1);
        let outcome = reconciler.reconcile_date(day, false)?;
        assert_eq!(outcome.calculations_written, 1);
        assert_eq!(outcome.calculations_removed, 0);
        assert_eq!(db.get_calculations(day)?, before);
        assert_eq!(db.get_bitcoin_daily_summaries(day, day)?, bitcoin_before);
        Ok(())
    }

    type Stored = (
        Vec<BitcoinCalculation>,
        Option<crate::model::DailySummary>,
        Vec<crate::model::BitcoinDailySummary>,
        Option<crate::model::MonthlySummary>,
        Vec<crate::model::BitcoinMonthlySummary>,
        Option<crate::model::YearlySummary>,
        Vec<crate::model::BitcoinYearlySummary>,
    );

    /// Every derived row that reconciling a March 2025 day touches.
    fn stored(db: &CurtailmentDb, day: Date) -> Result<Stored> {
        Ok((
            db.get_calculations(day)?,
            db.get_daily_summary(day)?,
            db.get_bitcoin_daily_summaries(day, day)?,
            db.get_monthly_summary(month(2025, 3))?,
            db.get_bitcoin_monthly_summaries(2025)?,
            db.get_yearly_summary(2025)?,
            db.get_bitcoin_yearly_summaries(2025)?,
        ))
    }

    #[test]
    fn reconcile_is_idempotent() -> Result<()> {
        let db = test_db();
        let day = seed(&db);
        let reconciler = reconciler(&db);
        let first = reconciler.reconcile_date(day, false)?;
        let after_first = stored(&db, day)?;
        assert!(db.get_yearly_summary(2025)?.is_some());
        assert_eq!(db.get_bitcoin_yearly_summaries(2025)?.len(), 3);

        let second = reconciler.reconcile_date(day, false)?;
        assert_eq!(second.calculations_written, 0);
        assert_eq!(second.calculations_removed, 0);
        assert_eq!(first.daily, second.daily);
        assert_eq!(stored(&db, day)?, after_first);

        let forced = reconciler.reconcile_date(day, true)?;
        assert_eq!(forced.calculations_removed, 6);
        assert_eq!(forced.calculations_written, 6);
        assert_eq!(stored(&db, day)?, after_first);
        Ok(())
    }

    #[test]
    fn eligibility_decides_what_is_calculated() -> Result<()> {
        let db = test_db();
        let day = date(2025, 1, 10);
        db.replace_records(
            day,
            &[
                record(day, 1, "T_A-1", dec!(-5), false, false),
                record(day, 1, "T_B-1", dec!(-5), false, true),
            ],
        )?;
        reconciler(&db).reconcile_date(day, false)?;
        assert_eq!(db.get_calculations(day)?.len(), 3);
        assert_eq!(db.get_daily_summary(day)?.unwrap().total_curtailed_energy, dec!(5));

        let loose = Reconciler::new(
            db.clone(),
            StaticDifficulty::constant(DIFFICULTY),
            Eligibility::VolumeOnly,
            vec![MinerModel::S19jPro],
        );
        loose.reconcile_date(day, false)?;
        // the S9 and M20S rows of T_B-1 stay, they still have an eligible record
        assert_eq!(db.get_calculations(day)?.len(), 4);
        assert_eq!(db.get_daily_summary(day)?.unwrap().total_curtailed_energy, dec!(10));
        Ok(())
    }

    #[test]
    fn ineligible_record_loses_its_calculations() -> Result<()> {
        let db = test_db();
        let day = seed(&db);
        let reconciler = reconciler(&db);
        reconciler.reconcile_date(day, false)?;
        db.upsert_record(&record(day, 1, "T_X-1", dec!(-10), false, false))?;
        let outcome = reconciler.reconcile_date(day, false)?;
        assert_eq!(outcome.calculations_removed, 3);
        assert_eq!(db.get_calculations(day)?.len(), 3);
        assert_eq!(outcome.daily.summary.total_curtailed_energy, dec!(20));
        Ok(())
    }

    #[test]
    fn empty_date_needs_no_difficulty() -> Result<()> {
        let db = test_db();
        let reconciler = Reconciler::new(
            db.clone(),
            StaticDifficulty::default(),
            Eligibility::VolumeAndFlag,
            MinerModel::ALL.to_vec(),
        );
        let day = date(2025, 7, 4);
        let outcome = reconciler.reconcile_date(day, false)?;
        assert_eq!(outcome.records_processed, 0);
        assert_eq!(outcome.daily.summary.total_curtailed_energy, dec!(0));

        let seeded = seed(&db);
        assert!(matches!(
            reconciler.reconcile_date(seeded, false),
            Err(Error::MissingDifficulty(_))
        ));
        assert!(db.get_calculations(seeded)?.is_empty());
        Ok(())
    }

    #[test]
    fn spot_fix_recomputes_one_key() -> Result<()> {
        let db = test_db();
        let day = seed(&db);
        let reconciler = reconciler(&db);
        reconciler.reconcile_date(day, false)?;

        db.upsert_record(&record(day, 1, "T_X-1", dec!(-40), true, false))?;
        let fix = reconciler.spot_fix(day, 1, "T_X-1")?;
        assert!(fix.eligible);
        assert_eq!(fix.calculations_removed, 3);
        assert_eq!(fix.calculations_written, 3);
        assert_eq!(fix.daily.summary.total_curtailed_energy, dec!(60));
        let s9 = db
            .get_calculations(day)?
            .into_iter()
            .find(|c| c.settlement_period == 1 && c.miner_model == MinerModel::S9)
            .unwrap();
        assert_eq!(s9.curtailed_energy, dec!(40));

        let gone = reconciler.spot_fix(day, 9, "T_X-1")?;
        assert!(!gone.eligible);
        assert_eq!(gone.calculations_written, 0);
        Ok(())
    }

    #[test]
    fn status_counts_missing_calculations() -> Result<()> {
        let db = test_db();
        let day = seed(&db);
        let reconciler = reconciler(&db);
        let status = reconciler.status(None)?;
        assert_eq!(status.total_records, 2);
        assert_eq!(status.missing_count, 6);
        assert_eq!(status.completion_percentage, 0.0);

        reconciler.reconcile_date(day, false)?;
        db.delete_calculation(day, 1, "T_X-1", MinerModel::M20s)?;
        let status = reconciler.status(Some((day, day)))?;
        assert_eq!(status.total_calculations, 5);
        assert_eq!(status.missing_count, 1);
        assert_eq!(status.completion_percentage, 83.33);
        Ok(())
    }

    /// Fails for one date while `failing` is set, and counts calls per date.
    struct FlakyDifficulty {
        failing_date: Date,
        failing: AtomicBool,
        calls: Mutex<BTreeMap<Date, u32>>,
    }

    impl DifficultyProvider for FlakyDifficulty {
        fn difficulty(&self, date: Date) -> Result<f64> {
            *self.calls.lock().unwrap().entry(date).or_default() += 1;
            if self.failing.load(Ordering::SeqCst) && date == self.failing_date {
                return Err(Error::DifficultyUnavailable("connection reset".to_string()));
            }
            Ok(DIFFICULTY)
        }
    }

    #[tokio::test]
    async fn range_resumes_only_failed_date() -> Result<()> {
        let db = test_db();
        let start = date(2025, 3, 1);
        let end = date(2025, 3, 5);
        for (i, day) in crate::interval::days(start, end)?.into_iter().enumerate() {
            let volume = -Decimal::from(i as i64 + 1);
            db.replace_records(day, &[record(day, 1, "T_X-1", volume, true, false)])?;
        }
        let provider = Arc::new(FlakyDifficulty {
            failing_date: date(2025, 3, 3),
            failing: AtomicBool::new(true),
            calls: Mutex::new(BTreeMap::new()),
        });
        let reconciler = Reconciler::new(
            db.clone(),
            Arc::clone(&provider),
            Eligibility::VolumeAndFlag,
            MinerModel::ALL.to_vec(),
        )
        .with_retry(fast());

        let report = reconciler.reconcile_range(start, end, 2, false).await?;
        assert!(!report.resumed);
        assert_eq!(report.failed(), vec![date(2025, 3, 3)]);
        assert_eq!(report.succeeded().len(), 4);
        assert_eq!(provider.calls.lock().unwrap()[&date(2025, 3, 3)], 3);
        let checkpoint = report.checkpoint.unwrap();
        assert_eq!(checkpoint.status, RunStatus::Incomplete);
        assert_eq!(checkpoint.dates_done, 4);
        assert_eq!(checkpoint.last_completed_date, Some(end));
        let monthly = db.get_monthly_summary(month(2025, 3))?.unwrap();
        assert_eq!(monthly.total_curtailed_energy, dec!(12));

        provider.failing.store(false, Ordering::SeqCst);
        provider.calls.lock().unwrap().clear();
        let report = reconciler.reconcile_range(start, end, 2, false).await?;
        assert!(report.resumed);
        assert_eq!(report.already_done.len(), 4);
        assert_eq!(report.succeeded(), vec![date(2025, 3, 3)]);
        assert_eq!(
            provider.calls.lock().unwrap().keys().copied().collect::<Vec<_>>(),
            vec![date(2025, 3, 3)]
        );
        assert_eq!(report.checkpoint.unwrap().status, RunStatus::Completed);
        let monthly = db.get_monthly_summary(month(2025, 3))?.unwrap();
        assert_eq!(monthly.total_curtailed_energy, dec!(15));
        assert_eq!(db.get_calculations(date(2025, 3, 3))?.len(), 3);
        Ok(())
    }

    /// Unavailable on the first lookup only.
    struct OnceUnavailable(AtomicBool);

    impl DifficultyProvider for OnceUnavailable {
        fn difficulty(&self, _date: Date) -> Result<f64> {
            if self.0.swap(false, Ordering::SeqCst) {
                return Err(Error::DifficultyUnavailable("timeout".to_string()));
            }
            Ok(DIFFICULTY)
        }
    }

    #[tokio::test]
    async fn retried_date_is_reported() -> Result<()> {
        let db = test_db();
        let day = seed(&db);
        let reconciler = Reconciler::new(
            db.clone(),
            OnceUnavailable(AtomicBool::new(true)),
            Eligibility::VolumeAndFlag,
            MinerModel::ALL.to_vec(),
        )
        .with_retry(fast());
        let report = reconciler.reconcile_range(day, day, 1, false).await?;
        assert_eq!(report.retried(), vec![day]);
        assert_eq!(report.dates[0].attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn reingest_retries_the_store_step() -> Result<()> {
        let db = test_db();
        let day = seed(&db);
        let reconciler = Reconciler::new(
            db.clone(),
            OnceUnavailable(AtomicBool::new(true)),
            Eligibility::VolumeAndFlag,
            MinerModel::ALL.to_vec(),
        )
        .with_retry(fast());
        let source = FakeSource::new(HashMap::from([(
            2,
            vec![obs("T_Y-1", dec!(-4), dec!(-30), true, false)],
        )]));
        let ingestor = Ingestor::new(db.clone(), &source, Eligibility::VolumeAndFlag)
            .with_retry(fast())
            .with_request_delay(Duration::ZERO);

        let report = reconciler.reingest_range(&ingestor, day, day, 1).await?;
        assert_eq!(report.retried(), vec![day]);
        assert_eq!(report.dates[0].attempts, 2);
        // the day was fetched once, only the store step ran again
        assert_eq!(source.calls.lock().unwrap().len(), 48);
        assert_eq!(db.get_calculations(day)?.len(), 3);
        assert_eq!(
            db.get_daily_summary(day)?.unwrap().total_curtailed_energy,
            dec!(4)
        );
        Ok(())
    }

    /// Holds the calling thread for a while on every lookup.
    struct SlowDifficulty(Duration);

    impl DifficultyProvider for SlowDifficulty {
        fn difficulty(&self, _date: Date) -> Result<f64> {
            std::thread::sleep(self.0);
            Ok(DIFFICULTY)
        }
    }

    #[tokio::test]
    async fn range_dates_overlap() -> Result<()> {
        let db = test_db();
        let days = [
            date(2025, 5, 1),
            date(2025, 5, 2),
            date(2025, 5, 3),
            date(2025, 5, 4),
        ];
        for day in days {
            db.replace_records(day, &[record(day, 1, "T_X-1", dec!(-10), true, false)])?;
        }
        let lookup = Duration::from_millis(250);
        let reconciler = Reconciler::new(
            db.clone(),
            SlowDifficulty(lookup),
            Eligibility::VolumeAndFlag,
            vec![MinerModel::S19jPro],
        )
        .with_retry(fast());

        let started = Instant::now();
        let report = reconciler
            .reconcile_range(days[0], days[3], days.len(), false)
            .await?;
        let elapsed = started.elapsed();
        assert!(report.failed().is_empty());
        for day in days {
            assert_eq!(db.get_calculations(day)?.len(), 1);
        }
        let monthly = db.get_monthly_summary(month(2025, 5))?.unwrap();
        assert_eq!(monthly.total_curtailed_energy, dec!(40));
        assert!(
            elapsed < lookup * 3,
            "4 dates took {:?}, they did not run at the same time",
            elapsed
        );
        Ok(())
    }

    #[tokio::test]
    async fn reingest_replaces_records_and_calculations() -> Result<()> {
        let db = test_db();
        let day = seed(&db);
        let reconciler = reconciler(&db);
        reconciler.reconcile_date(day, false)?;

        let source = FakeSource::new(HashMap::from([(
            4,
            vec![obs("T_Y-1", dec!(-7.5), dec!(-50), true, false)],
        )]));
        let ingestor = Ingestor::new(db.clone(), &source, Eligibility::VolumeAndFlag)
            .with_retry(fast())
            .with_request_delay(Duration::ZERO);
        let report = reconciler.reingest_range(&ingestor, day, day, 1).await?;
        let outcome = report.dates[0].outcome.as_ref().unwrap();
        assert_eq!(outcome.ingested.as_ref().unwrap().records_written, 1);
        assert_eq!(outcome.calculations_removed, 6);
        assert_eq!(outcome.calculations_written, 3);
        assert_eq!(outcome.daily.summary.total_curtailed_energy, dec!(7.5));
        assert_eq!(outcome.daily.summary.total_payment, dec!(375));
        assert!(db
            .get_calculations(day)?
            .iter()
            .all(|c| c.farm_id == "T_Y-1"));
        Ok(())
    }
}
