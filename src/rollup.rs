use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use jiff::civil::{date, Date};
use log::{info, warn};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::db::CurtailmentDb;
use crate::eligibility::Eligibility;
use crate::error::{Error, Result};
use crate::interval::month::Month;
use crate::mining::MinerModel;
use crate::model::{
    BitcoinDailySummary, BitcoinMonthlySummary, BitcoinYearlySummary, DailySummary,
    MonthlySummary, YearlySummary,
};

/// Summary rows written for one level of the hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rollup<S, B> {
    pub summary: S,
    pub bitcoin: Vec<B>,
}

pub type DailyRollup = Rollup<DailySummary, BitcoinDailySummary>;
pub type MonthlyRollup = Rollup<MonthlySummary, BitcoinMonthlySummary>;
pub type YearlyRollup = Rollup<YearlySummary, BitcoinYearlySummary>;

/// Everything refreshed for one date: the day, its month and its year.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cascade {
    pub daily: DailyRollup,
    pub monthly: MonthlyRollup,
    pub yearly: YearlyRollup,
}

fn sum_by_model(items: impl Iterator<Item = (MinerModel, Decimal)>) -> BTreeMap<MinerModel, Decimal> {
    let mut out: BTreeMap<MinerModel, Decimal> = BTreeMap::new();
    for (model, value) in items {
        *out.entry(model).or_default() += value;
    }
    out
}

/// Recomputes the summary tables, one level at a time, from the level below.
///
/// Every roll-up writes full totals, never increments, so running it again on
/// unchanged children gives the same rows.  Days come from the records and
/// the calculations, months from the days, years from the months.  The
/// levels must be refreshed in that order; [`RollupEngine::cascade`] does so.
///
/// Clones share one lock, so cascades started from several threads run one
/// after the other.
#[derive(Clone)]
pub struct RollupEngine {
    db: CurtailmentDb,
    eligibility: Eligibility,
    cascading: Arc<Mutex<()>>,
}

impl RollupEngine {
    pub fn new(db: CurtailmentDb, eligibility: Eligibility) -> Self {
        RollupEngine {
            db,
            eligibility,
            cascading: Arc::new(Mutex::new(())),
        }
    }

    /// Sum the eligible records and their calculations for the day.  A day
    /// without records gets a summary with zero totals and no bitcoin rows.
    pub fn rollup_daily(&self, day: Date) -> Result<DailyRollup> {
        let records = self.db.get_eligible_records(day, self.eligibility)?;
        let summary = DailySummary {
            summary_date: day,
            total_curtailed_energy: records.iter().map(|r| r.curtailed_energy()).sum(),
            total_payment: records.iter().map(|r| r.payment).sum(),
        };
        self.db.upsert_daily_summary(&summary)?;

        let calculations = self.db.get_eligible_calculations(day, self.eligibility)?;
        let bitcoin: Vec<BitcoinDailySummary> =
            sum_by_model(calculations.iter().map(|c| (c.miner_model, c.bitcoin_mined)))
                .into_iter()
                .map(|(miner_model, bitcoin_mined)| BitcoinDailySummary {
                    summary_date: day,
                    miner_model,
                    bitcoin_mined,
                })
                .collect();
        self.db.replace_bitcoin_daily_summaries(day, &bitcoin)?;
        Ok(Rollup { summary, bitcoin })
    }

    /// Sum the daily summaries of the month.
    pub fn rollup_monthly(&self, month: Month) -> Result<MonthlyRollup> {
        let (start, end) = (month.start_date(), month.end_date());
        let days = self.db.get_daily_summaries(start, end)?;

        let stale = self.stale_days(month, &days)?;
        if !stale.is_empty() {
            warn!(
                "{} days of {} have records but no daily summary yet, first one {}",
                stale.len(),
                month,
                stale[0]
            );
        }

        let summary = MonthlySummary {
            year_month: month,
            total_curtailed_energy: days.iter().map(|d| d.total_curtailed_energy).sum(),
            total_payment: days.iter().map(|d| d.total_payment).sum(),
        };
        self.db.upsert_monthly_summary(&summary)?;

        let daily_bitcoin = self.db.get_bitcoin_daily_summaries(start, end)?;
        let bitcoin: Vec<BitcoinMonthlySummary> =
            sum_by_model(daily_bitcoin.iter().map(|d| (d.miner_model, d.bitcoin_mined)))
                .into_iter()
                .map(|(miner_model, bitcoin_mined)| BitcoinMonthlySummary {
                    year_month: month,
                    miner_model,
                    bitcoin_mined,
                })
                .collect();
        self.db.replace_bitcoin_monthly_summaries(month, &bitcoin)?;
        Ok(Rollup { summary, bitcoin })
    }

    /// Sum the monthly summaries of the year.  Fails with a consistency error
    /// if a month has daily summaries but was never rolled up.
    pub fn rollup_yearly(&self, year: i16) -> Result<YearlyRollup> {
        let months = self.db.get_monthly_summaries(year)?;
        let rolled: BTreeSet<Month> = months.iter().map(|m| m.year_month).collect();
        let with_days: BTreeSet<Month> = self
            .db
            .get_daily_summaries(date(year, 1, 1), date(year, 12, 31))?
            .iter()
            .map(|d| Month::containing(d.summary_date))
            .collect();
        let missing: Vec<String> = with_days
            .difference(&rolled)
            .map(|m| m.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Consistency(format!(
                "year {} has daily summaries for months {} but no monthly summary",
                year,
                missing.join(", ")
            )));
        }

        let summary = YearlySummary {
            year,
            total_curtailed_energy: months.iter().map(|m| m.total_curtailed_energy).sum(),
            total_payment: months.iter().map(|m| m.total_payment).sum(),
        };
        self.db.upsert_yearly_summary(&summary)?;

        let monthly_bitcoin = self.db.get_bitcoin_monthly_summaries(year)?;
        let bitcoin: Vec<BitcoinYearlySummary> =
            sum_by_model(monthly_bitcoin.iter().map(|m| (m.miner_model, m.bitcoin_mined)))
                .into_iter()
                .map(|(miner_model, bitcoin_mined)| BitcoinYearlySummary {
                    year,
                    miner_model,
                    bitcoin_mined,
                })
                .collect();
        self.db.replace_bitcoin_yearly_summaries(year, &bitcoin)?;
        Ok(Rollup { summary, bitcoin })
    }

    /// Refresh the day, then its month, then its year.
    pub fn cascade(&self, day: Date) -> Result<Cascade> {
        // a yearly roll-up must not see a day whose month is not rolled up yet
        let _guard = self.cascading.lock().unwrap_or_else(PoisonError::into_inner);
        let daily = self.rollup_daily(day)?;
        let monthly = self.rollup_monthly(Month::containing(day))?;
        let yearly = self.rollup_yearly(day.year())?;
        info!(
            "rolled up {}: {} MWh, month {} MWh, year {} MWh",
            day,
            daily.summary.total_curtailed_energy,
            monthly.summary.total_curtailed_energy,
            yearly.summary.total_curtailed_energy
        );
        Ok(Cascade {
            daily,
            monthly,
            yearly,
        })
    }

    /// Days of the month with eligible records but no daily summary.
    fn stale_days(&self, month: Month, days: &[DailySummary]) -> Result<Vec<Date>> {
        let summarized: BTreeSet<Date> = days.iter().map(|d| d.summary_date).collect();
        let with_records =
            self.db
                .dates_with_records(self.eligibility, month.start_date(), month.end_date())?;
        Ok(with_records
            .into_iter()
            .filter(|d| !summarized.contains(d))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use jiff::civil::date;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::db::curtailment_db::tests::{record, test_db};
    use crate::interval::month::month;
    use crate::model::BitcoinCalculation;

    fn engine(db: &CurtailmentDb) -> RollupEngine {
        RollupEngine::new(db.clone(), Eligibility::VolumeAndFlag)
    }

    fn calc(day: Date, period: u8, model: MinerModel, btc: Decimal) -> BitcoinCalculation {
        BitcoinCalculation {
            settlement_date: day,
            settlement_period: period,
            farm_id: "T_X-1".to_string(),
            miner_model: model,
            curtailed_energy: dec!(10),
            bitcoin_mined: btc,
            difficulty: 1.0e14,
        }
    }

    #[test]
    fn empty_day_has_zero_totals() -> Result<()> {
        let db = test_db();
        let day = date(2025, 6, 1);
        let rollup = engine(&db).rollup_daily(day)?;
        assert_eq!(rollup.summary.total_curtailed_energy, dec!(0));
        assert_eq!(rollup.summary.total_payment, dec!(0));
        assert!(rollup.bitcoin.is_empty());
        let saved = db.get_daily_summary(day)?.unwrap();
        assert_eq!(saved.total_curtailed_energy, dec!(0));
        Ok(())
    }

    #[test]
    fn daily_ignores_ineligible_records() -> Result<()> {
        let db = test_db();
        let day = date(2025, 3, 31);
        db.replace_records(
            day,
            &[
                record(day, 1, "T_X-1", dec!(-10), true, false),
                record(day, 2, "T_X-1", dec!(-20), false, false),
                record(day, 3, "T_X-1", dec!(15), true, false),
            ],
        )?;
        // a calculation left over for an ineligible record doesn't count
        db.upsert_calculations(&[
            calc(day, 1, MinerModel::S9, dec!(0.001)),
            calc(day, 2, MinerModel::S9, dec!(0.5)),
        ])?;
        let rollup = engine(&db).rollup_daily(day)?;
        assert_eq!(rollup.summary.total_curtailed_energy, dec!(10));
        assert_eq!(rollup.summary.total_payment, dec!(455));
        assert_eq!(rollup.bitcoin.len(), 1);
        assert_eq!(rollup.bitcoin[0].bitcoin_mined, dec!(0.001));
        Ok(())
    }

    #[test]
    fn monthly_is_sum_of_daily() -> Result<()> {
        let db = test_db();
        let engine = engine(&db);
        let days = [date(2025, 3, 1), date(2025, 3, 15), date(2025, 3, 31)];
        for (i, day) in days.iter().enumerate() {
            let volume = Decimal::from(-(i as i64 + 1) * 7) - dec!(0.125);
            db.replace_records(*day, &[record(*day, 10, "T_X-1", volume, true, false)])?;
            db.upsert_calculations(&[
                calc(*day, 10, MinerModel::S19jPro, dec!(0.0125)),
                calc(*day, 10, MinerModel::S9, dec!(0.00012345)),
            ])?;
            engine.rollup_daily(*day)?;
        }
        // a day in the next month must not count
        let april = date(2025, 4, 1);
        db.replace_records(april, &[record(april, 1, "T_X-1", dec!(-100), true, false)])?;
        engine.rollup_daily(april)?;

        let rollup = engine.rollup_monthly(month(2025, 3))?;
        let daily = db.get_daily_summaries(date(2025, 3, 1), date(2025, 3, 31))?;
        let total: Decimal = daily.iter().map(|d| d.total_curtailed_energy).sum();
        assert_eq!(rollup.summary.total_curtailed_energy, total);
        assert_eq!(total, dec!(42.375));
        assert_eq!(
            db.get_monthly_summary(month(2025, 3))?.unwrap(),
            rollup.summary
        );
        let s19 = rollup
            .bitcoin
            .iter()
            .find(|b| b.miner_model == MinerModel::S19jPro)
            .unwrap();
        assert_eq!(s19.bitcoin_mined, dec!(0.0375));
        Ok(())
    }

    #[test]
    fn rollups_are_idempotent() -> Result<()> {
        let db = test_db();
        let engine = engine(&db);
        let day = date(2025, 3, 31);
        db.replace_records(day, &[record(day, 1, "T_X-1", dec!(-10.5), true, true)])?;
        db.upsert_calculations(&[calc(day, 1, MinerModel::M20s, dec!(0.00031416))])?;
        let first = engine.cascade(day)?;
        let second = engine.cascade(day)?;
        assert_eq!(first, second);
        assert_eq!(db.get_daily_summaries(day, day)?.len(), 1);
        assert_eq!(db.get_monthly_summaries(2025)?.len(), 1);
        assert_eq!(db.get_bitcoin_yearly_summaries(2025)?, first.yearly.bitcoin);
        Ok(())
    }

    #[test]
    fn yearly_detects_month_never_rolled_up() -> Result<()> {
        let db = test_db();
        let engine = engine(&db);
        let day = date(2025, 3, 31);
        db.replace_records(day, &[record(day, 1, "T_X-1", dec!(-10), true, false)])?;
        engine.cascade(day)?;

        // a daily summary written without its monthly roll-up
        engine.rollup_daily(date(2025, 2, 10))?;
        let res = engine.rollup_yearly(2025);
        assert!(matches!(res, Err(Error::Consistency(_))));

        engine.rollup_monthly(month(2025, 2))?;
        let yearly = engine.rollup_yearly(2025)?;
        assert_eq!(yearly.summary.total_curtailed_energy, dec!(10));
        Ok(())
    }
}
