use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use jiff::civil::Date;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::db::CurtailmentDb;
use crate::eligibility::Eligibility;
use crate::error::{Error, Result};
use crate::interval::settlement_periods;
use crate::model::{CurtailmentRecord, Observation};
use crate::retry::RetryPolicy;

/// Where curtailment observations come from, one settlement period at a time.
pub trait CurtailmentSource {
    fn fetch(&self, date: Date, period: u8) -> impl Future<Output = Result<Vec<Observation>>>;
}

impl<T: CurtailmentSource> CurtailmentSource for &T {
    fn fetch(&self, date: Date, period: u8) -> impl Future<Output = Result<Vec<Observation>>> {
        (**self).fetch(date, period)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub date: Date,
    pub periods: u8,
    pub observations: usize,
    pub ineligible: usize,
    pub malformed: usize,
    pub records_written: usize,
}

/// Fetches every settlement period of a day and replaces the day's records.
pub struct Ingestor<S> {
    db: CurtailmentDb,
    source: S,
    eligibility: Eligibility,
    retry: RetryPolicy,
    concurrency: usize,
    request_delay: Duration,
}

impl<S: CurtailmentSource> Ingestor<S> {
    pub fn new(db: CurtailmentDb, source: S, eligibility: Eligibility) -> Self {
        Ingestor {
            db,
            source,
            eligibility,
            retry: RetryPolicy::default(),
            concurrency: 3,
            request_delay: Duration::from_millis(200),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Number of period requests in flight at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Pause before each period request.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Fetch all the periods of the day, then replace the stored records in
    /// one transaction.  If any period can't be fetched the stored records
    /// are left alone.
    pub async fn ingest_date(&self, date: Date) -> Result<IngestOutcome> {
        self.fetch_day(date).await?.write(&self.db)
    }

    /// Fetch and merge every period of the day without touching the store.
    pub async fn fetch_day(&self, date: Date) -> Result<FetchedDay> {
        let periods = settlement_periods(date)?;
        let fetched: Vec<Result<(u8, Vec<Observation>)>> = stream::iter(1..=periods)
            .map(|period| self.fetch_period(date, period))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        let mut fetched = fetched.into_iter().collect::<Result<Vec<_>>>()?;
        fetched.sort_by_key(|(period, _)| *period);

        let mut outcome = IngestOutcome {
            date,
            periods,
            observations: 0,
            ineligible: 0,
            malformed: 0,
            records_written: 0,
        };
        let mut merged: BTreeMap<(u8, String), Merge> = BTreeMap::new();
        for (period, observations) in fetched {
            outcome.observations += observations.len();
            for obs in observations {
                if let Err(e) = check(date, period, &obs) {
                    warn!("{}", e);
                    outcome.malformed += 1;
                    continue;
                }
                // ineligible observations are dropped before merging, so they
                // add neither volume nor flags to an eligible key
                if !self.eligibility.is_eligible(obs.volume, obs.so_flag, obs.cadl_flag) {
                    outcome.ineligible += 1;
                    continue;
                }
                merged
                    .entry((period, obs.farm_id.clone()))
                    .or_default()
                    .add(&obs);
            }
        }

        let records = merged
            .into_iter()
            .map(|((period, farm_id), m)| m.into_record(date, period, farm_id))
            .collect();
        Ok(FetchedDay { outcome, records })
    }

    async fn fetch_period(&self, date: Date, period: u8) -> Result<(u8, Vec<Observation>)> {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
        let label = format!("fetch {} period {}", date, period);
        match self.retry.run(&label, || self.source.fetch(date, period)).await {
            Ok((observations, attempts)) => {
                debug!(
                    "{}: {} observations after {} attempts",
                    label,
                    observations.len(),
                    attempts
                );
                Ok((period, observations))
            }
            Err(exhausted) => Err(exhausted.error),
        }
    }
}

/// The merged records of a day, ready to replace the stored ones.
#[derive(Debug, Clone)]
pub struct FetchedDay {
    outcome: IngestOutcome,
    records: Vec<CurtailmentRecord>,
}

impl FetchedDay {
    pub fn records(&self) -> &[CurtailmentRecord] {
        &self.records
    }

    /// Replace the day's records in one transaction.  Writing the same day
    /// twice leaves the same rows.
    pub fn write(&self, db: &CurtailmentDb) -> Result<IngestOutcome> {
        let mut outcome = self.outcome.clone();
        outcome.records_written = db.replace_records(outcome.date, &self.records)?;
        info!(
            "ingested {}: {} observations over {} periods, {} records written, {} ineligible, {} malformed",
            outcome.date,
            outcome.observations,
            outcome.periods,
            outcome.records_written,
            outcome.ineligible,
            outcome.malformed
        );
        Ok(outcome)
    }
}

fn check(date: Date, period: u8, obs: &Observation) -> Result<()> {
    if obs.farm_id.trim().is_empty() {
        return Err(Error::MalformedRecord {
            date,
            period,
            reason: "empty farm id".to_string(),
        });
    }
    Ok(())
}

/// Accumulates the observations of one (period, farm) key.
#[derive(Default)]
struct Merge {
    lead_party_name: Option<String>,
    volume: Decimal,
    original_value: Decimal,
    final_value: Decimal,
    payment: Decimal,
    so_flag: bool,
    cadl_flag: bool,
    first: Option<(Decimal, Decimal)>,
}

impl Merge {
    fn add(&mut self, obs: &Observation) {
        if self.lead_party_name.is_none() {
            self.lead_party_name = obs.lead_party_name.clone();
        }
        if self.first.is_none() {
            self.first = Some((obs.original_price, obs.final_price));
        }
        self.volume += obs.volume;
        self.original_value += obs.volume * obs.original_price;
        self.final_value += obs.volume * obs.final_price;
        self.payment += -(obs.volume.abs() * obs.original_price);
        self.so_flag |= obs.so_flag;
        self.cadl_flag |= obs.cadl_flag;
    }

    fn into_record(self, date: Date, period: u8, farm_id: String) -> CurtailmentRecord {
        let (original_price, final_price) = if self.volume.is_zero() {
            self.first.unwrap_or_default()
        } else {
            (
                (self.original_value / self.volume).round_dp(6),
                (self.final_value / self.volume).round_dp(6),
            )
        };
        CurtailmentRecord {
            settlement_date: date,
            settlement_period: period,
            farm_id,
            lead_party_name: self.lead_party_name,
            volume: self.volume,
            original_price,
            final_price,
            payment: self.payment.round_dp(6),
            so_flag: self.so_flag,
            cadl_flag: self.cadl_flag,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use jiff::civil::date;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::db::curtailment_db::tests::{record, test_db};

    pub(crate) fn obs(farm: &str, volume: Decimal, price: Decimal, so: bool, cadl: bool) -> Observation {
        Observation {
            farm_id: farm.to_string(),
            lead_party_name: Some("Lead Party".to_string()),
            volume,
            original_price: price,
            final_price: price,
            so_flag: so,
            cadl_flag: cadl,
        }
    }

    /// Serves fixed observations per period and counts the calls.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub data: HashMap<u8, Vec<Observation>>,
        pub failures: Mutex<HashMap<u8, Vec<Error>>>,
        pub calls: Mutex<Vec<(Date, u8)>>,
    }

    impl FakeSource {
        pub(crate) fn new(data: HashMap<u8, Vec<Observation>>) -> Self {
            FakeSource {
                data,
                ..Default::default()
            }
        }

        /// Make the next calls for the period fail, in order.
        pub(crate) fn fail(&self, period: u8, errors: Vec<Error>) {
            self.failures.lock().unwrap().insert(period, errors);
        }
    }

    impl CurtailmentSource for FakeSource {
        async fn fetch(&self, date: Date, period: u8) -> Result<Vec<Observation>> {
            self.calls.lock().unwrap().push((date, period));
            if let Some(errors) = self.failures.lock().unwrap().get_mut(&period) {
                if !errors.is_empty() {
                    return Err(errors.remove(0));
                }
            }
            Ok(self.data.get(&period).cloned().unwrap_or_default())
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(2),
            rate_limit_wait: Duration::from_millis(3),
        }
    }

    fn ingestor<S: CurtailmentSource>(db: &CurtailmentDb, source: S) -> Ingestor<S> {
        Ingestor::new(db.clone(), source, Eligibility::VolumeAndFlag)
            .with_retry(fast())
            .with_request_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn ingest_filters_and_merges() -> Result<()> {
        let db = test_db();
        let day = date(2025, 3, 31);
        let source = FakeSource::new(HashMap::from([
            (
                1,
                vec![
                    obs("T_X-1", dec!(-10), dec!(-40), true, false),
                    obs("T_X-1", dec!(-30), dec!(-60), false, true),
                    obs("T_Y-1", dec!(-5), dec!(-20), false, false),
                    obs("T_Z-1", dec!(12), dec!(80), true, false),
                ],
            ),
            (2, vec![obs("", dec!(-1), dec!(-1), true, true)]),
            (17, vec![obs("T_Y-1", dec!(-2.5), dec!(-35.25), true, false)]),
        ]));
        let outcome = ingestor(&db, &source).ingest_date(day).await?;
        assert_eq!(outcome.periods, 48);
        assert_eq!(source.calls.lock().unwrap().len(), 48);
        assert_eq!(outcome.observations, 6);
        assert_eq!(outcome.ineligible, 2);
        assert_eq!(outcome.malformed, 1);
        assert_eq!(outcome.records_written, 2);

        let merged = db.get_record(day, 1, "T_X-1")?.unwrap();
        assert_eq!(merged.volume, dec!(-40));
        assert_eq!(merged.original_price, dec!(-55));
        assert_eq!(merged.payment, dec!(2200));
        assert!(merged.so_flag && merged.cadl_flag);

        let single = db.get_record(day, 17, "T_Y-1")?.unwrap();
        assert_eq!(single.payment, dec!(88.125));
        Ok(())
    }

    #[tokio::test]
    async fn fetch_day_leaves_store_alone() -> Result<()> {
        let db = test_db();
        let day = date(2025, 6, 1);
        db.replace_records(day, &[record(day, 5, "T_OLD-1", dec!(-3), true, false)])?;
        let source = FakeSource::new(HashMap::from([(
            5,
            vec![
                obs("T_NEW-1", dec!(-8), dec!(-10), true, false),
                obs("T_NEW-1", dec!(-2), dec!(-10), false, false),
            ],
        )]));
        let fetched = ingestor(&db, &source).fetch_day(day).await?;
        assert_eq!(fetched.records().len(), 1);
        assert_eq!(fetched.records()[0].volume, dec!(-8));
        assert_eq!(db.get_records(day)?[0].farm_id, "T_OLD-1");

        let first = fetched.write(&db)?;
        let second = fetched.write(&db)?;
        assert_eq!(first, second);
        assert_eq!(first.ineligible, 1);
        assert_eq!(db.get_records(day)?, fetched.records().to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn ingest_replaces_previous_records() -> Result<()> {
        let db = test_db();
        let day = date(2025, 6, 1);
        db.replace_records(
            day,
            &[
                record(day, 5, "T_OLD-1", dec!(-3), true, false),
                record(day, 6, "T_OLD-1", dec!(-4), true, false),
            ],
        )?;
        let source = FakeSource::new(HashMap::from([(
            5,
            vec![obs("T_NEW-1", dec!(-8), dec!(-10), true, false)],
        )]));
        ingestor(&db, &source).ingest_date(day).await?;
        let records = db.get_records(day)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].farm_id, "T_NEW-1");
        Ok(())
    }

    #[tokio::test]
    async fn failed_fetch_keeps_stored_records() -> Result<()> {
        let db = test_db();
        let day = date(2025, 6, 1);
        db.replace_records(day, &[record(day, 5, "T_OLD-1", dec!(-3), true, false)])?;
        let source = FakeSource::new(HashMap::new());
        source.fail(
            7,
            vec![
                Error::HttpStatus { status: 503, url: "x".into() },
                Error::HttpStatus { status: 503, url: "x".into() },
                Error::HttpStatus { status: 503, url: "x".into() },
            ],
        );
        let res = ingestor(&db, &source).ingest_date(day).await;
        assert!(matches!(res, Err(Error::HttpStatus { status: 503, .. })));
        assert_eq!(db.get_records(day)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn rate_limited_fetch_is_retried() -> Result<()> {
        let db = test_db();
        let day = date(2025, 6, 1);
        let source = FakeSource::new(HashMap::from([(
            3,
            vec![obs("T_X-1", dec!(-1), dec!(-10), true, false)],
        )]));
        source.fail(3, vec![Error::RateLimited { url: "x".into() }]);
        let outcome = ingestor(&db, &source).ingest_date(day).await?;
        assert_eq!(outcome.records_written, 1);
        let calls = source.calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|(_, p)| *p == 3).count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn clock_change_days() -> Result<()> {
        let db = test_db();
        let source = FakeSource::new(HashMap::new());
        let ingestor = ingestor(&db, &source);
        assert_eq!(ingestor.ingest_date(date(2025, 3, 30)).await?.periods, 46);
        assert_eq!(ingestor.ingest_date(date(2025, 10, 26)).await?.periods, 50);
        let calls = source.calls.lock().unwrap();
        assert_eq!(calls.iter().map(|(_, p)| *p).max(), Some(50));
        Ok(())
    }
}
