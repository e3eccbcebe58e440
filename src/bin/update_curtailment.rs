use std::error::Error;

use clap::Parser;
use curtail::{config::Config, reconcile::Reconciler, report::range_summary};
use jiff::{tz::TimeZone, ToSpan, Zoned};
use log::{error, info};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,

    /// Number of days to fetch again, ending yesterday
    #[arg(short, long, default_value_t = 3)]
    days: i32,
}

/// Run this job every day in the morning, after Elexon has settled the
/// previous day.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Config::load(&args.env)?;
    let db = config.open_db()?;
    let ingestor = config.ingestor(&db)?;
    let reconciler = Reconciler::new(
        db.clone(),
        db.clone(),
        config.eligibility,
        config.miner_models.clone(),
    )
    .with_retry(config.retry.clone());

    let today = Zoned::now()
        .with_time_zone(TimeZone::get("Europe/London")?)
        .date();
    let end = today.yesterday()?;
    let start = end - (args.days.max(1) - 1).days();

    let report = reconciler.reingest_range(&ingestor, start, end, 1).await?;
    let summary = range_summary(&report);
    if report.failed().is_empty() {
        info!("{}", summary);
    } else {
        error!("{}", summary);
        for d in report.dates.iter().filter(|d| d.error.is_some()) {
            error!("{}: {}", d.date, d.error.as_deref().unwrap_or_default());
        }
        return Err(summary.into());
    }

    let status = reconciler.status(Some((start, end)))?;
    info!(
        "{} to {}: {} calculations missing, {:.2}% complete",
        start, end, status.missing_count, status.completion_percentage
    );
    Ok(())
}
