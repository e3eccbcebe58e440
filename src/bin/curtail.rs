use std::{error::Error, fmt::Display, path::PathBuf};

use clap::{Parser, Subcommand};
use curtail::{
    config::Config,
    difficulty::{DifficultyProvider, StaticDifficulty},
    reconcile::{RangeReport, Reconciler},
    report::{
        outcome_table, range_summary, range_table, spot_fix_table, status_table,
        verification_table, verify_date,
    },
};
use jiff::civil::Date;
use log::info;
use serde::Serialize;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(version, about = "Keep bitcoin calculations and summaries in line with curtailment records", long_about = None)]
struct Args {
    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,

    /// Print the report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Use this network difficulty for every date instead of the stored history
    #[arg(long, global = true)]
    difficulty: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// How complete the calculations are
    Status {
        #[arg(long, requires = "end")]
        start: Option<Date>,
        #[arg(long, requires = "start")]
        end: Option<Date>,
    },
    /// Reconcile one date
    Reconcile {
        #[arg(long)]
        date: Date,
        /// Recompute every calculation of the date
        #[arg(long)]
        force: bool,
    },
    /// Reconcile a range of dates, resuming an interrupted run
    Range {
        #[arg(long)]
        start: Date,
        #[arg(long)]
        end: Date,
        /// Dates processed at once, defaults to CURTAIL_BATCH_SIZE
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        force: bool,
    },
    /// Recompute one settlement period of one farm
    SpotFix {
        #[arg(long)]
        date: Date,
        #[arg(long)]
        period: u8,
        #[arg(long)]
        farm: String,
    },
    /// Fetch a date again from Elexon and recompute it
    Reingest {
        #[arg(long)]
        date: Date,
    },
    /// Fetch a range of dates again from Elexon
    ReingestRange {
        #[arg(long)]
        start: Date,
        #[arg(long)]
        end: Date,
        #[arg(long, default_value_t = 1)]
        batch_size: usize,
    },
    /// Load a `date,difficulty` CSV file into the difficulty history
    ImportDifficulty {
        #[arg(long)]
        file: PathBuf,
    },
    /// Set the difficulty in force from a date
    SetDifficulty {
        #[arg(long)]
        date: Date,
        #[arg(long)]
        value: f64,
    },
    /// Show records, calculations and summary of a date
    Verify {
        #[arg(long)]
        date: Date,
    },
}

fn print<T: Serialize>(json: bool, value: &T, table: impl Display) -> Result<(), Box<dyn Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", table);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = Config::load(&args.env)?;
    let db = config.open_db()?;
    let provider: Box<dyn DifficultyProvider + Send + Sync> = match args.difficulty {
        Some(value) => {
            info!("using difficulty {} for every date", value);
            Box::new(StaticDifficulty::constant(value))
        }
        None => Box::new(db.clone()),
    };
    let reconciler = Reconciler::new(
        db.clone(),
        provider,
        config.eligibility,
        config.miner_models.clone(),
    )
    .with_retry(config.retry.clone());
    let r = &reconciler;

    match args.command {
        Command::Status { start, end } => {
            let range = start.zip(end);
            let status = reconciler.status(range)?;
            print(args.json, &status, status_table(&status))?;
        }
        Command::Reconcile { date, force } => {
            let label = format!("reconcile {}", date);
            let (outcome, _) = reconciler
                .retry()
                .run(&label, || async move { r.reconcile_date(date, force) })
                .await
                .map_err(|e| e.error)?;
            let verification = verify_date(&db, date, config.eligibility, &config.miner_models)?;
            let table = format!(
                "{}\n\n{}",
                outcome_table(&[&outcome]),
                verification_table(&verification)
            );
            print(
                args.json,
                &json!({"outcome": outcome, "verification": verification}),
                table,
            )?;
        }
        Command::Range {
            start,
            end,
            batch_size,
            force,
        } => {
            let batch_size = batch_size.unwrap_or(config.batch_size);
            let report = reconciler
                .reconcile_range(start, end, batch_size, force)
                .await?;
            print(args.json, &report, range_table(&report))?;
            fail_on_failed_dates(&report)?;
        }
        Command::SpotFix { date, period, farm } => {
            let label = format!("spot-fix {} period {} farm {}", date, period, farm);
            let farm = farm.as_str();
            let (fix, _) = reconciler
                .retry()
                .run(&label, || async move { r.spot_fix(date, period, farm) })
                .await
                .map_err(|e| e.error)?;
            let verification = verify_date(&db, date, config.eligibility, &config.miner_models)?;
            let table = format!(
                "{}\n\n{}",
                spot_fix_table(&fix),
                verification_table(&verification)
            );
            print(
                args.json,
                &json!({"spot_fix": fix, "verification": verification}),
                table,
            )?;
        }
        Command::Reingest { date } => {
            let ingestor = config.ingestor(&db)?;
            let outcome = reconciler.reingest_date(&ingestor, date).await?;
            let verification = verify_date(&db, date, config.eligibility, &config.miner_models)?;
            let table = format!(
                "{}\n\n{}",
                outcome_table(&[&outcome]),
                verification_table(&verification)
            );
            print(
                args.json,
                &json!({"outcome": outcome, "verification": verification}),
                table,
            )?;
        }
        Command::ReingestRange {
            start,
            end,
            batch_size,
        } => {
            let ingestor = config.ingestor(&db)?;
            let report = reconciler
                .reingest_range(&ingestor, start, end, batch_size)
                .await?;
            print(args.json, &report, range_table(&report))?;
            fail_on_failed_dates(&report)?;
        }
        Command::ImportDifficulty { file } => {
            let n = db.import_difficulty_csv(&file)?;
            info!("imported {} difficulty values", n);
        }
        Command::SetDifficulty { date, value } => {
            db.upsert_difficulty(date, value)?;
            info!("difficulty from {} set to {}", date, value);
        }
        Command::Verify { date } => {
            let verification = verify_date(&db, date, config.eligibility, &config.miner_models)?;
            print(args.json, &verification, verification_table(&verification))?;
        }
    }
    Ok(())
}

fn fail_on_failed_dates(report: &RangeReport) -> Result<(), Box<dyn Error>> {
    let summary = range_summary(report);
    info!("{}", summary);
    if report.failed().is_empty() {
        Ok(())
    } else {
        Err(summary.into())
    }
}
