use std::{thread, time::Duration};

use duckdb::{types::Type, types::ValueRef, DuckdbConnectionManager, Row};
use jiff::civil::Date;
use log::warn;
use r2d2::Pool;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Open a connection pool on a DuckDB file, waiting for another process to
/// release its lock on the file.
/// Suggested `max_attempts = 8`, `initial_wait = Duration::from_millis(25)`.
pub fn open_pool_with_retry(
    duckdb_path: &str,
    pool_size: u32,
    max_attempts: u32,
    initial_wait: Duration,
) -> Result<Pool<DuckdbConnectionManager>, crate::Error> {
    let mut attempts = 0;
    let mut wait_duration = initial_wait;

    loop {
        match DuckdbConnectionManager::file(duckdb_path) {
            Ok(manager) => {
                let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;
                return Ok(pool);
            }
            Err(e) => {
                attempts += 1;
                if attempts >= max_attempts {
                    return Err(e.into());
                }
                warn!(
                    "Retrying to open DuckDB {} after error: {} (attempt {}/{})",
                    duckdb_path, e, attempts, max_attempts
                );
                thread::sleep(wait_duration);
                wait_duration *= 2;
            }
        }
    }
}

/// Read a DECIMAL column.  Integer and double results, e.g. from an
/// aggregate over an empty table, are converted.
pub fn decimal_at(row: &Row, idx: usize) -> duckdb::Result<Decimal> {
    let value = row.get_ref(idx)?;
    let out = match value {
        ValueRef::Decimal(v) => Some(v),
        ValueRef::Null => Some(Decimal::ZERO),
        ValueRef::TinyInt(v) => Some(Decimal::from(v)),
        ValueRef::SmallInt(v) => Some(Decimal::from(v)),
        ValueRef::Int(v) => Some(Decimal::from(v)),
        ValueRef::BigInt(v) => Some(Decimal::from(v)),
        ValueRef::HugeInt(v) => Decimal::from_i128(v),
        ValueRef::Double(v) => Decimal::from_f64(v),
        _ => None,
    };
    out.ok_or_else(|| {
        duckdb::Error::FromSqlConversionFailure(
            idx,
            Type::Decimal,
            format!("value in column {} is not a decimal", idx).into(),
        )
    })
}

/// Read a DATE column that was selected as VARCHAR.
pub fn date_at(row: &Row, idx: usize) -> duckdb::Result<Date> {
    let s: String = row.get(idx)?;
    s.parse::<Date>()
        .map_err(|e| duckdb::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn opt_date_at(row: &Row, idx: usize) -> duckdb::Result<Option<Date>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => s
            .parse::<Date>()
            .map(Some)
            .map_err(|e| duckdb::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

/// SQL filter on a date column for an optional inclusive range.
pub fn date_range_filter(column: &str, range: Option<(Date, Date)>) -> String {
    match range {
        Some((start, end)) => format!(
            " AND {} >= '{}'::DATE AND {} <= '{}'::DATE",
            column, start, column, end
        ),
        None => String::new(),
    }
}
