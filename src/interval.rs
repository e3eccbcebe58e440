pub mod month;

use jiff::{civil::Date, ToSpan};

use crate::error::{Error, Result};

/// All the days between `start` and `end`, both ends included.
pub fn days(start: Date, end: Date) -> Result<Vec<Date>> {
    if end < start {
        return Err(Error::Config(format!(
            "End date {} is before start date {}",
            end, start
        )));
    }
    Ok(start.series(1.day()).take_while(|d| *d <= end).collect())
}

/// Number of half-hour settlement periods in a day on the GB market.
/// Clock changes make it 46 in the spring and 50 in the autumn.
pub fn settlement_periods(date: Date) -> Result<u8> {
    let start = date.at(0, 0, 0, 0).in_tz("Europe/London")?;
    let end = date.tomorrow()?.at(0, 0, 0, 0).in_tz("Europe/London")?;
    let seconds = end.timestamp().as_second() - start.timestamp().as_second();
    Ok((seconds / 1800) as u8)
}
