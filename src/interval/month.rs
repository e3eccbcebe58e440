use std::fmt;
use std::str::FromStr;

use jiff::civil::{date, Date};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// A calendar month, the key of the monthly summary tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
    year: i16,
    month: i8,
}

/// Panics if the month is not in `1..=12`, like `jiff::civil::date`.
pub fn month(year: i16, month: i8) -> Month {
    Month::new(year, month).unwrap()
}

impl Month {
    pub fn new(year: i16, month: i8) -> Option<Month> {
        if !(1..=12).contains(&month) {
            return None;
        }
        Some(Month { year, month })
    }

    /// Return the month that contains this date.
    pub fn containing(day: Date) -> Month {
        Month {
            year: day.year(),
            month: day.month(),
        }
    }

    pub fn year(&self) -> i16 {
        self.year
    }

    pub fn month(&self) -> i8 {
        self.month
    }

    pub fn start_date(&self) -> Date {
        date(self.year, self.month, 1)
    }

    /// Last day of the month, inclusive.
    pub fn end_date(&self) -> Date {
        self.start_date().last_of_month()
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = Error;

    /// Parse a string like "2025-03".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || Error::Config(format!("Failed parsing {} as a month", s));
        let (y, m) = s.trim().split_once('-').ok_or_else(err)?;
        let year: i16 = y.parse().map_err(|_| err())?;
        let month: i8 = m.parse().map_err(|_| err())?;
        Month::new(year, month).ok_or_else(err)
    }
}

impl Serialize for Month {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Month {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
