use std::collections::BTreeMap;
use std::sync::Arc;

use jiff::civil::Date;

use crate::error::{Error, Result};

/// Network difficulty in force on a date.
///
/// Implementations return `Error::MissingDifficulty` when they have no value
/// for the date, and `Error::DifficultyUnavailable` for failures worth a retry.
pub trait DifficultyProvider {
    fn difficulty(&self, date: Date) -> Result<f64>;
}

impl<T: DifficultyProvider + ?Sized> DifficultyProvider for &T {
    fn difficulty(&self, date: Date) -> Result<f64> {
        (**self).difficulty(date)
    }
}

impl<T: DifficultyProvider + ?Sized> DifficultyProvider for Box<T> {
    fn difficulty(&self, date: Date) -> Result<f64> {
        (**self).difficulty(date)
    }
}

impl<T: DifficultyProvider + ?Sized> DifficultyProvider for Arc<T> {
    fn difficulty(&self, date: Date) -> Result<f64> {
        (**self).difficulty(date)
    }
}

/// Difficulty values kept in memory.  The value for a date is the latest one
/// on or before it.
#[derive(Debug, Clone, Default)]
pub struct StaticDifficulty {
    values: BTreeMap<Date, f64>,
}

impl StaticDifficulty {
    pub fn new(values: impl IntoIterator<Item = (Date, f64)>) -> Self {
        StaticDifficulty {
            values: values.into_iter().collect(),
        }
    }

    /// The same difficulty for every date.
    pub fn constant(difficulty: f64) -> Self {
        StaticDifficulty::new([(Date::MIN, difficulty)])
    }
}

impl DifficultyProvider for StaticDifficulty {
    fn difficulty(&self, date: Date) -> Result<f64> {
        self.values
            .range(..=date)
            .next_back()
            .map(|(_, v)| *v)
            .ok_or(Error::MissingDifficulty(date))
    }
}
