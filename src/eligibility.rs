use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Which curtailment observations count towards calculations and summaries.
///
/// The same rule is used when records are ingested and when the cascade
/// reads them back, both in Rust and as a SQL predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Eligibility {
    /// `volume < 0` and at least one of the SO or CADL flags set.
    #[default]
    VolumeAndFlag,
    /// `volume < 0`, flags ignored.
    VolumeOnly,
}

impl Eligibility {
    pub fn is_eligible(&self, volume: Decimal, so_flag: bool, cadl_flag: bool) -> bool {
        match self {
            Eligibility::VolumeAndFlag => volume < Decimal::ZERO && (so_flag || cadl_flag),
            Eligibility::VolumeOnly => volume < Decimal::ZERO,
        }
    }

    /// SQL boolean expression over a `curtailment_records` alias.
    pub fn sql_predicate(&self, alias: &str) -> String {
        match self {
            Eligibility::VolumeAndFlag => format!(
                "({a}.volume < 0 AND ({a}.so_flag OR {a}.cadl_flag))",
                a = alias
            ),
            Eligibility::VolumeOnly => format!("({}.volume < 0)", alias),
        }
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eligibility::VolumeAndFlag => write!(f, "volume-and-flag"),
            Eligibility::VolumeOnly => write!(f, "volume-only"),
        }
    }
}

impl FromStr for Eligibility {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "volume-and-flag" | "strict" => Ok(Eligibility::VolumeAndFlag),
            "volume-only" => Ok(Eligibility::VolumeOnly),
            _ => Err(Error::Config(format!("Unknown eligibility rule: {}", s))),
        }
    }
}
