use std::fmt;
use std::str::FromStr;

use jiff::civil::{date, Date};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Length of a settlement period, in minutes.
pub const SETTLEMENT_PERIOD_MINUTES: f64 = 30.0;

/// Target time between two blocks, in seconds.
pub const BLOCK_INTERVAL_SECONDS: f64 = 600.0;

/// Bitcoin amounts are kept to the satoshi.
pub const BTC_DECIMALS: u32 = 8;

/// Block subsidy in force from a given date (UTC), in BTC.
/// Must be sorted by date.
const HALVING_SCHEDULE: [(i16, i8, i8, Decimal); 5] = [
    (2009, 1, 3, dec!(50)),
    (2012, 11, 28, dec!(25)),
    (2016, 7, 9, dec!(12.5)),
    (2020, 5, 11, dec!(6.25)),
    (2024, 4, 20, dec!(3.125)),
];

/// The block reward for blocks mined on the settlement date.
pub fn block_reward(settlement_date: Date) -> Decimal {
    HALVING_SCHEDULE
        .iter()
        .rev()
        .find(|(y, m, d, _)| settlement_date >= date(*y, *m, *d))
        .map(|e| e.3)
        .unwrap_or(Decimal::ZERO)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MinerModel {
    #[serde(rename = "S19J_PRO")]
    S19jPro,
    #[serde(rename = "S9")]
    S9,
    #[serde(rename = "M20S")]
    M20s,
}

impl MinerModel {
    pub const ALL: [MinerModel; 3] = [MinerModel::S19jPro, MinerModel::S9, MinerModel::M20s];

    pub fn as_str(&self) -> &'static str {
        match self {
            MinerModel::S19jPro => "S19J_PRO",
            MinerModel::S9 => "S9",
            MinerModel::M20s => "M20S",
        }
    }

    /// Rated hash rate, in hashes per second.
    pub fn hash_rate(&self) -> f64 {
        match self {
            MinerModel::S19jPro => 100e12,
            MinerModel::S9 => 13.5e12,
            MinerModel::M20s => 68e12,
        }
    }

    /// Rated power draw, in watts.
    pub fn power(&self) -> f64 {
        match self {
            MinerModel::S19jPro => 3050.0,
            MinerModel::S9 => 1323.0,
            MinerModel::M20s => 3360.0,
        }
    }
}

impl fmt::Display for MinerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MinerModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "S19J_PRO" => Ok(MinerModel::S19jPro),
            "S9" => Ok(MinerModel::S9),
            "M20S" => Ok(MinerModel::M20s),
            _ => Err(Error::UnknownMinerModel(s.to_string())),
        }
    }
}

/// Parse a comma separated list of miner models, e.g. "S19J_PRO,S9".
pub fn parse_models(s: &str) -> Result<Vec<MinerModel>> {
    let mut out: Vec<MinerModel> = Vec::new();
    for name in s.split(',').filter(|x| !x.trim().is_empty()) {
        let model = name.parse::<MinerModel>()?;
        if !out.contains(&model) {
            out.push(model);
        }
    }
    Ok(out)
}

pub fn validate_difficulty(difficulty: f64) -> Result<()> {
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return Err(Error::InvalidDifficulty(difficulty));
    }
    Ok(())
}

/// Bitcoin that could have been mined with the energy curtailed during one
/// settlement period.
///
/// The energy runs as many whole miners as it can power for the period, their
/// combined hash rate is compared with the network hash rate implied by the
/// difficulty, and that share of the block rewards issued during the period is
/// returned, rounded to the satoshi.  The block reward is the one in force on
/// the settlement date.
pub fn calculate_yield(
    curtailed_energy_mwh: Decimal,
    model: MinerModel,
    difficulty: f64,
    settlement_date: Date,
) -> Result<Decimal> {
    validate_difficulty(difficulty)?;
    let energy = curtailed_energy_mwh
        .to_f64()
        .ok_or(Error::InvalidEnergy(f64::NAN))?;
    if !energy.is_finite() || energy < 0.0 {
        return Err(Error::InvalidEnergy(energy));
    }
    let reward = block_reward(settlement_date).to_f64().unwrap_or(0.0);

    let period_hours = SETTLEMENT_PERIOD_MINUTES / 60.0;
    let curtailed_kwh = energy * 1000.0;
    let miner_kwh = model.power() / 1000.0 * period_hours;
    let miners = (curtailed_kwh / miner_kwh).floor();

    let hashes_per_block = difficulty * 2f64.powi(32);
    let network_hash_rate = hashes_per_block / BLOCK_INTERVAL_SECONDS;
    let share = miners * model.hash_rate() / network_hash_rate;
    let blocks = SETTLEMENT_PERIOD_MINUTES * 60.0 / BLOCK_INTERVAL_SECONDS;

    let btc = share * reward * blocks;
    let btc = Decimal::from_f64(btc).ok_or(Error::InvalidEnergy(energy))?;
    Ok(btc.round_dp(BTC_DECIMALS))
}
