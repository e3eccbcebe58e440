use jiff::civil::Date;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::eligibility::Eligibility;
use crate::interval::month::Month;
use crate::mining::MinerModel;

/// Energy curtailed at one farm (BMU) during one settlement period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurtailmentRecord {
    pub settlement_date: Date,
    pub settlement_period: u8,
    pub farm_id: String,
    pub lead_party_name: Option<String>,
    /// MWh, negative for curtailment
    pub volume: Decimal,
    pub original_price: Decimal,
    pub final_price: Decimal,
    /// Cost of the curtailment, positive when the farm is paid to turn down
    pub payment: Decimal,
    pub so_flag: bool,
    pub cadl_flag: bool,
}

impl CurtailmentRecord {
    pub fn is_eligible(&self, rule: Eligibility) -> bool {
        rule.is_eligible(self.volume, self.so_flag, self.cadl_flag)
    }

    /// Curtailed energy in MWh, as a positive number.
    pub fn curtailed_energy(&self) -> Decimal {
        self.volume.abs()
    }
}

/// One observation as returned by the settlement API for a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub farm_id: String,
    pub lead_party_name: Option<String>,
    pub volume: Decimal,
    pub original_price: Decimal,
    pub final_price: Decimal,
    pub so_flag: bool,
    pub cadl_flag: bool,
}

/// Hypothetical mining yield of one curtailment record with one miner model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitcoinCalculation {
    pub settlement_date: Date,
    pub settlement_period: u8,
    pub farm_id: String,
    pub miner_model: MinerModel,
    pub curtailed_energy: Decimal,
    pub bitcoin_mined: Decimal,
    /// Network difficulty used for the calculation
    pub difficulty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub summary_date: Date,
    pub total_curtailed_energy: Decimal,
    pub total_payment: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySummary {
    pub year_month: Month,
    pub total_curtailed_energy: Decimal,
    pub total_payment: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearlySummary {
    pub year: i16,
    pub total_curtailed_energy: Decimal,
    pub total_payment: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitcoinDailySummary {
    pub summary_date: Date,
    pub miner_model: MinerModel,
    pub bitcoin_mined: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitcoinMonthlySummary {
    pub year_month: Month,
    pub miner_model: MinerModel,
    pub bitcoin_mined: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitcoinYearlySummary {
    pub year: i16,
    pub miner_model: MinerModel,
    pub bitcoin_mined: Decimal,
}
