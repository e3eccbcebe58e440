use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::info;
use serde::Deserialize;

use crate::error::Result;
use crate::model::Observation;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BmuUnit {
    pub elexon_bm_unit: String,
    pub lead_party_name: Option<String>,
    pub fuel_type: Option<String>,
}

/// Balancing mechanism units known to be wind farms, from a JSON file of
/// `{elexonBmUnit, leadPartyName, fuelType}` entries.
#[derive(Debug, Clone, Default)]
pub struct BmuMapping {
    units: HashMap<String, BmuUnit>,
}

impl BmuMapping {
    pub fn from_json(json: &str) -> Result<BmuMapping> {
        let all: Vec<BmuUnit> = serde_json::from_str(json)?;
        let units: HashMap<String, BmuUnit> = all
            .into_iter()
            .filter(|u| {
                u.fuel_type
                    .as_deref()
                    .map_or(true, |f| f.eq_ignore_ascii_case("wind"))
            })
            .map(|u| (u.elexon_bm_unit.clone(), u))
            .collect();
        Ok(BmuMapping { units })
    }

    pub fn load(path: &Path) -> Result<BmuMapping> {
        let mapping = BmuMapping::from_json(&fs::read_to_string(path)?)?;
        info!("loaded {} wind units from {}", mapping.len(), path.display());
        Ok(mapping)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, bm_unit: &str) -> Option<&BmuUnit> {
        self.units.get(bm_unit)
    }

    /// Drop the observations of units not in the mapping, and fill in the
    /// lead party name where the API left it out.
    pub fn filter(&self, observations: Vec<Observation>) -> Vec<Observation> {
        observations
            .into_iter()
            .filter_map(|mut obs| {
                let unit = self.units.get(&obs.farm_id)?;
                if obs.lead_party_name.is_none() {
                    obs.lead_party_name = unit.lead_party_name.clone();
                }
                Some(obs)
            })
            .collect()
    }
}
