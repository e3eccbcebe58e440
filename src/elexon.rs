pub mod bmu;

use std::time::Duration;

use jiff::civil::Date;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::elexon::bmu::BmuMapping;
use crate::error::{Error, Result};
use crate::ingest::CurtailmentSource;
use crate::model::Observation;

pub const DEFAULT_BASE_URL: &str = "https://data.elexon.co.uk/bmrs/api/v1";

/// One accepted bid of the settlement stack.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackItem {
    id: String,
    lead_party_name: Option<String>,
    volume: Decimal,
    original_price: Decimal,
    final_price: Decimal,
    so_flag: Option<bool>,
    cadl_flag: Option<bool>,
}

impl From<StackItem> for Observation {
    fn from(item: StackItem) -> Self {
        Observation {
            farm_id: item.id,
            lead_party_name: item.lead_party_name,
            volume: item.volume,
            original_price: item.original_price,
            final_price: item.final_price,
            so_flag: item.so_flag.unwrap_or(false),
            cadl_flag: item.cadl_flag.unwrap_or(false),
        }
    }
}

/// Parse the body of a bid stack response.  Items that don't have the
/// expected shape are logged and left out.
pub fn parse_stack(body: &str, date: Date, period: u8) -> Result<Vec<Observation>> {
    let value: Value = serde_json::from_str(body)?;
    let Some(items) = value.get("data").and_then(|d| d.as_array()) else {
        return Err(Error::MalformedRecord {
            date,
            period,
            reason: "response has no data array".to_string(),
        });
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<StackItem>(item.clone()) {
            Ok(item) => out.push(item.into()),
            Err(e) => warn!(
                "skipping malformed item for {} period {}: {} ({})",
                date, period, e, item
            ),
        }
    }
    Ok(out)
}

/// Client for the Elexon BMRS settlement stack.
pub struct ElexonClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    mapping: Option<BmuMapping>,
}

impl ElexonClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<ElexonClient> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("curtail/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ElexonClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            mapping: None,
        })
    }

    /// Keep only the wind units of the mapping.
    pub fn with_mapping(mut self, mapping: BmuMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn stack_url(&self, date: Date, period: u8) -> String {
        format!(
            "{}/balancing/settlement/stack/all/bid/{}/{}",
            self.base_url, date, period
        )
    }

    async fn get(&self, url: &str) -> Result<String> {
        let mut builder = self.client.get(url);
        if let Some(key) = &self.api_key {
            builder = builder.query(&[("apiKey", key)]);
        }
        let response = builder.send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.text().await?),
            StatusCode::TOO_MANY_REQUESTS => Err(Error::RateLimited {
                url: url.to_string(),
            }),
            status => Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }
}

impl CurtailmentSource for ElexonClient {
    async fn fetch(&self, date: Date, period: u8) -> Result<Vec<Observation>> {
        let url = self.stack_url(date, period);
        let body = self.get(&url).await?;
        let observations = parse_stack(&body, date, period)?;
        let n = observations.len();
        let observations = match &self.mapping {
            Some(mapping) => mapping.filter(observations),
            None => observations,
        };
        debug!(
            "{} period {}: {} items, {} kept",
            date,
            period,
            n,
            observations.len()
        );
        Ok(observations)
    }
}
