use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::normalize::ParkingCategory;

/// Row identifier as the store hands it back: bigint or text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(value) => write!(f, "{value}"),
            RecordId::Text(value) => f.write_str(value),
        }
    }
}

/// A queued reference to one external listing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Owner {
    pub id: RecordId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub parsed: Option<bool>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub status: Option<bool>,
}

impl Owner {
    #[cfg(test)]
    pub fn new(id: i64, url: impl Into<String>) -> Self {
        Self {
            id: RecordId::Int(id),
            url: Some(url.into()),
            parsed: Some(false),
            status: None,
        }
    }

    /// The source URL, if the owner carries a usable one.
    pub fn source_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// `parsed` and `status` arrive as booleans, `"true"`/`"FALSE"` strings or null.
fn lenient_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Bool(flag)) => Some(flag),
        Some(Value::String(text)) => match text.trim().to_lowercase().as_str() {
            "true" | "t" | "1" => Some(true),
            "false" | "f" | "0" => Some(false),
            _ => None,
        },
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0),
        _ => None,
    })
}

/// The normalized record written to the `objects` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalListing {
    pub owners_id: RecordId,
    pub address: String,
    pub description: String,
    pub floor: Option<i64>,
    pub total_floors: Option<i64>,
    pub rooms: Option<i64>,
    pub agent_id: i64,
    pub main_photo_index: usize,
    pub main_photo_url: Option<String>,
    pub photos_json: Option<Map<String, Value>>,
    pub complex_name: Option<String>,
    pub promotion_type: &'static str,
    pub promotion_bet: Option<f64>,
    pub price: Option<f64>,
    pub deposit: Option<f64>,
    pub prepayment: f64,
    pub conditioner: bool,
    pub bathtub: bool,
    pub shower: bool,
    pub total_area: Option<f64>,
    pub living_area: Option<f64>,
    pub kitchen_area: Option<f64>,
    pub combined_bathroom: Option<u32>,
    pub separate_bathroom: Option<u32>,
    pub balconies: Option<i64>,
    pub loggias: Option<i64>,
    pub ceiling_height: Option<i64>,
    pub parking: Option<ParkingCategory>,
    pub status: &'static str,
    #[serde(rename = "type")]
    pub property_type: &'static str,
    pub cian_url: String,
    pub children: bool,
    pub pets: bool,
    pub layout: &'static str,
    pub repair: &'static str,
    pub windowtype: &'static str,
    pub termtype: &'static str,
    pub utilites: &'static str,
    pub fridge: bool,
    pub washer: bool,
    pub tv: bool,
    pub internet: bool,
    pub furniture: bool,
    pub kitchenfurniture: bool,
    pub passenger_elevator: u8,
    pub freight_elevator: u8,
    pub category: &'static str,
}

/// Identifiers requested back from a listing insert.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InsertedListing {
    #[serde(default)]
    pub id: Option<RecordId>,
    #[serde(default)]
    pub external_id: Option<RecordId>,
}

/// Outcome of one batch run, consumed by the summary notifier.
#[derive(Debug, Default)]
pub struct CycleResult {
    pub total_owners: usize,
    pub processed_count: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
