//! # Shared Context Record
//!
//! Per-thread business state that handlers act on. Only tools and hydration
//! callbacks mutate it; everything else reads it through
//! [`SharedContext::public_view`], which is the only shape allowed to leave the
//! process.
//!
//! The public view hides `itinerary`, `baggage_claim_id`,
//! `compensation_case_id` and `scenario`, and drops `vouchers` until at least
//! one voucher has been granted. Unset public fields are present as `null` so
//! observers see a stable key set.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys never exposed outside the process.
pub const HIDDEN_KEYS: [&str; 4] = [
    "itinerary",
    "baggage_claim_id",
    "compensation_case_id",
    "scenario",
];

/// One flight leg of an itinerary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItinerarySegment {
    pub flight_number: String,
    pub origin: String,
    pub destination: String,
    pub departure: String,
    pub arrival: String,
    pub status: String,
    pub gate: String,
}

/// Business state shared by every handler of a thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    pub passenger_name: Option<String>,
    pub confirmation_number: Option<String>,
    pub seat_number: Option<String>,
    pub flight_number: Option<String>,
    pub account_number: Option<String>,
    pub itinerary: Option<Vec<ItinerarySegment>>,
    pub baggage_claim_id: Option<String>,
    pub compensation_case_id: Option<String>,
    pub scenario: Option<String>,
    pub vouchers: Option<Vec<String>>,
    pub special_service_note: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filtered view for observers.
    pub fn public_view(&self) -> Map<String, Value> {
        let mut data = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for key in HIDDEN_KEYS {
            data.remove(key);
        }
        let has_vouchers = matches!(data.get("vouchers"), Some(Value::Array(v)) if !v.is_empty());
        if !has_vouchers {
            data.remove("vouchers");
        }
        data
    }
}

/// Keys whose value differs between two public views.
///
/// A key present before but gone after is reported as `null`.
pub fn diff_public(before: &Map<String, Value>, after: &Map<String, Value>) -> Map<String, Value> {
    let mut changes = Map::new();
    for (key, value) in after {
        if before.get(key) != Some(value) {
            changes.insert(key.clone(), value.clone());
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            changes.insert(key.clone(), Value::Null);
        }
    }
    changes
}
