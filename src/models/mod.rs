use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

// ── Feed payload ──────────────────────────────────────────────────────────────

/// Envelope of the data.gov.in bulk response.
///
/// A payload without a `records` array is malformed; the client treats that
/// as a terminal fetch failure rather than an empty page.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedEnvelope {
    #[serde(default)]
    pub records: Option<Vec<FeedRecord>>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// One raw record as served by the feed. Untrusted: every field may be
/// absent, and the numeric fields arrive as strings more often than not.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FeedRecord {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub commodity: Option<String>,
    #[serde(default)]
    pub variety: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub min_price: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub modal_price: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub max_price: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub arrivals_in_tonnes: Option<String>,
    #[serde(default)]
    pub arrival_date: Option<String>,
}

/// Accepts `"1250"`, `1250` or `1250.5` alike; the cleaner does the real
/// numeric parsing in one place.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

// ── Market dimension ──────────────────────────────────────────────────────────

/// A physical marketplace, resolved once per (state, district, market_name)
/// triple and referenced by every price observation taken there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Market {
    pub id: i64,
    pub state: String,
    pub district: String,
    pub market_name: String,
    pub address: Option<String>,
    pub contact_phone: Option<String>,
    pub last_seen_at: NaiveDateTime,
}

// ── Price observation fact ────────────────────────────────────────────────────

/// An observation ready to be appended; the market id is supplied by the
/// resolver at write time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewObservation {
    pub commodity: String,
    pub variety: String,
    pub min_price: Option<f64>,
    pub modal_price: Option<f64>,
    pub max_price: Option<f64>,
    pub arrivals_tonnes: f64,
    /// Canonical `YYYY-MM-DD` string, or `None` when the feed date could not
    /// be interpreted. Never a reason to drop the record.
    pub observed_on: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceObservation {
    pub id: i64,
    pub market_id: i64,
    pub commodity: String,
    pub variety: String,
    pub min_price: Option<f64>,
    pub modal_price: Option<f64>,
    pub max_price: Option<f64>,
    pub arrivals_tonnes: f64,
    pub observed_on: Option<String>,
    pub created_at: NaiveDateTime,
}

// ── Ingest run log ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IngestRun {
    pub id: i64,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub status: String,
    pub attempted: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub error_msg: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_with_numeric_fields_as_numbers() {
        let body = r#"{
            "total": 1,
            "records": [{
                "state": "Tamil Nadu",
                "district": "Coimbatore",
                "market": "Karamadai",
                "commodity": "Tomato",
                "min_price": 1000,
                "modal_price": "1250",
                "max_price": 1400.5,
                "arrival_date": "05/03/2024"
            }]
        }"#;

        let env: FeedEnvelope = serde_json::from_str(body).unwrap();
        let records = env.records.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].min_price.as_deref(), Some("1000"));
        assert_eq!(records[0].modal_price.as_deref(), Some("1250"));
        assert_eq!(records[0].max_price.as_deref(), Some("1400.5"));
        assert_eq!(records[0].variety, None);
        assert_eq!(records[0].arrivals_in_tonnes, None);
    }

    #[test]
    fn test_envelope_missing_records_is_none() {
        let env: FeedEnvelope = serde_json::from_str(r#"{"total": 0}"#).unwrap();
        assert!(env.records.is_none());
    }

    #[test]
    fn test_record_with_null_fields() {
        let body = r#"{"state": "Tamil Nadu", "market": null, "modal_price": null}"#;
        let rec: FeedRecord = serde_json::from_str(body).unwrap();
        assert_eq!(rec.state.as_deref(), Some("Tamil Nadu"));
        assert_eq!(rec.market, None);
        assert_eq!(rec.modal_price, None);
    }
}
