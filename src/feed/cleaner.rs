use crate::models::{FeedRecord, NewObservation};

// ── Date normalization ────────────────────────────────────────────────────────

/// Rewrite a feed arrival date to `YYYY-MM-DD`.
///
/// The feed serves either `DD/MM/YYYY` or already-canonical `YYYY-MM-DD`.
/// Slash dates are reordered; dash dates pass through untouched; anything
/// else yields `None` — an absent date, not an error. No calendar validation
/// happens here: `99/99/2024` comes out as `2024-99-99`. Matches the feed's
/// own looseness, so the store keeps whatever the provider sent.
pub fn normalize_arrival_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.contains('/') {
        let mut parts = raw.splitn(3, '/');
        let day = parts.next()?;
        let month = parts.next()?;
        let year = parts.next()?;
        return Some(format!("{year}-{month}-{day}"));
    }

    if raw.contains('-') {
        return Some(raw.to_string());
    }

    None
}

// ── State filter ──────────────────────────────────────────────────────────────

/// Keep only records for the target state. Exact, case-sensitive match —
/// the feed's own casing convention. Order is preserved, nothing is deduped.
pub fn filter_state(records: Vec<FeedRecord>, state: &str) -> Vec<FeedRecord> {
    records
        .into_iter()
        .filter(|r| r.state.as_deref() == Some(state))
        .collect()
}

// ── Numeric parsing ───────────────────────────────────────────────────────────

/// Parse a feed numeric: strip everything except digits, dot, minus.
/// "Rs 1,250.00" → 1250.0 | "1400" → 1400.0 | "N/A" → None
pub fn parse_price(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s == "NA" || s == "N/A" || s == "-" || s == "—" {
        return None;
    }
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse().ok()
}

// ── FeedRecord → NewObservation ───────────────────────────────────────────────

/// Shape a raw record into a fact row. Prices stay optional; absent arrival
/// quantity defaults to zero per the feed's convention.
pub fn record_to_observation(rec: &FeedRecord) -> NewObservation {
    NewObservation {
        commodity: rec.commodity.as_deref().unwrap_or("").trim().to_string(),
        variety: rec.variety.as_deref().unwrap_or("").trim().to_string(),
        min_price: rec.min_price.as_deref().and_then(parse_price),
        modal_price: rec.modal_price.as_deref().and_then(parse_price),
        max_price: rec.max_price.as_deref().and_then(parse_price),
        arrivals_tonnes: rec
            .arrivals_in_tonnes
            .as_deref()
            .and_then(parse_price)
            .unwrap_or(0.0),
        observed_on: rec.arrival_date.as_deref().and_then(normalize_arrival_date),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(state: &str, market: &str) -> FeedRecord {
        FeedRecord {
            state: Some(state.to_string()),
            district: Some("Coimbatore".to_string()),
            market: Some(market.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_slash_dates_reorder_to_iso() {
        assert_eq!(
            normalize_arrival_date("05/03/2024").as_deref(),
            Some("2024-03-05")
        );
        assert_eq!(
            normalize_arrival_date("31/12/2023").as_deref(),
            Some("2023-12-31")
        );
    }

    #[test]
    fn test_dash_dates_pass_through() {
        assert_eq!(
            normalize_arrival_date("2024-03-05").as_deref(),
            Some("2024-03-05")
        );
    }

    #[test]
    fn test_unrecognized_dates_are_absent() {
        assert_eq!(normalize_arrival_date(""), None);
        assert_eq!(normalize_arrival_date("   "), None);
        assert_eq!(normalize_arrival_date("yesterday"), None);
        assert_eq!(normalize_arrival_date("05/03"), None);
    }

    #[test]
    fn test_no_calendar_validation() {
        // Deliberate: component order changes, values are not inspected.
        assert_eq!(
            normalize_arrival_date("99/99/2024").as_deref(),
            Some("2024-99-99")
        );
    }

    #[test]
    fn test_filter_state_keeps_order() {
        let records = vec![
            rec("Tamil Nadu", "Karamadai"),
            rec("Kerala", "Palakkad"),
            rec("Tamil Nadu", "Oddanchatram"),
            rec("tamil nadu", "WrongCase"),
        ];
        let kept = filter_state(records, "Tamil Nadu");
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].market.as_deref(), Some("Karamadai"));
        assert_eq!(kept[1].market.as_deref(), Some("Oddanchatram"));
    }

    #[test]
    fn test_filter_state_no_matches() {
        let records = vec![rec("Kerala", "Palakkad")];
        assert!(filter_state(records, "Tamil Nadu").is_empty());
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("1250"), Some(1250.0));
        assert_eq!(parse_price("Rs 1,250.50"), Some(1250.5));
        assert_eq!(parse_price("NA"), None);
        assert_eq!(parse_price(""), None);
    }

    #[test]
    fn test_record_to_observation_defaults() {
        let raw = FeedRecord {
            commodity: Some(" Tomato ".to_string()),
            modal_price: Some("1250".to_string()),
            arrival_date: Some("05/03/2024".to_string()),
            ..Default::default()
        };
        let obs = record_to_observation(&raw);
        assert_eq!(obs.commodity, "Tomato");
        assert_eq!(obs.variety, "");
        assert_eq!(obs.modal_price, Some(1250.0));
        assert_eq!(obs.min_price, None);
        assert_eq!(obs.arrivals_tonnes, 0.0);
        assert_eq!(obs.observed_on.as_deref(), Some("2024-03-05"));
    }
}
