//! Value, timestamp and id extraction from raw records.
//!
//! Each data type has one extractor in a fixed table. An extractor tries a
//! short, ordered list of field names and returns the first numeric value.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use super::{DataType, RawRecord};

/// Pure function turning a raw record into a numeric observation.
pub type Extractor = fn(&RawRecord) -> Option<f64>;

/// Epoch values above this are treated as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e12;

fn earnings(record: &RawRecord) -> Option<f64> {
    first_numeric(record, &["netIncome", "value"])
}

fn revenue(record: &RawRecord) -> Option<f64> {
    first_numeric(record, &["revenue", "totalRevenue", "value"])
}

fn debt_ratio(record: &RawRecord) -> Option<f64> {
    first_numeric(record, &["debtToEquity", "value"])
}

fn profit_margin(record: &RawRecord) -> Option<f64> {
    first_numeric(record, &["netProfitMargin", "profitMargin", "value"])
}

fn roe(record: &RawRecord) -> Option<f64> {
    first_numeric(record, &["returnOnEquity", "roe", "value"])
}

fn economic_indicator(record: &RawRecord) -> Option<f64> {
    first_numeric(record, &["value", "actual"])
}

fn guidance(record: &RawRecord) -> Option<f64> {
    first_numeric(record, &["guidanceEps", "estimate", "value"])
}

/// Extractor for a data type.
pub fn extractor(data_type: DataType) -> Extractor {
    match data_type {
        DataType::Earnings => earnings,
        DataType::Revenue => revenue,
        DataType::DebtRatio => debt_ratio,
        DataType::ProfitMargin => profit_margin,
        DataType::Roe => roe,
        DataType::EconomicIndicator => economic_indicator,
        DataType::Guidance => guidance,
    }
}

/// Extract the numeric value of a record.
///
/// `value_field` comes from the source descriptor and takes precedence over
/// the per-type table.
pub fn extract_value(
    data_type: DataType,
    record: &RawRecord,
    value_field: Option<&str>,
) -> Option<f64> {
    match value_field {
        Some(field) => record.get(field).and_then(numeric),
        None => extractor(data_type)(record),
    }
}

fn first_numeric(record: &RawRecord, fields: &[&str]) -> Option<f64> {
    fields
        .iter()
        .find_map(|field| record.get(*field).and_then(numeric))
}

/// Numbers, or strings such as "1,234.5" and "12.5%".
fn numeric(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .trim_end_matches('%')
                .chars()
                .filter(|c| *c != ',')
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Parse the timestamp field of a record.
///
/// Accepts epoch seconds, epoch milliseconds, RFC 3339 strings and plain
/// `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_record_timestamp(record: &RawRecord, field: &str) -> Option<DateTime<Utc>> {
    match record.get(field)? {
        Value::Number(n) => from_epoch(n.as_f64()?),
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let millis = if raw.abs() >= EPOCH_MILLIS_THRESHOLD {
        raw
    } else {
        raw * 1000.0
    };
    Utc.timestamp_millis_opt(millis as i64).single()
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    s.parse::<f64>().ok().and_then(from_epoch)
}

/// Stable string id of a record; numbers are rendered without quotes.
pub fn record_id(record: &RawRecord, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_extraction_table_prefers_specific_fields() {
        let r = record(json!({ "netIncome": 120.5, "value": 1.0 }));
        assert_eq!(extract_value(DataType::Earnings, &r, None), Some(120.5));

        let r = record(json!({ "value": 7.0 }));
        assert_eq!(extract_value(DataType::Earnings, &r, None), Some(7.0));

        let r = record(json!({ "debtToEquity": "1.35" }));
        assert_eq!(extract_value(DataType::DebtRatio, &r, None), Some(1.35));

        let r = record(json!({ "totalRevenue": "1,250,000" }));
        assert_eq!(extract_value(DataType::Revenue, &r, None), Some(1_250_000.0));

        let r = record(json!({ "profitMargin": "12.5%" }));
        assert_eq!(extract_value(DataType::ProfitMargin, &r, None), Some(12.5));

        let r = record(json!({ "returnOnEquity": 18 }));
        assert_eq!(extract_value(DataType::Roe, &r, None), Some(18.0));

        let r = record(json!({ "actual": -0.3 }));
        assert_eq!(extract_value(DataType::EconomicIndicator, &r, None), Some(-0.3));

        let r = record(json!({ "estimate": 3.1 }));
        assert_eq!(extract_value(DataType::Guidance, &r, None), Some(3.1));
    }

    #[test]
    fn test_extraction_missing_or_invalid() {
        let r = record(json!({ "netIncome": null, "value": "n/a" }));
        assert_eq!(extract_value(DataType::Earnings, &r, None), None);

        let r = record(json!({ "unrelated": 1 }));
        assert_eq!(extract_value(DataType::Roe, &r, None), None);
    }

    #[test]
    fn test_value_field_override() {
        let r = record(json!({ "eps": 2.5, "netIncome": 900 }));
        assert_eq!(extract_value(DataType::Earnings, &r, Some("eps")), Some(2.5));
        assert_eq!(extract_value(DataType::Earnings, &r, Some("missing")), None);
    }

    #[test]
    fn test_parse_record_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();

        let r = record(json!({ "ts": "2024-01-15T00:00:00Z" }));
        assert_eq!(parse_record_timestamp(&r, "ts"), Some(expected));

        let r = record(json!({ "ts": "2024-01-15" }));
        assert_eq!(parse_record_timestamp(&r, "ts"), Some(expected));

        let r = record(json!({ "ts": expected.timestamp() }));
        assert_eq!(parse_record_timestamp(&r, "ts"), Some(expected));

        let r = record(json!({ "ts": expected.timestamp_millis() }));
        assert_eq!(parse_record_timestamp(&r, "ts"), Some(expected));

        let r = record(json!({ "ts": "yesterday" }));
        assert_eq!(parse_record_timestamp(&r, "ts"), None);
        assert_eq!(parse_record_timestamp(&r, "other"), None);
    }

    #[test]
    fn test_record_id() {
        let r = record(json!({ "id": "q4-2024", "seq": 42, "empty": "", "obj": {} }));
        assert_eq!(record_id(&r, "id").as_deref(), Some("q4-2024"));
        assert_eq!(record_id(&r, "seq").as_deref(), Some("42"));
        assert_eq!(record_id(&r, "empty"), None);
        assert_eq!(record_id(&r, "obj"), None);
    }
}
