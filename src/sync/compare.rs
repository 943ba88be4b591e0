//! Field comparison for the upsert decision
//!
//! Stored values went through a JSON round trip and upstream values arrive in
//! whatever shape the API chose, so equality is decided per field by a
//! declared comparator rather than by raw `Value` equality.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How two values of one field are compared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldComparator {
    /// Raw JSON equality
    #[default]
    Exact,
    /// Numbers, numeric strings and booleans compared as f64
    Numeric,
    /// Instants compared after parsing common timestamp formats
    Timestamp,
    /// Booleans, 0/1 and "true"/"false"/"yes"/"no"
    Boolean,
    /// Strings compared after trimming; null equals ""
    Text,
    /// Arrays compared as multisets
    UnorderedList,
}

impl FieldComparator {
    /// Whether two field values are semantically equal
    ///
    /// A missing field and an explicit null are always equal.
    pub fn equals(&self, stored: Option<&Value>, incoming: Option<&Value>) -> bool {
        let stored = stored.unwrap_or(&Value::Null);
        let incoming = incoming.unwrap_or(&Value::Null);

        if stored == incoming {
            return true;
        }

        match self {
            FieldComparator::Exact => false,
            FieldComparator::Numeric => match (as_number(stored), as_number(incoming)) {
                (Some(a), Some(b)) => (a - b).abs() < 1e-9,
                _ => false,
            },
            FieldComparator::Timestamp => match (as_instant(stored), as_instant(incoming)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            FieldComparator::Boolean => match (as_bool(stored), as_bool(incoming)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            FieldComparator::Text => match (as_text(stored), as_text(incoming)) {
                (Some(a), Some(b)) => a.trim() == b.trim(),
                _ => false,
            },
            FieldComparator::UnorderedList => unordered_eq(stored, incoming),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse an instant from a string or a unix timestamp in seconds
fn as_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Value::String(s) => parse_instant(s.trim()),
        _ => None,
    }
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    // Naive formats are taken as UTC
    let naive = s.trim_end_matches('Z');
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(dt.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn unordered_eq(a: &Value, b: &Value) -> bool {
    let empty = Vec::new();
    let (a, b) = match (a, b) {
        (Value::Array(a), Value::Array(b)) => (a, b),
        (Value::Null, Value::Array(b)) => (&empty, b),
        (Value::Array(a), Value::Null) => (a, &empty),
        _ => return false,
    };

    if a.len() != b.len() {
        return false;
    }

    let mut remaining: Vec<&Value> = b.iter().collect();
    for item in a {
        match remaining.iter().position(|candidate| *candidate == item) {
            Some(pos) => {
                remaining.swap_remove(pos);
            }
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eq(cmp: FieldComparator, a: Value, b: Value) -> bool {
        cmp.equals(Some(&a), Some(&b))
    }

    #[test]
    fn test_missing_and_null_are_equal_for_every_comparator() {
        for cmp in [
            FieldComparator::Exact,
            FieldComparator::Numeric,
            FieldComparator::Timestamp,
            FieldComparator::Boolean,
            FieldComparator::Text,
            FieldComparator::UnorderedList,
        ] {
            assert!(cmp.equals(None, Some(&Value::Null)));
            assert!(cmp.equals(Some(&Value::Null), None));
            assert!(cmp.equals(None, None));
        }
    }

    #[test]
    fn test_exact() {
        assert!(eq(FieldComparator::Exact, json!("a"), json!("a")));
        assert!(!eq(FieldComparator::Exact, json!(1), json!("1")));
    }

    #[test]
    fn test_numeric_shapes() {
        assert!(eq(FieldComparator::Numeric, json!(1), json!(1.0)));
        assert!(eq(FieldComparator::Numeric, json!(1), json!("1")));
        assert!(eq(FieldComparator::Numeric, json!(" 2.50 "), json!(2.5)));
        assert!(!eq(FieldComparator::Numeric, json!(1), json!(2)));
        assert!(!eq(FieldComparator::Numeric, json!("abc"), json!(0)));
        assert!(!eq(FieldComparator::Numeric, json!(0), Value::Null));
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(eq(
            FieldComparator::Timestamp,
            json!("2024-06-01T00:00:00Z"),
            json!("2024-06-01 00:00:00")
        ));
        assert!(eq(
            FieldComparator::Timestamp,
            json!("2024-06-01T02:00:00+02:00"),
            json!("2024-06-01T00:00:00Z")
        ));
        assert!(eq(
            FieldComparator::Timestamp,
            json!("2024-06-01T00:00:00.000Z"),
            json!("2024-06-01")
        ));
        assert!(eq(
            FieldComparator::Timestamp,
            json!(1717200000),
            json!("2024-06-01T00:00:00Z")
        ));
        assert!(!eq(
            FieldComparator::Timestamp,
            json!("2024-06-01T00:00:01Z"),
            json!("2024-06-01 00:00:00")
        ));
        assert!(!eq(
            FieldComparator::Timestamp,
            json!("not a date"),
            json!("2024-06-01")
        ));
    }

    #[test]
    fn test_boolean_shapes() {
        assert!(eq(FieldComparator::Boolean, json!(true), json!(1)));
        assert!(eq(FieldComparator::Boolean, json!(false), json!("no")));
        assert!(eq(FieldComparator::Boolean, json!("TRUE"), json!("yes")));
        assert!(!eq(FieldComparator::Boolean, json!(true), json!(false)));
        assert!(!eq(FieldComparator::Boolean, json!("maybe"), json!(true)));
    }

    #[test]
    fn test_text_trims_and_treats_null_as_empty() {
        assert!(eq(FieldComparator::Text, json!(" Ada "), json!("Ada")));
        assert!(eq(FieldComparator::Text, Value::Null, json!("")));
        assert!(eq(FieldComparator::Text, json!(5), json!("5")));
        assert!(!eq(FieldComparator::Text, json!("Ada"), json!("ada")));
    }

    #[test]
    fn test_unordered_list() {
        assert!(eq(
            FieldComparator::UnorderedList,
            json!([1, 2, 3]),
            json!([3, 1, 2])
        ));
        assert!(eq(FieldComparator::UnorderedList, Value::Null, json!([])));
        assert!(!eq(
            FieldComparator::UnorderedList,
            json!([1, 1, 2]),
            json!([1, 2, 2])
        ));
        assert!(!eq(FieldComparator::UnorderedList, json!([1]), json!([1, 1])));
        assert!(!eq(FieldComparator::UnorderedList, json!("x"), json!(["x"])));
    }
}
