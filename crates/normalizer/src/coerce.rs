//! Value coercion rules.
//!
//! `Ok(None)` means "missing" (JSON null or a blank string); `Err(())` means
//! the value is present but cannot be read as the requested type.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;

use signalhub_core::AttrValue;

use crate::mapping::FieldType;

pub(crate) fn coerce(value: &JsonValue, field_type: FieldType) -> Result<Option<AttrValue>, ()> {
    if let JsonValue::String(s) = value {
        if s.trim().is_empty() {
            return Ok(None);
        }
    }
    if value.is_null() {
        return Ok(None);
    }

    let coerced = match field_type {
        FieldType::Int => to_int(value).map(AttrValue::Int),
        FieldType::Float => to_float(value).map(AttrValue::Float),
        FieldType::Bool => to_bool(value).map(AttrValue::Bool),
        FieldType::Text => to_text(value).map(AttrValue::Text),
        FieldType::Date => to_date(value).map(AttrValue::Date),
        FieldType::Timestamp => to_timestamp(value).map(AttrValue::Timestamp),
    };
    coerced.map(Some).ok_or(())
}

fn to_int(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64).map(|f| f as i64)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            })
        }
        JsonValue::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn to_float(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn to_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn to_date(value: &JsonValue) -> Option<NaiveDate> {
    let s = value.as_str()?.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc).date_naive()))
        .or_else(|| parse_naive_datetime(s).map(|t| t.date()))
}

fn to_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        // Epoch milliseconds.
        JsonValue::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        JsonValue::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc))
                .or_else(|| parse_naive_datetime(s).map(|t| Utc.from_utc_datetime(&t)))
                .or_else(|| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|t| Utc.from_utc_datetime(&t))
                })
        }
        _ => None,
    }
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}
