//! Per-attribute value conversions
//!
//! The read and write transforms between the JSON values of the table API
//! and the driver-level [`CqlValue`] encodings. Documented normalizations:
//! `long` and `decimal` read back as strings, `varint` as a number,
//! timestamps as ISO-8601, and empty sets are indistinguishable from null
//! (the store treats them identically).
//!
//! Conversions are applied just before parameter binding on the write path
//! and after fetching on the read path. Hidden attributes (names starting
//! with `_`) are bound natively by the engine and never pass through here,
//! with the exception of the read-only `_ttl` decoration.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::driver::CqlValue;
use crate::error::{Result, SedimentError};
use crate::types::{parse_tid, AttributeType};

fn expected(ty: &AttributeType, got: &Value) -> SedimentError {
    SedimentError::Validation(format!("Expected {} value, got {}", ty, got))
}

/// Encode a JSON attribute value for binding
pub fn write_value(ty: &AttributeType, value: &Value) -> Result<CqlValue> {
    if value.is_null() {
        return Ok(CqlValue::Null);
    }
    match ty {
        AttributeType::Blob => match value {
            Value::String(s) => Ok(CqlValue::Blob(s.as_bytes().to_vec())),
            _ => Err(expected(ty, value)),
        },
        AttributeType::String => match value {
            Value::String(s) => Ok(CqlValue::Text(s.clone())),
            _ => Err(expected(ty, value)),
        },
        AttributeType::Int => value
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(CqlValue::Int)
            .ok_or_else(|| expected(ty, value)),
        AttributeType::Varint => match value {
            Value::Number(n) => n
                .as_i64()
                .map(CqlValue::Varint)
                .ok_or_else(|| expected(ty, value)),
            Value::String(s) => s
                .parse::<i64>()
                .map(CqlValue::Varint)
                .map_err(|_| expected(ty, value)),
            _ => Err(expected(ty, value)),
        },
        AttributeType::Long => match value {
            Value::Number(n) => n
                .as_i64()
                .map(CqlValue::Bigint)
                .ok_or_else(|| expected(ty, value)),
            Value::String(s) => s
                .parse::<i64>()
                .map(CqlValue::Bigint)
                .map_err(|_| expected(ty, value)),
            _ => Err(expected(ty, value)),
        },
        AttributeType::Decimal => match value {
            Value::Number(n) => Ok(CqlValue::Decimal(n.to_string())),
            Value::String(s) => Ok(CqlValue::Decimal(s.clone())),
            _ => Err(expected(ty, value)),
        },
        AttributeType::Double => value
            .as_f64()
            .map(CqlValue::Double)
            .ok_or_else(|| expected(ty, value)),
        AttributeType::Float => value
            .as_f64()
            .map(|f| CqlValue::Float(f as f32))
            .ok_or_else(|| expected(ty, value)),
        AttributeType::Boolean => value
            .as_bool()
            .map(CqlValue::Boolean)
            .ok_or_else(|| expected(ty, value)),
        AttributeType::Timestamp => match value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| CqlValue::Timestamp(dt.with_timezone(&Utc)))
                .map_err(|_| expected(ty, value)),
            Value::Number(n) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .map(CqlValue::Timestamp)
                .ok_or_else(|| expected(ty, value)),
            _ => Err(expected(ty, value)),
        },
        AttributeType::Timeuuid => match value {
            Value::String(s) => parse_tid(s).map(CqlValue::Timeuuid),
            _ => Err(expected(ty, value)),
        },
        AttributeType::Uuid => match value {
            Value::String(s) => Uuid::parse_str(s)
                .map(CqlValue::Uuid)
                .map_err(|_| expected(ty, value)),
            _ => Err(expected(ty, value)),
        },
        AttributeType::Json => Ok(CqlValue::Text(value.to_string())),
        AttributeType::Set(inner) => match value {
            Value::Array(items) if items.is_empty() => Ok(CqlValue::Null),
            Value::Array(items) => {
                let elems = items
                    .iter()
                    .map(|v| write_value(inner, v))
                    .collect::<Result<Vec<_>>>()?;
                Ok(CqlValue::Set(elems))
            }
            _ => Err(expected(ty, value)),
        },
    }
}

/// Decode a fetched value back into its JSON form
pub fn read_value(ty: &AttributeType, value: CqlValue) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match (ty, value) {
        (AttributeType::Blob, CqlValue::Blob(bytes)) => match String::from_utf8(bytes) {
            Ok(s) => Value::String(s),
            Err(e) => Value::String(STANDARD.encode(e.as_bytes())),
        },
        (AttributeType::Json, CqlValue::Text(s)) => {
            serde_json::from_str(&s).unwrap_or(Value::Null)
        }
        (AttributeType::Long, CqlValue::Bigint(i)) => Value::String(i.to_string()),
        (AttributeType::Decimal, CqlValue::Decimal(s)) => Value::String(s),
        (AttributeType::Varint, CqlValue::Varint(i)) => Value::from(i),
        (AttributeType::Timestamp, CqlValue::Timestamp(dt)) => {
            Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        (_, CqlValue::Timeuuid(u)) | (_, CqlValue::Uuid(u)) => Value::String(u.to_string()),
        (AttributeType::Set(inner), CqlValue::Set(items)) => {
            Value::Array(items.into_iter().map(|v| read_value(inner, v)).collect())
        }
        (_, CqlValue::Text(s)) => Value::String(s),
        (_, CqlValue::Int(i)) => Value::from(i),
        (_, CqlValue::Bigint(i)) => Value::from(i),
        (_, CqlValue::Varint(i)) => Value::from(i),
        (_, CqlValue::Double(f)) => Value::from(f),
        (_, CqlValue::Float(f)) => Value::from(f as f64),
        (_, CqlValue::Boolean(b)) => Value::Bool(b),
        (_, CqlValue::Decimal(s)) => Value::String(s),
        (_, CqlValue::Timestamp(dt)) => {
            Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        (_, CqlValue::Blob(bytes)) => Value::String(STANDARD.encode(bytes)),
        (_, CqlValue::Set(items)) => Value::Array(
            items
                .into_iter()
                .map(|v| read_value(&AttributeType::String, v))
                .collect(),
        ),
        (_, CqlValue::Null) => Value::Null,
    }
}
