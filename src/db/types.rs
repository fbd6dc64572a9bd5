//! Postgres row decoding.
//!
//! Rows are normalized to JSON maps (`column name -> value`) so results from
//! pooled queries, transactions and cursors share one shape.
//!
//! Queries without parameters travel over the simple protocol and return text
//! values; parameterized queries return binary values. Both must decode to the
//! same JSON, so decoding is two-phase:
//! 1. `TypeCategory` classifies the column's type name
//! 2. a category-specific decoder extracts the value
//!
//! A value no decoder understands is passed through as the server's text when
//! it arrived as text. A binary value that cannot be decoded becomes `null`
//! with a warning naming the column and its type.

use crate::models::Row as JsonRow;
use serde_json::Value as JsonValue;
use sqlx::postgres::types::{Oid, PgInterval};
use sqlx::postgres::{
    PgColumn, PgHasArrayType, PgRow, PgTypeInfo, PgTypeKind, PgValueFormat, PgValueRef,
};
use sqlx::types::BigDecimal;
use sqlx::types::ipnetwork::IpNetwork;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};
use std::fmt::Write as _;
use tracing::warn;

/// Logical category for Postgres column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Oid,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Interval,
    Network,
    Array,
    Unknown,
}

/// Classify a Postgres type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.ends_with("[]") {
        return TypeCategory::Array;
    }
    // Checked first: "numeric" would otherwise never reach the float arm
    if lower == "numeric" || lower == "decimal" {
        return TypeCategory::Decimal;
    }

    match lower.as_str() {
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "smallserial"
        | "serial" | "bigserial" => TypeCategory::Integer,
        "oid" => TypeCategory::Oid,
        "float4" | "float8" | "real" | "double precision" => TypeCategory::Float,
        "bool" | "boolean" => TypeCategory::Boolean,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "bytea" => TypeCategory::Binary,
        "timestamp" => TypeCategory::Timestamp,
        "timestamptz" => TypeCategory::TimestampTz,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        "interval" => TypeCategory::Interval,
        "inet" | "cidr" => TypeCategory::Network,
        "text" | "varchar" | "bpchar" | "char" | "name" | "citext" => TypeCategory::Text,
        _ => TypeCategory::Unknown,
    }
}

// Sign words of the binary NUMERIC header.
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_POS_INF: u16 = 0xD000;
const NUMERIC_NEG_INF: u16 = 0xF000;

/// Raw NUMERIC value kept as its exact textual representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name == "numeric" || name == "decimal"
    }
}

impl PgHasArrayType for RawDecimal {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("_numeric")
    }

    fn array_compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("numeric[]")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        if value.format() == PgValueFormat::Text {
            return Ok(RawDecimal(value.as_str()?.to_string()));
        }

        // Header: ndigits, weight, sign, dscale (all 16-bit big endian)
        let bytes = value.as_bytes()?;
        if bytes.len() < 8 {
            return Err("NUMERIC value is shorter than its header".into());
        }
        let sign = u16::from_be_bytes([bytes[4], bytes[5]]);
        let dscale = u16::from_be_bytes([bytes[6], bytes[7]]);
        match sign {
            NUMERIC_NAN => return Ok(RawDecimal("NaN".to_string())),
            NUMERIC_POS_INF => return Ok(RawDecimal("Infinity".to_string())),
            NUMERIC_NEG_INF => return Ok(RawDecimal("-Infinity".to_string())),
            _ => {}
        }

        // The digit groups alone lose the display scale: 12.50 would read
        // back as 12.5000.
        let decimal = <BigDecimal as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(decimal.with_scale(i64::from(dscale)).to_plain_string()))
    }
}

/// Encode binary data as base64 text.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    JsonValue::String(STANDARD.encode(bytes))
}

/// Render an interval the way the server does with `IntervalStyle = postgres`,
/// e.g. `1 year 2 mons 3 days 04:05:06`.
pub fn format_interval(months: i32, days: i32, microseconds: i64) -> String {
    let mut out = String::new();
    let mut is_zero = true;
    let mut is_before = false;

    for (value, unit) in [(months / 12, "year"), (months % 12, "mon"), (days, "day")] {
        if value == 0 {
            continue;
        }
        if !is_zero {
            out.push(' ');
        }
        if is_before && value > 0 {
            out.push('+');
        }
        let plural = if value != 1 { "s" } else { "" };
        let _ = write!(out, "{value} {unit}{plural}");
        is_before = value < 0;
        is_zero = false;
    }

    if is_zero || microseconds != 0 {
        if !is_zero {
            out.push(' ');
        }
        if microseconds < 0 {
            out.push('-');
        } else if is_before {
            out.push('+');
        }
        let abs = microseconds.unsigned_abs();
        let hours = abs / 3_600_000_000;
        let minutes = abs % 3_600_000_000 / 60_000_000;
        let seconds = abs % 60_000_000 / 1_000_000;
        let fraction = abs % 1_000_000;
        let _ = write!(out, "{hours:02}:{minutes:02}:{seconds:02}");
        if fraction != 0 {
            let digits = format!("{fraction:06}");
            out.push('.');
            out.push_str(digits.trim_end_matches('0'));
        }
    }

    out
}

/// Render an address the way the server does: `inet` hosts drop their prefix,
/// `cidr` values always carry it.
pub fn format_network(network: IpNetwork, is_cidr: bool) -> String {
    let host_prefix = if network.is_ipv4() { 32 } else { 128 };
    if !is_cidr && network.prefix() == host_prefix {
        network.ip().to_string()
    } else {
        network.to_string()
    }
}

/// Convert a result row to a JSON map.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .map(|col| (col.name().to_string(), decode_column(self, col)))
            .collect()
    }
}

fn decode_column(row: &PgRow, col: &PgColumn) -> JsonValue {
    let idx = col.ordinal();
    let type_name = col.type_info().name();

    let raw = match row.try_get_raw(idx) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(column = col.name(), pg_type = type_name, error = %e, "Failed to read column");
            return JsonValue::Null;
        }
    };
    if raw.is_null() {
        return JsonValue::Null;
    }

    let category = categorize_type(type_name);
    if let Some(value) = decode_value(row, idx, category, type_name) {
        return value;
    }

    match raw.format() {
        PgValueFormat::Text => match raw.as_str() {
            Ok(text) => JsonValue::String(text.to_string()),
            Err(e) => {
                warn!(column = col.name(), pg_type = type_name, error = %e, "Column is not UTF-8");
                JsonValue::Null
            }
        },
        // Enum labels travel as their text in both formats.
        PgValueFormat::Binary if matches!(raw.type_info().kind(), PgTypeKind::Enum(_)) => {
            raw.as_str()
                .map_or(JsonValue::Null, |label| JsonValue::String(label.to_string()))
        }
        PgValueFormat::Binary => {
            warn!(
                column = col.name(),
                pg_type = type_name,
                "No decoder for binary column value, returning null"
            );
            JsonValue::Null
        }
    }
}

fn decode_value(
    row: &PgRow,
    idx: usize,
    category: TypeCategory,
    type_name: &str,
) -> Option<JsonValue> {
    match category {
        TypeCategory::Decimal => decode_as::<RawDecimal>(row, idx).map(|v| JsonValue::String(v.0)),
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Oid => decode_as::<Oid>(row, idx).map(|v| JsonValue::Number(v.0.into())),
        TypeCategory::Boolean => decode_as::<bool>(row, idx).map(JsonValue::Bool),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Binary => decode_as::<Vec<u8>>(row, idx).map(|v| encode_binary_value(&v)),
        TypeCategory::Json => decode_as::<JsonValue>(row, idx),
        TypeCategory::Uuid => decode_as::<uuid::Uuid>(row, idx).map(|v| json_string(&v)),
        TypeCategory::Timestamp => {
            decode_as::<chrono::NaiveDateTime>(row, idx).map(|v| json_string(&v))
        }
        TypeCategory::TimestampTz => decode_as::<chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|v| JsonValue::String(v.to_rfc3339())),
        TypeCategory::Date => decode_as::<chrono::NaiveDate>(row, idx).map(|v| json_string(&v)),
        TypeCategory::Time => decode_as::<chrono::NaiveTime>(row, idx).map(|v| json_string(&v)),
        // Only the binary forms are decoded; text already reads like the server.
        TypeCategory::Interval => decode_as::<PgInterval>(row, idx).map(|v| {
            JsonValue::String(format_interval(v.months, v.days, v.microseconds))
        }),
        TypeCategory::Network => decode_as::<IpNetwork>(row, idx).map(|v| {
            JsonValue::String(format_network(v, type_name.eq_ignore_ascii_case("cidr")))
        }),
        TypeCategory::Array => decode_array(row, idx, type_name),
        TypeCategory::Text => decode_as::<String>(row, idx).map(JsonValue::String),
        TypeCategory::Unknown => None,
    }
}

fn json_string(value: &impl ToString) -> JsonValue {
    JsonValue::String(value.to_string())
}

/// Decode a non-null column, `None` when `T` cannot represent it.
fn decode_as<'r, T>(row: &'r PgRow, idx: usize) -> Option<T>
where
    T: Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

fn decode_integer(row: &PgRow, idx: usize) -> Option<JsonValue> {
    if let Some(v) = decode_as::<i16>(row, idx) {
        return Some(v.into());
    }
    if let Some(v) = decode_as::<i32>(row, idx) {
        return Some(v.into());
    }
    decode_as::<i64>(row, idx).map(JsonValue::from)
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn decode_float(row: &PgRow, idx: usize) -> Option<JsonValue> {
    decode_as::<f64>(row, idx)
        .or_else(|| decode_as::<f32>(row, idx).map(f64::from))
        .map(float_value)
}

/// One-dimensional arrays of the common element types. Anything else (and
/// multi-dimensional arrays) falls through to the raw value.
fn decode_array(row: &PgRow, idx: usize, type_name: &str) -> Option<JsonValue> {
    let element = type_name
        .get(..type_name.len().saturating_sub(2))
        .unwrap_or_default()
        .to_lowercase();

    match element.as_str() {
        "int2" => array_of::<i16>(row, idx, JsonValue::from),
        "int4" => array_of::<i32>(row, idx, JsonValue::from),
        "int8" => array_of::<i64>(row, idx, JsonValue::from),
        "oid" => array_of::<Oid>(row, idx, |v| JsonValue::from(v.0)),
        "float4" => array_of::<f32>(row, idx, |v| float_value(f64::from(v))),
        "float8" => array_of::<f64>(row, idx, float_value),
        "numeric" => array_of::<RawDecimal>(row, idx, |v| JsonValue::String(v.0)),
        "bool" => array_of::<bool>(row, idx, JsonValue::Bool),
        "text" | "varchar" | "bpchar" | "name" => array_of::<String>(row, idx, JsonValue::String),
        "uuid" => array_of::<uuid::Uuid>(row, idx, |v| json_string(&v)),
        "date" => array_of::<chrono::NaiveDate>(row, idx, |v| json_string(&v)),
        "timestamp" => array_of::<chrono::NaiveDateTime>(row, idx, |v| json_string(&v)),
        "timestamptz" => array_of::<chrono::DateTime<chrono::Utc>>(row, idx, |v| {
            JsonValue::String(v.to_rfc3339())
        }),
        "jsonb" | "json" => array_of::<JsonValue>(row, idx, |v| v),
        _ => None,
    }
}

fn array_of<T>(row: &PgRow, idx: usize, to_json: impl Fn(T) -> JsonValue) -> Option<JsonValue>
where
    T: for<'a> Decode<'a, sqlx::Postgres> + Type<sqlx::Postgres> + PgHasArrayType,
{
    let items = row.try_get::<Vec<Option<T>>, _>(idx).ok()?;
    Some(JsonValue::Array(
        items
            .into_iter()
            .map(|item| item.map_or(JsonValue::Null, &to_json))
            .collect(),
    ))
}
