//! Query-related data models.
//!
//! This module defines parameter values, query templates and normalized results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single result row, keyed by column name.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Arbitrary JSON, bound as `jsonb`
    Json(JsonValue),
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// SQL text plus its positional parameter values.
///
/// `query` may still contain `{{ ... }}` macro blocks until it has been run
/// through [`crate::template::compile`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlTemplate {
    pub query: String,
    #[serde(default)]
    pub values: Vec<QueryParam>,
}

impl SqlTemplate {
    /// A template with no parameters.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            values: Vec::new(),
        }
    }

    /// A template with positional parameters (`$1..$N`).
    pub fn with_values(query: impl Into<String>, values: Vec<QueryParam>) -> Self {
        Self {
            query: query.into(),
            values,
        }
    }
}

impl From<&str> for SqlTemplate {
    fn from(query: &str) -> Self {
        Self::new(query)
    }
}

/// Normalized query result: the row count reported by the server and the rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub row_count: u64,
    pub rows: Vec<Row>,
}

impl QueryOutput {
    /// Result of a statement that returns no rows.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Check if the result contains no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Diagnostic snapshot of the most recent statement issued on a lease.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub issued_at: DateTime<Utc>,
}

impl QuerySnapshot {
    pub fn new(sql: &str, params: &[QueryParam]) -> Self {
        Self {
            sql: sql.to_string(),
            params: params.to_vec(),
            issued_at: Utc::now(),
        }
    }
}
