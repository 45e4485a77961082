//! Dynamic values exchanged between models, converters and the database.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The declared in-memory type of a model property.
///
/// The Schema Mapper infers a database type from this when a column does not
/// override it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    String,
    Bool,
    Int,
    Long,
    Float,
    Double,
    /// A zone-aware timestamp, stored as UTC.
    ZonedDateTime,
    /// A wall-clock timestamp without zone, interpreted as UTC.
    LocalDateTime,
    LocalDate,
    List,
    Map,
    /// A JSON-encodable object that is neither a list nor a map.
    Object,
    Enum,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String => "String",
            ValueKind::Bool => "Bool",
            ValueKind::Int => "Int",
            ValueKind::Long => "Long",
            ValueKind::Float => "Float",
            ValueKind::Double => "Double",
            ValueKind::ZonedDateTime => "ZonedDateTime",
            ValueKind::LocalDateTime => "LocalDateTime",
            ValueKind::LocalDate => "LocalDate",
            ValueKind::List => "List",
            ValueKind::Map => "Map",
            ValueKind::Object => "Object",
            ValueKind::Enum => "Enum",
        }
    }

    /// Collection kinds are persisted as serialized text.
    pub fn is_collection(&self) -> bool {
        matches!(self, ValueKind::List | ValueKind::Map | ValueKind::Object)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single property or column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    LocalDateTime(NaiveDateTime),
    Date(NaiveDate),
    Json(serde_json::Value),
    /// The variant name of an application enum.
    Enum(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::BigInt(_) => "BigInt",
            Value::Float(_) => "Float",
            Value::Double(_) => "Double",
            Value::Text(_) => "Text",
            Value::Timestamp(_) => "Timestamp",
            Value::LocalDateTime(_) => "LocalDateTime",
            Value::Date(_) => "Date",
            Value::Json(_) => "Json",
            Value::Enum(_) => "Enum",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::BigInt(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(i64::from(*i)),
            Value::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            Value::BigInt(i) => i32::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(f64::from(*f)),
            Value::Double(f) => Some(*f),
            Value::Int(i) => Some(f64::from(*i)),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            Value::LocalDateTime(t) => Some(t.and_utc()),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Text used when hashing query arguments into a cache key.
    pub fn cache_key_part(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::BigInt(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Double(f) => f.to_string(),
            Value::Text(s) | Value::Enum(s) => s.clone(),
            Value::Timestamp(t) => t.to_rfc3339(),
            Value::LocalDateTime(t) => t.to_string(),
            Value::Date(d) => d.to_string(),
            Value::Json(v) => v.to_string(),
        }
    }

    /// Plain JSON rendering, used when deserializing raw rows into beans.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::BigInt(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(f64::from(*f))
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Double(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Text(s) | Value::Enum(s) => Json::String(s.clone()),
            Value::Timestamp(t) => Json::String(t.to_rfc3339()),
            Value::LocalDateTime(t) => Json::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::Date(d) => Json::String(d.to_string()),
            Value::Json(v) => v.clone(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
