//! PostgreSQL type identifiers and bound/returned values.
//!
//! Parameters are sent in binary where the encoding is trivial and in text
//! where PostgreSQL's own input functions are the safer parser (numeric,
//! json, date/time). Results are always requested in text format and
//! decoded here by type OID.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;

use super::error::{PgError, PgResult};
use super::protocol::Format;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    /// Let the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }
}

// ============================================================================
// Values
// ============================================================================

/// A value bound to a statement parameter or read back from a result row.
///
/// Serializes to the natural JSON shape so rows can be handed straight to
/// HTTP handlers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Arbitrary-precision numeric, kept in its decimal text form.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(uuid::Uuid),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Type OID announced in Parse for this parameter.
    pub fn type_oid(&self) -> Oid {
        match self {
            Value::Null => Oid::UNSPECIFIED,
            Value::Bool(_) => Oid::BOOL,
            Value::Int2(_) => Oid::INT2,
            Value::Int4(_) => Oid::INT4,
            Value::Int8(_) => Oid::INT8,
            Value::Float4(_) => Oid::FLOAT4,
            Value::Float8(_) => Oid::FLOAT8,
            Value::Numeric(_) => Oid::NUMERIC,
            Value::Text(_) => Oid::TEXT,
            Value::Bytea(_) => Oid::BYTEA,
            Value::Uuid(_) => Oid::UUID,
            Value::Date(_) => Oid::DATE,
            Value::Timestamp(_) => Oid::TIMESTAMP,
            Value::TimestampTz(_) => Oid::TIMESTAMPTZ,
            Value::Json(_) => Oid::JSONB,
        }
    }

    /// Wire format used when binding this value.
    pub fn format(&self) -> Format {
        match self {
            Value::Bool(_)
            | Value::Int2(_)
            | Value::Int4(_)
            | Value::Int8(_)
            | Value::Float4(_)
            | Value::Float8(_)
            | Value::Bytea(_)
            | Value::Uuid(_) => Format::Binary,
            _ => Format::Text,
        }
    }

    /// Encode for a Bind message. `None` means SQL NULL.
    pub fn encode(&self) -> Option<Vec<u8>> {
        let bytes = match self {
            Value::Null => return None,
            Value::Bool(v) => vec![u8::from(*v)],
            Value::Int2(v) => v.to_be_bytes().to_vec(),
            Value::Int4(v) => v.to_be_bytes().to_vec(),
            Value::Int8(v) => v.to_be_bytes().to_vec(),
            Value::Float4(v) => v.to_be_bytes().to_vec(),
            Value::Float8(v) => v.to_be_bytes().to_vec(),
            Value::Bytea(v) => v.clone(),
            Value::Uuid(v) => v.as_bytes().to_vec(),
            Value::Numeric(v) | Value::Text(v) => v.as_bytes().to_vec(),
            Value::Date(v) => v.format("%Y-%m-%d").to_string().into_bytes(),
            Value::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S%.f").to_string().into_bytes(),
            Value::TimestampTz(v) => v
                .format("%Y-%m-%d %H:%M:%S%.f+00")
                .to_string()
                .into_bytes(),
            Value::Json(v) => v.to_string().into_bytes(),
        };
        Some(bytes)
    }

    /// Decode a text-format column value.
    ///
    /// Date/time values PostgreSQL can represent but chrono cannot
    /// (`infinity`, BC dates) are kept as text rather than failing the row.
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| PgError::Type(format!("Invalid UTF-8 in column: {}", e)))?;

        let value = match oid {
            Oid::BOOL => Value::Bool(text == "t"),
            Oid::INT2 => Value::Int2(parse_number(text, "INT2")?),
            Oid::INT4 => Value::Int4(parse_number(text, "INT4")?),
            Oid::INT8 => Value::Int8(parse_number(text, "INT8")?),
            Oid::FLOAT4 => Value::Float4(parse_number(text, "FLOAT4")?),
            Oid::FLOAT8 => Value::Float8(parse_number(text, "FLOAT8")?),
            Oid::NUMERIC => Value::Numeric(text.to_owned()),
            Oid::BYTEA => Value::Bytea(decode_bytea_hex(text)?),
            Oid::UUID => Value::Uuid(
                uuid::Uuid::parse_str(text)
                    .map_err(|e| PgError::Type(format!("Invalid UUID: {}", e)))?,
            ),
            Oid::JSON | Oid::JSONB => Value::Json(
                serde_json::from_str(text)
                    .map_err(|e| PgError::Type(format!("Invalid JSON: {}", e)))?,
            ),
            Oid::DATE => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(Value::Date)
                .unwrap_or_else(|_| Value::Text(text.to_owned())),
            Oid::TIMESTAMP => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map(Value::Timestamp)
                .unwrap_or_else(|_| Value::Text(text.to_owned())),
            Oid::TIMESTAMPTZ => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map(|ts| Value::TimestampTz(ts.with_timezone(&Utc)))
                .unwrap_or_else(|_| Value::Text(text.to_owned())),
            _ => Value::Text(text.to_owned()),
        };

        Ok(value)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Numeric(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int2(v) => Some(i64::from(*v)),
            Value::Int4(v) => Some(i64::from(*v)),
            Value::Int8(v) => Some(*v),
            _ => None,
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
        Value::Int4(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int8(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float8(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Value::Uuid(v)
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

// ============================================================================
// Helper functions
// ============================================================================

fn parse_number<T>(text: &str, type_name: &str) -> PgResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    text.parse::<T>()
        .map_err(|e| PgError::Type(format!("Invalid {}: {}", type_name, e)))
}

/// Decode bytea in `hex` output format (`\x0a0b...`), the server default.
fn decode_bytea_hex(text: &str) -> PgResult<Vec<u8>> {
    let hex = text
        .strip_prefix("\\x")
        .ok_or_else(|| PgError::Type("Unsupported bytea output format".to_string()))?;

    if hex.len() % 2 != 0 {
        return Err(PgError::Type("Odd-length bytea hex string".to_string()));
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| PgError::Type(format!("Invalid bytea hex: {}", e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(Value::decode_text(Oid::BOOL, b"t").unwrap(), Value::Bool(true));
        assert_eq!(Value::decode_text(Oid::BOOL, b"f").unwrap(), Value::Bool(false));
        assert_eq!(Value::decode_text(Oid::INT8, b"-42").unwrap(), Value::Int8(-42));
        assert_eq!(
            Value::decode_text(Oid::NUMERIC, b"12.50").unwrap(),
            Value::Numeric("12.50".to_string())
        );
        assert!(Value::decode_text(Oid::INT4, b"abc").is_err());
    }

    #[test]
    fn test_decode_bytea_and_uuid() {
        assert_eq!(
            Value::decode_text(Oid::BYTEA, b"\\x00ff10").unwrap(),
            Value::Bytea(vec![0x00, 0xff, 0x10])
        );

        let id = "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11";
        match Value::decode_text(Oid::UUID, id.as_bytes()).unwrap() {
            Value::Uuid(u) => assert_eq!(u.to_string(), id),
            other => panic!("expected uuid, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_timestamps() {
        match Value::decode_text(Oid::TIMESTAMPTZ, b"2024-03-01 12:30:45.123+02").unwrap() {
            Value::TimestampTz(ts) => assert_eq!(ts.to_rfc3339(), "2024-03-01T10:30:45.123+00:00"),
            other => panic!("expected timestamptz, got {:?}", other),
        }

        assert_eq!(
            Value::decode_text(Oid::TIMESTAMP, b"infinity").unwrap(),
            Value::Text("infinity".to_string())
        );
    }

    #[test]
    fn test_param_formats() {
        assert_eq!(Value::Int4(7).format(), Format::Binary);
        assert_eq!(Value::Int4(7).encode(), Some(vec![0, 0, 0, 7]));
        assert_eq!(Value::Numeric("1.5".into()).format(), Format::Text);
        assert_eq!(Value::Null.encode(), None);
        assert_eq!(Value::Null.type_oid(), Oid::UNSPECIFIED);
    }

    #[test]
    fn test_json_serialization() {
        let v = Value::Json(serde_json::json!({"a": 1}));
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"{"a":1}"#);
        assert_eq!(serde_json::to_string(&Value::Null).unwrap(), "null");
    }
}
