//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tag values, quality codes and source timestamps."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use r_ems_common::time::datetime_to_millis;
use serde_json::{Number, Value};

/// Value as delivered by a tag session.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
    Array(Vec<TagValue>),
    /// Variant the session could not map; carries its textual form.
    Opaque(String),
}

impl TagValue {
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            TagValue::Null
                | TagValue::Bool(_)
                | TagValue::Int(_)
                | TagValue::Float(_)
                | TagValue::Text(_)
        )
    }

    /// Normalize into the JSON shape carried by records and RPC replies.
    ///
    /// Arrays keep primitive elements and stringify the rest, timestamps render
    /// as RFC 3339, binary as base64, opaque variants and non-finite floats
    /// as their text.
    pub fn to_json(&self) -> Value {
        match self {
            TagValue::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| {
                        if item.is_primitive() {
                            item.primitive_to_json()
                        } else {
                            Value::String(item.to_string())
                        }
                    })
                    .collect(),
            ),
            TagValue::Timestamp(_) | TagValue::Binary(_) | TagValue::Opaque(_) => {
                Value::String(self.to_string())
            }
            primitive => primitive.primitive_to_json(),
        }
    }

    fn primitive_to_json(&self) -> Value {
        match self {
            TagValue::Null => Value::Null,
            TagValue::Bool(flag) => Value::Bool(*flag),
            TagValue::Int(number) => Value::from(*number),
            TagValue::Float(number) => Number::from_f64(*number)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(number.to_string())),
            TagValue::Text(text) => Value::String(text.clone()),
            other => Value::String(other.to_string()),
        }
    }

    /// Build a writable value from an inbound JSON payload.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => TagValue::Null,
            Value::Bool(flag) => TagValue::Bool(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(int) => TagValue::Int(int),
                None => TagValue::Float(number.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(text) => TagValue::Text(text.clone()),
            Value::Array(items) => TagValue::Array(items.iter().map(TagValue::from_json).collect()),
            Value::Object(_) => TagValue::Text(value.to_string()),
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Null => f.write_str("null"),
            TagValue::Bool(flag) => write!(f, "{flag}"),
            TagValue::Int(number) => write!(f, "{number}"),
            TagValue::Float(number) => write!(f, "{number}"),
            TagValue::Text(text) => f.write_str(text),
            TagValue::Timestamp(instant) => {
                f.write_str(&instant.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            TagValue::Binary(bytes) => f.write_str(&BASE64.encode(bytes)),
            TagValue::Array(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            TagValue::Opaque(text) => f.write_str(text),
        }
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Float(value)
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Text(value.to_owned())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Text(value)
    }
}

/// OPC-DA quality word accompanying every reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quality(pub u16);

impl Quality {
    /// The only code treated as trustworthy.
    pub const GOOD: Quality = Quality(192);
    pub const BAD: Quality = Quality(0);
    pub const UNCERTAIN: Quality = Quality(64);
    pub const COMM_FAILURE: Quality = Quality(24);

    pub fn code(&self) -> u16 {
        self.0
    }

    pub fn is_good(&self) -> bool {
        *self == Self::GOOD
    }

    /// Human readable status for the code.
    pub fn describe(&self) -> &'static str {
        match self.0 {
            0x00 => "Bad",
            0x04 => "Config Error",
            0x08 => "Not Connected",
            0x0C => "Device Failure",
            0x10 => "Sensor Failure",
            0x14 => "Last Known Value",
            0x18 => "Comm Failure",
            0x1C => "Out of Service",
            0x40 => "Uncertain",
            0x44 => "Last Usable Value",
            0x50 => "Sensor Not Accurate",
            0x54 => "EU Units Exceeded",
            0x58 => "Sub-Normal",
            0xC0 => "Good",
            0xD8 => "Local Override",
            code if code & 0xC0 == 0x40 => "Uncertain",
            code if code & 0xC0 == 0xC0 => "Good (substatus)",
            _ => "Bad",
        }
    }

    /// Value forwarded in place of an untrusted reading.
    pub fn diagnostic(&self) -> String {
        format!("BAD_QUALITY: {} ({})", self.describe(), self.0)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.describe(), self.0)
    }
}

/// Timestamp as reported by the source; may be absent or unparsable.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceTimestamp {
    Instant(DateTime<Utc>),
    Millis(i64),
    Text(String),
}

const TEXT_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%m/%d/%y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
];

impl SourceTimestamp {
    /// Unix milliseconds when the instant is usable. Naive text is read as UTC.
    pub fn to_millis(&self) -> Option<i64> {
        match self {
            SourceTimestamp::Instant(instant) => Some(datetime_to_millis(instant)),
            SourceTimestamp::Millis(millis) if *millis > 0 => Some(*millis),
            SourceTimestamp::Millis(_) => None,
            SourceTimestamp::Text(text) => {
                let text = text.trim();
                if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                    return Some(parsed.timestamp_millis());
                }
                TEXT_FORMATS.iter().find_map(|format| {
                    NaiveDateTime::parse_from_str(text, format)
                        .ok()
                        .map(|naive| datetime_to_millis(&naive.and_utc()))
                })
            }
        }
    }
}

/// One entry of a batched read reply.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub tag_path: String,
    pub value: TagValue,
    pub quality: Quality,
    pub timestamp: Option<SourceTimestamp>,
}

impl RawReading {
    pub fn new(tag_path: impl Into<String>, value: TagValue, quality: Quality) -> Self {
        Self {
            tag_path: tag_path.into(),
            value,
            quality,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: SourceTimestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn arrays_stringify_non_primitive_elements() {
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let value = TagValue::Array(vec![
            TagValue::Int(1),
            TagValue::Timestamp(instant),
            TagValue::Binary(vec![1, 2]),
        ]);
        assert_eq!(
            value.to_json(),
            json!([1, "2024-01-01T00:00:00.000Z", "AQI="])
        );
    }

    #[test]
    fn binary_uses_base64() {
        let value = TagValue::Binary(b"opc".to_vec());
        assert_eq!(value.to_json(), json!("b3Bj"));
        assert_eq!(BASE64.decode("b3Bj").unwrap(), b"opc");
    }

    #[test]
    fn non_finite_floats_render_as_text() {
        assert_eq!(TagValue::Float(f64::INFINITY).to_json(), json!("inf"));
        assert_eq!(TagValue::Float(f64::NAN).to_json(), json!("NaN"));
        assert_eq!(
            TagValue::Array(vec![TagValue::Float(f64::NEG_INFINITY), TagValue::Int(1)]).to_json(),
            json!(["-inf", 1])
        );
    }

    #[test]
    fn opaque_values_render_as_text() {
        let value = TagValue::Opaque("VT_CY(12.5)".into());
        assert_eq!(value.to_json(), json!("VT_CY(12.5)"));
    }

    #[test]
    fn json_payloads_map_to_tag_values() {
        assert_eq!(TagValue::from_json(&json!(42)), TagValue::Int(42));
        assert_eq!(TagValue::from_json(&json!(1.5)), TagValue::Float(1.5));
        assert_eq!(TagValue::from_json(&json!("on")), TagValue::Text("on".into()));
        assert_eq!(
            TagValue::from_json(&json!({"a": 1})),
            TagValue::Text("{\"a\":1}".into())
        );
    }

    #[test]
    fn only_192_is_good() {
        assert!(Quality::GOOD.is_good());
        assert!(!Quality(216).is_good());
        assert!(!Quality::UNCERTAIN.is_good());
        assert_eq!(Quality::COMM_FAILURE.diagnostic(), "BAD_QUALITY: Comm Failure (24)");
    }

    #[test]
    fn source_timestamps_parse() {
        let expected = 1_704_110_400_000;
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(SourceTimestamp::Instant(instant).to_millis(), Some(expected));
        assert_eq!(
            SourceTimestamp::Text("2024-01-01T12:00:00Z".into()).to_millis(),
            Some(expected)
        );
        assert_eq!(
            SourceTimestamp::Text("01/01/24 12:00:00".into()).to_millis(),
            Some(expected)
        );
        assert_eq!(SourceTimestamp::Text("garbage".into()).to_millis(), None);
        assert_eq!(SourceTimestamp::Millis(0).to_millis(), None);
    }
}
