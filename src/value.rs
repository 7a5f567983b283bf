//! Tagged value union and cross-kind conversion
//!
//! Points carry values of a small closed set of kinds. Sending a value of a
//! kind different from the point's declared kind goes through [`Value::coerce`],
//! one explicit conversion per supported pair, instead of failing.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PointLinkError, Result};

/// A typed point value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean (single bit or coil)
    Bool(bool),
    /// Signed integer (covers all signed register widths)
    Int(i64),
    /// Unsigned integer (covers all unsigned register widths)
    UInt(u64),
    /// 32/64-bit floating point
    Float(f64),
    /// Fixed-length raw byte buffer
    Bytes(Vec<u8>),
    /// Text, NUL-trimmed on decode
    Text(String),
    /// Date/time value
    Time(DateTime<Utc>),
}

/// Kind tag for [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Int,
    UInt,
    Float,
    Bytes,
    Text,
    Time,
}

impl ValueKind {
    /// Human-readable kind name for error messages
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::UInt => "uint",
            ValueKind::Float => "float",
            ValueKind::Bytes => "bytes",
            ValueKind::Text => "text",
            ValueKind::Time => "time",
        }
    }
}

impl Value {
    /// Kind tag of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::UInt(_) => ValueKind::UInt,
            Value::Float(_) => ValueKind::Float,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Text(_) => ValueKind::Text,
            Value::Time(_) => ValueKind::Time,
        }
    }

    /// Numeric view of the value, if one exists
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::Time(t) => Some(t.timestamp_millis() as f64),
            Value::Bytes(_) => None,
        }
    }

    /// Integer view of the value, if one exists (floats are rounded)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            Value::Float(f) => Some(f.round() as i64),
            Value::Text(s) => s.trim().parse::<i64>().ok(),
            Value::Time(t) => Some(t.timestamp_millis()),
            Value::Bytes(_) => None,
        }
    }

    /// Boolean view: numerics are truthy when non-zero
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::UInt(u) => Some(*u != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::Text(s) => {
                let s = s.trim().to_ascii_lowercase();
                match s.as_str() {
                    "true" | "1" | "on" => Some(true),
                    "false" | "0" | "off" => Some(false),
                    _ => None,
                }
            },
            _ => None,
        }
    }

    /// Convert this value to the target kind
    ///
    /// The conversion table is a closed set resolved at compile time:
    /// numerics convert freely (floats round when narrowing to integers),
    /// booleans map to 0/1, text parses, and times convert through Unix
    /// epoch milliseconds. Unsupported pairs return
    /// [`PointLinkError::Conversion`].
    pub fn coerce(&self, target: ValueKind) -> Result<Value> {
        if self.kind() == target {
            return Ok(self.clone());
        }

        let unsupported = || PointLinkError::Conversion {
            from: self.kind().name(),
            to: target.name(),
        };

        match target {
            ValueKind::Bool => self.as_bool().map(Value::Bool).ok_or_else(unsupported),
            ValueKind::Int => self.as_i64().map(Value::Int).ok_or_else(unsupported),
            ValueKind::UInt => match self {
                Value::Float(f) if *f < 0.0 => Err(unsupported()),
                _ => self
                    .as_i64()
                    .and_then(|i| u64::try_from(i).ok())
                    .map(Value::UInt)
                    .ok_or_else(unsupported),
            },
            ValueKind::Float => self.as_f64().map(Value::Float).ok_or_else(unsupported),
            ValueKind::Text => match self {
                Value::Bool(b) => Ok(Value::Text(b.to_string())),
                Value::Int(i) => Ok(Value::Text(i.to_string())),
                Value::UInt(u) => Ok(Value::Text(u.to_string())),
                Value::Float(f) => Ok(Value::Text(f.to_string())),
                Value::Time(t) => Ok(Value::Text(t.to_rfc3339())),
                _ => Err(unsupported()),
            },
            ValueKind::Bytes => match self {
                Value::Text(s) => Ok(Value::Bytes(s.as_bytes().to_vec())),
                _ => Err(unsupported()),
            },
            ValueKind::Time => match self {
                Value::Int(ms) => Utc
                    .timestamp_millis_opt(*ms)
                    .single()
                    .map(Value::Time)
                    .ok_or_else(unsupported),
                Value::UInt(ms) => i64::try_from(*ms)
                    .ok()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .map(Value::Time)
                    .ok_or_else(unsupported),
                Value::Text(s) => DateTime::parse_from_rfc3339(s)
                    .map(|t| Value::Time(t.with_timezone(&Utc)))
                    .map_err(|_| unsupported()),
                _ => Err(unsupported()),
            },
        }
    }
}
