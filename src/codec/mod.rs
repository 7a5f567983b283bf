//! Value codec: typed values to and from device register windows
//!
//! Conversion is layered the same way on encode and decode:
//!
//! - byte count: each format declares how many raw bytes it occupies, and
//!   the window is rounded up to whole 16-bit registers;
//! - byte order: [`ByteOrder`] rearranges canonical big-endian bytes into
//!   wire layout and back (see `byte_order`);
//! - skip-first-byte: the first canonical byte of the window is reserved;
//!   encode merges the value into the current raw window so the reserved
//!   byte survives, decode drops it before parsing;
//! - scale: numeric formats multiply by `scale` after decode and divide
//!   before encode, with an identity fast path when `scale == 1`.
//!
//! Bit-flag points (`Bool` format on a word object) are read-modify-write:
//! the other 15 bits of the register pass through untouched.

pub mod byte_order;
pub mod time;

pub use byte_order::ByteOrder;
pub use time::TimeEncoding;

use crate::error::{PointLinkError, Result};
use crate::value::{Value, ValueKind};

/// Wire format of a point value
#[derive(Debug, Clone, PartialEq)]
pub enum DataFormat {
    /// One bit within a 16-bit register (bit 0 = LSB)
    Bool { bit: u8 },
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    Float32,
    Float64,
    /// Fixed-length raw byte buffer, zero padded
    Bytes { len: u16 },
    /// Fixed-length text, zero padded, NUL-trimmed on decode
    Text { len: u16 },
    /// Date/time, see [`TimeEncoding`]
    Time(TimeEncoding),
}

impl DataFormat {
    /// Value kind this format decodes to (with unit scale)
    pub fn value_kind(&self) -> ValueKind {
        match self {
            DataFormat::Bool { .. } => ValueKind::Bool,
            DataFormat::UInt16 | DataFormat::UInt32 | DataFormat::UInt64 => ValueKind::UInt,
            DataFormat::Int16 | DataFormat::Int32 | DataFormat::Int64 => ValueKind::Int,
            DataFormat::Float32 | DataFormat::Float64 => ValueKind::Float,
            DataFormat::Bytes { .. } => ValueKind::Bytes,
            DataFormat::Text { .. } => ValueKind::Text,
            DataFormat::Time(_) => ValueKind::Time,
        }
    }

    /// Raw value bytes on the wire, excluding any skipped byte
    pub fn byte_len(&self) -> usize {
        match self {
            DataFormat::Bool { .. } | DataFormat::UInt16 | DataFormat::Int16 => 2,
            DataFormat::UInt32 | DataFormat::Int32 | DataFormat::Float32 => 4,
            DataFormat::UInt64 | DataFormat::Int64 | DataFormat::Float64 => 8,
            DataFormat::Bytes { len } | DataFormat::Text { len } => *len as usize,
            DataFormat::Time(enc) => enc.byte_len(),
        }
    }

    /// Whole registers the value window occupies, including the skipped byte
    pub fn register_count(&self, skip_first_byte: bool) -> u16 {
        let bytes = self.byte_len() + usize::from(skip_first_byte);
        bytes.div_ceil(2) as u16
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataFormat::UInt16
                | DataFormat::Int16
                | DataFormat::UInt32
                | DataFormat::Int32
                | DataFormat::UInt64
                | DataFormat::Int64
                | DataFormat::Float32
                | DataFormat::Float64
        )
    }

    /// Whether encoding needs the current raw window (read-modify-write)
    pub fn needs_readback(&self, skip_first_byte: bool) -> bool {
        skip_first_byte || matches!(self, DataFormat::Bool { .. })
    }
}

/// Clamp a numeric value to the representable range of the target format.
///
/// Prevents register overflow when a write exceeds the target's capacity
/// (e.g. writing 70000 to a uint16 register).
pub fn clamp_to_format(value: f64, format: &DataFormat) -> f64 {
    let (min, max): (f64, f64) = match format {
        DataFormat::UInt16 => (0.0, 65535.0),
        DataFormat::Int16 => (-32768.0, 32767.0),
        DataFormat::UInt32 => (0.0, 4294967295.0),
        DataFormat::Int32 => (-2147483648.0, 2147483647.0),
        DataFormat::UInt64 => (0.0, u64::MAX as f64),
        DataFormat::Int64 => (i64::MIN as f64, i64::MAX as f64),
        DataFormat::Float32 => (f32::MIN as f64, f32::MAX as f64),
        DataFormat::Float64 => (f64::MIN, f64::MAX),
        _ => return value,
    };
    value.clamp(min, max)
}

fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

fn bytes_to_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect()
}

/// Parse a numeric format from canonical big-endian bytes
fn parse_numeric(bytes: &[u8], format: &DataFormat) -> Result<Value> {
    let need = format.byte_len();
    if bytes.len() < need {
        return Err(PointLinkError::InsufficientData(format!(
            "Numeric decode needs {need} bytes, got {}",
            bytes.len()
        )));
    }
    let b = &bytes[..need];
    let value = match format {
        DataFormat::UInt16 => Value::UInt(u64::from(u16::from_be_bytes([b[0], b[1]]))),
        DataFormat::Int16 => Value::Int(i64::from(i16::from_be_bytes([b[0], b[1]]))),
        DataFormat::UInt32 => Value::UInt(u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))),
        DataFormat::Int32 => Value::Int(i64::from(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))),
        DataFormat::UInt64 => Value::UInt(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])),
        DataFormat::Int64 => Value::Int(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])),
        DataFormat::Float32 => {
            Value::Float(f64::from(f32::from_be_bytes([b[0], b[1], b[2], b[3]])))
        },
        DataFormat::Float64 => Value::Float(f64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])),
        _ => {
            return Err(PointLinkError::codec(format!(
                "Format {format:?} is not numeric"
            )))
        },
    };
    Ok(value)
}

/// Serialize a value into the canonical big-endian bytes of a numeric
/// format, applying the inverse scale and range clamping
fn numeric_bytes(value: &Value, format: &DataFormat, scale: f64) -> Result<Vec<u8>> {
    let conversion = || PointLinkError::Conversion {
        from: value.kind().name(),
        to: format.value_kind().name(),
    };

    match format {
        DataFormat::Float32 => {
            let f = scaled_outbound(value, scale).ok_or_else(conversion)?;
            Ok((clamp_to_format(f, format) as f32).to_be_bytes().to_vec())
        },
        DataFormat::Float64 => {
            let f = scaled_outbound(value, scale).ok_or_else(conversion)?;
            Ok(f.to_be_bytes().to_vec())
        },
        _ => {
            // Integer formats: stay in integer arithmetic on the identity
            // fast path so 64-bit values keep full precision.
            let raw: i64 = if scale == 1.0 {
                match value {
                    Value::UInt(u) => {
                        // u64 beyond i64::MAX wraps through the i64 carrier;
                        // byte emission below is width-exact so the pattern
                        // survives for UInt64.
                        *u as i64
                    },
                    _ => value.as_i64().ok_or_else(conversion)?,
                }
            } else {
                let f = value.as_f64().ok_or_else(conversion)? / scale;
                clamp_to_format(f, format).round() as i64
            };
            let bytes = match format {
                DataFormat::UInt16 => (raw.clamp(0, 65535) as u16).to_be_bytes().to_vec(),
                DataFormat::Int16 => (raw.clamp(-32768, 32767) as i16).to_be_bytes().to_vec(),
                DataFormat::UInt32 => (raw.clamp(0, 4294967295) as u32).to_be_bytes().to_vec(),
                DataFormat::Int32 => {
                    (raw.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
                        .to_be_bytes()
                        .to_vec()
                },
                DataFormat::UInt64 => (raw as u64).to_be_bytes().to_vec(),
                DataFormat::Int64 => raw.to_be_bytes().to_vec(),
                _ => return Err(conversion()),
            };
            Ok(bytes)
        },
    }
}

fn scaled_outbound(value: &Value, scale: f64) -> Option<f64> {
    value.as_f64().map(|f| f / scale)
}

/// Decode a point value from the registers of its value window.
///
/// `words` are the raw registers as read from the device, starting at the
/// point's own address. A decode failure never carries further than the
/// returned error; callers surface it as a per-point Receiving error and
/// leave the cached value stale.
pub fn decode_words(
    words: &[u16],
    format: &DataFormat,
    order: ByteOrder,
    scale: f64,
    skip_first_byte: bool,
) -> Result<Value> {
    let regs = format.register_count(skip_first_byte) as usize;
    if words.len() < regs {
        return Err(PointLinkError::InsufficientData(format!(
            "Window has {} registers, need {regs}",
            words.len()
        )));
    }

    // Bit flags live inside a single register; byte order and skip do not
    // apply.
    if let DataFormat::Bool { bit } = format {
        let set = (words[0] >> bit) & 1 == 1;
        return Ok(Value::Bool(set));
    }

    let canonical = order.apply(&words_to_bytes(&words[..regs]));
    let payload = &canonical[usize::from(skip_first_byte)..];

    if format.is_numeric() {
        let native = parse_numeric(payload, format)?;
        if scale == 1.0 {
            return Ok(native);
        }
        let f = native
            .as_f64()
            .ok_or_else(|| PointLinkError::codec("Numeric decode produced non-numeric value"))?;
        return Ok(Value::Float(f * scale));
    }

    match format {
        DataFormat::Bytes { len } => {
            let len = *len as usize;
            if payload.len() < len {
                return Err(PointLinkError::InsufficientData(format!(
                    "Byte decode needs {len} bytes, got {}",
                    payload.len()
                )));
            }
            Ok(Value::Bytes(payload[..len].to_vec()))
        },
        DataFormat::Text { len } => {
            let len = (*len as usize).min(payload.len());
            let trimmed = payload[..len]
                .iter()
                .rposition(|&b| b != 0)
                .map_or(&payload[..0], |last| &payload[..=last]);
            let text = std::str::from_utf8(trimmed)
                .map_err(|_| PointLinkError::codec("Text window is not valid UTF-8"))?;
            Ok(Value::Text(text.to_string()))
        },
        DataFormat::Time(enc) => Ok(Value::Time(time::decode_time(payload, enc)?)),
        _ => Err(PointLinkError::codec(format!(
            "Unhandled format {format:?}"
        ))),
    }
}

/// Encode a point value into the registers of its value window.
///
/// `current` must hold the present window registers for read-modify-write
/// formats (bit flags and skip-first-byte layouts); for everything else it
/// only supplies the trailing pad byte of odd-length payloads.
pub fn encode_words(
    value: &Value,
    format: &DataFormat,
    order: ByteOrder,
    scale: f64,
    skip_first_byte: bool,
    current: Option<&[u16]>,
) -> Result<Vec<u16>> {
    let regs = format.register_count(skip_first_byte) as usize;

    if let DataFormat::Bool { bit } = format {
        let word = current
            .and_then(|w| w.first().copied())
            .ok_or_else(|| PointLinkError::codec("Bit write requires the current register"))?;
        let set = value.as_bool().ok_or(PointLinkError::Conversion {
            from: value.kind().name(),
            to: "bool",
        })?;
        let mask = 1u16 << bit;
        let word = if set { word | mask } else { word & !mask };
        return Ok(vec![word]);
    }

    let payload: Vec<u8> = if format.is_numeric() {
        numeric_bytes(value, format, scale)?
    } else {
        match format {
            DataFormat::Bytes { len } => {
                let src = match value {
                    Value::Bytes(b) => b.clone(),
                    Value::Text(s) => s.as_bytes().to_vec(),
                    _ => {
                        return Err(PointLinkError::Conversion {
                            from: value.kind().name(),
                            to: "bytes",
                        })
                    },
                };
                let mut b = src;
                b.resize(*len as usize, 0);
                b
            },
            DataFormat::Text { len } => {
                let text = match value.coerce(ValueKind::Text)? {
                    Value::Text(s) => s,
                    _ => unreachable!(),
                };
                let mut b = text.into_bytes();
                b.resize(*len as usize, 0);
                b
            },
            DataFormat::Time(enc) => {
                let dt = match value.coerce(ValueKind::Time)? {
                    Value::Time(t) => t,
                    _ => unreachable!(),
                };
                time::encode_time(&dt, enc)?
            },
            _ => {
                return Err(PointLinkError::codec(format!(
                    "Unhandled format {format:?}"
                )))
            },
        }
    };

    // Assemble the full canonical window, preserving the reserved byte and
    // any trailing pad byte from the current contents.
    let mut canonical = match current {
        Some(words) if words.len() >= regs => order.apply(&words_to_bytes(&words[..regs])),
        _ if skip_first_byte => {
            return Err(PointLinkError::codec(
                "Skip-first-byte write requires the current window",
            ))
        },
        _ => vec![0u8; regs * 2],
    };
    let offset = usize::from(skip_first_byte);
    canonical[offset..offset + payload.len()].copy_from_slice(&payload);

    Ok(bytes_to_words(&order.apply(&canonical)))
}
