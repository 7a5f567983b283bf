//! Date/time point encodings
//!
//! Four wire layouts are supported: Unix epoch integers (seconds or
//! milliseconds, with an optional power-of-ten rescale), a raw nanosecond
//! tick count, formatted text, and a compact per-field byte layout driven
//! by a `yMdHmsf` format string.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{PointLinkError, Result};

/// Wire encoding for date/time points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeEncoding {
    /// Unix epoch integer: seconds (4 bytes) or milliseconds (8 bytes),
    /// multiplied by `10^pow10` on the wire
    Epoch { millis: bool, pow10: i8 },
    /// Nanoseconds since Unix epoch, signed 64-bit
    Ticks,
    /// Formatted text of fixed byte length, zero padded
    Text { format: String, len: u16 },
    /// Compact per-field layout: each occurrence of a letter in the format
    /// string (`y M d H m s f`) consumes one byte of that field, fields are
    /// emitted in order of first appearance, and an absent time-of-day field
    /// leaves its amount to be carried by the next-smaller present field
    Packed { format: String },
}

impl TimeEncoding {
    /// Number of raw bytes this encoding occupies on the wire
    pub fn byte_len(&self) -> usize {
        match self {
            TimeEncoding::Epoch { millis: false, .. } => 4,
            TimeEncoding::Epoch { millis: true, .. } => 8,
            TimeEncoding::Ticks => 8,
            TimeEncoding::Text { len, .. } => *len as usize,
            TimeEncoding::Packed { format } => format.chars().count(),
        }
    }
}

/// Per-field byte widths of a packed format string, in order of first
/// appearance. Rejects letters outside `yMdHmsf`.
fn packed_fields(format: &str) -> Result<Vec<(char, usize)>> {
    let mut fields: Vec<(char, usize)> = Vec::new();
    for c in format.chars() {
        if !"yMdHmsf".contains(c) {
            return Err(PointLinkError::codec(format!(
                "Invalid packed time field '{c}' in format '{format}'"
            )));
        }
        match fields.iter_mut().find(|(f, _)| *f == c) {
            Some((_, n)) => *n += 1,
            None => fields.push((c, 1)),
        }
    }
    if fields.is_empty() {
        return Err(PointLinkError::codec("Empty packed time format"));
    }
    Ok(fields)
}

fn write_be(value: u64, width: usize, out: &mut Vec<u8>) -> Result<()> {
    if width < 8 && value >= 1u64 << (8 * width) {
        return Err(PointLinkError::codec(format!(
            "Packed time field value {value} does not fit in {width} byte(s)"
        )));
    }
    for i in (0..width).rev() {
        out.push((value >> (8 * i)) as u8);
    }
    Ok(())
}

fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn pow10(exp: u32) -> i64 {
    10i64.saturating_pow(exp)
}

/// Encode a timestamp into its raw wire bytes
pub fn encode_time(dt: &DateTime<Utc>, encoding: &TimeEncoding) -> Result<Vec<u8>> {
    match encoding {
        TimeEncoding::Epoch { millis, pow10: p } => {
            let base = if *millis {
                dt.timestamp_millis()
            } else {
                dt.timestamp()
            };
            let raw = if *p >= 0 {
                base.checked_mul(pow10(*p as u32)).ok_or_else(|| {
                    PointLinkError::codec("Epoch rescale overflow")
                })?
            } else {
                base / pow10((-*p) as u32)
            };
            if *millis {
                Ok(raw.to_be_bytes().to_vec())
            } else {
                let raw = u32::try_from(raw).map_err(|_| {
                    PointLinkError::codec(format!("Epoch value {raw} does not fit in 4 bytes"))
                })?;
                Ok(raw.to_be_bytes().to_vec())
            }
        },
        TimeEncoding::Ticks => {
            let nanos = dt.timestamp_nanos_opt().ok_or_else(|| {
                PointLinkError::codec("Timestamp out of tick range")
            })?;
            Ok(nanos.to_be_bytes().to_vec())
        },
        TimeEncoding::Text { format, len } => {
            let text = dt.format(format).to_string();
            let mut bytes = text.into_bytes();
            if bytes.len() > *len as usize {
                return Err(PointLinkError::codec(format!(
                    "Formatted time exceeds declared length {len}"
                )));
            }
            bytes.resize(*len as usize, 0);
            Ok(bytes)
        },
        TimeEncoding::Packed { format } => {
            let fields = packed_fields(format)?;
            let present = |c: char| fields.iter().any(|(f, _)| *f == c);

            // Time-of-day walk, largest unit first: each present field takes
            // its share, an absent field leaves its amount for the next
            // smaller present field.
            let mut remaining = u64::from(dt.hour()) * 3_600_000
                + u64::from(dt.minute()) * 60_000
                + u64::from(dt.second()) * 1_000
                + u64::from(dt.timestamp_subsec_millis());
            let mut time_vals = [0u64; 4]; // H m s f
            for (slot, unit_ms) in [(0, 3_600_000), (1, 60_000), (2, 1_000), (3, 1)] {
                let letter = ['H', 'm', 's', 'f'][slot];
                if present(letter) {
                    time_vals[slot] = remaining / unit_ms;
                    remaining %= unit_ms;
                }
            }

            let mut out = Vec::with_capacity(encoding.byte_len());
            for (field, width) in &fields {
                let value = match field {
                    'y' => {
                        let year = dt.year().max(0) as u64;
                        if *width == 1 { year % 100 } else { year }
                    },
                    'M' => u64::from(dt.month()),
                    'd' => u64::from(dt.day()),
                    'H' => time_vals[0],
                    'm' => time_vals[1],
                    's' => time_vals[2],
                    'f' => time_vals[3],
                    _ => unreachable!(),
                };
                write_be(value, *width, &mut out)?;
            }
            Ok(out)
        },
    }
}

/// Decode raw wire bytes into a timestamp
pub fn decode_time(bytes: &[u8], encoding: &TimeEncoding) -> Result<DateTime<Utc>> {
    let need = encoding.byte_len();
    if bytes.len() < need {
        return Err(PointLinkError::InsufficientData(format!(
            "Time decode needs {need} bytes, got {}",
            bytes.len()
        )));
    }
    let bytes = &bytes[..need];

    match encoding {
        TimeEncoding::Epoch { millis, pow10: p } => {
            let raw = if *millis {
                i64::from_be_bytes(bytes.try_into().map_err(|_| {
                    PointLinkError::codec("Bad epoch width")
                })?)
            } else {
                i64::from(u32::from_be_bytes(bytes.try_into().map_err(|_| {
                    PointLinkError::codec("Bad epoch width")
                })?))
            };
            let base = if *p >= 0 {
                raw / pow10(*p as u32)
            } else {
                raw.checked_mul(pow10((-*p) as u32))
                    .ok_or_else(|| PointLinkError::codec("Epoch rescale overflow"))?
            };
            let dt = if *millis {
                Utc.timestamp_millis_opt(base).single()
            } else {
                Utc.timestamp_opt(base, 0).single()
            };
            dt.ok_or_else(|| PointLinkError::codec(format!("Epoch value {base} out of range")))
        },
        TimeEncoding::Ticks => {
            let nanos = i64::from_be_bytes(
                bytes
                    .try_into()
                    .map_err(|_| PointLinkError::codec("Bad tick width"))?,
            );
            Ok(Utc.timestamp_nanos(nanos))
        },
        TimeEncoding::Text { format, .. } => {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            let text = std::str::from_utf8(&bytes[..end])
                .map_err(|_| PointLinkError::codec("Time text is not valid UTF-8"))?;
            let naive = chrono::NaiveDateTime::parse_from_str(text, format)
                .map_err(|e| PointLinkError::codec(format!("Time parse failed: {e}")))?;
            Ok(Utc.from_utc_datetime(&naive))
        },
        TimeEncoding::Packed { format } => {
            let fields = packed_fields(format)?;
            let mut vals = std::collections::HashMap::new();
            let mut offset = 0usize;
            for (field, width) in &fields {
                vals.insert(*field, read_be(&bytes[offset..offset + width]));
                offset += width;
            }

            let year = match vals.get(&'y') {
                Some(&v) => {
                    let width = fields.iter().find(|(f, _)| *f == 'y').map(|(_, n)| *n);
                    if width == Some(1) { 2000 + v as i32 } else { v as i32 }
                },
                None => 1970,
            };
            let month = vals.get(&'M').copied().unwrap_or(1) as u32;
            let day = vals.get(&'d').copied().unwrap_or(1) as u32;

            // Absent larger units were folded into the next smaller present
            // field at encode time; summing in milliseconds reverses that.
            let ms_of_day = vals.get(&'H').copied().unwrap_or(0) * 3_600_000
                + vals.get(&'m').copied().unwrap_or(0) * 60_000
                + vals.get(&'s').copied().unwrap_or(0) * 1_000
                + vals.get(&'f').copied().unwrap_or(0);
            if ms_of_day >= 86_400_000 {
                return Err(PointLinkError::codec(format!(
                    "Packed time-of-day {ms_of_day}ms exceeds one day"
                )));
            }

            let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
                PointLinkError::codec(format!("Invalid packed date {year}-{month}-{day}"))
            })?;
            let naive = date
                .and_hms_milli_opt(
                    (ms_of_day / 3_600_000) as u32,
                    (ms_of_day % 3_600_000 / 60_000) as u32,
                    (ms_of_day % 60_000 / 1_000) as u32,
                    (ms_of_day % 1_000) as u32,
                )
                .ok_or_else(|| PointLinkError::codec("Invalid packed time of day"))?;
            Ok(Utc.from_utc_datetime(&naive))
        },
    }
}
