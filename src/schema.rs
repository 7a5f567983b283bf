//! Declarative point tables
//!
//! Replaces attribute-scanning discovery with an explicit table: hosts
//! describe each point as a [`PointSpec`] (typically deserialized from a
//! JSON/TOML point table) and this module turns the table into the same
//! [`Point`]/[`Binding`] objects the engine consumes. Any host-side
//! declarative style (config files, code generation, builders) can feed
//! this layer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{ByteOrder, DataFormat, TimeEncoding};
use crate::error::{PointLinkError, Result};
use crate::handler::{Binding, BindingTarget, Mode};
use crate::interface::{Interface, PointHandle};
use crate::point::{ObjectKind, Point, PointAddress, PointConfig, RequestWindow};

fn default_slave() -> u8 {
    1
}
fn default_scale() -> f64 {
    1.0
}

/// One row of a point table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointSpec {
    pub name: String,
    #[serde(default = "default_slave")]
    pub slave: u8,
    pub kind: ObjectKind,
    pub address: u16,
    /// Codec name: `bool`, `uint16`..`int64`, `float32`, `float64`,
    /// `bytes`, `text`, `time_epoch`, `time_epoch_ms`, `time_ticks`,
    /// `time_text`, `time_packed`
    pub data_type: String,
    /// `ABCD` / `BADC` / `DCBA` / `CDAB`; defaults to `ABCD`
    #[serde(default)]
    pub byte_order: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Bit index for `bool` points on word objects
    #[serde(default)]
    pub bit: u8,
    /// Byte length for `bytes`, `text` and `time_text`
    #[serde(default)]
    pub length: Option<u16>,
    /// Format string for `time_text` (chrono) and `time_packed` (`yMdHmsf`)
    #[serde(default)]
    pub time_format: Option<String>,
    #[serde(default)]
    pub skip_first_byte: bool,
    #[serde(default)]
    pub window: Option<RequestWindow>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub multi_write: bool,
    #[serde(default)]
    pub rollback_on_error: bool,
}

impl PointSpec {
    fn length(&self) -> Result<u16> {
        self.length.ok_or_else(|| {
            PointLinkError::config(format!(
                "Point '{}': data type '{}' requires a length",
                self.name, self.data_type
            ))
        })
    }

    fn time_format(&self) -> Result<String> {
        self.time_format.clone().ok_or_else(|| {
            PointLinkError::config(format!(
                "Point '{}': data type '{}' requires a time format",
                self.name, self.data_type
            ))
        })
    }

    /// Resolve the `data_type` string into a codec format
    pub fn format(&self) -> Result<DataFormat> {
        let format = match self.data_type.as_str() {
            "bool" => DataFormat::Bool { bit: self.bit },
            "uint16" => DataFormat::UInt16,
            "int16" => DataFormat::Int16,
            "uint32" => DataFormat::UInt32,
            "int32" => DataFormat::Int32,
            "uint64" => DataFormat::UInt64,
            "int64" => DataFormat::Int64,
            "float32" => DataFormat::Float32,
            "float64" => DataFormat::Float64,
            "bytes" => DataFormat::Bytes { len: self.length()? },
            "text" | "string" => DataFormat::Text { len: self.length()? },
            "time_epoch" => DataFormat::Time(TimeEncoding::Epoch {
                millis: false,
                pow10: 0,
            }),
            "time_epoch_ms" => DataFormat::Time(TimeEncoding::Epoch {
                millis: true,
                pow10: 0,
            }),
            "time_ticks" => DataFormat::Time(TimeEncoding::Ticks),
            "time_text" => DataFormat::Time(TimeEncoding::Text {
                format: self.time_format()?,
                len: self.length()?,
            }),
            "time_packed" => DataFormat::Time(TimeEncoding::Packed {
                format: self.time_format()?,
            }),
            other => {
                return Err(PointLinkError::config(format!(
                    "Point '{}': unknown data type '{other}'",
                    self.name
                )))
            },
        };
        Ok(format)
    }

    fn byte_order(&self) -> Result<ByteOrder> {
        match &self.byte_order {
            None => Ok(ByteOrder::default()),
            Some(s) => ByteOrder::from_str(s).ok_or_else(|| {
                PointLinkError::config(format!(
                    "Point '{}': unknown byte order '{s}'",
                    self.name
                ))
            }),
        }
    }

    /// Translate into a validated point configuration
    pub fn to_config(&self) -> Result<PointConfig> {
        let mut config = PointConfig::new(
            self.name.clone(),
            PointAddress {
                slave: self.slave,
                kind: self.kind,
                address: self.address,
            },
            self.format()?,
        )
        .with_byte_order(self.byte_order()?)
        .with_scale(self.scale)
        .with_skip_first_byte(self.skip_first_byte)
        .with_multi_write(self.multi_write);
        if let Some(window) = self.window {
            config = config.with_window(window.start, window.length);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Build an unbound point from one table row
pub fn build_point(spec: &PointSpec) -> Result<Arc<Point>> {
    Point::new(spec.to_config()?, spec.mode)
}

/// Build a point mirrored into a host-side binding target
pub fn build_bound_point(
    spec: &PointSpec,
    target: Arc<dyn BindingTarget>,
) -> Result<Arc<Point>> {
    Point::with_binding(
        spec.to_config()?,
        spec.mode,
        Binding::new(target, spec.rollback_on_error),
    )
}

/// Build and bind a whole table onto an interface
///
/// Any invalid row aborts the load before anything is bound, so a table
/// either attaches completely or not at all.
pub fn bind_table(interface: &Interface, specs: &[PointSpec]) -> Result<Vec<PointHandle>> {
    let points = specs
        .iter()
        .map(build_point)
        .collect::<Result<Vec<_>>>()?;
    debug!(points = points.len(), "Point table loaded");
    Ok(interface.bind_all(points))
}

/// Build and bind a table where some rows mirror into host-side targets
///
/// Rows paired with a target become bound points (using the row's
/// rollback flag); rows without one become plain points. Same
/// all-or-nothing semantics as [`bind_table`].
pub fn bind_table_with_targets(
    interface: &Interface,
    rows: Vec<(PointSpec, Option<Arc<dyn BindingTarget>>)>,
) -> Result<Vec<PointHandle>> {
    let mut points = Vec::with_capacity(rows.len());
    for (spec, target) in rows {
        let point = match target {
            Some(target) => build_bound_point(&spec, target)?,
            None => build_point(&spec)?,
        };
        points.push(point);
    }
    debug!(points = points.len(), "Point table loaded");
    Ok(interface.bind_all(points))
}
