//! Typed device-point binding and polling engine
//!
//! This library maps typed values onto raw device registers and keeps both
//! sides in step. Hosts describe each device location as a [`Point`] with
//! codec parameters (data format, byte order, scale, skip-first-byte, bit
//! index), bind points onto an [`Interface`], and let the [`PollEngine`]
//! read them cyclically through merged batch requests. Outbound writes,
//! two-phase host bindings with rollback, and a served-memory slave map
//! round out the data path.
//!
//! # Architecture
//!
//! - [`value`] / [`codec`] — the tagged value union and the value ↔
//!   register-window conversions
//! - [`point`] / [`handler`] — addressable locations, cached last values,
//!   host bindings
//! - [`interface`] — the point arena, shared device memory and event
//!   channel
//! - [`scheduler`] — merged-read planning and the cyclic poll engine
//! - [`slavemap`] — address buckets for the served-memory side
//! - [`schema`] — declarative point tables
//! - [`client`] — the abstract protocol-client boundary
//!
//! The engine never speaks a wire protocol itself; everything below the
//! [`ProtocolClient`] trait (framing, transport, retries) belongs to the
//! host.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use voltage_pointlink::{
//!     DataFormat, Interface, Mode, ObjectKind, Point, PointAddress, PointConfig,
//!     PollEngine, PollingConfig, ProtocolClient,
//! };
//!
//! # async fn run(client: Arc<dyn ProtocolClient>) -> voltage_pointlink::Result<()> {
//! let interface = Interface::new();
//! let flow = Point::new(
//!     PointConfig::new(
//!         "flow_rate",
//!         PointAddress { slave: 1, kind: ObjectKind::WordReadOnly, address: 400 },
//!         DataFormat::Float32,
//!     ),
//!     Mode::ReceiveOnly,
//! )?;
//! interface.bind(flow);
//!
//! let engine = PollEngine::new(interface, client, PollingConfig::default());
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod events;
pub mod handler;
pub mod interface;
pub mod memory;
pub mod point;
pub mod scheduler;
pub mod schema;
pub mod slavemap;
pub mod value;

pub use client::{ClientRequest, ClientResponse, ProtocolClient, SpanLimits, WritePayload};
pub use codec::{ByteOrder, DataFormat, TimeEncoding};
pub use error::{PointLinkError, Result};
pub use events::{CycleError, Direction, EngineEvent};
pub use handler::{Binding, BindingTarget, CellTarget, Handler, Mode};
pub use interface::{Interface, PointHandle};
pub use memory::DeviceMemory;
pub use point::{ObjectKind, Point, PointAddress, PointConfig, RequestWindow};
pub use scheduler::{PollEngine, PollStats, PollingConfig};
pub use schema::{
    bind_table, bind_table_with_targets, build_bound_point, build_point, PointSpec,
};
pub use slavemap::SlaveMap;
pub use value::{Value, ValueKind};
