//! Points: addressable device locations with codec parameters
//!
//! A point owns its address, codec settings and handler, and funnels every
//! outbound value through one underlying device-write operation guarded by
//! a per-point lock. Synchronous and asynchronous send paths differ only in
//! blocking behavior, never in outcome semantics.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{ClientRequest, ClientResponse, ProtocolClient, WritePayload};
use crate::codec::{self, ByteOrder, DataFormat};
use crate::error::{PointLinkError, Result};
use crate::handler::{Binding, Handler, Mode};
use crate::interface::OwnerRef;
use crate::memory::DeviceMemory;
use crate::value::Value;

/// Device object kind a point address refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// Read/write single-bit objects (coils)
    BitWritable,
    /// Read-only single-bit objects (discrete inputs)
    BitReadOnly,
    /// Read/write 16-bit registers (holding registers)
    WordWritable,
    /// Read-only 16-bit registers (input registers)
    WordReadOnly,
}

impl ObjectKind {
    pub fn is_bit(&self) -> bool {
        matches!(self, ObjectKind::BitWritable | ObjectKind::BitReadOnly)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, ObjectKind::BitWritable | ObjectKind::WordWritable)
    }
}

/// Full device address of a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointAddress {
    /// Slave / station id
    pub slave: u8,
    pub kind: ObjectKind,
    /// Register address for word kinds, bit address for bit kinds
    pub address: u16,
}

/// Optional override of the window a point asks the scheduler to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestWindow {
    pub start: u16,
    pub length: u16,
}

/// Static configuration of a point
#[derive(Debug, Clone)]
pub struct PointConfig {
    pub name: String,
    pub address: PointAddress,
    pub format: DataFormat,
    pub byte_order: ByteOrder,
    pub scale: f64,
    pub skip_first_byte: bool,
    /// Widened read window; must start at or before the point's own address
    pub window: Option<RequestWindow>,
    /// Use the multi-unit write variant even for single-register writes
    pub prefer_multi_write: bool,
}

impl PointConfig {
    pub fn new(name: impl Into<String>, address: PointAddress, format: DataFormat) -> Self {
        Self {
            name: name.into(),
            address,
            format,
            byte_order: ByteOrder::default(),
            scale: 1.0,
            skip_first_byte: false,
            window: None,
            prefer_multi_write: false,
        }
    }

    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_skip_first_byte(mut self, skip: bool) -> Self {
        self.skip_first_byte = skip;
        self
    }

    pub fn with_window(mut self, start: u16, length: u16) -> Self {
        self.window = Some(RequestWindow { start, length });
        self
    }

    pub fn with_multi_write(mut self, multi: bool) -> Self {
        self.prefer_multi_write = multi;
        self
    }

    /// Validate address/window/codec combinations; invalid configurations
    /// are rejected here, never deferred to runtime
    pub fn validate(&self) -> Result<()> {
        if let Some(window) = &self.window {
            if window.start > self.address.address {
                return Err(PointLinkError::config(format!(
                    "Point '{}': request window start {} is after the point address {}",
                    self.name, window.start, self.address.address
                )));
            }
            let own_end = u32::from(self.address.address) + u32::from(self.value_length());
            let window_end = u32::from(window.start) + u32::from(window.length);
            if window_end < own_end {
                return Err(PointLinkError::config(format!(
                    "Point '{}': request window [{}..{}) does not cover the value window",
                    self.name, window.start, window_end
                )));
            }
        }
        if let DataFormat::Bool { bit } = self.format {
            if bit > 15 && !self.address.kind.is_bit() {
                return Err(PointLinkError::config(format!(
                    "Point '{}': bit index {bit} out of range (0-15)",
                    self.name
                )));
            }
        }
        if self.address.kind.is_bit() && !matches!(self.format, DataFormat::Bool { .. }) {
            return Err(PointLinkError::config(format!(
                "Point '{}': bit objects only carry bool values",
                self.name
            )));
        }
        if self.scale == 0.0 {
            return Err(PointLinkError::config(format!(
                "Point '{}': scale must be non-zero",
                self.name
            )));
        }
        Ok(())
    }

    /// Units the point's own value occupies (bits for bit kinds, registers
    /// for word kinds)
    pub fn value_length(&self) -> u16 {
        if self.address.kind.is_bit() {
            1
        } else {
            self.format.register_count(self.skip_first_byte)
        }
    }

    /// Start address of the window the scheduler should read
    pub fn actual_request_address(&self) -> u16 {
        self.window
            .map_or(self.address.address, |w| w.start)
    }

    /// Length of the window the scheduler should read
    pub fn actual_request_length(&self) -> u16 {
        match self.window {
            Some(w) => w.length,
            None => self.value_length(),
        }
    }
}

/// Runtime point: configuration, handler, optional binding, send lock
pub struct Point {
    config: RwLock<PointConfig>,
    handler: Handler,
    binding: Option<Binding>,
    send_lock: tokio::sync::Mutex<()>,
    owner: Mutex<Option<OwnerRef>>,
}

impl std::fmt::Debug for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config.read();
        f.debug_struct("Point")
            .field("name", &config.name)
            .field("address", &config.address)
            .field("format", &config.format)
            .finish()
    }
}

impl Point {
    /// Build a point with a plain handler
    pub fn new(config: PointConfig, mode: Mode) -> Result<Arc<Self>> {
        Self::build(config, mode, None)
    }

    /// Build a point whose handler mirrors into a binding target
    pub fn with_binding(config: PointConfig, mode: Mode, binding: Binding) -> Result<Arc<Self>> {
        Self::build(config, mode, Some(binding))
    }

    fn build(config: PointConfig, mode: Mode, binding: Option<Binding>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config: RwLock::new(config),
            handler: Handler::new(mode),
            binding,
            send_lock: tokio::sync::Mutex::new(()),
            owner: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    pub fn address(&self) -> PointAddress {
        self.config.read().address
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> PointConfig {
        self.config.read().clone()
    }

    /// Units the point's own value occupies
    pub fn value_length(&self) -> u16 {
        self.config.read().value_length()
    }

    /// Window the scheduler should read for this point
    pub fn request_span(&self) -> (u16, u16) {
        let config = self.config.read();
        (
            config.actual_request_address(),
            config.actual_request_length(),
        )
    }

    /// Re-address the point; callers must fix up any address-keyed maps
    /// around this (see `SlaveMap::rebind_address`)
    pub(crate) fn set_address(&self, address: u16) {
        self.config.write().address.address = address;
    }

    pub(crate) fn set_owner(&self, owner: Option<OwnerRef>) {
        *self.owner.lock() = owner;
    }

    pub(crate) fn owner(&self) -> Option<OwnerRef> {
        self.owner.lock().clone()
    }

    /// Decode this point's value from the shared device memory
    pub fn decode_from_memory(&self, memory: &DeviceMemory) -> Result<Value> {
        let config = self.config.read().clone();
        let addr = config.address;
        if addr.kind.is_bit() {
            let word = memory.read_word(addr.slave, addr.kind, addr.address)?;
            return Ok(Value::Bool(word != 0));
        }
        let words = memory.read_range(
            addr.slave,
            addr.kind,
            addr.address,
            config.value_length(),
        )?;
        codec::decode_words(
            &words,
            &config.format,
            config.byte_order,
            config.scale,
            config.skip_first_byte,
        )
    }

    /// Decode from memory and update the handler (and binding target)
    pub fn receive_from_memory(&self, memory: &DeviceMemory) -> Result<Value> {
        let value = self.decode_from_memory(memory)?;
        self.handler.store_received(value.clone());
        if let Some(binding) = &self.binding {
            if self.handler.mode().can_receive() {
                binding.apply_inbound(&value);
            }
        }
        Ok(value)
    }

    /// Fetch the point's current raw window, preferring the shared memory
    /// cache and falling back to one device read
    async fn current_window(
        &self,
        client: &Arc<dyn ProtocolClient>,
        memory: &DeviceMemory,
    ) -> Result<Vec<u16>> {
        let (slave, kind, address, count) = {
            let config = self.config.read();
            (
                config.address.slave,
                config.address.kind,
                config.address.address,
                config.value_length(),
            )
        };
        if let Ok(words) = memory.read_range(slave, kind, address, count) {
            return Ok(words);
        }
        debug!(
            slave,
            address, count, "Window not cached, reading back before write"
        );
        let response = client
            .request(ClientRequest::Read {
                slave,
                kind,
                address,
                count,
            })
            .await?;
        let words = match response {
            ClientResponse::ReadWords(words) => words,
            ClientResponse::ReadBits(bits) => bits.into_iter().map(u16::from).collect(),
            ClientResponse::Fault(fault) => return Err(PointLinkError::Fault(fault)),
            ClientResponse::WriteOk => {
                return Err(PointLinkError::Protocol(
                    "Write acknowledgement to a read request".into(),
                ))
            },
        };
        memory.write_range(slave, kind, address, &words);
        Ok(words)
    }

    /// Send a value to the device (synchronous path: completes when the
    /// underlying request has been answered)
    pub async fn send(
        &self,
        client: &Arc<dyn ProtocolClient>,
        memory: &DeviceMemory,
        value: &Value,
    ) -> Result<()> {
        self.send_inner(client, memory, value, None).await
    }

    /// Send with a cancellation signal: aborts without contacting the
    /// device if cancelled before dispatch; best-effort afterwards
    pub async fn send_cancellable(
        &self,
        client: &Arc<dyn ProtocolClient>,
        memory: &DeviceMemory,
        value: &Value,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.send_inner(client, memory, value, Some(cancel)).await
    }

    /// Send on a worker task so the caller is not blocked; same outcome
    /// semantics as [`Point::send`]
    pub fn send_spawned(
        self: &Arc<Self>,
        client: Arc<dyn ProtocolClient>,
        memory: DeviceMemory,
        value: Value,
    ) -> JoinHandle<Result<()>> {
        let point = Arc::clone(self);
        tokio::spawn(async move { point.send(&client, &memory, &value).await })
    }

    /// Resend the last cached value; fails without I/O when nothing has
    /// ever been received or sent
    pub async fn resend_local(
        &self,
        client: &Arc<dyn ProtocolClient>,
        memory: &DeviceMemory,
    ) -> Result<()> {
        if self.handler.timestamp().is_none() {
            return Err(PointLinkError::NoCachedValue);
        }
        let value = self.handler.value().ok_or(PointLinkError::NoCachedValue)?;
        self.send(client, memory, &value).await
    }

    async fn send_inner(
        &self,
        client: &Arc<dyn ProtocolClient>,
        memory: &DeviceMemory,
        value: &Value,
        cancel: Option<CancellationToken>,
    ) -> Result<()> {
        // Serialize concurrent sends to the same point.
        let _guard = self.send_lock.lock().await;

        // Before any device contact: read-modify-write formats may read the
        // current window back first, and a cancelled send must not reach
        // the device at all.
        if let Some(cancel) = &cancel {
            if cancel.is_cancelled() {
                return Err(PointLinkError::Cancelled);
            }
        }

        let config = self.config.read().clone();
        if !config.address.kind.is_writable() {
            return Err(PointLinkError::config(format!(
                "Point '{}' is not writable",
                config.name
            )));
        }

        let request = if config.address.kind.is_bit() {
            let bit = value.as_bool().ok_or(PointLinkError::Conversion {
                from: value.kind().name(),
                to: "bool",
            })?;
            ClientRequest::Write {
                slave: config.address.slave,
                kind: config.address.kind,
                address: config.address.address,
                payload: WritePayload::Bits(vec![bit]),
                multi: config.prefer_multi_write,
            }
        } else {
            let current = if config.format.needs_readback(config.skip_first_byte) {
                Some(self.current_window(client, memory).await?)
            } else {
                None
            };
            let words = codec::encode_words(
                value,
                &config.format,
                config.byte_order,
                config.scale,
                config.skip_first_byte,
                current.as_deref(),
            )?;
            ClientRequest::Write {
                slave: config.address.slave,
                kind: config.address.kind,
                address: config.address.address,
                multi: config.prefer_multi_write || words.len() > 1,
                payload: WritePayload::Words(words),
            }
        };

        if let Some(cancel) = &cancel {
            if cancel.is_cancelled() {
                return Err(PointLinkError::Cancelled);
            }
        }

        debug!(point = %config.name, ?request, "Dispatching write");
        let response = client.request(request.clone()).await?;
        match response {
            ClientResponse::WriteOk => {
                // Mirror the written window into the local cache so the next
                // read-modify-write starts from fresh contents.
                if let ClientRequest::Write {
                    slave,
                    kind,
                    address,
                    payload,
                    ..
                } = request
                {
                    let words: Vec<u16> = match payload {
                        WritePayload::Words(words) => words,
                        WritePayload::Bits(bits) => bits.into_iter().map(u16::from).collect(),
                    };
                    memory.write_range(slave, kind, address, &words);
                }
                self.handler.store_sent(value.clone());
                Ok(())
            },
            ClientResponse::Fault(fault) => Err(PointLinkError::Fault(fault)),
            other => Err(PointLinkError::Protocol(format!(
                "Unexpected response to write: {other:?}"
            ))),
        }
    }

    /// Outbound member-change path of a binding
    ///
    /// Called by the host when the bound member changes. No-op while an
    /// inbound apply is suppressing mirroring, and when the mode does not
    /// permit sending. On send failure with rollback enabled the target is
    /// reverted to its pre-change value; without rollback the change
    /// stands.
    pub async fn push_from_target(
        &self,
        client: &Arc<dyn ProtocolClient>,
        memory: &DeviceMemory,
        value: &Value,
    ) -> Result<()> {
        let Some(binding) = &self.binding else {
            return self.send(client, memory, value).await;
        };
        if binding.is_suppressed() || !self.handler.mode().can_send() {
            return Ok(());
        }
        if !binding.target().propose(value) {
            return Ok(());
        }
        match self.send(client, memory, value).await {
            Ok(()) => {
                binding.target().commit();
                Ok(())
            },
            Err(error) => {
                if binding.rollback_on_error() {
                    binding.target().revert();
                } else {
                    binding.target().commit();
                }
                Err(error)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_address(address: u16) -> PointAddress {
        PointAddress {
            slave: 1,
            kind: ObjectKind::WordWritable,
            address,
        }
    }

    #[test]
    fn test_window_start_after_address_rejected() {
        let config = PointConfig::new("p", word_address(100), DataFormat::UInt16)
            .with_window(101, 4);
        assert!(matches!(
            config.validate(),
            Err(PointLinkError::Config(_))
        ));
    }

    #[test]
    fn test_window_must_cover_value() {
        let config = PointConfig::new("p", word_address(100), DataFormat::Float64)
            .with_window(98, 4);
        assert!(config.validate().is_err());

        let config = PointConfig::new("p", word_address(100), DataFormat::Float64)
            .with_window(98, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_actual_request_window_defaults_to_own_span() {
        let config = PointConfig::new("p", word_address(400), DataFormat::Float32);
        assert_eq!(config.actual_request_address(), 400);
        assert_eq!(config.actual_request_length(), 2);
    }

    #[test]
    fn test_actual_request_window_override() {
        let config = PointConfig::new("p", word_address(400), DataFormat::Float32)
            .with_window(396, 8);
        assert_eq!(config.actual_request_address(), 396);
        assert_eq!(config.actual_request_length(), 8);
    }

    #[test]
    fn test_skip_first_byte_rounds_up_register_count() {
        let config = PointConfig::new("p", word_address(0), DataFormat::UInt16)
            .with_skip_first_byte(true);
        assert_eq!(config.value_length(), 2);
    }

    #[test]
    fn test_bit_object_requires_bool_format() {
        let address = PointAddress {
            slave: 1,
            kind: ObjectKind::BitWritable,
            address: 10,
        };
        let config = PointConfig::new("p", address, DataFormat::UInt16);
        assert!(config.validate().is_err());

        let config = PointConfig::new("p", address, DataFormat::Bool { bit: 0 });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_scale_rejected() {
        let config = PointConfig::new("p", word_address(0), DataFormat::UInt16).with_scale(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_decode_from_memory() {
        let memory = DeviceMemory::new();
        memory.write_range(1, ObjectKind::WordWritable, 400, &[0x41BB, 0x999A]);
        let point = Point::new(
            PointConfig::new("flow", word_address(400), DataFormat::Float32),
            Mode::TwoWay,
        )
        .unwrap();
        match point.decode_from_memory(&memory).unwrap() {
            Value::Float(f) => assert!((f - 23.45).abs() < 1e-4),
            other => panic!("Expected float, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_missing_window_leaves_handler_stale() {
        let memory = DeviceMemory::new();
        let point = Point::new(
            PointConfig::new("p", word_address(0), DataFormat::UInt16),
            Mode::TwoWay,
        )
        .unwrap();
        assert!(point.receive_from_memory(&memory).is_err());
        assert!(point.handler().value().is_none());
    }
}
