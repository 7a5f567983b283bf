//! Abstract protocol-client boundary
//!
//! The engine never frames or transports anything itself. It hands a
//! [`ClientRequest`] to a [`ProtocolClient`] and inspects only the response
//! tag and payload. Size limits and concurrency tolerance are capabilities
//! the client reports, not things the engine infers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::point::ObjectKind;

/// Payload of a device write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePayload {
    /// Coil/bit values, one per address
    Bits(Vec<bool>),
    /// 16-bit register values
    Words(Vec<u16>),
}

impl WritePayload {
    /// Number of addressable units covered by this payload
    pub fn unit_count(&self) -> u16 {
        match self {
            WritePayload::Bits(b) => b.len() as u16,
            WritePayload::Words(w) => w.len() as u16,
        }
    }
}

/// A single request handed to the protocol client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Read `count` units starting at `address`
    Read {
        slave: u8,
        kind: ObjectKind,
        address: u16,
        count: u16,
    },
    /// Write a payload starting at `address`; `multi` requests the
    /// multi-unit write variant even for a single unit
    Write {
        slave: u8,
        kind: ObjectKind,
        address: u16,
        payload: WritePayload,
        multi: bool,
    },
}

/// Response tags the engine understands
#[derive(Debug, Clone, PartialEq)]
pub enum ClientResponse {
    /// Successful bit-object read
    ReadBits(Vec<bool>),
    /// Successful word-object read
    ReadWords(Vec<u16>),
    /// Successful write acknowledgement
    WriteOk,
    /// Device exception / negative acknowledgement
    Fault(String),
}

/// Protocol-specific maximum addressable span per request
///
/// Bit objects typically allow a far larger span than word objects
/// (e.g. 2000 coils vs 125 registers per Modbus read).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanLimits {
    #[serde(default = "default_bit_max_span")]
    pub bit_max_span: u16,
    #[serde(default = "default_word_max_span")]
    pub word_max_span: u16,
}

fn default_bit_max_span() -> u16 {
    2000
}
fn default_word_max_span() -> u16 {
    125
}

impl Default for SpanLimits {
    fn default() -> Self {
        Self {
            bit_max_span: default_bit_max_span(),
            word_max_span: default_word_max_span(),
        }
    }
}

impl SpanLimits {
    /// Maximum span for the given object kind
    pub fn max_span(&self, kind: ObjectKind) -> u16 {
        if kind.is_bit() {
            self.bit_max_span
        } else {
            self.word_max_span
        }
    }
}

/// Contract every protocol implementation must satisfy
///
/// The engine issues no retries; retry policy, if any, lives behind this
/// trait.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Perform one request/response exchange
    async fn request(&self, request: ClientRequest) -> Result<ClientResponse>;

    /// Per-request span limits of the underlying protocol
    fn limits(&self) -> SpanLimits {
        SpanLimits::default()
    }

    /// Whether the transport tolerates concurrent in-flight requests
    /// (e.g. a connection-oriented transport with per-request correlation).
    /// The scheduler only issues requests in parallel when this is true.
    fn supports_concurrent_requests(&self) -> bool {
        false
    }
}
