//! Engine event signals
//!
//! Per-point errors, received values and cycle completions are delivered
//! over one broadcast channel per interface. No failure is ever allowed to
//! propagate as a panic or terminate the poll task; everything surfaces
//! here as an event.

use crate::error::PointLinkError;
use crate::interface::PointHandle;
use crate::point::PointAddress;
use crate::value::Value;

/// Whether an error happened on the inbound or outbound path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// One failed request of a cycle, keyed by the request's start address
#[derive(Debug, Clone)]
pub struct CycleError {
    pub address: PointAddress,
    pub error: PointLinkError,
}

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A per-point failure; the cached value is left stale
    PointError {
        handle: PointHandle,
        direction: Direction,
        error: PointLinkError,
    },
    /// A point decoded a fresh value from a read or a local slave write
    ValueReceived { handle: PointHandle, value: Value },
    /// A poll cycle finished; `succeed` is true when at least one request
    /// in the cycle succeeded, `errors` aggregates every failed request
    CycleCompleted {
        succeed: bool,
        errors: Vec<CycleError>,
    },
}
