//! Unified error handling for the point binding and polling engine
//!
//! All per-point and per-request failures are converted into values of
//! [`PointLinkError`]; nothing is allowed to panic across the engine
//! boundary or terminate the poll task.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, PointLinkError>;

/// Main error type for the point engine
///
/// Errors are cloneable because cycle-completion events carry an aggregate
/// of every request failure observed during the cycle.
#[derive(Debug, Clone, Error)]
pub enum PointLinkError {
    /// Invalid point or engine configuration, rejected at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Value could not be encoded or decoded with the point's codec settings
    #[error("Codec error: {0}")]
    Codec(String),

    /// The device memory window does not cover the requested range
    #[error("Insufficient window data: {0}")]
    InsufficientData(String),

    /// The protocol client returned something the engine cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device answered with an exception / negative acknowledgement
    #[error("Device fault: {0}")]
    Fault(String),

    /// `resend_local` was called before any value was received or sent
    #[error("No cached value to resend")]
    NoCachedValue,

    /// An asynchronous send was cancelled before the request was dispatched
    #[error("Send cancelled before dispatch")]
    Cancelled,

    /// No conversion exists between the two value kinds
    #[error("Unsupported conversion from {from} to {to}")]
    Conversion {
        from: &'static str,
        to: &'static str,
    },

    /// A point handle no longer resolves to a live point
    #[error("Point no longer bound")]
    PointGone,
}

impl PointLinkError {
    /// Shorthand for a codec error with a formatted message
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Shorthand for a configuration error with a formatted message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
