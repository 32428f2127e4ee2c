//! Error types for UNet exchange operations
//!
//! Two layers: [`DecodeError`] for datagrams that do not parse as packets
//! (dropped with a warning, never fatal) and [`UNetError`] for everything the
//! exchange, channels and senders can report to the host.
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for UNet operations
pub type Result<T> = std::result::Result<T, UNetError>;

/// Why a datagram could not be decoded into a packet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Datagram shorter than the header or than its declared counts require
    #[error("truncated packet: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    /// Magic number does not identify a UNet packet
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    /// Byte order flag is neither little nor big endian
    #[error("unknown byte order flag {0}")]
    BadByteOrder(u8),

    /// Declared entry count exceeds packet capacity
    #[error("{kind} count {count} exceeds capacity {max}")]
    CountOverflow {
        kind: &'static str,
        count: usize,
        max: usize,
    },
}

/// UNet exchange error enumeration
///
/// Covers the failure modes that leave a component:
/// - transport and socket failures (transient, retried by the caller)
/// - configuration problems (fatal at construction)
/// - shared store failures (logged per write)
/// - startup dependency timeouts (fatal unless shutting down)
#[derive(Debug, Error)]
pub enum UNetError {
    /// Socket level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file or environment could not be parsed
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid
    #[error("configuration validation error: {0}")]
    Configuration(String),

    /// Datagram could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Transport could not be created, opened or used
    #[error("transport {name}: {reason}")]
    Transport { name: String, reason: String },

    /// Shared store did not become ready within the allowed time
    #[error("shared store not ready within {timeout:?}")]
    StoreNotReady { timeout: Duration },

    /// Shared store rejected an operation
    #[error("shared store error: {0}")]
    Store(String),

    /// Sensor id is not known to the shared store
    #[error("unknown sensor id {0}")]
    UnknownSensor(i64),

    /// Operation was interrupted by shutdown
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// Logging subsystem could not be set up
    #[error("logging error: {0}")]
    Logging(String),
}

impl From<figment::Error> for UNetError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl UNetError {
    /// Build a transport error for the named endpoint
    pub fn transport(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}
