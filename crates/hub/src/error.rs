//! Typed errors for the sensor transport, the wire protocol and the pin
//! layer. Application seams wrap these in `anyhow` with context.

use thiserror::Error;

use crate::pins::LogicalPin;

/// The link to the sensor source failed. Always followed by a reconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open sensor transport {address}: {source}")]
    Open {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sensor transport read failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("sensor transport closed by peer")]
    Closed,

    #[error("no data from sensor transport for {0} seconds")]
    Idle(u64),

    #[error("unsupported sensor address '{0}'")]
    Unsupported(String),
}

/// A framed message could not be decoded. The frame is dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame body is not ASCII text")]
    NotText,

    #[error("frame '{0}' has no checksum separator")]
    MissingSeparator(String),

    #[error("expected 4 fields, got {0}")]
    FieldCount(usize),

    #[error("field '{0}' is not an integer")]
    BadField(String),

    #[error("checksum field '{0}' is not numeric")]
    BadChecksum(String),

    #[error("checksum mismatch: transmitted {transmitted}, computed {computed}")]
    ChecksumMismatch { transmitted: u32, computed: u32 },
}

/// A raw value fell outside its configured domain.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("raw value {value} outside [{min}, {max}]")]
pub struct NormalizationError {
    pub value: i64,
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Error)]
pub enum PinError {
    #[error("pin board not initialised; refusing to write {0}")]
    NotInitialized(LogicalPin),

    #[error("{0} is an input pin")]
    NotAnOutput(LogicalPin),
}
