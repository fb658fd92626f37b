//! Crate-wide error taxonomy (spec §7).

use thiserror::Error;

/// Failure modes of the codec decoders (§4.3). Never constructed from a panic.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DecodeError {
    #[error("invalid preamble: expected 0x00000000, got {0:#010x}")]
    InvalidPreamble(u32),
    #[error("CRC mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    CrcMismatch { expected: u16, computed: u16 },
    #[error("unsupported codec id: {0:#04x}")]
    UnsupportedCodec(u8),
    #[error("frame truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("frame length {size} outside bounds (0, {max}]")]
    FrameTooLarge { size: usize, max: usize },
    #[error("quantity1 ({quantity1}) does not match quantity2 ({quantity2})")]
    QuantityMismatch { quantity1: u8, quantity2: u8 },
}

/// Top-level error type returned by fallible operations throughout the service.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("frame of {size} bytes exceeds max_packet_size {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("invalid IMEI: {0}")]
    InvalidImei(String),
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("broker publish confirm timed out after {0:?}")]
    BrokerPublishTimeout(std::time::Duration),
    #[error("database unavailable: {0}")]
    DatabaseUnavailable(#[from] sqlx::Error),
    #[error("mapping load failed for imei {imei}: {reason}")]
    MappingLoadFailed { imei: String, reason: String },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("shutdown in progress")]
    Shutdown,
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ParserError>;
