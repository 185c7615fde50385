//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during packet framing or frame decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'LRPC', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("control payload too short: {0} bytes")]
    ShortControl(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
