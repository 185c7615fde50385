//! # linkrpc-protocol
//!
//! Wire protocol implementation for linkrpc.
//!
//! This crate provides:
//! - Binary packet framing with opcode, length prefix and CRC32C validation
//! - Typed frames (Request, Response, Control) selected by opcode
//! - Stream encoder/decoder
//! - Protocol error types

pub mod codec;
pub mod error;
pub mod frame;
pub mod packet;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use frame::{Control, Frame, Opcode, Request, Response};
pub use packet::{Packet, MAGIC, PACKET_HEADER_SIZE};

/// Protocol version supported by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for a linkrpc peer.
pub const DEFAULT_PORT: u16 = 7420;

/// Maximum packet payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
