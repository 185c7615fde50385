//! Encoder and decoder for linkrpc packets.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::packet::Packet;
use bytes::{Bytes, BytesMut};

/// Encodes frames and raw opcode/payload pairs into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a typed frame into a packet.
    pub fn encode_frame(frame: &Frame) -> Result<BytesMut, ProtocolError> {
        frame.to_packet()?.encode()
    }

    /// Encodes an already serialized payload under `opcode`.
    pub fn encode_raw(opcode: u8, payload: Bytes) -> Result<BytesMut, ProtocolError> {
        Packet::new(opcode, payload).encode()
    }
}

/// Buffers stream bytes and yields complete packets.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next packet from the buffer.
    pub fn decode_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        Packet::decode(&mut self.buffer)
    }

    /// Attempts to decode the next packet and its typed frame.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        match self.decode_packet()? {
            Some(packet) => Ok(Some(Frame::from_packet(packet)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
