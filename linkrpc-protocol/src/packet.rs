//! Binary packet format carried over a byte stream.
//!
//! Packet layout (16 bytes header + payload):
//!
//! ```text
//! +--------+---------+--------+----------+-------------+--------+
//! | magic  | version | opcode | reserved | payload_len | crc32c |
//! | 4 bytes| 2 bytes | 1 byte |  1 byte  |   4 bytes   | 4 bytes|
//! +--------+---------+--------+----------+-------------+--------+
//! | payload                                                     |
//! | payload_len bytes                                           |
//! +-------------------------------------------------------------+
//! ```

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying linkrpc packets: "LRPC"
pub const MAGIC: [u8; 4] = *b"LRPC";

/// Size of the fixed packet header in bytes (4+2+1+1+4+4 = 16).
pub const PACKET_HEADER_SIZE: usize = 16;

/// A single opcode-tagged unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw opcode byte; interpreted by [`crate::Opcode`].
    pub opcode: u8,
    /// Variant-specific serialized frame.
    pub payload: Bytes,
}

impl Packet {
    pub fn new(opcode: u8, payload: Bytes) -> Self {
        Self { opcode, payload }
    }

    /// Encodes the packet into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PacketTooLarge {
                size: u32::try_from(len).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let payload_len = len as u32;

        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(crate::PROTOCOL_VERSION);
        buf.put_u8(self.opcode);
        buf.put_u8(0);
        buf.put_u32(payload_len);
        buf.put_u32(crc32c::crc32c(&self.payload));
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a packet from bytes.
    ///
    /// Returns `Ok(Some(packet))` if a complete packet was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    /// Nothing is consumed from `buf` unless a whole packet is available.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let opcode = buf[6];
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        let total_len = PACKET_HEADER_SIZE + payload_len as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(PACKET_HEADER_SIZE);
        let payload = buf.split_to(payload_len as usize).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(ProtocolError::CrcMismatch {
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self { opcode, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let packet = Packet::new(2, Bytes::from_static(br#"{"request_id":"a"}"#));
        let mut buf = packet.encode().unwrap();
        assert_eq!(buf.len(), PACKET_HEADER_SIZE + packet.payload.len());

        let decoded = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_crc_validation() {
        let packet = Packet::new(1, Bytes::from_static(b"payload"));
        let mut encoded = packet.encode().unwrap();

        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        let result = Packet::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&b"BADX\x00\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Packet::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = BytesMut::from(&b"LRPC\x00\x63\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Packet::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_incomplete_header() {
        let mut buf = BytesMut::from(&b"LRPC\x00\x01\x01"[..]);
        assert!(Packet::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn test_incomplete_payload_is_not_consumed() {
        let packet = Packet::new(3, Bytes::from_static(b"0123456789"));
        let encoded = packet.encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 3]);
        assert!(Packet::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), encoded.len() - 3);
    }

    #[test]
    fn test_packet_too_large() {
        let huge = vec![0u8; MAX_PAYLOAD_SIZE as usize + 1];
        let result = Packet::new(1, Bytes::from(huge)).encode();
        assert!(matches!(
            result,
            Err(ProtocolError::PacketTooLarge { size, max })
                if size == MAX_PAYLOAD_SIZE + 1 && max == MAX_PAYLOAD_SIZE
        ));
    }

    #[test]
    fn test_oversized_length_header_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u16(crate::PROTOCOL_VERSION);
        buf.put_u8(1);
        buf.put_u8(0);
        buf.put_u32(MAX_PAYLOAD_SIZE + 1);
        buf.put_u32(0);
        let result = Packet::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::PacketTooLarge { .. })));
    }

    #[test]
    fn test_empty_payload() {
        let packet = Packet::new(3, Bytes::new());
        let mut buf = packet.encode().unwrap();
        let decoded = Packet::decode(&mut buf).unwrap().unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_multiple_packets_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Packet::new(1, Bytes::from_static(b"one")).encode().unwrap());
        buf.extend_from_slice(&Packet::new(2, Bytes::from_static(b"two")).encode().unwrap());

        let first = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.opcode, 1);
        assert_eq!(&first.payload[..], b"one");

        let second = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.opcode, 2);
        assert_eq!(&second.payload[..], b"two");

        assert!(Packet::decode(&mut buf).unwrap().is_none());
    }
}
