//! Typed frames and their opcodes.
//!
//! A frame is the unit the dispatch layer reasons about. On the wire it travels
//! as a [`Packet`](crate::Packet) whose opcode alone decides which variant the
//! payload decodes into:
//!
//! | opcode | variant  | payload encoding                     |
//! |--------|----------|--------------------------------------|
//! | `0x01` | Request  | JSON                                 |
//! | `0x02` | Response | JSON                                 |
//! | `0x03` | Control  | 4-byte big-endian code + raw data    |

use crate::error::ProtocolError;
use crate::packet::Packet;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the control code prefix in a control payload.
pub const CONTROL_CODE_SIZE: usize = 4;

/// One-byte tag identifying a frame variant on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Request = 0x01,
    Response = 0x02,
    Control = 0x03,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns whether frames with this opcode go to the generic frame handler.
    pub fn is_generic(self) -> bool {
        matches!(self, Opcode::Request | Opcode::Response)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Opcode::Request),
            0x02 => Ok(Opcode::Response),
            0x03 => Ok(Opcode::Control),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Request => write!(f, "REQUEST"),
            Opcode::Response => write!(f, "RESPONSE"),
            Opcode::Control => write!(f, "CONTROL"),
        }
    }
}

/// Outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Unique request ID for correlation.
    pub request_id: String,

    /// Call target, e.g. `"service.method"`.
    pub target: String,

    /// Serialized call arguments.
    #[serde(default)]
    pub args: Bytes,
}

impl Request {
    pub fn new(request_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            target: target.into(),
            args: Bytes::new(),
        }
    }

    pub fn with_args(mut self, args: impl Into<Bytes>) -> Self {
        self.args = args.into();
        self
    }
}

/// Reply to a [`Request`], matched by `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Request ID this response correlates to.
    pub request_id: String,

    /// Result payload (absent on error or for calls without a result).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Bytes>,

    /// Remote error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Response {
    pub fn ok(request_id: impl Into<String>, result: impl Into<Bytes>) -> Self {
        Self {
            request_id: request_id.into(),
            result: Some(result.into()),
            err: None,
        }
    }

    pub fn error(request_id: impl Into<String>, err: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            result: None,
            err: Some(err.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.err.is_some()
    }
}

/// Out-of-band control message keyed by a numeric code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub code: i32,
    pub data: Bytes,
}

impl Control {
    pub fn new(code: i32, data: impl Into<Bytes>) -> Self {
        Self {
            code,
            data: data.into(),
        }
    }

    /// Reads the control code from a payload without copying the data.
    pub fn peek_code(payload: &[u8]) -> Result<i32, ProtocolError> {
        if payload.len() < CONTROL_CODE_SIZE {
            return Err(ProtocolError::ShortControl(payload.len()));
        }
        Ok(i32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_CODE_SIZE + self.data.len());
        buf.put_i32(self.code);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, ProtocolError> {
        let code = Self::peek_code(&payload)?;
        let data = payload.split_off(CONTROL_CODE_SIZE);
        Ok(Self { code, data })
    }
}

/// A typed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(Request),
    Response(Response),
    Control(Control),
}

impl Frame {
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::Request(_) => Opcode::Request,
            Frame::Response(_) => Opcode::Response,
            Frame::Control(_) => Opcode::Control,
        }
    }

    /// Serializes the frame payload (without opcode).
    pub fn serialize(&self) -> Result<Bytes, ProtocolError> {
        match self {
            Frame::Request(req) => Ok(Bytes::from(serde_json::to_vec(req)?)),
            Frame::Response(resp) => Ok(Bytes::from(serde_json::to_vec(resp)?)),
            Frame::Control(ctrl) => Ok(ctrl.encode()),
        }
    }

    /// Decodes a payload into the variant selected by `opcode`.
    pub fn decode(opcode: u8, payload: Bytes) -> Result<Self, ProtocolError> {
        match Opcode::try_from(opcode)? {
            Opcode::Request => Ok(Frame::Request(serde_json::from_slice(&payload)?)),
            Opcode::Response => Ok(Frame::Response(serde_json::from_slice(&payload)?)),
            Opcode::Control => Ok(Frame::Control(Control::decode(payload)?)),
        }
    }

    pub fn to_packet(&self) -> Result<Packet, ProtocolError> {
        Ok(Packet::new(self.opcode().as_u8(), self.serialize()?))
    }

    pub fn from_packet(packet: Packet) -> Result<Self, ProtocolError> {
        Self::decode(packet.opcode, packet.payload)
    }
}

impl From<Request> for Frame {
    fn from(req: Request) -> Self {
        Frame::Request(req)
    }
}

impl From<Response> for Frame {
    fn from(resp: Response) -> Self {
        Frame::Response(resp)
    }
}

impl From<Control> for Frame {
    fn from(ctrl: Control) -> Self {
        Frame::Control(ctrl)
    }
}
