//! Opcode router for inbound packets.
//!
//! Request and Response packets go to the single generic frame handler;
//! Control packets go to the handler registered for their control code.
//! Dispatch runs on the receive loop, so handlers must hand long work off
//! to another task.

use crate::error::DispatchError;
use bytes::Bytes;
use dashmap::DashMap;
use linkrpc_protocol::{Control, Frame, Opcode};
use parking_lot::RwLock;
use std::sync::Arc;

/// Handles decoded Request/Response frames: `(connection_id, frame)`.
pub type FrameHandler = Arc<dyn Fn(&str, Frame) + Send + Sync>;

/// Handles control payload data for one code: `(connection_id, data)`.
pub type CtrlHandler = Arc<dyn Fn(&str, Bytes) + Send + Sync>;

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Delivered to the frame handler.
    Frame(Opcode),
    /// Delivered to the control handler for this code.
    Control(i32),
    /// No handler for this control code; nothing was invoked.
    Dropped(i32),
}

/// Maps opcodes and control codes to handlers.
#[derive(Default)]
pub struct Router {
    frame_handler: RwLock<Option<FrameHandler>>,
    ctrl_handlers: DashMap<i32, CtrlHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets (or replaces) the generic frame handler.
    pub fn set_frame_handler(&self, handler: FrameHandler) {
        *self.frame_handler.write() = Some(handler);
    }

    /// Registers a control handler. An existing handler for `code` is replaced.
    pub fn add_ctrl_handle(&self, code: i32, handler: CtrlHandler) {
        if self.ctrl_handlers.insert(code, handler).is_some() {
            tracing::debug!("replaced control handler for code {}", code);
        }
    }

    pub fn has_frame_handler(&self) -> bool {
        self.frame_handler.read().is_some()
    }

    pub fn ctrl_codes(&self) -> Vec<i32> {
        let mut codes: Vec<i32> = self.ctrl_handlers.iter().map(|e| *e.key()).collect();
        codes.sort_unstable();
        codes
    }

    /// Decodes `payload` according to `opcode` and invokes the matching handler.
    pub fn dispatch(
        &self,
        connection_id: &str,
        opcode: u8,
        payload: Bytes,
    ) -> Result<Routed, DispatchError> {
        let op = Opcode::try_from(opcode)?;

        if op.is_generic() {
            let frame = Frame::decode(opcode, payload)?;
            // Clone out of the lock so a handler may re-register.
            let handler = self
                .frame_handler
                .read()
                .clone()
                .ok_or(DispatchError::NoFrameHandler)?;
            tracing::debug!("[{}] routing {} frame", connection_id, op);
            handler(connection_id, frame);
            return Ok(Routed::Frame(op));
        }

        let ctrl = Control::decode(payload)?;
        let handler = self
            .ctrl_handlers
            .get(&ctrl.code)
            .map(|entry| entry.value().clone());

        match handler {
            Some(handler) => {
                tracing::debug!("[{}] routing control code {}", connection_id, ctrl.code);
                handler(connection_id, ctrl.data);
                Ok(Routed::Control(ctrl.code))
            }
            None => {
                tracing::warn!(
                    "[{}] dropping control frame with unknown code {}",
                    connection_id,
                    ctrl.code
                );
                Ok(Routed::Dropped(ctrl.code))
            }
        }
    }
}
