//! # linkrpc-client
//!
//! Single-link dispatch layer for linkrpc.
//!
//! This crate provides:
//! - A dispatcher owning one active connection, with close hooks and a
//!   supervised auto-reconnect policy
//! - An opcode router for Request/Response frames and control codes
//! - Request correlation for concurrent calls over one link
//! - A high-level client and its configuration

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod reconnect;
pub mod router;
pub mod transport;
pub mod wait;

#[cfg(test)]
pub(crate) mod testing;

pub use client::Client;
pub use config::{Config, ConfigError, DispatchConfig, LinkConfig};
pub use dispatcher::{CloseHook, Dispatcher, Handle, Hook, WeakDispatcher};
pub use error::{abort_on_fatal, DispatchError, FatalError, FatalSink};
pub use reconnect::ReconnectPolicy;
pub use router::{CtrlHandler, FrameHandler, Routed, Router};
pub use transport::{Connection, TcpConnection, TcpTransport, Transport};
pub use wait::{CallResult, Delivery, PendingCall, WaitRegistry};
