//! Byte-stream transport boundary and its TCP implementation.

use crate::error::DispatchError;
use async_trait::async_trait;
use bytes::Bytes;
use linkrpc_protocol::{Decoder, Encoder};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Opens connections to a peer address.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> io::Result<Arc<dyn Connection>>;
}

/// An established, opcode-framed connection.
///
/// `write` and `receive` may run concurrently; `close` must wake a blocked
/// `receive` with [`DispatchError::ConnectionClosed`].
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn write(&self, opcode: u8, payload: Bytes) -> Result<(), DispatchError>;

    async fn receive(&self) -> Result<(u8, Bytes), DispatchError>;

    async fn close(&self);

    fn address(&self) -> &str;
}

/// Dials plain TCP connections.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    read_buffer_size: usize,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str) -> io::Result<Arc<dyn Connection>> {
        tracing::debug!("Connecting to {}...", addr);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;
        stream.set_nodelay(true).ok();

        Ok(Arc::new(TcpConnection::new(
            addr.to_string(),
            stream,
            self.read_buffer_size,
        )))
    }
}

struct ReadState {
    half: OwnedReadHalf,
    decoder: Decoder,
    buf: Vec<u8>,
}

/// A TCP connection carrying linkrpc packets.
pub struct TcpConnection {
    addr: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<ReadState>,
    closed: watch::Sender<bool>,
}

impl TcpConnection {
    pub fn new(addr: String, stream: TcpStream, read_buffer_size: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Self {
            addr,
            writer: Mutex::new(Some(write_half)),
            reader: Mutex::new(ReadState {
                half: read_half,
                decoder: Decoder::new(),
                buf: vec![0u8; read_buffer_size],
            }),
            closed,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Resolves once the flag flips to `true`.
pub(crate) async fn closed_signal(mut rx: watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn write(&self, opcode: u8, payload: Bytes) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::ConnectionClosed);
        }

        let encoded = Encoder::encode_raw(opcode, payload)?;
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard
            .as_mut()
            .ok_or(DispatchError::ConnectionClosed)?;
        writer.write_all(&encoded).await?;
        tracing::debug!("wrote opcode={:#04x} ({} bytes)", opcode, encoded.len());
        Ok(())
    }

    async fn receive(&self) -> Result<(u8, Bytes), DispatchError> {
        let closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(DispatchError::ConnectionClosed);
        }

        let mut guard = self.reader.lock().await;
        let state = &mut *guard;
        loop {
            if let Some(packet) = state.decoder.decode_packet()? {
                return Ok((packet.opcode, packet.payload));
            }

            let n = tokio::select! {
                _ = closed_signal(closed.clone()) => return Err(DispatchError::ConnectionClosed),
                read = state.half.read(&mut state.buf) => read?,
            };

            if n == 0 {
                tracing::debug!("peer {} closed the connection", self.addr);
                return Err(DispatchError::ConnectionClosed);
            }
            state.decoder.extend(&state.buf[..n]);
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            tracing::debug!("Shutting down writer to {}", self.addr);
            let _ = writer.shutdown().await;
        }
    }

    fn address(&self) -> &str {
        &self.addr
    }
}
