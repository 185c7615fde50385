//! In-memory transport for tests.

use crate::error::DispatchError;
use crate::transport::{closed_signal, Connection, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use linkrpc_protocol::Frame;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Transport whose dials either fail on demand or yield a [`MockPeer`].
pub(crate) struct MockTransport {
    fail_dials: AtomicUsize,
    dial_times: Mutex<Vec<Instant>>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockTransport {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            fail_dials: AtomicUsize::new(0),
            dial_times: Mutex::new(Vec::new()),
            peers,
        });
        (transport, peer_rx)
    }

    /// Makes the next `n` dials fail.
    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_dials.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_always(&self) {
        self.fail_dials.store(usize::MAX, Ordering::SeqCst);
    }

    pub(crate) fn dial_count(&self) -> usize {
        self.dial_times.lock().len()
    }

    pub(crate) fn dial_times(&self) -> Vec<Instant> {
        self.dial_times.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dial(&self, addr: &str) -> io::Result<Arc<dyn Connection>> {
        self.dial_times.lock().push(Instant::now());

        let fail = self
            .fail_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(n),
                n => Some(n - 1),
            })
            .is_ok();
        if fail {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock dial refused",
            ));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let conn = Arc::new(MockConnection {
            addr: addr.to_string(),
            inbound: tokio::sync::Mutex::new(inbound_rx),
            outbound: outbound_tx,
            closed,
        });
        let _ = self.peers.send(MockPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
        });
        Ok(conn)
    }
}

struct MockConnection {
    addr: String,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u8, Bytes)>>,
    outbound: mpsc::UnboundedSender<(u8, Bytes)>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn write(&self, opcode: u8, payload: Bytes) -> Result<(), DispatchError> {
        if *self.closed.borrow() {
            return Err(DispatchError::ConnectionClosed);
        }
        self.outbound
            .send((opcode, payload))
            .map_err(|_| DispatchError::ConnectionClosed)
    }

    async fn receive(&self) -> Result<(u8, Bytes), DispatchError> {
        let closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = closed_signal(closed) => Err(DispatchError::ConnectionClosed),
            next = inbound.recv() => next.ok_or_else(|| {
                DispatchError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "peer hung up"))
            }),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    fn address(&self) -> &str {
        &self.addr
    }
}

/// Remote end of a mock connection. Dropping it hangs up.
pub(crate) struct MockPeer {
    inbound: mpsc::UnboundedSender<(u8, Bytes)>,
    outbound: mpsc::UnboundedReceiver<(u8, Bytes)>,
}

impl MockPeer {
    pub(crate) fn send(&self, frame: impl Into<Frame>) {
        let frame = frame.into();
        self.send_raw(frame.opcode().as_u8(), frame.serialize().unwrap());
    }

    pub(crate) fn send_raw(&self, opcode: u8, payload: Bytes) {
        let _ = self.inbound.send((opcode, payload));
    }

    /// Next frame written by the local side; panics after two seconds.
    pub(crate) async fn next_frame(&mut self) -> Frame {
        let (opcode, payload) = tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("no frame written")
            .expect("connection dropped");
        Frame::decode(opcode, payload).unwrap()
    }

    pub(crate) fn try_next(&mut self) -> Option<(u8, Bytes)> {
        self.outbound.try_recv().ok()
    }
}

/// Waits up to two seconds for the next dialed peer.
pub(crate) async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MockPeer>) -> MockPeer {
    tokio::time::timeout(Duration::from_secs(2), peers.recv())
        .await
        .expect("no dial happened")
        .expect("transport dropped")
}

/// Polls `check` until it holds or two seconds pass.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
