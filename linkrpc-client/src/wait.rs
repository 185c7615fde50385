//! Request correlation.
//!
//! Each outbound call registers a [`PendingCall`] under a fresh request ID and
//! parks on it; the response handler resolves the ID with [`WaitRegistry::callback`].
//! Responses may arrive in any order.
//!
//! Calls that time out or are dropped are remembered in a bounded set, so a
//! reply that arrives after its caller gave up is told apart from a reply for
//! an ID that was never issued.

use crate::error::DispatchError;
use crate::ids;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Result delivered to a waiting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub result: Option<Bytes>,
    pub err: Option<String>,
}

impl CallResult {
    pub fn ok(result: impl Into<Bytes>) -> Self {
        Self {
            result: Some(result.into()),
            err: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: None,
            err: Some(message.into()),
        }
    }

    /// Converts into the caller-facing result; remote errors become
    /// [`DispatchError::Remote`].
    pub fn into_result(self) -> Result<Bytes, DispatchError> {
        match self.err {
            Some(message) => Err(DispatchError::Remote(message)),
            None => Ok(self.result.unwrap_or_default()),
        }
    }
}

/// Number of abandoned request IDs remembered for late replies.
pub const ABANDONED_CAPACITY: usize = 1024;

/// Outcome of a successful [`WaitRegistry::callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the waiting caller.
    Delivered,
    /// The caller timed out or went away; the reply was discarded.
    Abandoned,
}

struct Slot {
    tx: oneshot::Sender<CallResult>,
    connection_id: Option<String>,
}

#[derive(Default)]
struct Slots {
    pending: HashMap<String, Slot>,
    abandoned: HashSet<String>,
    abandoned_order: VecDeque<String>,
    closed: bool,
}

impl Slots {
    fn abandon(&mut self, id: String) {
        if !self.abandoned.insert(id.clone()) {
            return;
        }
        self.abandoned_order.push_back(id);
        while self.abandoned_order.len() > ABANDONED_CAPACITY {
            if let Some(oldest) = self.abandoned_order.pop_front() {
                self.abandoned.remove(&oldest);
            }
        }
    }
}

/// Registry of in-flight calls keyed by request ID.
#[derive(Clone, Default)]
pub struct WaitRegistry {
    slots: Arc<Mutex<Slots>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new pending call under a fresh request ID.
    pub fn register(&self) -> Result<PendingCall, DispatchError> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(DispatchError::ConnectionClosed);
        }

        let mut id = ids::new_id();
        while slots.pending.contains_key(&id) {
            id = ids::new_id();
        }
        slots.pending.insert(
            id.clone(),
            Slot {
                tx,
                connection_id: None,
            },
        );

        Ok(PendingCall {
            id,
            rx: Some(rx),
            slots: self.slots.clone(),
        })
    }

    /// Resolves the pending call registered under `request_id`.
    ///
    /// A reply for a call that timed out or was dropped is discarded and
    /// reported as [`Delivery::Abandoned`], once. Fails with
    /// [`DispatchError::NoSuchPendingCall`] if the ID was never issued or is
    /// already resolved.
    pub fn callback(&self, request_id: &str, result: CallResult) -> Result<Delivery, DispatchError> {
        let slot = {
            let mut slots = self.slots.lock();
            match slots.pending.remove(request_id) {
                Some(slot) => slot,
                None if slots.abandoned.remove(request_id) => return Ok(Delivery::Abandoned),
                None => return Err(DispatchError::NoSuchPendingCall(request_id.to_string())),
            }
        };

        if slot.tx.send(result).is_err() {
            tracing::debug!("caller for request {} went away before delivery", request_id);
        }
        Ok(Delivery::Delivered)
    }

    /// Fails every call bound to `connection_id` with
    /// [`DispatchError::ConnectionClosed`]. The registry stays open.
    pub fn fail_connection(&self, connection_id: &str) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.pending.len();
        slots
            .pending
            .retain(|_, slot| slot.connection_id.as_deref() != Some(connection_id));
        let failed = before - slots.pending.len();
        if failed > 0 {
            tracing::debug!(
                "failed {} pending calls on connection [{}]",
                failed,
                connection_id
            );
        }
        failed
    }

    /// Tears the registry down: every waiter resolves with
    /// [`DispatchError::ConnectionClosed`] and new registrations fail.
    pub fn close(&self) {
        let mut slots = self.slots.lock();
        slots.closed = true;
        let dropped = slots.pending.len();
        slots.pending.clear();
        if dropped > 0 {
            tracing::debug!("released {} pending calls on close", dropped);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.slots.lock().closed
    }

    /// Returns the number of unresolved calls.
    pub fn pending_count(&self) -> usize {
        self.slots.lock().pending.len()
    }
}

/// Handle to one in-flight call. Dropping it unresolved forgets the call.
pub struct PendingCall {
    id: String,
    rx: Option<oneshot::Receiver<CallResult>>,
    slots: Arc<Mutex<Slots>>,
}

impl PendingCall {
    /// Request ID to embed in the outbound Request frame.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ties the call to the connection its request is written on, so
    /// [`WaitRegistry::fail_connection`] releases it.
    pub fn bind(&self, connection_id: &str) {
        if let Some(slot) = self.slots.lock().pending.get_mut(&self.id) {
            slot.connection_id = Some(connection_id.to_string());
        }
    }

    /// Waits for the matching response.
    ///
    /// With a `deadline`, gives up after that long with
    /// [`DispatchError::Timeout`] and forgets the call.
    pub async fn wait(mut self, deadline: Option<Duration>) -> Result<CallResult, DispatchError> {
        let rx = self.rx.take().ok_or(DispatchError::ConnectionClosed)?;

        let received = match deadline {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::debug!("request {} timed out after {:?}", self.id, limit);
                    return Err(DispatchError::Timeout);
                }
            },
            None => rx.await,
        };

        received.map_err(|_| DispatchError::ConnectionClosed)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        if slots.pending.remove(&self.id).is_some() {
            slots.abandon(std::mem::take(&mut self.id));
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall").field("id", &self.id).finish()
    }
}
