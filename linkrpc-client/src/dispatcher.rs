//! Single-link dispatcher.
//!
//! Owns the one active connection to a peer, writes outbound frames to it and
//! runs a receive loop per connection that feeds inbound packets to the
//! [`Router`]. When a connection terminates, the loop runs the registered close
//! hooks exactly once with the connection ID and the terminating error (`None`
//! for a locally requested close).

use crate::error::{abort_on_fatal, DispatchError, FatalError, FatalSink};
use crate::ids;
use crate::router::{CtrlHandler, FrameHandler, Router};
use crate::transport::{Connection, Transport};
use linkrpc_protocol::Frame;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

/// Invoked once per connection termination: `(connection_id, error)`.
pub type CloseHook = Arc<dyn Fn(&str, Option<&DispatchError>) + Send + Sync>;

/// Hook registrations.
pub enum Hook {
    Close(CloseHook),
}

/// Router handler registrations.
pub enum Handle {
    /// Generic handler for Request/Response frames.
    Frame(FrameHandler),
    /// Handler for one control code.
    Ctrl(i32, CtrlHandler),
}

struct ActiveLink {
    id: String,
    conn: Arc<dyn Connection>,
    /// Set when the close was requested locally.
    closing: Arc<AtomicBool>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    router: Router,
    close_hooks: RwLock<Vec<CloseHook>>,
    fatal: RwLock<FatalSink>,
    link_addr: Mutex<Option<String>>,
    active: Mutex<Option<ActiveLink>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    /// Set by `close`, cleared by `link`. Written under the `reconnect` lock.
    closed: AtomicBool,
}

impl Inner {
    fn report_fatal(&self, err: FatalError) {
        let sink = self.fatal.read().clone();
        sink(err);
    }

    fn run_close_hooks(&self, connection_id: &str, err: Option<&DispatchError>) {
        let hooks = self.close_hooks.read().clone();
        for hook in hooks {
            hook(connection_id, err);
        }
    }
}

/// Dispatcher for single-link mode. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Non-owning handle for hooks that must not keep the dispatcher alive.
#[derive(Clone)]
pub struct WeakDispatcher {
    inner: Weak<Inner>,
}

impl WeakDispatcher {
    pub fn upgrade(&self) -> Option<Dispatcher> {
        self.inner.upgrade().map(|inner| Dispatcher { inner })
    }
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                router: Router::new(),
                close_hooks: RwLock::new(Vec::new()),
                fatal: RwLock::new(abort_on_fatal()),
                link_addr: Mutex::new(None),
                active: Mutex::new(None),
                reconnect: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // =========================================================================
    // Link lifecycle
    // =========================================================================

    /// Connects to `addr` and starts the receive loop for the new connection.
    ///
    /// The address is remembered for [`relink`](Self::relink) even when the
    /// dial fails. A connection that is already active is replaced and closed.
    /// Linking after [`close`](Self::close) re-enables reconnection.
    pub async fn link(&self, addr: &str) -> Result<(), DispatchError> {
        {
            let _slot = self.inner.reconnect.lock();
            self.inner.closed.store(false, Ordering::SeqCst);
        }
        self.connect(addr).await
    }

    async fn connect(&self, addr: &str) -> Result<(), DispatchError> {
        *self.inner.link_addr.lock() = Some(addr.to_string());

        let conn = self
            .inner
            .transport
            .dial(addr)
            .await
            .map_err(|source| DispatchError::Link {
                addr: addr.to_string(),
                source,
            })?;

        let id = ids::new_id();
        let closing = Arc::new(AtomicBool::new(false));
        let previous = self.inner.active.lock().replace(ActiveLink {
            id: id.clone(),
            conn: conn.clone(),
            closing: closing.clone(),
        });

        if let Some(previous) = previous {
            tracing::info!("replacing connection [{}]", previous.id);
            previous.closing.store(true, Ordering::SeqCst);
            previous.conn.close().await;
        }

        tracing::info!("link addr [{}] success, connID [{}]", conn.address(), id);
        tokio::spawn(receive_loop(self.inner.clone(), id, conn, closing));
        Ok(())
    }

    /// Links again to the last address passed to [`link`](Self::link).
    /// Does nothing once the dispatcher has been closed.
    pub async fn relink(&self) -> bool {
        if self.is_closed() {
            tracing::debug!("relink skipped, dispatcher is closed");
            return false;
        }

        let addr = self.inner.link_addr.lock().clone();
        let Some(addr) = addr else {
            self.inner.report_fatal(FatalError::NotLinked);
            return false;
        };

        match self.connect(&addr).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("relink failed: {}", e);
                false
            }
        }
    }

    /// Listening is a server-mode capability and always fails here.
    pub async fn listen(&self, addr: &str) -> Result<(), DispatchError> {
        tracing::error!("link mode can't listen on {}", addr);
        Err(DispatchError::ListenUnsupported)
    }

    /// Cancels any in-flight reconnection and closes the active connection.
    ///
    /// Close hooks run from the connection's receive loop with no error.
    /// Reconnection tasks handed to [`supervise`](Self::supervise) afterwards
    /// are aborted until the next [`link`](Self::link).
    pub async fn close(&self) {
        let reconnect = {
            let mut slot = self.inner.reconnect.lock();
            self.inner.closed.store(true, Ordering::SeqCst);
            slot.take()
        };
        if let Some(task) = reconnect {
            if !task.is_finished() {
                tracing::debug!("cancelling in-flight reconnection");
                task.abort();
            }
            // Wait so an aborted attempt cannot install a link after this point.
            let _ = task.await;
        }

        let active = self.inner.active.lock().take();
        if let Some(link) = active {
            link.closing.store(true, Ordering::SeqCst);
            link.conn.close().await;
            tracing::info!("closed connection [{}]", link.id);
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Writes `frame` to the active connection.
    pub async fn send(&self, frame: &Frame) -> Result<(), DispatchError> {
        let (_, conn) = self.active().ok_or(DispatchError::NotLinked)?;
        write_frame(conn.as_ref(), frame).await
    }

    /// Writes `frame` to the connection named `connection_id`, which must be
    /// the active one.
    pub async fn send_to(&self, connection_id: &str, frame: &Frame) -> Result<(), DispatchError> {
        match self.active() {
            Some((id, conn)) if id == connection_id => write_frame(conn.as_ref(), frame).await,
            other => Err(DispatchError::Addressing {
                requested: connection_id.to_string(),
                active: other.map(|(id, _)| id),
            }),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn hook(&self, hook: Hook) {
        match hook {
            Hook::Close(f) => self.inner.close_hooks.write().push(f),
        }
    }

    pub fn handle(&self, handle: Handle) {
        match handle {
            Handle::Frame(f) => self.inner.router.set_frame_handler(f),
            Handle::Ctrl(code, f) => self.inner.router.add_ctrl_handle(code, f),
        }
    }

    pub fn on_close<F>(&self, f: F)
    where
        F: Fn(&str, Option<&DispatchError>) + Send + Sync + 'static,
    {
        self.hook(Hook::Close(Arc::new(f)));
    }

    pub fn handle_frame<F>(&self, f: F)
    where
        F: Fn(&str, Frame) + Send + Sync + 'static,
    {
        self.handle(Handle::Frame(Arc::new(f)));
    }

    pub fn handle_ctrl<F>(&self, code: i32, f: F)
    where
        F: Fn(&str, bytes::Bytes) + Send + Sync + 'static,
    {
        self.handle(Handle::Ctrl(code, Arc::new(f)));
    }

    /// Replaces the sink that receives unrecoverable errors.
    pub fn on_fatal<F>(&self, f: F)
    where
        F: Fn(FatalError) + Send + Sync + 'static,
    {
        *self.inner.fatal.write() = Arc::new(f);
    }

    pub fn report_fatal(&self, err: FatalError) {
        self.inner.report_fatal(err);
    }

    /// Hands a reconnection task to the dispatcher so `close` can cancel it.
    /// A previous task still running is aborted.
    pub fn supervise(&self, task: JoinHandle<()>) {
        let previous = {
            let mut slot = self.inner.reconnect.lock();
            if self.inner.closed.load(Ordering::SeqCst) {
                tracing::debug!("dispatcher is closed, dropping reconnection task");
                task.abort();
                return;
            }
            slot.replace(task)
        };
        if let Some(previous) = previous {
            if !previous.is_finished() {
                previous.abort();
            }
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// ID of the active connection; a fresh ID is minted on every link.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.active.lock().as_ref().map(|link| link.id.clone())
    }

    /// Whether [`close`](Self::close) was called without a later `link`.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn is_linked(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    /// Address remembered for relinking.
    pub fn address(&self) -> Option<String> {
        self.inner.link_addr.lock().clone()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner
            .reconnect
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    #[cfg(test)]
    pub(crate) fn run_close_hooks(&self, connection_id: &str, err: Option<&DispatchError>) {
        self.inner.run_close_hooks(connection_id, err);
    }

    fn active(&self) -> Option<(String, Arc<dyn Connection>)> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|link| (link.id.clone(), link.conn.clone()))
    }
}

async fn write_frame(conn: &dyn Connection, frame: &Frame) -> Result<(), DispatchError> {
    let payload = frame.serialize()?;
    conn.write(frame.opcode().as_u8(), payload).await
}

async fn receive_loop(
    inner: Arc<Inner>,
    id: String,
    conn: Arc<dyn Connection>,
    closing: Arc<AtomicBool>,
) {
    let err = loop {
        match conn.receive().await {
            Ok((opcode, payload)) => {
                if let Err(e) = inner.router.dispatch(&id, opcode, payload) {
                    tracing::error!("[{}] dispatch failed: {}", id, e);
                    inner.report_fatal(match e {
                        DispatchError::NoFrameHandler => FatalError::MissingFrameHandler,
                        other => FatalError::ProtocolViolation(other.to_string()),
                    });
                }
            }
            Err(e) => break e,
        }
    };

    conn.close().await;
    {
        let mut active = inner.active.lock();
        if active.as_ref().is_some_and(|link| link.id == id) {
            *active = None;
        }
    }

    if closing.load(Ordering::SeqCst) {
        tracing::info!("connection [{}] closed", id);
        inner.run_close_hooks(&id, None);
    } else {
        tracing::warn!("connection [{}] lost: {}", id, err);
        inner.run_close_hooks(&id, Some(&err));
    }
}
