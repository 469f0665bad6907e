//! A paired inbound/upstream connection and its joint lifecycle.
//!
//! The loop owns each session through its registry; connections hold weak
//! back-references, so the ownership cycle breaks at dispose. Disposal is
//! guarded by a compare-and-swap on the disposed flag: whichever task or
//! thread wins runs teardown exactly once.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::event_loop::{panic_message, LoopShared};
use crate::events::ProxyEvents;
use crate::proxy::connection::{Connection, Direction};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One proxied client: the inbound connection, the paired upstream
/// connection, and their shared lifecycle.
pub struct Session {
    id: u64,
    local: Connection,
    remote: Connection,
    event_loop: Arc<LoopShared>,
    closed_tx: watch::Sender<bool>,
    disposed: AtomicBool,
    user_token: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Session {
    pub(crate) fn new(
        event_loop: Arc<LoopShared>,
        inbound: TcpStream,
        upstream: TcpStream,
    ) -> Arc<Self> {
        let high = event_loop.config().pipe_high_watermark;
        let low = event_loop.config().pipe_low_watermark;
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            local: Connection::new(inbound, Direction::Local, high, low),
            remote: Connection::new(upstream, Direction::Remote, high, low),
            event_loop,
            closed_tx,
            disposed: AtomicBool::new(false),
            user_token: Mutex::new(None),
        })
    }

    /// Numeric id for log correlation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once disposal has begun; no message events fire afterwards.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Attach or replace the embedder's opaque per-session state.
    pub fn set_user_token(&self, token: Option<Box<dyn Any + Send>>) {
        *self.user_token.lock().unwrap() = token;
    }

    /// Remove and return the embedder's opaque per-session state.
    pub fn take_user_token(&self) -> Option<Box<dyn Any + Send>> {
        self.user_token.lock().unwrap().take()
    }

    /// Sends a message (NUL appended by the core) to the inbound peer.
    /// Worker thread only.
    pub async fn send_local(&self, payload: &[u8]) -> Result<(), ProxyError> {
        self.ensure_worker()?;
        self.local.send_framed(payload).await
    }

    /// Text variant of [`send_local`]. The protocol carries ASCII.
    ///
    /// [`send_local`]: Session::send_local
    pub async fn send_local_text(&self, text: &str) -> Result<(), ProxyError> {
        self.send_local(text.as_bytes()).await
    }

    /// Sends a message (NUL appended by the core) to the upstream peer.
    /// Worker thread only.
    pub async fn send_remote(&self, payload: &[u8]) -> Result<(), ProxyError> {
        self.ensure_worker()?;
        self.remote.send_framed(payload).await
    }

    /// Text variant of [`send_remote`].
    ///
    /// [`send_remote`]: Session::send_remote
    pub async fn send_remote_text(&self, text: &str) -> Result<(), ProxyError> {
        self.send_remote(text.as_bytes()).await
    }

    /// Requests disposal from any thread.
    ///
    /// On the worker the teardown is queued as a task; from foreign threads
    /// it is scheduled onto the worker, falling back to an in-place teardown
    /// without events when the loop can no longer run work (sockets must not
    /// leak even then).
    pub fn dispose(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        if self.event_loop.is_worker_thread() {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                session.dispose_on_worker().await;
            });
            return;
        }
        let session = Arc::clone(self);
        let scheduled = self.event_loop.schedule(Box::new(move || {
            tokio::spawn(async move {
                session.dispose_on_worker().await;
            });
        }));
        if scheduled.is_err() {
            self.fallback_teardown();
        }
    }

    pub(crate) fn events(&self) -> &Arc<dyn ProxyEvents> {
        self.event_loop.events()
    }

    pub(crate) fn closed_rx(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Emits the connected event, then starts all six relay tasks.
    pub(crate) async fn start(self: &Arc<Self>, recv_chunk: usize) {
        info!(session = self.id, "session connected");
        let events = Arc::clone(self.events());
        if let Err(panic) = AssertUnwindSafe(events.on_client_state_changed(self, true))
            .catch_unwind()
            .await
        {
            events.on_error("state callback", panic_message(panic));
        }
        self.local.start(self, recv_chunk);
        self.remote.start(self, recv_chunk);
    }

    /// Runs teardown on the worker: disconnected event, shutdown signal,
    /// pipe completion, deregistration. Only the first caller proceeds.
    pub(crate) async fn dispose_on_worker(self: &Arc<Self>) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!(session = self.id, "session disposing");
        let events = Arc::clone(self.events());
        if let Err(panic) = AssertUnwindSafe(events.on_client_state_changed(self, false))
            .catch_unwind()
            .await
        {
            events.on_error("state callback", panic_message(panic));
        }
        let _ = self.closed_tx.send(true);
        self.local.complete_pipes();
        self.remote.complete_pipes();
        self.event_loop.unregister(self.id);
    }

    /// Teardown without events, for when the worker can no longer run.
    fn fallback_teardown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.closed_tx.send(true);
        self.local.complete_pipes();
        self.remote.complete_pipes();
        self.event_loop.unregister(self.id);
    }

    fn ensure_worker(&self) -> Result<(), ProxyError> {
        if self.event_loop.is_worker_thread() {
            Ok(())
        } else {
            Err(ProxyError::WrongThread)
        }
    }
}
