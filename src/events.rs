//! Observer interface for proxy events.
//!
//! The embedder passes one observer object at event loop construction; every
//! callback is invoked on the loop's worker thread, so observers may hold
//! plain state behind ordinary locks without worrying about reentrancy from
//! other threads. Message callbacks may call `send_local` / `send_remote` on
//! the session (and await them) to rewrite or forward traffic.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::proxy::session::Session;

/// Shared handle to a live proxy session.
pub type SessionRef = Arc<Session>;

/// Callbacks fired by the proxy core. All methods run on the worker thread.
///
/// Default implementations do nothing, so embedders implement only the
/// events they care about.
#[async_trait]
pub trait ProxyEvents: Send + Sync + 'static {
    /// A complete message arrived from the inbound peer.
    async fn on_local_message(&self, session: &SessionRef, text: &str) {
        let _ = (session, text);
    }

    /// A complete message arrived from the upstream peer.
    async fn on_remote_message(&self, session: &SessionRef, text: &str) {
        let _ = (session, text);
    }

    /// The session entered running (`true`) or was disposed (`false`).
    ///
    /// The `true` event precedes every message event for the session; the
    /// `false` event fires exactly once, before socket teardown.
    async fn on_client_state_changed(&self, session: &SessionRef, connected: bool) {
        let _ = (session, connected);
    }

    /// Periodic heartbeat carrying elapsed milliseconds since loop start.
    /// Values are monotonically non-decreasing.
    async fn on_tick(&self, elapsed_ms: u64) {
        let _ = elapsed_ms;
    }

    /// Error sink for caught callback panics and background failures.
    /// The loop survives anything reported here.
    fn on_error(&self, context: &'static str, detail: String) {
        error!(context, detail = %detail, "proxy error");
    }
}
