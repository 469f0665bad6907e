//! Error types for the proxy core.

use thiserror::Error;

/// Errors surfaced by the proxy core.
///
/// Transport failures are never returned through this type; they are
/// recovered per session and reported only through the disconnected state
/// event.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The operation is only valid on the event loop's worker thread.
    #[error("operation must be called from the event loop worker thread")]
    WrongThread,

    /// The event loop is disposing and no longer accepts work.
    #[error("event loop is shutting down")]
    ShuttingDown,

    /// A send payload contains a NUL byte, which would split the frame.
    #[error("message payload contains a NUL byte")]
    InvalidMessage,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
