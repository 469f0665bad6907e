//! Proxy core: pipes, connections, sessions, acceptor.
//!
//! ```text
//! Client ─▶ Acceptor ─▶ Session ┬─ local Connection  ─ recv pipe ─ framer ─▶ observer
//!                               └─ remote Connection ─ send pipe ─▶ upstream socket
//! ```
//!
//! Every component here runs on the event loop's worker thread; see
//! [`crate::event_loop`] for the scheduling model.

pub mod acceptor;
pub mod connection;
pub mod pipe;
pub mod session;

pub use acceptor::{Acceptor, BACKLOG};
pub use connection::{Connection, Direction};
pub use pipe::{FlushResult, PipeBuf, PipeReader, PipeWriter, ReadResult};
pub use session::Session;
