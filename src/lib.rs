//! Transparent TCP proxy for NUL-terminated ASCII message streams.
//!
//! The proxy accepts inbound TCP connections, dials a fixed upstream
//! endpoint for each, and relays bytes both ways while delivering every
//! complete NUL-terminated message to an embedder-supplied observer. The
//! observer may forward messages unchanged, rewrite them, or inject its own;
//! a periodic tick supports embedder-built timeouts and keep-alives.
//!
//! Everything observable happens on a single dedicated worker thread: one
//! event loop executes all I/O continuations, framing, and observer
//! callbacks, so embedders never see concurrent callbacks.
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use nulproxy::{Acceptor, EventLoop, ProxyConfig, ProxyEvents, SessionRef};
//!
//! struct Forwarder;
//!
//! #[async_trait::async_trait]
//! impl ProxyEvents for Forwarder {
//!     async fn on_local_message(&self, session: &SessionRef, text: &str) {
//!         let _ = session.send_remote_text(text).await;
//!     }
//!     async fn on_remote_message(&self, session: &SessionRef, text: &str) {
//!         let _ = session.send_local_text(text).await;
//!     }
//! }
//!
//! let event_loop = EventLoop::new(&ProxyConfig::default(), Arc::new(Forwarder))?;
//! let addr = Acceptor::bind(&event_loop, "127.0.0.1:7000".parse()?, "127.0.0.1:9000".parse()?)?;
//! // ... later:
//! event_loop.dispose();
//! ```

pub mod config;
pub mod error;
pub mod event_loop;
pub mod events;
pub mod proxy;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use event_loop::EventLoop;
pub use events::{ProxyEvents, SessionRef};
pub use proxy::{Acceptor, Direction, Session};
