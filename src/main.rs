//! nulproxy
//!
//! Transparent TCP proxy for NUL-terminated ASCII message streams.
//!
//! This binary wires the proxy core to a forwarding observer: every message
//! from the inbound peer is relayed to the upstream peer unchanged, and vice
//! versa, so the proxy is a byte-transparent middlebox that can log framed
//! traffic as it passes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nulproxy::{Acceptor, EventLoop, ProxyConfig, ProxyEvents, SessionRef};

#[derive(Parser, Debug)]
#[command(
    name = "nulproxy",
    about = "Transparent TCP proxy for NUL-terminated ASCII messages"
)]
struct Args {
    /// Local endpoint to listen on.
    #[arg(long, default_value = "127.0.0.1:7000")]
    listen: SocketAddr,

    /// Upstream endpoint to dial for each inbound connection.
    #[arg(long)]
    upstream: SocketAddr,

    /// Minimum milliseconds between tick emissions (0 spins).
    #[arg(long, default_value_t = 1)]
    tick_ms: u64,
}

/// Relays every framed message to the opposite peer unchanged.
struct Forwarder;

#[async_trait]
impl ProxyEvents for Forwarder {
    async fn on_local_message(&self, session: &SessionRef, text: &str) {
        debug!(session = session.id(), len = text.len(), "local -> remote");
        if let Err(e) = session.send_remote_text(text).await {
            debug!(session = session.id(), error = %e, "forward to remote failed");
        }
    }

    async fn on_remote_message(&self, session: &SessionRef, text: &str) {
        debug!(session = session.id(), len = text.len(), "remote -> local");
        if let Err(e) = session.send_local_text(text).await {
            debug!(session = session.id(), error = %e, "forward to local failed");
        }
    }

    async fn on_client_state_changed(&self, session: &SessionRef, connected: bool) {
        info!(session = session.id(), connected, "session state changed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ProxyConfig::default().with_tick_period(Duration::from_millis(args.tick_ms));
    let event_loop = EventLoop::new(&config, Arc::new(Forwarder))?;
    let addr = Acceptor::bind(&event_loop, args.listen, args.upstream)?;
    info!(listen = %addr, upstream = %args.upstream, "proxy running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    event_loop.dispose();
    Ok(())
}
