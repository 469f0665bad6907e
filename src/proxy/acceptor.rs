//! Listening socket and session hand-off.
//!
//! The acceptor binds on the worker (so the listening socket is owned by the
//! loop), accepts inbound connections, dials the fixed upstream endpoint for
//! each, and runs the resulting session. Accept and dial failures affect only
//! the nascent session; the accept loop keeps going until the loop shuts
//! down.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;
use crate::event_loop::{EventLoop, LoopShared};
use crate::proxy::session::Session;

/// Listener backlog.
pub const BACKLOG: u32 = 128;

/// Pause after a failed accept before retrying.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Binds a listener and proxies every inbound connection to `remote`.
pub struct Acceptor;

impl Acceptor {
    /// Begins accepting on `local`, pairing each inbound connection with an
    /// upstream connection to `remote`. Returns the bound address, so `:0`
    /// binds report their real port.
    ///
    /// The listening socket is created on the worker; callers on foreign
    /// threads block briefly until the worker reports the bound address.
    pub fn bind(
        event_loop: &EventLoop,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<SocketAddr, ProxyError> {
        let shared = Arc::clone(event_loop.shared());
        if shared.is_worker_thread() {
            let listener = listen(local)?;
            let addr = listener.local_addr()?;
            tokio::spawn(accept_loop(shared, listener, remote));
            return Ok(addr);
        }

        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let setup_shared = Arc::clone(&shared);
        shared.schedule(Box::new(move || {
            match listen(local).and_then(|l| l.local_addr().map(|addr| (addr, l))) {
                Ok((addr, listener)) => {
                    let _ = addr_tx.send(Ok(addr));
                    tokio::spawn(accept_loop(setup_shared, listener, remote));
                }
                Err(e) => {
                    let _ = addr_tx.send(Err(e));
                }
            }
        }))?;

        match addr_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Ok(addr)) => Ok(addr),
            Ok(Err(e)) => Err(ProxyError::Io(e)),
            Err(_) => Err(ProxyError::ShuttingDown),
        }
    }
}

/// Builds the listening socket with an explicit backlog.
fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

async fn accept_loop(shared: Arc<LoopShared>, listener: TcpListener, remote: SocketAddr) {
    let mut closed = shared.shutdown_rx();
    let local_addr = listener.local_addr().ok();
    let mut accepted: u64 = 0;
    let mut dial_failures: u64 = 0;

    info!(addr = ?local_addr, upstream = %remote, "listening");

    loop {
        let result = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            r = listener.accept() => r,
        };
        let (inbound, peer) = match result {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        debug!(peer = %peer, "inbound connection");

        let upstream = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            r = TcpStream::connect(remote) => match r {
                Ok(stream) => stream,
                Err(e) => {
                    dial_failures += 1;
                    warn!(peer = %peer, upstream = %remote, error = %e, "upstream dial failed");
                    // Dropping the inbound stream disposes the nascent session.
                    continue;
                }
            },
        };

        let _ = inbound.set_nodelay(true);
        let _ = upstream.set_nodelay(true);
        accepted += 1;

        let session = Session::new(Arc::clone(&shared), inbound, upstream);
        shared.register(Arc::clone(&session));
        session.start(shared.config().recv_chunk).await;
    }

    info!(accepted, dial_failures, "listener stopped");
}
