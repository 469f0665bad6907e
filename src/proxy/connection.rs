//! One proxied TCP socket and its byte pipelines.
//!
//! Each connection owns a receive pipe (socket bytes in, framer out) and a
//! send pipe (user messages in, socket out), driven by three cooperative
//! tasks on the worker:
//!
//! ```text
//! socket ──read──▶ recv pipe ──frame──▶ observer callback
//! user send ─────▶ send pipe ──write──▶ socket
//! ```
//!
//! A task observing EOF, a socket error, or the shutdown signal completes
//! its pipe half; the framer and socket writer additionally trigger disposal
//! of the owning session once their pipes report completion, so buffered
//! complete messages drain before teardown.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::trace;

use crate::error::ProxyError;
use crate::event_loop::panic_message;
use crate::events::SessionRef;
use crate::proxy::pipe::{pipe, PipeHandle, PipeReader, PipeWriter};
use crate::proxy::session::Session;

/// Which peer a connection faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The inbound peer that dialed the proxy.
    Local,
    /// The upstream peer the proxy dialed.
    Remote,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Local => f.write_str("local"),
            Direction::Remote => f.write_str("remote"),
        }
    }
}

/// A proxied socket with its receive and send pipes.
pub struct Connection {
    direction: Direction,
    /// Producer half of the send pipe. Locked so message callbacks can send
    /// while an earlier send is still parked on backpressure; the lock is
    /// only ever contended between tasks of the one worker thread.
    send_writer: Mutex<PipeWriter>,
    recv_pipe: PipeHandle,
    send_pipe: PipeHandle,
    io: StdMutex<Option<ConnIo>>,
}

/// Halves handed to the relay tasks at start.
struct ConnIo {
    stream: TcpStream,
    recv_writer: PipeWriter,
    recv_reader: PipeReader,
    send_reader: PipeReader,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, direction: Direction, high: usize, low: usize) -> Self {
        let (recv_writer, recv_reader, recv_pipe) = pipe(high, low);
        let (send_writer, send_reader, send_pipe) = pipe(high, low);
        Self {
            direction,
            send_writer: Mutex::new(send_writer),
            recv_pipe,
            send_pipe,
            io: StdMutex::new(Some(ConnIo {
                stream,
                recv_writer,
                recv_reader,
                send_reader,
            })),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Completes all four pipe halves, waking every parked task.
    pub(crate) fn complete_pipes(&self) {
        self.recv_pipe.complete_both();
        self.send_pipe.complete_both();
    }

    /// Spawns the three relay tasks on the worker runtime.
    pub(crate) fn start(&self, session: &SessionRef, recv_chunk: usize) {
        let Some(io) = self.io.lock().unwrap().take() else {
            return;
        };
        let (read_half, write_half) = io.stream.into_split();
        let direction = self.direction;
        let closed = session.closed_rx();
        let weak = Arc::downgrade(session);

        tokio::spawn(recv_from_socket(
            read_half,
            io.recv_writer,
            closed.clone(),
            direction,
            recv_chunk,
        ));
        tokio::spawn(frame_from_recv(io.recv_reader, weak.clone(), direction));
        tokio::spawn(send_to_socket(
            write_half,
            io.send_reader,
            closed,
            weak,
            direction,
        ));
    }

    /// Appends `payload` plus the NUL terminator to the send pipe and
    /// flushes, propagating pipe backpressure to the caller. After disposal
    /// the bytes are silently discarded.
    pub(crate) async fn send_framed(&self, payload: &[u8]) -> Result<(), ProxyError> {
        if payload.contains(&0) {
            return Err(ProxyError::InvalidMessage);
        }
        let mut writer = self.send_writer.lock().await;
        let region = writer.writable(payload.len() + 1);
        region[..payload.len()].copy_from_slice(payload);
        region[payload.len()] = 0;
        writer.advance(payload.len() + 1);
        writer.flush().await;
        Ok(())
    }
}

/// Reads the socket into the receive pipe until EOF, error, shutdown, or
/// reader completion.
///
/// Does not trigger disposal itself: completing the writer routes through
/// the framer, which drains any buffered complete messages before tearing
/// the session down. A trailing message that arrives together with EOF is
/// therefore still delivered ahead of the disconnected event.
async fn recv_from_socket(
    mut read_half: OwnedReadHalf,
    mut writer: PipeWriter,
    mut closed: watch::Receiver<bool>,
    direction: Direction,
    recv_chunk: usize,
) {
    loop {
        let region = writer.writable(recv_chunk);
        let n = tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            result = read_half.read(region) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    trace!(%direction, error = %e, "socket read failed");
                    break;
                }
            },
        };
        writer.advance(n);
        if writer.flush().await.completed {
            break;
        }
    }
    writer.complete();
    drop(read_half);
}

/// Cuts the receive pipe's byte stream into NUL-terminated messages and
/// delivers each to the observer. A trailing fragment without a NUL stays in
/// the pipe until more bytes arrive; on EOF it is discarded undelivered.
async fn frame_from_recv(mut reader: PipeReader, session: Weak<Session>, direction: Direction) {
    'outer: loop {
        let result = reader.read().await;
        let buf = result.buf;
        let mut consumed = 0usize;
        loop {
            let Some(nul) = buf.position(consumed, 0) else {
                break;
            };
            let Some(strong) = session.upgrade() else {
                break 'outer;
            };
            if strong.is_disposed() {
                break 'outer;
            }
            let bytes = buf.copy_range(consumed..nul);
            let text = String::from_utf8_lossy(&bytes);
            deliver_message(&strong, direction, &text).await;
            consumed = nul + 1;
        }
        reader.advance_to(consumed, buf.len());
        if result.completed {
            break;
        }
    }
    reader.complete();
    dispose_session(&session).await;
}

async fn deliver_message(session: &SessionRef, direction: Direction, text: &str) {
    let events = Arc::clone(session.events());
    let callback = async {
        match direction {
            Direction::Local => events.on_local_message(session, text).await,
            Direction::Remote => events.on_remote_message(session, text).await,
        }
    };
    if let Err(panic) = AssertUnwindSafe(callback).catch_unwind().await {
        events.on_error("message callback", panic_message(panic));
    }
}

/// Drains the send pipe to the socket until completion, error, or shutdown.
async fn send_to_socket(
    mut write_half: OwnedWriteHalf,
    mut reader: PipeReader,
    mut closed: watch::Receiver<bool>,
    session: Weak<Session>,
    direction: Direction,
) {
    'outer: loop {
        let result = reader.read().await;
        for segment in result.buf.segments() {
            let ok = tokio::select! {
                biased;
                _ = closed.wait_for(|c| *c) => false,
                r = write_half.write_all(segment) => match r {
                    Ok(()) => true,
                    Err(e) => {
                        trace!(%direction, error = %e, "socket write failed");
                        false
                    }
                },
            };
            if !ok {
                break 'outer;
            }
        }
        reader.advance_to(result.buf.len(), result.buf.len());
        if result.completed {
            break;
        }
    }
    reader.complete();
    let _ = write_half.shutdown().await;
    dispose_session(&session).await;
}

async fn dispose_session(session: &Weak<Session>) {
    if let Some(session) = session.upgrade() {
        session.dispose_on_worker().await;
    }
}
