//! In-process byte pipe with watermark backpressure.
//!
//! A pipe decouples a producer task from a consumer task: the producer
//! stages bytes into writable memory, commits them with [`PipeWriter::flush`],
//! and the consumer sees them as a cheap multi-segment view from
//! [`PipeReader::read`]. Flush suspends once the unread backlog reaches the
//! high watermark and resumes when the reader drains to the low watermark,
//! which is what lets a slow socket writer slow down a fast socket reader
//! without unbounded buffering.
//!
//! Exactly one producer and one consumer drive each pipe. The shared state is
//! mutex-guarded so the halves may live on different tasks; in this system
//! both halves run on the event loop's worker thread.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes, BytesMut};

/// Granularity for growing the writer's staging buffer.
const STAGE_CHUNK: usize = 4 * 1024;

struct PipeState {
    /// Committed, unconsumed segments, oldest first.
    segments: VecDeque<Bytes>,
    /// Total committed, unconsumed bytes.
    buffered: usize,
    /// Bytes from the head the reader has examined without consuming.
    /// `read` does not resolve until `buffered` exceeds this mark.
    examined: usize,
    writer_done: bool,
    reader_done: bool,
    read_waker: Option<Waker>,
    flush_waker: Option<Waker>,
    high: usize,
    low: usize,
}

impl PipeState {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_flusher(&mut self) {
        if let Some(waker) = self.flush_waker.take() {
            waker.wake();
        }
    }
}

/// Creates a pipe with the given watermarks.
///
/// Returns the writer half, the reader half, and a teardown handle that can
/// complete both halves at once.
pub fn pipe(high: usize, low: usize) -> (PipeWriter, PipeReader, PipeHandle) {
    let shared = Arc::new(Mutex::new(PipeState {
        segments: VecDeque::new(),
        buffered: 0,
        examined: 0,
        writer_done: false,
        reader_done: false,
        read_waker: None,
        flush_waker: None,
        high,
        low,
    }));
    (
        PipeWriter {
            shared: Arc::clone(&shared),
            staged: BytesMut::new(),
            staged_len: 0,
        },
        PipeReader {
            shared: Arc::clone(&shared),
            last_len: 0,
        },
        PipeHandle { shared },
    )
}

/// Teardown handle: completes both halves, waking any parked task.
#[derive(Clone)]
pub struct PipeHandle {
    shared: Arc<Mutex<PipeState>>,
}

impl PipeHandle {
    /// Marks both halves completed. Idempotent.
    pub fn complete_both(&self) {
        let mut state = self.shared.lock().unwrap();
        state.writer_done = true;
        state.reader_done = true;
        state.wake_reader();
        state.wake_flusher();
    }
}

/// Producer half of a pipe.
pub struct PipeWriter {
    shared: Arc<Mutex<PipeState>>,
    staged: BytesMut,
    staged_len: usize,
}

impl PipeWriter {
    /// Returns a writable region of at least `min` bytes.
    ///
    /// Staged bytes become visible to the reader only after [`advance`]
    /// followed by [`flush`].
    ///
    /// [`advance`]: PipeWriter::advance
    /// [`flush`]: PipeWriter::flush
    pub fn writable(&mut self, min: usize) -> &mut [u8] {
        let want = self.staged_len + min.max(STAGE_CHUNK);
        if self.staged.len() < want {
            self.staged.resize(want, 0);
        }
        &mut self.staged[self.staged_len..]
    }

    /// Marks `n` bytes of the writable region as produced.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.staged_len + n <= self.staged.len());
        self.staged_len += n;
    }

    /// Commits produced bytes and wakes the reader, then suspends while the
    /// unread backlog is at or above the high watermark, until the reader
    /// drains to the low watermark or completes.
    ///
    /// The commit itself happens eagerly, so cancelling the returned future
    /// never loses committed bytes.
    pub fn flush(&mut self) -> Flush<'_> {
        let committed = self.staged.split_to(self.staged_len).freeze();
        self.staged_len = 0;
        {
            let mut state = self.shared.lock().unwrap();
            if !committed.is_empty() && !state.reader_done && !state.writer_done {
                state.buffered += committed.len();
                state.segments.push_back(committed);
                state.wake_reader();
            }
        }
        Flush {
            shared: &self.shared,
            parked: false,
        }
    }

    /// Signals EOF to the reader. Idempotent.
    pub fn complete(&mut self) {
        let mut state = self.shared.lock().unwrap();
        state.writer_done = true;
        state.wake_reader();
        state.wake_flusher();
    }
}

/// Future returned by [`PipeWriter::flush`].
pub struct Flush<'a> {
    shared: &'a Arc<Mutex<PipeState>>,
    parked: bool,
}

impl Future for Flush<'_> {
    type Output = FlushResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<FlushResult> {
        let flush = self.get_mut();
        let mut state = flush.shared.lock().unwrap();
        let drained = if flush.parked {
            state.buffered <= state.low
        } else {
            state.buffered < state.high
        };
        if state.reader_done || state.writer_done || drained {
            Poll::Ready(FlushResult {
                completed: state.reader_done,
            })
        } else {
            flush.parked = true;
            state.flush_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Outcome of a flush.
#[derive(Debug, Clone, Copy)]
pub struct FlushResult {
    /// True when the reader has completed the pipe; further writes go nowhere.
    pub completed: bool,
}

/// Consumer half of a pipe.
pub struct PipeReader {
    shared: Arc<Mutex<PipeState>>,
    last_len: usize,
}

impl PipeReader {
    /// Suspends until bytes beyond the examined mark arrive or the writer
    /// completes, then returns a view of all unconsumed bytes.
    pub fn read(&mut self) -> Read<'_> {
        Read { reader: self }
    }

    /// Releases the first `consumed` bytes of the last returned buffer and
    /// records that the first `examined` bytes were inspected. The next
    /// [`read`] does not resolve until bytes beyond `examined` arrive or the
    /// writer completes.
    ///
    /// [`read`]: PipeReader::read
    pub fn advance_to(&mut self, consumed: usize, examined: usize) {
        debug_assert!(consumed <= examined && examined <= self.last_len);
        let mut state = self.shared.lock().unwrap();
        let mut remaining = consumed.min(state.buffered);
        state.buffered -= remaining;
        while remaining > 0 {
            let Some(front) = state.segments.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                state.segments.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
        state.examined = examined.saturating_sub(consumed);
        if state.buffered <= state.low {
            state.wake_flusher();
        }
    }

    /// Signals that nothing further will be consumed. Idempotent.
    pub fn complete(&mut self) {
        let mut state = self.shared.lock().unwrap();
        state.reader_done = true;
        state.wake_flusher();
    }
}

/// Future returned by [`PipeReader::read`].
pub struct Read<'a> {
    reader: &'a mut PipeReader,
}

impl Future for Read<'_> {
    type Output = ReadResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<ReadResult> {
        let read = self.get_mut();
        let shared = Arc::clone(&read.reader.shared);
        let mut state = shared.lock().unwrap();
        if state.buffered > state.examined || state.writer_done {
            let buf = PipeBuf {
                segments: state.segments.iter().cloned().collect(),
                len: state.buffered,
            };
            read.reader.last_len = state.buffered;
            Poll::Ready(ReadResult {
                buf,
                completed: state.writer_done,
            })
        } else {
            state.read_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Outcome of a read.
#[derive(Debug)]
pub struct ReadResult {
    /// All unconsumed bytes, possibly spanning several segments.
    pub buf: PipeBuf,
    /// True when the writer has completed. Buffered bytes may still be
    /// present and must be drained before completion is honored.
    pub completed: bool,
}

/// A cheap, possibly non-contiguous view of a pipe's unconsumed bytes.
///
/// Offsets in the accessors are relative to the start of the view.
#[derive(Debug, Default)]
pub struct PipeBuf {
    segments: Vec<Bytes>,
    len: usize,
}

impl PipeBuf {
    /// Total bytes in the view.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the view holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The underlying segments, in order.
    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// Offset of the first occurrence of `byte` at or after `from`.
    pub fn position(&self, from: usize, byte: u8) -> Option<usize> {
        let mut offset = 0;
        for segment in &self.segments {
            let end = offset + segment.len();
            if end > from {
                let start = from.saturating_sub(offset);
                if let Some(i) = segment[start..].iter().position(|&b| b == byte) {
                    return Some(offset + start + i);
                }
            }
            offset = end;
        }
        None
    }

    /// Copies `range` into an owned vector.
    pub fn copy_range(&self, range: Range<usize>) -> Vec<u8> {
        let mut out = Vec::with_capacity(range.end.saturating_sub(range.start));
        let mut offset = 0;
        for segment in &self.segments {
            let end = offset + segment.len();
            if end > range.start && offset < range.end {
                let from = range.start.saturating_sub(offset);
                let to = (range.end - offset).min(segment.len());
                out.extend_from_slice(&segment[from..to]);
            }
            offset = end;
            if offset >= range.end {
                break;
            }
        }
        out
    }
}
