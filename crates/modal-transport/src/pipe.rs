//! Bounded in-memory byte pipe with a terminal error slot.
//!
//! One [`PipeWriter`] (the stdio pump) feeds one [`PipeReader`] (the caller).
//! Writes block while the buffer is full. A writer may finish the pipe with
//! an error; the reader sees every byte written before it and then the error
//! on each subsequent read.

use crate::error::{Result, TransportError};
use bytes::{Buf, BytesMut};
use std::future::poll_fn;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use tokio::sync::Notify;

/// Buffer size used for exec stdout/stderr pipes.
pub const STDIO_PIPE_CAPACITY: usize = 64 * 1024;

struct State {
    buf: BytesMut,
    writer_closed: bool,
    reader_closed: bool,
    error: Option<TransportError>,
    read_waker: Option<Waker>,
}

impl State {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

struct Shared {
    capacity: usize,
    state: Mutex<State>,
    writable: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a pipe buffering at most `capacity` bytes.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        capacity: capacity.max(1),
        state: Mutex::new(State {
            buf: BytesMut::with_capacity(capacity.max(1)),
            writer_closed: false,
            reader_closed: false,
            error: None,
            read_waker: None,
        }),
        writable: Notify::new(),
    });
    (
        PipeWriter {
            shared: Arc::clone(&shared),
        },
        PipeReader { shared },
    )
}

/// Writing half of a [`pipe`].
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Write all of `data`, waiting for buffer space as needed.
    ///
    /// Fails once the reader has been closed.
    pub async fn write_all(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let writable = self.shared.writable.notified();
            {
                let mut state = self.shared.lock();
                if state.reader_closed {
                    return Err(TransportError::Stream("pipe reader closed".into()));
                }
                if state.writer_closed {
                    return Err(TransportError::Stream("write to closed pipe".into()));
                }
                let space = self.shared.capacity - state.buf.len();
                if space > 0 {
                    let n = space.min(data.len());
                    state.buf.extend_from_slice(&data[..n]);
                    data = &data[n..];
                    state.wake_reader();
                    continue;
                }
            }
            writable.await;
        }
        Ok(())
    }

    /// Signal end of stream. The reader drains buffered bytes, then sees EOF.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.writer_closed = true;
        state.wake_reader();
    }

    /// End the stream with `err`, surfaced after any buffered bytes.
    pub fn close_with_error(&self, err: TransportError) {
        let mut state = self.shared.lock();
        if !state.writer_closed {
            state.error = Some(err);
            state.writer_closed = true;
        }
        state.wake_reader();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reading half of a [`pipe`].
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Read up to `out.len()` bytes. Returns `Ok(0)` at end of stream.
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        poll_fn(|cx| self.poll_read(cx, out)).await
    }

    /// Poll for up to `out.len()` bytes, registering `cx` for wakeup when
    /// nothing is buffered yet.
    pub fn poll_read(&self, cx: &mut Context<'_>, out: &mut [u8]) -> Poll<Result<usize>> {
        if out.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut state = self.shared.lock();
        if !state.buf.is_empty() {
            let n = out.len().min(state.buf.len());
            out[..n].copy_from_slice(&state.buf[..n]);
            state.buf.advance(n);
            self.shared.writable.notify_one();
            return Poll::Ready(Ok(n));
        }
        if let Some(err) = &state.error {
            return Poll::Ready(Err(err.clone()));
        }
        if state.writer_closed || state.reader_closed {
            return Poll::Ready(Ok(0));
        }
        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Stop reading. Buffered bytes are discarded and further writes fail.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.reader_closed = true;
        state.buf.clear();
        self.shared.writable.notify_one();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}
