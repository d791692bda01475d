//! Byte-stream endpoints over offset-addressed stdio RPCs.
//!
//! # Output
//!
//! An [`OutputStream`] does nothing until it is first read. The first read
//! starts a pump task that opens `TaskExecStdioRead` at offset 0 and copies
//! each chunk into a bounded pipe. When the server stream breaks with a
//! transient error the pump backs off and reopens it at the last delivered
//! offset, so every byte reaches the reader exactly once and in order.
//!
//! The stream owns its pump: [`OutputStream::close`] or dropping the stream
//! cancels it.
//!
//! # Input
//!
//! An [`InputStream`] sends each write as one `TaskExecStdinWrite` tagged with
//! the running byte offset. Writes are serialised so offsets strictly increase.
//!
//! Both ends also implement tokio's [`AsyncRead`] / [`AsyncWrite`], so they
//! plug into `tokio::io::copy`, `BufReader`, and the `*Ext` helpers. Shutting
//! down an [`InputStream`] sends EOF.

use crate::context::CallContext;
use crate::error::{Result, TransportError};
use crate::pipe::{pipe, PipeReader, PipeWriter, STDIO_PIPE_CAPACITY};
use crate::router::{CommandRouterClient, OutputFd};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tonic::Code;

/// First delay before reopening a broken stdio stream.
const PUMP_BASE_DELAY: Duration = Duration::from_millis(10);
const PUMP_MAX_DELAY: Duration = Duration::from_secs(5);
const PUMP_DELAY_FACTOR: u32 = 2;
/// Reconnects allowed without any intervening progress.
const PUMP_MAX_RETRIES: u32 = 10;

/// Where an output stream reads from.
#[derive(Debug)]
struct StdioSource {
    client: Arc<CommandRouterClient>,
    exec_id: String,
    fd: OutputFd,
    deadline: Option<Instant>,
}

struct Pump {
    reader: PipeReader,
    ctx: CallContext,
    handle: JoinHandle<()>,
}

/// Lazily-started stdout or stderr of a remote process.
pub struct OutputStream {
    source: Option<StdioSource>,
    pump: Option<Pump>,
    closed: bool,
}

impl OutputStream {
    pub(crate) fn new(
        client: Arc<CommandRouterClient>,
        exec_id: impl Into<String>,
        fd: OutputFd,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            source: Some(StdioSource {
                client,
                exec_id: exec_id.into(),
                fd,
                deadline,
            }),
            pump: None,
            closed: false,
        }
    }

    /// A stream that is always at EOF.
    pub fn empty() -> Self {
        Self {
            source: None,
            pump: None,
            closed: false,
        }
    }

    /// Whether the pump has been started.
    pub fn is_started(&self) -> bool {
        self.pump.is_some()
    }

    fn start(&mut self) -> Option<&Pump> {
        if self.pump.is_none() && !self.closed {
            let source = self.source.take()?;
            let (writer, reader) = pipe(STDIO_PIPE_CAPACITY);
            let ctx = match source.deadline {
                Some(deadline) => CallContext::new().with_deadline(deadline),
                None => CallContext::new(),
            };
            tracing::trace!(exec_id = %source.exec_id, fd = %source.fd, "Starting stdio pump");
            let handle = tokio::spawn(run_pump(source, ctx.clone(), writer));
            self.pump = Some(Pump { reader, ctx, handle });
        }
        self.pump.as_ref()
    }

    fn poll_read_bytes(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize>> {
        match self.start() {
            Some(pump) => pump.reader.poll_read(cx, buf),
            None => Poll::Ready(Ok(0)),
        }
    }

    /// Read up to `buf.len()` bytes. Returns `Ok(0)` at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        std::future::poll_fn(|cx| self.poll_read_bytes(cx, buf)).await
    }

    /// Read until end of stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Read until end of stream and decode as UTF-8, replacing invalid sequences.
    pub async fn read_to_string(&mut self) -> Result<String> {
        let bytes = self.read_to_end().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Stop reading and cancel the pump. Reads after close return EOF.
    pub fn close(&mut self) {
        self.closed = true;
        self.source = None;
        if let Some(pump) = self.pump.take() {
            pump.ctx.cancel();
            pump.reader.close();
            pump.handle.abort();
        }
    }
}

impl AsyncRead for OutputStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let n = ready!(this.poll_read_bytes(cx, buf.initialize_unfilled()))
            .map_err(io::Error::other)?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream")
            .field("started", &self.is_started())
            .field("closed", &self.closed)
            .finish()
    }
}

// ============================================================================
// Pump
// ============================================================================

async fn run_pump(source: StdioSource, ctx: CallContext, writer: PipeWriter) {
    match pump_stdio(&source, &ctx, &writer).await {
        Ok(()) => writer.close(),
        Err(_) if ctx.is_cancelled() => writer.close(),
        Err(e) => {
            tracing::debug!(exec_id = %source.exec_id, fd = %source.fd, error = %e, "Stdio pump failed");
            writer.close_with_error(TransportError::Stream(format!(
                "error getting output stream: {e}"
            )));
        }
    }
}

async fn pump_stdio(source: &StdioSource, ctx: &CallContext, writer: &PipeWriter) -> Result<()> {
    let StdioSource {
        client, exec_id, fd, ..
    } = source;
    let deadline_error = || {
        TransportError::DeadlineExceeded(format!(
            "deadline exceeded while streaming stdio for exec {exec_id}"
        ))
    };

    let mut offset = 0u64;
    let mut delay = PUMP_BASE_DELAY;
    let mut retries_left = PUMP_MAX_RETRIES;
    let mut did_auth_retry = false;

    loop {
        if ctx.is_expired() {
            return Err(deadline_error());
        }

        let mut stream = match client.exec_stdio_read(ctx, exec_id, *fd, offset).await {
            Ok(stream) => stream,
            Err(e) if e.is_deadline_exceeded() && ctx.is_expired() => return Err(deadline_error()),
            Err(e) => return Err(e),
        };

        let err = loop {
            let item = tokio::select! {
                biased;
                err = ctx.done() => Some(Err(err)),
                item = client.next_chunk(&mut stream) => item,
            };
            match item {
                None => return Ok(()),
                Some(Ok(chunk)) => {
                    if chunk.data.is_empty() {
                        continue;
                    }
                    let len = chunk.data.len() as u64;
                    tokio::select! {
                        biased;
                        err = ctx.done() => break err,
                        written = writer.write_all(&chunk.data) => {
                            if written.is_err() {
                                // Reader went away.
                                return Ok(());
                            }
                        }
                    }
                    offset += len;
                    delay = PUMP_BASE_DELAY;
                    retries_left = PUMP_MAX_RETRIES;
                    did_auth_retry = false;
                    tracing::trace!(exec_id = %exec_id, fd = %fd, offset, "Delivered stdio chunk");
                }
                Some(Err(err)) => break err,
            }
        };

        if matches!(err, TransportError::DeadlineExceeded(_)) || (err.is_deadline_exceeded() && ctx.is_expired()) {
            return Err(deadline_error());
        }

        match err.status_code() {
            Some(Code::Unauthenticated) if !did_auth_retry => {
                tracing::debug!(exec_id = %exec_id, fd = %fd, offset, "Stdio stream unauthenticated, refreshing JWT");
                client.reauthenticate(ctx).await?;
                did_auth_retry = true;
            }
            Some(code) if crate::retry::RETRYABLE_CODES.contains(&code) && retries_left > 0 => {
                if let Some(deadline) = ctx.deadline() {
                    if Instant::now() + delay > deadline {
                        return Err(deadline_error());
                    }
                }
                tracing::debug!(
                    exec_id = %exec_id,
                    fd = %fd,
                    offset,
                    delay_ms = delay.as_millis() as u64,
                    code = ?code,
                    "Stdio stream interrupted, resuming"
                );
                ctx.sleep(delay).await?;
                delay = (delay * PUMP_DELAY_FACTOR).min(PUMP_MAX_DELAY);
                retries_left -= 1;
            }
            _ => return Err(err),
        }
    }
}

// ============================================================================
// Input
// ============================================================================

struct InputState {
    offset: u64,
    closed: bool,
}

struct Stdin {
    client: Arc<CommandRouterClient>,
    exec_id: String,
    ctx: CallContext,
    state: Mutex<InputState>,
}

impl Stdin {
    async fn write(&self, data: Bytes) -> Result<usize> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Stream("stdin is closed".into()));
        }
        let len = data.len();
        self.client
            .exec_stdin_write(&self.ctx, &self.exec_id, state.offset, data, false)
            .await?;
        state.offset += len as u64;
        Ok(len)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        self.client
            .exec_stdin_write(&self.ctx, &self.exec_id, state.offset, Bytes::new(), true)
            .await?;
        state.closed = true;
        Ok(())
    }
}

/// Stdin of a remote process.
pub struct InputStream {
    inner: Arc<Stdin>,
    /// Write or EOF started by the [`AsyncWrite`] impl and not yet finished.
    in_flight: Option<BoxFuture<'static, Result<usize>>>,
    shutting_down: bool,
}

impl InputStream {
    pub(crate) fn new(client: Arc<CommandRouterClient>, exec_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Stdin {
                client,
                exec_id: exec_id.into(),
                ctx: CallContext::new(),
                state: Mutex::new(InputState {
                    offset: 0,
                    closed: false,
                }),
            }),
            in_flight: None,
            shutting_down: false,
        }
    }

    /// Send `data` to the process. Returns the number of bytes written.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.inner.write(Bytes::copy_from_slice(data)).await
    }

    /// Offset at which the next write will land.
    pub async fn offset(&self) -> u64 {
        self.inner.state.lock().await.offset
    }

    /// Send EOF. Later writes fail; closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let Some(fut) = self.in_flight.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let result = ready!(fut.as_mut().poll(cx));
        self.in_flight = None;
        Poll::Ready(result.map_err(io::Error::other))
    }
}

impl AsyncWrite for InputStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.in_flight.is_none() {
            let inner = Arc::clone(&this.inner);
            let data = Bytes::copy_from_slice(buf);
            this.in_flight = Some(Box::pin(async move { inner.write(data).await }));
        }
        this.poll_in_flight(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_in_flight(cx).map_ok(|_| ())
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.shutting_down {
            ready!(this.poll_in_flight(cx))?;
            let inner = Arc::clone(&this.inner);
            this.in_flight = Some(Box::pin(async move { inner.close().await.map(|()| 0) }));
            this.shutting_down = true;
        }
        this.poll_in_flight(cx).map_ok(|_| ())
    }
}

impl std::fmt::Debug for InputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("exec_id", &self.inner.exec_id)
            .finish_non_exhaustive()
    }
}
