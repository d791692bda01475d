//! Session-scoped client for a task's command router.
//!
//! A [`CommandRouterClient`] talks directly to the command router running next
//! to one task. It authenticates with a short-lived JWT obtained from the
//! control plane and keeps that JWT fresh:
//!
//! - **Proactively**: before each call, a JWT within 30 seconds of expiry is
//!   refreshed first.
//! - **Reactively**: a call rejected with `UNAUTHENTICATED` triggers one
//!   refresh and is then retried exactly once.
//!
//! Concurrent refreshes coalesce: the first caller fetches under a lock and
//! the others observe the new token once they acquire it.

use crate::context::CallContext;
use crate::control::ControlPlaneClient;
use crate::error::{Result, TransportError};
use crate::proto::*;
use crate::retry::{call_with_retries, insert_ascii, RetryOptions};
use crate::rpc::{CommandRouter, RouterConnector, StdioStream};
use crate::token::{unix_now, Token, TokenStore};
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request, Response, Status};

/// JWTs closer than this to expiry are refreshed before use.
pub const JWT_REFRESH_BUFFER: Duration = Duration::from_secs(30);

/// Which output stream of an exec to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFd {
    Stdout,
    Stderr,
}

impl OutputFd {
    fn as_proto(self) -> TaskExecStdioFileDescriptor {
        match self {
            Self::Stdout => TaskExecStdioFileDescriptor::Stdout,
            Self::Stderr => TaskExecStdioFileDescriptor::Stderr,
        }
    }
}

impl std::fmt::Display for OutputFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// JWT-authenticated connection to one task's command router.
pub struct CommandRouterClient {
    stub: Arc<dyn CommandRouter>,
    control: Arc<ControlPlaneClient>,
    task_id: String,
    server_url: String,
    jwt: TokenStore,
    refresh_lock: Mutex<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    retry: RetryOptions,
}

impl CommandRouterClient {
    /// Look up `task_id`'s command router and connect to it.
    ///
    /// Returns `Ok(None)` if the task does not expose a command router.
    pub async fn connect(
        ctx: &CallContext,
        control: Arc<ControlPlaneClient>,
        connector: &dyn RouterConnector,
        task_id: &str,
        insecure: bool,
    ) -> Result<Option<Self>> {
        let access = match control.task_get_command_router_access(ctx, task_id).await {
            Ok(access) => access,
            Err(e) if e.status_code() == Some(Code::FailedPrecondition) => {
                tracing::debug!(task_id = %task_id, error = %e, "Command router access not available");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(task_id = %task_id, url = %access.url, "Using command router");
        let stub = connector.connect(&access.url, insecure)?;
        Ok(Some(Self::new(stub, control, task_id, access.url, access.jwt)))
    }

    /// Wrap an already-connected stub.
    pub fn new(
        stub: Arc<dyn CommandRouter>,
        control: Arc<ControlPlaneClient>,
        task_id: impl Into<String>,
        server_url: impl Into<String>,
        jwt: impl Into<String>,
    ) -> Self {
        let jwt_store = TokenStore::new();
        jwt_store.store(Token::from_jwt(jwt));
        Self {
            stub,
            control,
            task_id: task_id.into(),
            server_url: server_url.into(),
            jwt: jwt_store,
            refresh_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            retry: RetryOptions::session(),
        }
    }

    /// Override the retry policy used for unary calls.
    pub fn with_retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Close the client, cancelling in-flight calls. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(task_id = %self.task_id, "Closing command router client");
            self.shutdown.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ========================================================================
    // JWT lifecycle
    // ========================================================================

    /// Refresh the JWT if it is within [`JWT_REFRESH_BUFFER`] of expiry.
    async fn ensure_fresh_jwt(&self, ctx: &CallContext) -> Result<Arc<Token>> {
        let token = self.jwt.load();
        if token.seconds_left(unix_now()) > JWT_REFRESH_BUFFER.as_secs() as i64 {
            return Ok(token);
        }
        self.refresh_jwt(ctx, &token).await
    }

    /// Replace `observed` with a freshly fetched JWT.
    ///
    /// If another caller already replaced `observed` with a token that is not
    /// about to expire, that token is returned without a fetch.
    async fn refresh_jwt(&self, ctx: &CallContext, observed: &Arc<Token>) -> Result<Arc<Token>> {
        if self.is_closed() {
            return Err(TransportError::ClientClosed);
        }

        let _guard = ctx
            .run(async { Ok::<_, TransportError>(self.refresh_lock.lock().await) })
            .await?;

        let current = self.jwt.load();
        if !Arc::ptr_eq(&current, observed)
            && current.seconds_left(unix_now()) > JWT_REFRESH_BUFFER.as_secs() as i64
        {
            return Ok(current);
        }
        if self.is_closed() {
            return Err(TransportError::ClientClosed);
        }

        tracing::debug!(task_id = %self.task_id, "Refreshing command router JWT");
        let access = self
            .control
            .task_get_command_router_access(ctx, &self.task_id)
            .await?;

        if access.url != self.server_url {
            return Err(TransportError::Connection(
                "task router URL changed during session".into(),
            ));
        }

        Ok(self.jwt.store(Token::from_jwt(access.jwt)))
    }

    /// Refresh the JWT after the router rejected it mid-stream.
    pub(crate) async fn reauthenticate(&self, ctx: &CallContext) -> Result<()> {
        let observed = self.jwt.load();
        self.refresh_jwt(ctx, &observed).await.map(|_| ())
    }

    fn authorize<T>(&self, request: &mut Request<T>, token: &Token) {
        insert_ascii(
            request.metadata_mut(),
            "authorization",
            &format!("Bearer {}", token.value()),
        );
    }

    // ========================================================================
    // Call plumbing
    // ========================================================================

    /// Race `fut` against [`CommandRouterClient::close`].
    async fn guarded<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, Status>>,
    ) -> std::result::Result<T, Status> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(Status::cancelled("command router client closed")),
            result = fut => result,
        }
    }

    fn classify(&self, status: Status) -> TransportError {
        if status.code() == Code::Cancelled && self.is_closed() {
            TransportError::ClientClosed
        } else {
            TransportError::Rpc(status)
        }
    }

    /// Send one request, refreshing the JWT and resending once on `UNAUTHENTICATED`.
    async fn call_with_auth_retry<Req, Resp, F, Fut>(
        &self,
        ctx: &CallContext,
        request: Request<Req>,
        rpc: &F,
    ) -> Result<Response<Resp>>
    where
        Req: Clone,
        F: Fn(Arc<dyn CommandRouter>, Request<Req>) -> Fut,
        Fut: Future<Output = std::result::Result<Response<Resp>, Status>>,
    {
        if self.is_closed() {
            return Err(TransportError::ClientClosed);
        }

        let token = self.ensure_fresh_jwt(ctx).await?;
        let retry_request = clone_request(&request);

        let mut request = request;
        self.authorize(&mut request, &token);
        match self.guarded(rpc(Arc::clone(&self.stub), request)).await {
            Ok(response) => Ok(response),
            Err(status) if status.code() == Code::Unauthenticated => {
                tracing::debug!(
                    task_id = %self.task_id,
                    "Command router rejected JWT, refreshing and retrying once"
                );
                let token = self.refresh_jwt(ctx, &token).await?;
                let mut request = retry_request;
                self.authorize(&mut request, &token);
                self.guarded(rpc(Arc::clone(&self.stub), request))
                    .await
                    .map_err(|status| self.classify(status))
            }
            Err(status) => Err(self.classify(status)),
        }
    }

    /// Unary call with retries and auth handling.
    async fn unary<Req, Resp, F, Fut>(
        &self,
        ctx: &CallContext,
        options: &RetryOptions,
        message: Req,
        rpc: F,
    ) -> Result<Resp>
    where
        Req: Clone,
        F: Fn(Arc<dyn CommandRouter>, Request<Req>) -> Fut,
        Fut: Future<Output = std::result::Result<Response<Resp>, Status>>,
    {
        if self.is_closed() {
            return Err(TransportError::ClientClosed);
        }
        let rpc = &rpc;
        call_with_retries(ctx, options, |attempt| {
            let request = attempt.request(message.clone());
            async move {
                let response = self.call_with_auth_retry(ctx, request, rpc).await?;
                Ok::<_, TransportError>(response.into_inner())
            }
        })
        .await
    }

    fn options_with_deadline(&self, deadline: Option<Instant>) -> RetryOptions {
        self.retry.clone().with_deadline(deadline)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Start a process in the task.
    pub async fn exec_start(
        &self,
        ctx: &CallContext,
        request: TaskExecStartRequest,
    ) -> Result<TaskExecStartResponse> {
        tracing::debug!(task_id = %self.task_id, exec_id = %request.exec_id, "Starting exec");
        self.unary(ctx, &self.retry, request, |stub, request| async move {
            stub.task_exec_start(request).await
        })
        .await
    }

    /// Write a chunk of stdin at `offset`. `eof` closes the stream.
    pub async fn exec_stdin_write(
        &self,
        ctx: &CallContext,
        exec_id: &str,
        offset: u64,
        data: Bytes,
        eof: bool,
    ) -> Result<()> {
        let message = TaskExecStdinWriteRequest {
            task_id: self.task_id.clone(),
            exec_id: exec_id.to_string(),
            offset,
            data,
            eof,
        };
        self.unary(ctx, &self.retry, message, |stub, request| async move {
            stub.task_exec_stdin_write(request).await
        })
        .await?;
        Ok(())
    }

    /// Check whether an exec has exited, without blocking.
    pub async fn exec_poll(
        &self,
        ctx: &CallContext,
        exec_id: &str,
        deadline: Option<Instant>,
    ) -> Result<TaskExecPollResponse> {
        let deadline_error =
            || TransportError::DeadlineExceeded(format!("deadline exceeded while polling for exec {exec_id}"));
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(deadline_error());
        }

        let message = TaskExecPollRequest {
            task_id: self.task_id.clone(),
            exec_id: exec_id.to_string(),
        };
        let options = self.options_with_deadline(deadline);
        self.unary(ctx, &options, message, |stub, request| async move {
            stub.task_exec_poll(request).await
        })
        .await
        .map_err(|e| if e.is_deadline_exceeded() { deadline_error() } else { e })
    }

    /// Block until an exec exits.
    ///
    /// Each attempt long-polls for up to 60 seconds; attempts repeat until the
    /// process exits or `deadline` passes.
    pub async fn exec_wait(
        &self,
        ctx: &CallContext,
        exec_id: &str,
        deadline: Option<Instant>,
    ) -> Result<TaskExecWaitResponse> {
        let deadline_error =
            || TransportError::DeadlineExceeded(format!("deadline exceeded while waiting for exec {exec_id}"));
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(deadline_error());
        }

        let message = TaskExecWaitRequest {
            task_id: self.task_id.clone(),
            exec_id: exec_id.to_string(),
        };
        let options = RetryOptions::exec_wait().with_deadline(deadline);
        self.unary(ctx, &options, message, |stub, request| async move {
            stub.task_exec_wait(request).await
        })
        .await
        .map_err(|e| if e.is_deadline_exceeded() { deadline_error() } else { e })
    }

    /// Open the stdout or stderr stream of an exec, starting at `offset`.
    ///
    /// Opening is retried like any other call; errors that arrive once the
    /// stream is flowing are left to the caller.
    pub async fn exec_stdio_read(
        &self,
        ctx: &CallContext,
        exec_id: &str,
        fd: OutputFd,
        offset: u64,
    ) -> Result<StdioStream> {
        let message = TaskExecStdioReadRequest {
            task_id: self.task_id.clone(),
            exec_id: exec_id.to_string(),
            offset,
            file_descriptor: fd.as_proto() as i32,
        };
        tracing::trace!(task_id = %self.task_id, exec_id = %exec_id, fd = %fd, offset, "Opening stdio stream");
        self.unary(ctx, &self.retry, message, |stub, request| async move {
            stub.task_exec_stdio_read(request).await
        })
        .await
    }

    /// Mount an image at `path` inside the task.
    pub async fn mount_directory(&self, ctx: &CallContext, path: &str, image_id: &str) -> Result<()> {
        let message = TaskMountDirectoryRequest {
            task_id: self.task_id.clone(),
            path: path.to_string(),
            image_id: image_id.to_string(),
        };
        self.unary(ctx, &self.retry, message, |stub, request| async move {
            stub.task_mount_directory(request).await
        })
        .await?;
        Ok(())
    }

    /// Snapshot `path` inside the task into a new image, returning its ID.
    pub async fn snapshot_directory(&self, ctx: &CallContext, path: &str) -> Result<String> {
        let message = TaskSnapshotDirectoryRequest {
            task_id: self.task_id.clone(),
            path: path.to_string(),
        };
        let response = self
            .unary(ctx, &self.retry, message, |stub, request| async move {
                stub.task_snapshot_directory(request).await
            })
            .await?;
        Ok(response.image_id)
    }

    /// Race a stream item against client shutdown, for the stdio pump.
    pub(crate) async fn next_chunk(
        &self,
        stream: &mut StdioStream,
    ) -> Option<std::result::Result<TaskExecStdioReadResponse, TransportError>> {
        use futures::StreamExt;
        match self.guarded(async { Ok::<_, Status>(stream.next().await) }).await {
            Ok(item) => item.map(|r| r.map_err(|status| self.classify(status))),
            Err(status) => Some(Err(self.classify(status))),
        }
    }
}

impl Drop for CommandRouterClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for CommandRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouterClient")
            .field("task_id", &self.task_id)
            .field("server_url", &self.server_url)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn clone_request<T: Clone>(request: &Request<T>) -> Request<T> {
    let mut copy = Request::new(request.get_ref().clone());
    *copy.metadata_mut() = request.metadata().clone();
    copy
}
