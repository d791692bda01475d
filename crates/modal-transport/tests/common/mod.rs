//! In-memory control plane and command router used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::StreamExt;
use modal_transport::proto::*;
use modal_transport::{
    unix_now, AuthTokenManager, CommandRouter, CommandRouterClient, ControlPlane,
    ControlPlaneClient, RetryOptions, RouterConnector, StdioStream,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tonic::{Request, Response, Status};

pub const ROUTER_URL: &str = "https://router.test:443";
pub const TASK_ID: &str = "ta-test";

static JWT_SERIAL: AtomicUsize = AtomicUsize::new(0);

/// A syntactically valid JWT expiring at `exp`. Each call returns a distinct string.
pub fn make_jwt(exp: i64) -> String {
    let serial = JWT_SERIAL.fetch_add(1, Ordering::SeqCst);
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp},"jti":"{serial}"}}"#));
    format!("{header}.{payload}.sig")
}

fn metadata(request: &tonic::metadata::MetadataMap, key: &str) -> Option<String> {
    request
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ============================================================================
// Control plane
// ============================================================================

/// Scripted control plane that counts calls.
pub struct FakeControlPlane {
    pub auth_calls: AtomicUsize,
    pub access_calls: AtomicUsize,
    /// Delay before answering `AuthTokenGet`.
    pub auth_delay: Mutex<Duration>,
    /// Errors returned by the next `AuthTokenGet` calls, in order.
    pub auth_errors: Mutex<VecDeque<Status>>,
    /// Lifetime of tokens handed out by `AuthTokenGet`, in seconds.
    pub token_lifetime: Mutex<i64>,
    /// URL returned by `TaskGetCommandRouterAccess`.
    pub router_url: Mutex<String>,
    /// Error returned by every `TaskGetCommandRouterAccess`, if set.
    pub access_error: Mutex<Option<Status>>,
    /// Per-task delay before `TaskGetCommandRouterAccess` answers.
    pub access_delays: Mutex<HashMap<String, Duration>>,
    /// JWTs handed out by `TaskGetCommandRouterAccess`, in order.
    pub issued_jwts: Mutex<Vec<String>>,
    /// `x-modal-auth-token` values seen on `TaskGetCommandRouterAccess`.
    pub auth_tokens_seen: Mutex<Vec<String>>,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self {
            auth_calls: AtomicUsize::new(0),
            access_calls: AtomicUsize::new(0),
            auth_delay: Mutex::new(Duration::ZERO),
            auth_errors: Mutex::new(VecDeque::new()),
            token_lifetime: Mutex::new(3600),
            router_url: Mutex::new(ROUTER_URL.to_string()),
            access_error: Mutex::new(None),
            access_delays: Mutex::new(HashMap::new()),
            issued_jwts: Mutex::new(Vec::new()),
            auth_tokens_seen: Mutex::new(Vec::new()),
        }
    }
}

impl FakeControlPlane {
    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn access_calls(&self) -> usize {
        self.access_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn auth_token_get(
        &self,
        _request: Request<AuthTokenGetRequest>,
    ) -> Result<Response<AuthTokenGetResponse>, Status> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.auth_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = self.auth_errors.lock().unwrap().pop_front() {
            return Err(status);
        }
        let lifetime = *self.token_lifetime.lock().unwrap();
        Ok(Response::new(AuthTokenGetResponse {
            token: make_jwt(unix_now() + lifetime),
        }))
    }

    async fn task_get_command_router_access(
        &self,
        request: Request<TaskGetCommandRouterAccessRequest>,
    ) -> Result<Response<TaskGetCommandRouterAccessResponse>, Status> {
        self.access_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = metadata(request.metadata(), "x-modal-auth-token") {
            self.auth_tokens_seen.lock().unwrap().push(token);
        }
        let delay = self.access_delays.lock().unwrap().get(&request.get_ref().task_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = self.access_error.lock().unwrap().clone() {
            return Err(status);
        }
        let jwt = make_jwt(unix_now() + 3600);
        self.issued_jwts.lock().unwrap().push(jwt.clone());
        Ok(Response::new(TaskGetCommandRouterAccessResponse {
            url: self.router_url.lock().unwrap().clone(),
            jwt,
        }))
    }
}

// ============================================================================
// Command router
// ============================================================================

/// One step of a scripted stdio stream break.
#[derive(Debug, Clone)]
pub struct Disconnect {
    /// Chunks delivered before the stream fails.
    pub after_chunks: usize,
    pub status: Status,
}

/// Scripted command router that records every request.
pub struct FakeRouter {
    /// Method name of every call, in order.
    pub calls: Mutex<Vec<&'static str>>,
    /// Bearer tokens presented, in order.
    pub bearers: Mutex<Vec<String>>,
    /// Bearer tokens that are rejected with `UNAUTHENTICATED`.
    pub rejected: Mutex<Vec<String>>,
    /// Errors returned by the next unary calls, in order.
    pub unary_errors: Mutex<VecDeque<Status>>,
    /// Time of every unary call.
    pub call_times: Mutex<Vec<Instant>>,
    pub stdin_writes: Mutex<Vec<(u64, Vec<u8>, bool)>>,
    /// Bytes served on stdout.
    pub stdout: Mutex<Vec<u8>>,
    /// Bytes served on stderr.
    pub stderr: Mutex<Vec<u8>>,
    pub chunk_size: usize,
    /// Planned stdio stream breaks, consumed one per stream open.
    pub disconnects: Mutex<VecDeque<Disconnect>>,
    /// (fd, offset) of every stdio stream open.
    pub stdio_opens: Mutex<Vec<(i32, u64)>>,
    /// Exit status reported by poll and wait.
    pub exit_status: Mutex<Option<exec_exit_status::ExitStatus>>,
    /// Delay before `TaskExecWait` answers.
    pub wait_delay: Mutex<Duration>,
}

impl Default for FakeRouter {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            bearers: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            unary_errors: Mutex::new(VecDeque::new()),
            call_times: Mutex::new(Vec::new()),
            stdin_writes: Mutex::new(Vec::new()),
            stdout: Mutex::new(Vec::new()),
            stderr: Mutex::new(Vec::new()),
            chunk_size: 4,
            disconnects: Mutex::new(VecDeque::new()),
            stdio_opens: Mutex::new(Vec::new()),
            exit_status: Mutex::new(Some(exec_exit_status::ExitStatus::Code(0))),
            wait_delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl FakeRouter {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|m| **m == method).count()
    }

    fn admit<T>(&self, method: &'static str, request: &Request<T>) -> Result<(), Status> {
        self.calls.lock().unwrap().push(method);
        self.call_times.lock().unwrap().push(Instant::now());

        let bearer = metadata(request.metadata(), "authorization")
            .and_then(|v| v.strip_prefix("Bearer ").map(str::to_string))
            .ok_or_else(|| Status::unauthenticated("missing bearer token"))?;
        self.bearers.lock().unwrap().push(bearer.clone());
        if self.rejected.lock().unwrap().contains(&bearer) {
            return Err(Status::unauthenticated("invalid JWT"));
        }
        Ok(())
    }

    fn unary<T>(&self, method: &'static str, request: &Request<T>) -> Result<(), Status> {
        self.admit(method, request)?;
        match self.unary_errors.lock().unwrap().pop_front() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CommandRouter for FakeRouter {
    async fn task_exec_start(
        &self,
        request: Request<TaskExecStartRequest>,
    ) -> Result<Response<TaskExecStartResponse>, Status> {
        self.unary("exec_start", &request)?;
        Ok(Response::new(TaskExecStartResponse {}))
    }

    async fn task_exec_stdin_write(
        &self,
        request: Request<TaskExecStdinWriteRequest>,
    ) -> Result<Response<TaskExecStdinWriteResponse>, Status> {
        self.unary("stdin_write", &request)?;
        let message = request.into_inner();
        self.stdin_writes
            .lock()
            .unwrap()
            .push((message.offset, message.data.to_vec(), message.eof));
        Ok(Response::new(TaskExecStdinWriteResponse {}))
    }

    async fn task_exec_poll(
        &self,
        request: Request<TaskExecPollRequest>,
    ) -> Result<Response<TaskExecPollResponse>, Status> {
        self.unary("poll", &request)?;
        Ok(Response::new(TaskExecPollResponse {
            exit_status: *self.exit_status.lock().unwrap(),
        }))
    }

    async fn task_exec_wait(
        &self,
        request: Request<TaskExecWaitRequest>,
    ) -> Result<Response<TaskExecWaitResponse>, Status> {
        self.unary("wait", &request)?;
        let delay = *self.wait_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(Response::new(TaskExecWaitResponse {
            exit_status: *self.exit_status.lock().unwrap(),
        }))
    }

    async fn task_exec_stdio_read(
        &self,
        request: Request<TaskExecStdioReadRequest>,
    ) -> Result<Response<StdioStream>, Status> {
        self.unary("stdio_read", &request)?;
        let message = request.into_inner();
        self.stdio_opens
            .lock()
            .unwrap()
            .push((message.file_descriptor, message.offset));

        let data = if message.file_descriptor == TaskExecStdioFileDescriptor::Stderr as i32 {
            self.stderr.lock().unwrap().clone()
        } else {
            self.stdout.lock().unwrap().clone()
        };
        let start = (message.offset as usize).min(data.len());
        let mut items: Vec<Result<TaskExecStdioReadResponse, Status>> = data[start..]
            .chunks(self.chunk_size)
            .map(|chunk| {
                Ok(TaskExecStdioReadResponse {
                    data: bytes::Bytes::copy_from_slice(chunk),
                })
            })
            .collect();

        if let Some(disconnect) = self.disconnects.lock().unwrap().pop_front() {
            items.truncate(disconnect.after_chunks);
            items.push(Err(disconnect.status));
        }

        Ok(Response::new(futures::stream::iter(items).boxed()))
    }

    async fn task_mount_directory(
        &self,
        request: Request<TaskMountDirectoryRequest>,
    ) -> Result<Response<TaskMountDirectoryResponse>, Status> {
        self.unary("mount", &request)?;
        Ok(Response::new(TaskMountDirectoryResponse {}))
    }

    async fn task_snapshot_directory(
        &self,
        request: Request<TaskSnapshotDirectoryRequest>,
    ) -> Result<Response<TaskSnapshotDirectoryResponse>, Status> {
        self.unary("snapshot", &request)?;
        let path = request.into_inner().path;
        Ok(Response::new(TaskSnapshotDirectoryResponse {
            image_id: format!("im-{}", path.trim_start_matches('/')),
        }))
    }
}

/// Connector that always hands out the same fake router.
pub struct FakeConnector {
    pub router: Arc<FakeRouter>,
    pub urls: Mutex<Vec<String>>,
}

impl RouterConnector for FakeConnector {
    fn connect(&self, url: &str, _insecure: bool) -> modal_transport::Result<Arc<dyn CommandRouter>> {
        self.urls.lock().unwrap().push(url.to_string());
        Ok(Arc::clone(&self.router) as Arc<dyn CommandRouter>)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Control-plane client over `control` with a long-lived account token.
pub fn control_client(control: &Arc<FakeControlPlane>) -> Arc<ControlPlaneClient> {
    let stub = Arc::clone(control) as Arc<dyn ControlPlane>;
    let auth = AuthTokenManager::new(Arc::clone(&stub));
    auth.set_token("account-token", unix_now() + 3600);
    Arc::new(ControlPlaneClient::new(stub, auth, RetryOptions::rpc()))
}

/// Command router client for [`TASK_ID`] at [`ROUTER_URL`] holding `jwt`.
pub fn router_client(
    control: &Arc<FakeControlPlane>,
    router: &Arc<FakeRouter>,
    jwt: String,
) -> Arc<CommandRouterClient> {
    Arc::new(CommandRouterClient::new(
        Arc::clone(router) as Arc<dyn CommandRouter>,
        control_client(control),
        TASK_ID,
        ROUTER_URL,
        jwt,
    ))
}
