//! tonic-backed implementations of [`ControlPlane`] and [`CommandRouter`].

use crate::error::{Result, TransportError};
use crate::proto::*;
use crate::retry::insert_ascii;
use crate::rpc::{CommandRouter, ControlPlane, RouterConnector, StdioStream};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::{PathAndQuery, Uri};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Response, Status};

/// Largest message accepted or sent in either direction (100 MiB).
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_TYPE: &str = "libmodal-rs";
const CLIENT_VERSION: &str = "1.0.0";
const LIBMODAL_VERSION: &str = concat!("modal-rs/", env!("CARGO_PKG_VERSION"));

const AUTH_TOKEN_GET: &str = "/modal.client.ModalClient/AuthTokenGet";
const TASK_GET_COMMAND_ROUTER_ACCESS: &str = "/modal.client.ModalClient/TaskGetCommandRouterAccess";
const TASK_EXEC_START: &str = "/modal.task_command_router.TaskCommandRouter/TaskExecStart";
const TASK_EXEC_STDIN_WRITE: &str = "/modal.task_command_router.TaskCommandRouter/TaskExecStdinWrite";
const TASK_EXEC_POLL: &str = "/modal.task_command_router.TaskCommandRouter/TaskExecPoll";
const TASK_EXEC_WAIT: &str = "/modal.task_command_router.TaskCommandRouter/TaskExecWait";
const TASK_EXEC_STDIO_READ: &str = "/modal.task_command_router.TaskCommandRouter/TaskExecStdioRead";
const TASK_MOUNT_DIRECTORY: &str = "/modal.task_command_router.TaskCommandRouter/TaskMountDirectory";
const TASK_SNAPSHOT_DIRECTORY: &str =
    "/modal.task_command_router.TaskCommandRouter/TaskSnapshotDirectory";

/// Build a lazily-connecting channel for `url`.
///
/// `https://` URLs use TLS with the platform's native roots; `http://` URLs
/// connect in plaintext.
pub fn channel(url: &str) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(url.to_string())
        .map_err(|e| TransportError::InvalidArgument(format!("invalid URL {url:?}: {e}")))?
        .connect_timeout(CONNECT_TIMEOUT)
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_while_idle(true);

    let endpoint = if url.starts_with("https://") {
        endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?
    } else if url.starts_with("http://") {
        endpoint
    } else {
        return Err(TransportError::InvalidArgument(format!(
            "URL must start with http:// or https://, got {url:?}"
        )));
    };

    Ok(endpoint.connect_lazy())
}

/// Resolve a command router URL into the endpoint to dial.
///
/// The URL must be `https`; the port defaults to 443. When `insecure` is set
/// the same host and port are dialled without TLS.
pub fn command_router_endpoint(url: &str, insecure: bool) -> Result<String> {
    let uri: Uri = url
        .parse()
        .map_err(|e| TransportError::InvalidArgument(format!("failed to parse task router URL: {e}")))?;

    if uri.scheme_str() != Some("https") {
        return Err(TransportError::InvalidArgument(format!(
            "task router URL must be https, got: {url}"
        )));
    }
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| TransportError::InvalidArgument(format!("task router URL has no host: {url}")))?;
    let port = uri.port_u16().unwrap_or(443);

    let scheme = if insecure { "http" } else { "https" };
    Ok(format!("{scheme}://{host}:{port}"))
}

fn grpc(channel: Channel) -> Grpc<Channel> {
    Grpc::new(channel)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE)
}

async fn unary<Req, Resp>(
    grpc: &Grpc<Channel>,
    request: Request<Req>,
    path: &'static str,
) -> std::result::Result<Response<Resp>, Status>
where
    Req: prost::Message + 'static,
    Resp: prost::Message + Default + 'static,
{
    let mut grpc = grpc.clone();
    grpc.ready()
        .await
        .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;
    let codec: ProstCodec<Req, Resp> = ProstCodec::default();
    grpc.unary(request, PathAndQuery::from_static(path), codec).await
}

// ============================================================================
// Control plane
// ============================================================================

/// Static account credentials attached to every control-plane request.
#[derive(Clone)]
struct ClientHeaders {
    token_id: String,
    token_secret: String,
    environment: Option<String>,
}

impl ClientHeaders {
    fn apply<T>(&self, request: &mut Request<T>) {
        let metadata = request.metadata_mut();
        insert_ascii(metadata, "x-modal-client-type", CLIENT_TYPE);
        insert_ascii(metadata, "x-modal-client-version", CLIENT_VERSION);
        insert_ascii(metadata, "x-modal-libmodal-version", LIBMODAL_VERSION);
        insert_ascii(metadata, "x-modal-token-id", &self.token_id);
        insert_ascii(metadata, "x-modal-token-secret", &self.token_secret);
        if let Some(environment) = &self.environment {
            insert_ascii(metadata, "x-modal-environment", environment);
        }
    }
}

/// Control-plane stub over a tonic [`Channel`].
#[derive(Clone)]
pub struct GrpcControlPlane {
    grpc: Grpc<Channel>,
    headers: ClientHeaders,
}

impl GrpcControlPlane {
    pub fn new(
        channel: Channel,
        token_id: impl Into<String>,
        token_secret: impl Into<String>,
        environment: Option<String>,
    ) -> Self {
        Self {
            grpc: grpc(channel),
            headers: ClientHeaders {
                token_id: token_id.into(),
                token_secret: token_secret.into(),
                environment,
            },
        }
    }
}

#[async_trait]
impl ControlPlane for GrpcControlPlane {
    async fn auth_token_get(
        &self,
        mut request: Request<AuthTokenGetRequest>,
    ) -> std::result::Result<Response<AuthTokenGetResponse>, Status> {
        self.headers.apply(&mut request);
        unary(&self.grpc, request, AUTH_TOKEN_GET).await
    }

    async fn task_get_command_router_access(
        &self,
        mut request: Request<TaskGetCommandRouterAccessRequest>,
    ) -> std::result::Result<Response<TaskGetCommandRouterAccessResponse>, Status> {
        self.headers.apply(&mut request);
        unary(&self.grpc, request, TASK_GET_COMMAND_ROUTER_ACCESS).await
    }
}

// ============================================================================
// Command router
// ============================================================================

/// Command router stub over a tonic [`Channel`].
#[derive(Clone)]
pub struct GrpcCommandRouter {
    grpc: Grpc<Channel>,
}

impl GrpcCommandRouter {
    pub fn new(channel: Channel) -> Self {
        Self {
            grpc: grpc(channel),
        }
    }
}

#[async_trait]
impl CommandRouter for GrpcCommandRouter {
    async fn task_exec_start(
        &self,
        request: Request<TaskExecStartRequest>,
    ) -> std::result::Result<Response<TaskExecStartResponse>, Status> {
        unary(&self.grpc, request, TASK_EXEC_START).await
    }

    async fn task_exec_stdin_write(
        &self,
        request: Request<TaskExecStdinWriteRequest>,
    ) -> std::result::Result<Response<TaskExecStdinWriteResponse>, Status> {
        unary(&self.grpc, request, TASK_EXEC_STDIN_WRITE).await
    }

    async fn task_exec_poll(
        &self,
        request: Request<TaskExecPollRequest>,
    ) -> std::result::Result<Response<TaskExecPollResponse>, Status> {
        unary(&self.grpc, request, TASK_EXEC_POLL).await
    }

    async fn task_exec_wait(
        &self,
        request: Request<TaskExecWaitRequest>,
    ) -> std::result::Result<Response<TaskExecWaitResponse>, Status> {
        unary(&self.grpc, request, TASK_EXEC_WAIT).await
    }

    async fn task_exec_stdio_read(
        &self,
        request: Request<TaskExecStdioReadRequest>,
    ) -> std::result::Result<Response<StdioStream>, Status> {
        let mut grpc = self.grpc.clone();
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;
        let codec: ProstCodec<TaskExecStdioReadRequest, TaskExecStdioReadResponse> =
            ProstCodec::default();
        let response = grpc
            .server_streaming(request, PathAndQuery::from_static(TASK_EXEC_STDIO_READ), codec)
            .await?;
        Ok(response.map(|stream| stream.boxed()))
    }

    async fn task_mount_directory(
        &self,
        request: Request<TaskMountDirectoryRequest>,
    ) -> std::result::Result<Response<TaskMountDirectoryResponse>, Status> {
        unary(&self.grpc, request, TASK_MOUNT_DIRECTORY).await
    }

    async fn task_snapshot_directory(
        &self,
        request: Request<TaskSnapshotDirectoryRequest>,
    ) -> std::result::Result<Response<TaskSnapshotDirectoryResponse>, Status> {
        unary(&self.grpc, request, TASK_SNAPSHOT_DIRECTORY).await
    }
}

/// Dials command routers over tonic channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcRouterConnector;

impl RouterConnector for GrpcRouterConnector {
    fn connect(&self, url: &str, insecure: bool) -> Result<Arc<dyn CommandRouter>> {
        let endpoint = command_router_endpoint(url, insecure)?;
        if insecure {
            tracing::warn!(
                endpoint = %endpoint,
                "Using insecure connection for task command router; do not use in production"
            );
        }
        Ok(Arc::new(GrpcCommandRouter::new(channel(&endpoint)?)))
    }
}
