//! RPC surfaces the transport drives.
//!
//! Both traits mirror the shape of tonic-generated stubs so they can be backed
//! by a real [`tonic::transport::Channel`] (see [`crate::grpc`]) or by an
//! in-memory fake in tests.

use crate::proto::*;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tonic::{Request, Response, Status};

/// Server stream of stdout/stderr chunks.
pub type StdioStream = BoxStream<'static, Result<TaskExecStdioReadResponse, Status>>;

/// Account-authenticated control-plane RPCs.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    async fn auth_token_get(
        &self,
        request: Request<AuthTokenGetRequest>,
    ) -> Result<Response<AuthTokenGetResponse>, Status>;

    async fn task_get_command_router_access(
        &self,
        request: Request<TaskGetCommandRouterAccessRequest>,
    ) -> Result<Response<TaskGetCommandRouterAccessResponse>, Status>;
}

/// Task-local command router RPCs, authenticated with a session JWT.
#[async_trait]
pub trait CommandRouter: Send + Sync + 'static {
    async fn task_exec_start(
        &self,
        request: Request<TaskExecStartRequest>,
    ) -> Result<Response<TaskExecStartResponse>, Status>;

    async fn task_exec_stdin_write(
        &self,
        request: Request<TaskExecStdinWriteRequest>,
    ) -> Result<Response<TaskExecStdinWriteResponse>, Status>;

    async fn task_exec_poll(
        &self,
        request: Request<TaskExecPollRequest>,
    ) -> Result<Response<TaskExecPollResponse>, Status>;

    async fn task_exec_wait(
        &self,
        request: Request<TaskExecWaitRequest>,
    ) -> Result<Response<TaskExecWaitResponse>, Status>;

    async fn task_exec_stdio_read(
        &self,
        request: Request<TaskExecStdioReadRequest>,
    ) -> Result<Response<StdioStream>, Status>;

    async fn task_mount_directory(
        &self,
        request: Request<TaskMountDirectoryRequest>,
    ) -> Result<Response<TaskMountDirectoryResponse>, Status>;

    async fn task_snapshot_directory(
        &self,
        request: Request<TaskSnapshotDirectoryRequest>,
    ) -> Result<Response<TaskSnapshotDirectoryResponse>, Status>;
}

/// Opens a [`CommandRouter`] for a URL handed out by the control plane.
pub trait RouterConnector: Send + Sync + 'static {
    fn connect(&self, url: &str, insecure: bool) -> crate::Result<std::sync::Arc<dyn CommandRouter>>;
}
