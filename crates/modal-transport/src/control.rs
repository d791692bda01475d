//! Account-authenticated control-plane calls.

use crate::auth::AuthTokenManager;
use crate::context::CallContext;
use crate::error::{Result, TransportError};
use crate::proto::{TaskGetCommandRouterAccessRequest, TaskGetCommandRouterAccessResponse};
use crate::retry::{call_with_retries, insert_ascii, RetryOptions};
use crate::rpc::ControlPlane;
use std::future::Future;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// Metadata key carrying the account auth token.
pub const AUTH_TOKEN_HEADER: &str = "x-modal-auth-token";

/// Wraps a [`ControlPlane`] stub with auth token injection and retries.
pub struct ControlPlaneClient {
    stub: Arc<dyn ControlPlane>,
    auth: AuthTokenManager,
    retry: RetryOptions,
}

impl ControlPlaneClient {
    pub fn new(stub: Arc<dyn ControlPlane>, auth: AuthTokenManager, retry: RetryOptions) -> Self {
        Self { stub, auth, retry }
    }

    pub fn auth(&self) -> &AuthTokenManager {
        &self.auth
    }

    /// Default retry policy for calls that do not pass their own.
    pub fn retry_options(&self) -> &RetryOptions {
        &self.retry
    }

    /// Issue a control-plane RPC with retries and the current auth token.
    ///
    /// `rpc` is invoked once per attempt with a request carrying the retry
    /// metadata and `x-modal-auth-token`. `options` overrides the client's
    /// default retry policy for this call only.
    pub async fn call<Req, Resp, F, Fut>(
        &self,
        ctx: &CallContext,
        options: Option<&RetryOptions>,
        message: Req,
        rpc: F,
    ) -> Result<Resp>
    where
        Req: Clone,
        F: Fn(Arc<dyn ControlPlane>, Request<Req>) -> Fut,
        Fut: Future<Output = std::result::Result<Response<Resp>, Status>>,
    {
        let options = options.unwrap_or(&self.retry);
        let rpc = &rpc;
        call_with_retries(ctx, options, |attempt| {
            let mut request = attempt.request(message.clone());
            let stub = Arc::clone(&self.stub);
            async move {
                let token = self.auth.get_token(ctx).await?;
                insert_ascii(request.metadata_mut(), AUTH_TOKEN_HEADER, &token);
                let response = rpc(stub, request).await?;
                Ok::<_, TransportError>(response.into_inner())
            }
        })
        .await
    }

    /// Ask the control plane where to reach `task_id`'s command router.
    pub async fn task_get_command_router_access(
        &self,
        ctx: &CallContext,
        task_id: &str,
    ) -> Result<TaskGetCommandRouterAccessResponse> {
        let message = TaskGetCommandRouterAccessRequest {
            task_id: task_id.to_string(),
        };
        self.call(ctx, None, message, |stub, request| async move {
            stub.task_get_command_router_access(request).await
        })
        .await
    }
}
