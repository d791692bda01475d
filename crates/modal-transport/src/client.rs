//! Top-level client tying the transport pieces together.

use crate::auth::AuthTokenManager;
use crate::config::ClientConfig;
use crate::context::CallContext;
use crate::control::ControlPlaneClient;
use crate::error::{Result, TransportError};
use crate::grpc::{self, GrpcControlPlane, GrpcRouterConnector};
use crate::process::{ContainerProcess, ExecParams};
use crate::retry::RetryOptions;
use crate::router::CommandRouterClient;
use crate::rpc::{ControlPlane, RouterConnector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// Per-task router slot, filled by whichever caller connects first.
type RouterSlot = Arc<OnceCell<Arc<CommandRouterClient>>>;

/// Client for the Modal control plane and task command routers.
///
/// Create one with [`Client::connect`] or [`Client::builder`], share it by
/// reference or `Arc`, and call [`Client::close`] when done.
pub struct Client {
    config: ClientConfig,
    control: Arc<ControlPlaneClient>,
    connector: Arc<dyn RouterConnector>,
    routers: RwLock<HashMap<String, RouterSlot>>,
    closed: AtomicBool,
}

impl Client {
    /// Connect to the control plane described by `config`.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            control_plane: None,
            connector: None,
            retry: RetryOptions::rpc(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Control-plane client for issuing authenticated RPCs with retries.
    pub fn control_plane(&self) -> &ControlPlaneClient {
        &self.control
    }

    /// Current account auth token, refreshed as needed.
    pub async fn auth_token(&self, ctx: &CallContext) -> Result<String> {
        self.control.auth().get_token(ctx).await
    }

    /// Command router client for `task_id`, created on first use.
    ///
    /// Callers for the same task share one connection attempt. The map lock is
    /// only held to find the task's slot, so a slow connect never blocks
    /// lookups for other tasks.
    pub async fn command_router(
        &self,
        ctx: &CallContext,
        task_id: &str,
    ) -> Result<Arc<CommandRouterClient>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ClientClosed);
        }

        let slot = self.router_slot(task_id).await;
        let router = slot
            .get_or_try_init(|| async {
                let router = CommandRouterClient::connect(
                    ctx,
                    Arc::clone(&self.control),
                    self.connector.as_ref(),
                    task_id,
                    self.config.command_router_insecure,
                )
                .await?
                .ok_or_else(|| {
                    TransportError::NotAvailable(format!(
                        "command router access is not enabled for task {task_id}"
                    ))
                })?;
                Ok::<_, TransportError>(Arc::new(router))
            })
            .await?;

        // close() may have run while we were connecting.
        if self.closed.load(Ordering::SeqCst) {
            router.close();
            return Err(TransportError::ClientClosed);
        }
        Ok(Arc::clone(router))
    }

    async fn router_slot(&self, task_id: &str) -> RouterSlot {
        if let Some(slot) = self.routers.read().await.get(task_id) {
            return Arc::clone(slot);
        }
        let mut routers = self.routers.write().await;
        Arc::clone(routers.entry(task_id.to_string()).or_default())
    }

    /// Start `command` in `task_id`.
    pub async fn exec(
        &self,
        ctx: &CallContext,
        task_id: &str,
        command: &[String],
        params: &ExecParams,
    ) -> Result<ContainerProcess> {
        let router = self.command_router(ctx, task_id).await?;
        ContainerProcess::start(router, ctx, command, params).await
    }

    /// Close every command router client and stop token refreshes. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut routers = self.routers.write().await;
        for router in routers.values().filter_map(|slot| slot.get()) {
            router.close();
        }
        routers.clear();
        self.control.auth().close();
        tracing::info!("Client closed");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    control_plane: Option<Arc<dyn ControlPlane>>,
    connector: Option<Arc<dyn RouterConnector>>,
    retry: RetryOptions,
}

impl ClientBuilder {
    /// Use an existing control-plane stub instead of dialling `server_url`.
    pub fn control_plane(mut self, stub: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(stub);
        self
    }

    /// Use a custom way of reaching command routers.
    pub fn router_connector(mut self, connector: Arc<dyn RouterConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Default retry policy for control-plane calls.
    pub fn retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Build the client and fetch the initial auth token.
    pub async fn build(self) -> Result<Client> {
        self.build_with_context(&CallContext::new()).await
    }

    /// Like [`ClientBuilder::build`], with the initial token fetch bound to `ctx`.
    pub async fn build_with_context(self, ctx: &CallContext) -> Result<Client> {
        self.retry.validate()?;

        let stub = match self.control_plane {
            Some(stub) => stub,
            None => {
                self.config.validate()?;
                let channel = grpc::channel(&self.config.server_url)?;
                Arc::new(GrpcControlPlane::new(
                    channel,
                    self.config.token_id.clone(),
                    self.config.token_secret.clone(),
                    self.config.environment.clone(),
                )) as Arc<dyn ControlPlane>
            }
        };

        let auth = AuthTokenManager::with_retry_options(Arc::clone(&stub), self.retry.clone());
        auth.get_token(ctx).await.map_err(|e| match e {
            TransportError::Auth { .. } => e,
            other => TransportError::auth("failed to get initial auth token", other),
        })?;

        tracing::info!(server_url = %self.config.server_url, "Client connected");

        Ok(Client {
            control: Arc::new(ControlPlaneClient::new(stub, auth, self.retry)),
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(GrpcRouterConnector) as Arc<dyn RouterConnector>),
            routers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            config: self.config,
        })
    }
}
