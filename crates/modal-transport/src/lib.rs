//! # modal-transport
//!
//! Resilient transport layer for the Modal client.
//!
//! This crate handles everything between "call this RPC" and the wire: the
//! account auth token lifecycle, per-call retries with idempotency keys and
//! deadlines, and JWT-authenticated sessions with a task's command router,
//! including live stdin/stdout/stderr streams for processes running in it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Client                                │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────────────┐      ┌─────────────────────────┐    │
//! │  │ ControlPlaneClient │─────▶│  AuthTokenManager       │    │
//! │  │  - call()          │      │   TokenStore (account)  │    │
//! │  └────────────────────┘      └─────────────────────────┘    │
//! │            │ call_with_retries                               │
//! │            ▼                                                 │
//! │  ┌────────────────────┐      ┌─────────────────────────┐    │
//! │  │ CommandRouterClient│─────▶│  TokenStore (session    │    │
//! │  │  - exec_start()    │      │   JWT, 30s buffer)      │    │
//! │  │  - exec_wait()     │      └─────────────────────────┘    │
//! │  │  - stdio_read()    │                                      │
//! │  └────────────────────┘                                      │
//! │            │                                                 │
//! │            ▼                                                 │
//! │  ┌────────────────────┐      ┌─────────────────────────┐    │
//! │  │ ContainerProcess   │─────▶│ OutputStream ─ pump ─▶  │    │
//! │  │  stdin/out/err     │      │   64 KiB pipe           │    │
//! │  └────────────────────┘      └─────────────────────────┘    │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use modal_transport::{CallContext, Client, ClientConfig, ExecParams};
//!
//! # async fn example() -> modal_transport::Result<()> {
//! let client = Client::connect(ClientConfig::from_env()?).await?;
//! let ctx = CallContext::new();
//!
//! let command = vec!["echo".to_string(), "hello".to_string()];
//! let mut process = client
//!     .exec(&ctx, "ta-123", &command, &ExecParams::default())
//!     .await?;
//!
//! let stdout = process.stdout.read_to_string().await?;
//! let status = process.wait(&ctx).await?;
//! println!("{status}: {stdout}");
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Token Refresh**: Fresh tokens served lock-free; near-expiry tokens refreshed in the background
//! - **Retries**: Exponential backoff on transient gRPC codes with a stable idempotency key
//! - **Session Auth**: Proactive and reactive JWT refresh for command routers
//! - **Resumable Streams**: Stdout/stderr resume from the last delivered offset after disconnects
//! - **Cancellation**: Every blocking call takes a [`CallContext`]

mod auth;
mod client;
mod config;
mod context;
mod control;
mod error;
pub mod grpc;
mod logging;
mod pipe;
mod process;
pub mod proto;
mod retry;
mod router;
mod rpc;
mod stream;
mod token;

pub use auth::AuthTokenManager;
pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ClientConfigBuilder, LogLevel, DEFAULT_SERVER_URL};
pub use context::CallContext;
pub use control::{ControlPlaneClient, AUTH_TOKEN_HEADER};
pub use error::{Result, TransportError};
pub use logging::init_tracing;
pub use pipe::{pipe, PipeReader, PipeWriter, STDIO_PIPE_CAPACITY};
pub use process::{
    build_exec_start_request, validate_exec_args, ContainerProcess, ExecParams, ExitStatus,
    StdioBehavior, ARG_MAX_BYTES,
};
pub use retry::{call_with_retries, Attempt, RetryOptions, RETRYABLE_CODES};
pub use router::{CommandRouterClient, OutputFd, JWT_REFRESH_BUFFER};
pub use rpc::{CommandRouter, ControlPlane, RouterConnector, StdioStream};
pub use stream::{InputStream, OutputStream};
pub use token::{
    parse_jwt_expiration, unix_now, Token, TokenStatus, TokenStore, DEFAULT_EXPIRY_OFFSET,
    REFRESH_WINDOW,
};
