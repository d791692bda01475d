//! Account auth token lifecycle.
//!
//! The [`AuthTokenManager`] keeps the current account token in a
//! [`TokenStore`] and decides, on every [`AuthTokenManager::get_token`] call,
//! whether the cached value can be served as-is, should be refreshed in the
//! background, or must be fetched before returning.
//!
//! ```text
//!  EMPTY ──fetch──▶ VALID ──(within 5 min of exp)──▶ NEEDS REFRESH
//!    ▲                ▲                                  │
//!    │                └────────── background refresh ◀───┘
//!    └──── EXPIRED ◀──(refresh failed until exp)
//! ```
//!
//! Concurrent callers never issue more than one `AuthTokenGet` at a time: the
//! blocking path serialises on a fetch mutex and re-checks the store once the
//! lock is held, and the background path only runs for whoever wins `try_lock`.
//!
//! A failed background refresh leaves the cached token in place; callers keep
//! getting it until it expires, and the next background attempt waits out
//! [`REFRESH_FAILURE_COOLDOWN`].

use crate::context::CallContext;
use crate::error::{Result, TransportError};
use crate::proto::AuthTokenGetRequest;
use crate::retry::{call_with_retries, RetryOptions};
use crate::rpc::ControlPlane;
use crate::token::{unix_now, Token, TokenStatus, TokenStore, REFRESH_WINDOW};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Minimum gap between a failed background refresh and the next one.
pub const REFRESH_FAILURE_COOLDOWN: Duration = Duration::from_secs(5);

/// Fetches, caches, and refreshes the account auth token.
///
/// Cloning is cheap; clones share the same token state.
#[derive(Clone)]
pub struct AuthTokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    stub: Arc<dyn ControlPlane>,
    store: TokenStore,
    fetch_lock: Arc<Mutex<()>>,
    shutdown: CancellationToken,
    retry: RetryOptions,
    last_refresh_failure: std::sync::Mutex<Option<Instant>>,
}

impl AuthTokenManager {
    /// Create a manager that fetches tokens through `stub`.
    pub fn new(stub: Arc<dyn ControlPlane>) -> Self {
        Self::with_retry_options(stub, RetryOptions::rpc())
    }

    /// Create a manager with a custom retry policy for `AuthTokenGet`.
    pub fn with_retry_options(stub: Arc<dyn ControlPlane>, retry: RetryOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                stub,
                store: TokenStore::new(),
                fetch_lock: Arc::new(Mutex::new(())),
                shutdown: CancellationToken::new(),
                retry,
                last_refresh_failure: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Return a valid token, fetching or refreshing as needed.
    ///
    /// A fresh token is returned without locking or RPCs. A token inside the
    /// refresh window is returned immediately while one background task
    /// replaces it. An empty or expired token is fetched before returning.
    pub async fn get_token(&self, ctx: &CallContext) -> Result<String> {
        let token = self.inner.store.load();
        match token.status(unix_now(), REFRESH_WINDOW) {
            TokenStatus::Fresh => Ok(token.value().to_string()),
            TokenStatus::NeedsRefresh => {
                self.spawn_background_refresh();
                Ok(token.value().to_string())
            }
            TokenStatus::Empty | TokenStatus::Expired => self.fetch_blocking(ctx).await,
        }
    }

    async fn fetch_blocking(&self, ctx: &CallContext) -> Result<String> {
        let _guard = ctx
            .run(async { Ok::<_, TransportError>(self.inner.fetch_lock.lock().await) })
            .await?;

        // Another caller may have fetched while we waited for the lock.
        let token = self.inner.store.load();
        if matches!(
            token.status(unix_now(), REFRESH_WINDOW),
            TokenStatus::Fresh | TokenStatus::NeedsRefresh
        ) {
            return Ok(token.value().to_string());
        }

        tracing::debug!("Fetching auth token");
        let token = self
            .inner
            .fetch(ctx)
            .await
            .map_err(|e| match e {
                TransportError::Auth { .. } => e,
                other => TransportError::auth("failed to fetch auth token", other),
            })?;
        Ok(token.value().to_string())
    }

    fn spawn_background_refresh(&self) {
        if self.inner.shutdown.is_cancelled() || self.inner.cooling_down() {
            return;
        }
        let Ok(guard) = Arc::clone(&self.inner.fetch_lock).try_lock_owned() else {
            return;
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _guard = guard;

            if inner.store.load().status(unix_now(), REFRESH_WINDOW) == TokenStatus::Fresh {
                return;
            }

            let ctx = CallContext::from_token(inner.shutdown.child_token());
            match inner.fetch(&ctx).await {
                Ok(token) => {
                    inner.set_refresh_failure(None);
                    tracing::debug!(expiry = token.expiry(), "Refreshed auth token in background")
                }
                Err(TransportError::Cancelled) => {}
                Err(e) => {
                    inner.set_refresh_failure(Some(Instant::now()));
                    tracing::warn!(error = %e, "Background auth token refresh failed, serving cached token");
                }
            }
        });
    }

    /// Snapshot of the cached token, which may be empty or expired.
    pub fn current_token(&self) -> Arc<Token> {
        self.inner.store.load()
    }

    /// Replace the cached token. Intended for seeding and tests.
    pub fn set_token(&self, value: impl Into<String>, expiry: i64) {
        self.inner.store.store(Token::new(value, expiry));
    }

    /// Whether the cached token is missing or past its expiry.
    pub fn is_expired(&self) -> bool {
        matches!(
            self.inner.store.load().status(unix_now(), REFRESH_WINDOW),
            TokenStatus::Empty | TokenStatus::Expired
        )
    }

    /// Cancel any in-flight background refresh and stop starting new ones.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn cooling_down(&self) -> bool {
        self.last_refresh_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() < REFRESH_FAILURE_COOLDOWN)
    }

    fn set_refresh_failure(&self, at: Option<Instant>) {
        *self
            .last_refresh_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = at;
    }

    async fn fetch(&self, ctx: &CallContext) -> Result<Arc<Token>> {
        let stub = &self.stub;
        let response = call_with_retries(ctx, &self.retry, |attempt| async move {
            let response = stub
                .auth_token_get(attempt.request(AuthTokenGetRequest {}))
                .await?;
            Ok::<_, TransportError>(response.into_inner())
        })
        .await?;

        if response.token.is_empty() {
            return Err(TransportError::Auth {
                message: "did not receive auth token from server".into(),
                source: None,
            });
        }

        Ok(self.store.store(Token::from_jwt(response.token)))
    }
}
