//! Bearer tokens and their expiry bookkeeping.
//!
//! Both the long-lived account token and the short-lived command-router JWT
//! are stored as a [`Token`] inside a [`TokenStore`]. Readers take a cheap
//! `Arc` snapshot; writers replace the whole value at once.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Tokens closer than this to expiry are refreshed in the background.
pub const REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Lifetime assumed for tokens whose expiry cannot be read.
pub const DEFAULT_EXPIRY_OFFSET: Duration = Duration::from_secs(20 * 60);

/// Current wall-clock time in epoch seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// An opaque bearer token together with its expiry (epoch seconds).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Token {
    value: String,
    expiry: i64,
}

/// Freshness of a token relative to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// No token has been stored yet.
    Empty,
    /// Valid and outside the refresh window.
    Fresh,
    /// Still valid, but inside the refresh window.
    NeedsRefresh,
    /// Past its expiry.
    Expired,
}

impl Token {
    pub fn new(value: impl Into<String>, expiry: i64) -> Self {
        Self {
            value: value.into(),
            expiry,
        }
    }

    /// Build a token from a JWT, reading the expiry from its `exp` claim.
    ///
    /// Falls back to `now + DEFAULT_EXPIRY_OFFSET` when the claim is missing
    /// or the token is malformed.
    pub fn from_jwt(value: impl Into<String>) -> Self {
        let value = value.into();
        let expiry = match parse_jwt_expiration(&value) {
            Some(exp) => exp,
            None => {
                tracing::warn!("auth token has no readable expiry, assuming default lifetime");
                unix_now() + DEFAULT_EXPIRY_OFFSET.as_secs() as i64
            }
        };
        Self { value, expiry }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Expiry in epoch seconds.
    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Seconds until expiry at `now`. Negative once expired.
    pub fn seconds_left(&self, now: i64) -> i64 {
        self.expiry - now
    }

    pub fn status(&self, now: i64, refresh_window: Duration) -> TokenStatus {
        if self.is_empty() {
            TokenStatus::Empty
        } else if now >= self.expiry {
            TokenStatus::Expired
        } else if self.expiry - now <= refresh_window.as_secs() as i64 {
            TokenStatus::NeedsRefresh
        } else {
            TokenStatus::Fresh
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("expiry", &self.expiry)
            .finish()
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<serde_json::Number>,
}

/// Extract the `exp` claim from a JWT without verifying it.
///
/// Returns `None` for anything that is not three dot-separated segments with
/// a base64 JSON payload carrying a numeric `exp`.
pub fn parse_jwt_expiration(jwt: &str) -> Option<i64> {
    let parts: Vec<&str> = jwt.split('.').collect();
    if parts.len() != 3 {
        return None;
    }

    let payload = parts[1].trim_end_matches('=');
    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| STANDARD_NO_PAD.decode(payload))
        .ok()?;

    let claims: Claims = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.exp?;
    exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))
}

/// Shared, atomically replaceable token slot.
#[derive(Debug, Default)]
pub struct TokenStore {
    current: RwLock<Arc<Token>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored token.
    pub fn load(&self) -> Arc<Token> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Replace the stored token, returning the new snapshot.
    pub fn store(&self, token: Token) -> Arc<Token> {
        let token = Arc::new(token);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::clone(&token);
        token
    }
}
