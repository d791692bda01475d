//! Client configuration.
//!
//! Configuration is loaded from environment variables with sensible defaults,
//! or assembled with [`ClientConfig::builder`].

use crate::error::{Result, TransportError};
use std::fmt;
use std::str::FromStr;

/// Control-plane endpoint used when `MODAL_SERVER_URL` is unset.
pub const DEFAULT_SERVER_URL: &str = "https://api.modal.com:443";

/// Verbosity of the crate's own log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level name (case-insensitive). An empty string means `Warn`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "" | "WARN" | "WARNING" => Ok(Self::Warn),
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "ERROR" => Ok(Self::Error),
            other => Err(TransportError::Config(format!(
                "invalid log level {other:?} (must be DEBUG, INFO, WARN, or ERROR)"
            ))),
        }
    }

    /// Name as understood by `tracing` filter directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for a [`crate::Client`].
#[derive(Clone)]
pub struct ClientConfig {
    /// Control-plane URL (`http://` or `https://`).
    pub server_url: String,
    /// Account token ID.
    pub token_id: String,
    /// Account token secret.
    pub token_secret: String,
    /// Environment name, if any.
    pub environment: Option<String>,
    /// Log level for this crate.
    pub log_level: LogLevel,
    /// Connect to command routers without TLS. Local testing only.
    pub command_router_insecure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            token_id: String::new(),
            token_secret: String::new(),
            environment: None,
            log_level: LogLevel::default(),
            command_router_insecure: false,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url)
            .field("token_id", &self.token_id)
            .field("token_secret", &"[REDACTED]")
            .field("environment", &self.environment)
            .field("log_level", &self.log_level)
            .field("command_router_insecure", &self.command_router_insecure)
            .finish()
    }
}

impl ClientConfig {
    /// Create a new config builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `MODAL_SERVER_URL` | `https://api.modal.com:443` |
    /// | `MODAL_TOKEN_ID` | (none) |
    /// | `MODAL_TOKEN_SECRET` | (none) |
    /// | `MODAL_ENVIRONMENT` | (none) |
    /// | `MODAL_LOGLEVEL` | `WARN` |
    /// | `MODAL_TASK_COMMAND_ROUTER_INSECURE` | `false` |
    ///
    /// The result is not validated; call [`ClientConfig::validate`] before use.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let default = Self::default();

        let log_level = match lookup("MODAL_LOGLEVEL") {
            Some(level) => LogLevel::parse(&level)?,
            None => default.log_level,
        };

        Ok(Self {
            server_url: lookup("MODAL_SERVER_URL")
                .filter(|v| !v.is_empty())
                .unwrap_or(default.server_url),
            token_id: lookup("MODAL_TOKEN_ID").unwrap_or_default(),
            token_secret: lookup("MODAL_TOKEN_SECRET").unwrap_or_default(),
            environment: lookup("MODAL_ENVIRONMENT").filter(|v| !v.is_empty()),
            log_level,
            command_router_insecure: lookup("MODAL_TASK_COMMAND_ROUTER_INSECURE")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(default.command_router_insecure),
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.token_id.is_empty() || self.token_secret.is_empty() {
            return Err(TransportError::Config(
                "missing token_id or token_secret, please set them in the environment".into(),
            ));
        }
        if !(self.server_url.starts_with("https://") || self.server_url.starts_with("http://")) {
            return Err(TransportError::Config(format!(
                "server_url must start with http:// or https://, got {:?}",
                self.server_url
            )));
        }
        Ok(())
    }
}

/// Builder for ClientConfig.
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the control-plane URL.
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into();
        self
    }

    /// Set the account token ID and secret.
    pub fn credentials(mut self, token_id: impl Into<String>, token_secret: impl Into<String>) -> Self {
        self.config.token_id = token_id.into();
        self.config.token_secret = token_secret.into();
        self
    }

    /// Set the environment name.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.config.environment = Some(environment.into());
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Allow plaintext connections to command routers.
    pub fn command_router_insecure(mut self, insecure: bool) -> Self {
        self.config.command_router_insecure = insecure;
        self
    }

    /// Build the configuration, validating all required fields.
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
