//! Tracing setup for binaries and tests that embed the client.

use crate::config::LogLevel;
use crate::error::{Result, TransportError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence; otherwise this crate logs at `level`.
pub fn init_tracing(level: LogLevel) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("modal_transport={level}")))
        .map_err(|e| TransportError::Config(format!("invalid log filter: {e}")))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| TransportError::Config(format!("failed to install tracing subscriber: {e}")))
}
