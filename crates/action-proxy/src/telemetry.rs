//! Logging setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::{ProxyError, ProxyResult};

/// Build the event filter: `RUST_LOG` when set, `settings.level` otherwise.
pub fn env_filter(settings: &LoggingSettings) -> ProxyResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.level)
            .map_err(|e| ProxyError::config(format!("invalid log level: {e}"))),
    }
}

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(settings: &LoggingSettings) -> ProxyResult<()> {
    let filter = env_filter(settings)?;

    let layer = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| ProxyError::server(format!("failed to initialize logging: {e}")))
}
