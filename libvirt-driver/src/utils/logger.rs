//! Logging configuration using tracing.
//!
//! Diagnostics go to stderr; stdout stays free for command output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::errors::{DriverError, Result};

/// Initialize logging with the specified level (`RUST_LOG` takes precedence)
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| DriverError::Config(format!("failed to initialize logging: {}", e)))
}
