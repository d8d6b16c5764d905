//! Logging setup for binaries and tests that embed the lock.
//!
//! The library itself only emits `tracing` events; nothing is printed unless a
//! subscriber is installed, either here or by the host application.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON lines, one event per line.
    Json,
    #[default]
    Pretty,
}

/// Installs a global subscriber filtered by `RUST_LOG` (default `info`).
///
/// Only the first call has any effect. If the host already installed a
/// subscriber this is a no-op as well.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let installed = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
        if installed.is_err() {
            tracing::debug!("a global subscriber was already installed");
        }
    });
}
