//! Structured logging setup

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing with structured JSON logging
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Use
/// `RUST_LOG=eventdelta=debug` to follow every physical request and
/// reconnection.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .json();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    info!("eventdelta tracing initialized");
}

/// Like [`init_tracing`], but does nothing when a global subscriber is already set
pub fn try_init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).json())
        .try_init()
        .is_ok()
}
