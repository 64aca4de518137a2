//! Structured logging setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,tokio_tungstenite=warn,tungstenite=warn";

/// Initialize structured logging.
///
/// Log levels come from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
///
/// ```no_run
/// tricktable::logging::init();
/// tracing::info!("Server starting");
/// ```
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Structured logging initialized");
}

/// Log a rejected reconnection with structured fields.
pub fn log_reconnect_rejected(player: &str, reason: &str) {
    tracing::warn!(
        event_type = "reconnect_rejected",
        player = player,
        "Reconnection rejected: {}",
        reason
    );
}
