//! Telemetry and logging initialization
//!
//! Structured logging with `tracing` and `tracing-subscriber`. Logs always go
//! to stderr so CLI output on stdout stays machine-readable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `verbose` raises the default level to DEBUG for Trek crates; `RUST_LOG`
/// overrides either default. `json_format` switches to one JSON object per
/// line. Returns false if a subscriber was already installed.
///
/// # Example
/// ```
/// trek_common::telemetry::init_tracing(false, false);
/// tracing::info!("sync engine starting");
/// ```
pub fn init_tracing(verbose: bool, json_format: bool) -> bool {
    let filter_level = if verbose {
        "info,trek_sync=debug,trek_common=debug,trek_cli=debug"
    } else {
        "info"
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_level));

    let installed = if json_format {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .with(env_filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .compact(),
            )
            .with(env_filter)
            .try_init()
    };

    installed.is_ok()
}
