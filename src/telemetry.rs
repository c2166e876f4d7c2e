//! Telemetry initialization.
//!
//! Controlled by two environment variables:
//! - `REFIT_LOG`: an `EnvFilter` directive (`info`, `refit=debug`, ...);
//!   unset disables tracing output entirely.
//! - `REFIT_LOG_FORMAT=json`: JSON events to stderr instead of text.
//!
//! User-facing progress stays on stdout via `println!`; tracing is for
//! operators and tests.

use tracing_subscriber::EnvFilter;

/// Initialize tracing from the environment. Call once from `main`.
pub fn init() {
    let Ok(directives) = std::env::var("REFIT_LOG") else {
        return;
    };
    if directives.is_empty() {
        return;
    }
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("REFIT_LOG_FORMAT").is_ok_and(|v| v == "json");
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
