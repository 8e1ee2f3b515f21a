//! Telemetry initialization.
//!
//! Controlled by `BEADS_LOG`:
//! - unset → no-op (tracing disabled, zero overhead)
//! - `"stderr"` → JSON events to stderr
//! - any other value → treated as an `EnvFilter` directive with the plain
//!   formatter, e.g. `BEADS_LOG=beads=debug`
//!
//! `RUST_LOG` refines the filter in either mode.

use tracing_subscriber::EnvFilter;

/// Initialize telemetry based on `BEADS_LOG`. Call once from `main`.
pub fn init() {
    let Some(mode) = std::env::var("BEADS_LOG").ok().filter(|v| !v.is_empty()) else {
        return;
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if mode == "stderr" {
            EnvFilter::new("info")
        } else {
            EnvFilter::new(mode.clone())
        }
    });

    if mode == "stderr" {
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
