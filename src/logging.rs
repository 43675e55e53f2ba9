//! # Logging
//!
//! The crate logs through `tracing` and never installs a subscriber on its
//! own. Binaries and tests that want output call [`init`], which installs a
//! `fmt` subscriber filtered by `RUST_LOG` (default `info`).
//!
//! ```text
//! RUST_LOG=eventide=debug        append outcomes, pages, notifications
//! RUST_LOG=eventide::sqlite=debug schema setup, rolled-back transactions
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber. Later calls, or calls after another
/// subscriber was installed, do nothing.
pub fn init() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Like [`init`], but writes through the test harness's captured output.
pub fn init_for_tests() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
