//! # Logging
//!
//! The primitives only emit `tracing` events, installing a subscriber is up to the binary (and the tests).
//! Filtering goes through `RUST_LOG`, `info` if it's not set.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Install a fmt subscriber for the process. Repeated calls are no-ops.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_target(false)
        .try_init();
}

static INIT_TEST_LOGGING: Once = Once::new();

/// Trace-level output captured by the test harness, the first call wins
pub fn init_test_logging() {
    INIT_TEST_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}
