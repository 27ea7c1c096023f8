//! Shared test plumbing.

use std::sync::Once;

/// Installs a tracing subscriber once per test binary; `WEFT_LOG`
/// controls verbosity (e.g. `WEFT_LOG=trace`).
pub(crate) fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("WEFT_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
