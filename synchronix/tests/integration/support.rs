//! Helpers shared by the integration tests.

use std::sync::Once;
use std::thread;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// Logs kernel events to the test output, filtered by `RUST_LOG`.
pub(crate) fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Polls `condition` until it holds.
pub(crate) fn wait_until(condition: impl Fn() -> bool) {
    while !condition() {
        thread::sleep(Duration::from_millis(1));
    }
}
