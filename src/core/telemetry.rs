//! Logging setup for hosts embedding the executor.

use tracing::Level;

/// Install a `tracing-subscriber` fmt subscriber at the given level.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Same as [`init_tracing`] but writes through the test harness capture.
pub fn init_test_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init()
        .is_ok()
}
