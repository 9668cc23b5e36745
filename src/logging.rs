//! Structured logging setup (SPEC_FULL §2.2). The crate itself never calls
//! any of this: it only emits `tracing` events. Wiring up a subscriber is a
//! binary/test concern, not a library one.

use tracing_subscriber::EnvFilter;

/// Initializes a global `tracing` subscriber printing to stderr, honoring
/// `RUST_LOG` (defaulting to `info`). Intended for application entry points;
/// panics if a global subscriber is already set.
pub fn init() {
    try_init().expect("failed to install tracing subscriber");
}

/// Test-only variant: multiple test binaries/threads race to install the
/// global subscriber, so a second call is expected and ignored rather than
/// treated as a bug.
#[cfg(any(test, feature = "test-util"))]
pub fn init_for_testing() {
    let _ = try_init();
}

fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init()
}
