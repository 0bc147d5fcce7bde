use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging with environment filter.
/// Set MGPU_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("MGPU_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Install a test-friendly subscriber that writes through the libtest capture.
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_env("MGPU_LOG")
        .unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
