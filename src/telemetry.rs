use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// - Debug builds: human-readable output with targets
/// - Release builds: JSON lines for log aggregation
///
/// The filter comes from `RUST_LOG`, defaulting to `info`. Returns `false`
/// when a subscriber was already installed, so calling it twice is harmless.
pub fn init_tracing() -> bool {
    init_tracing_with_default("info")
}

/// Like [`init_tracing`] with a custom fallback directive such as
/// `"sourced_outbox=debug"`.
pub fn init_tracing_with_default(directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    if cfg!(debug_assertions) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .is_ok()
    }
}
