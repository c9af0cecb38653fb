use tracing_subscriber::EnvFilter;

/// Initialize the process-wide tracing subscriber. `debug` raises the
/// default level; RUST_LOG still takes precedence when set.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
