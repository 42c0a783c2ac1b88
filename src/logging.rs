use tracing_subscriber::EnvFilter;

/// Initialize tracing for the relay.
///
/// `RUST_LOG` takes precedence over `default_level`. Uses `try_init` so
/// tests and embedding services can call this more than once.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
