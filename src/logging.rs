//! Tracing setup for embedders that do not install their own
//! subscriber. `RUST_LOG` overrides the default directive.

/// Installs the global fmt subscriber. Returns an error string when a
/// subscriber is already installed, which embedders are free to ignore.
pub fn init(default_directive: &str) -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| err.to_string())
}
