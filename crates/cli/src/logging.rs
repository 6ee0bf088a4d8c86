//! Diagnostic logging to stderr.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// filter; `--quiet` silences everything below errors.
pub fn init(configured: Option<&str>, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(configured.unwrap_or(DEFAULT_FILTER)))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
