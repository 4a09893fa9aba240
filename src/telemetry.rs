//! Structured logging setup.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "secure_rag=info,secure_rag_core=info";
const VERBOSE_FILTER: &str = "secure_rag=debug,secure_rag_core=debug";

/// Install the global `tracing` subscriber, writing to stderr.
///
/// `RUST_LOG` overrides the default filter. Calling this twice is a no-op.
pub fn init_logging(verbose: bool) {
    let default = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
