//! Diagnostic tracing for the macbox binary.
//!
//! Tracing output is for operators debugging a run. It goes to stderr and is
//! independent of the product output: result files under `.macbox/flows/` and
//! the summary printed on stdout are the same whatever `RUST_LOG` says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Compact format on stderr.
///
/// # Example
/// ```bash
/// RUST_LOG=macbox=debug macbox swarm run ci --workspaces ws-1,ws-2
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
