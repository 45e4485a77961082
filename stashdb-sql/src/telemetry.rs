//! Logging setup for the `stashdb` binary and embedding applications.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a `fmt` subscriber filtered by `RUST_LOG`.
///
/// Without `RUST_LOG` the level is `info`, or `debug` when `verbose` is set.
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(verbose: bool) -> bool {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .is_ok()
}
