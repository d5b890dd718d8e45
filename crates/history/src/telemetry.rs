//! Tracing setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

/// Install a fmt subscriber filtered by `filter`, or by `RUST_LOG` when `None`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(filter: Option<&str>) -> bool {
    let env_filter = filter
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
