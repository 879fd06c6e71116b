//! Tracing subscriber setup for binaries and tests

use cohort_core::CohortConfig;
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, or `filter` when unset
///
/// Returns false when a global subscriber was already installed.
pub fn init_tracing(filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

pub fn init_from_config(config: &CohortConfig) -> bool {
    init_tracing(&config.log_filter)
}
