//! Process bootstrap helpers.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize tracing with the TIO_LOG environment variable.
///
/// Defaults to "info" level if TIO_LOG is not set. Panics if a global
/// subscriber is already installed.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Like [`init_tracing`], but returns false instead of panicking when a
/// subscriber is already installed. Test harnesses call this repeatedly.
pub fn try_init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}
