//! Tracing subscriber setup.

use crate::config::{ObservabilityConfig, DEFAULT_LOG_FILTER};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global `fmt` subscriber filtered by `config.log_filter`.
///
/// Invalid directives fall back to [`DEFAULT_LOG_FILTER`].
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}
