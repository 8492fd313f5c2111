//! Tracing subscriber setup for binaries and tests embedding the crate.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, UmbralError};

/// Installs a global fmt subscriber filtered by `filter` (e.g. `"umbral=debug"`).
///
/// Fails if the filter does not parse or a global subscriber is already set.
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| UmbralError::Config(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| UmbralError::Config("logging already initialized".into()))
}
