//! Tracing initialisation.
//!
//! `RUST_LOG` takes precedence over the configured level so that a single
//! module can be turned up without touching the settings file:
//!
//! ```bash
//! RUST_LOG=spectro_align::alignment=debug
//! ```

use crate::config::LoggingSettings;
use crate::error::{AlignError, AppResult};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber described by `settings`.
///
/// Returns `Ok(false)` when a subscriber was already installed (e.g. by the
/// host application or an earlier call), `Ok(true)` otherwise.
pub fn init(settings: &LoggingSettings) -> AppResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.level).map_err(|err| {
            AlignError::invalid(format!("bad log level '{}': {}", settings.level, err))
        })?,
    };

    let installed = if settings.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    };
    Ok(installed)
}
