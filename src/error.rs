//! Custom error types for the alignment engine.
//!
//! This module defines `AlignError`, the single error type shared by the stage and
//! spectrometer capability layers, the processing pipeline and the aligner. Using the
//! `thiserror` crate keeps every failure kind in one place so that callers can match on
//! what went wrong instead of parsing strings.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidParameter`**: the caller supplied a value outside its contract, such as an
//!   integration time below the device minimum or a ring with fewer than two points.
//! - **`OutOfRange`**: the stage refused a move beyond its travel. The aligner aborts the
//!   current primitive and re-raises it, leaving the stage at its last good target.
//! - **`DriverFault`**: a non-recoverable device error.
//! - **`Transient`**: a spectrometer hiccup (dropped USB frame, timeout) that is worth
//!   retrying. See `error_recovery::retry_transient`.
//! - **`FitFailure`**: a numerical fit could not produce a finite maximum. It is consumed
//!   by the fit dispatcher and never reaches callers of the aligner.
//! - **`Config`**: wraps `figment` errors raised while loading settings.
//! - **`Serialization`**: wraps `serde_json` errors raised while exporting scans.
//!
//! There is no cancellation variant: a stopped alignment returns normally with a
//! truncated trace.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, AlignError>;

/// Every failure the alignment engine can surface.
#[derive(Error, Debug)]
pub enum AlignError {
    /// A tunable or argument is outside its contract. Nothing was moved.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A requested stage position lies beyond an axis's travel.
    #[error("Axis '{axis}' cannot reach {target} (travel {min}..{max})")]
    OutOfRange {
        /// Name of the offending axis
        axis: String,
        /// Requested absolute position
        target: f64,
        /// Lower travel limit
        min: f64,
        /// Upper travel limit
        max: f64,
    },

    /// The stage or spectrometer reported an unrecoverable error.
    #[error("Driver fault: {0}")]
    DriverFault(String),

    /// A device error worth retrying, such as a dropped exposure.
    #[error("Transient device error: {0}")]
    Transient(String),

    /// A fitter could not produce an estimate.
    #[error("Fit failed: {0}")]
    FitFailure(String),

    /// Settings failed to load.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// A scan could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AlignError {
    /// True for errors that a retry policy is allowed to swallow.
    pub fn is_transient(&self) -> bool {
        matches!(self, AlignError::Transient(_))
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        AlignError::InvalidParameter(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AlignError::DriverFault("controller not responding".to_string());
        assert_eq!(err.to_string(), "Driver fault: controller not responding");
    }

    #[test]
    fn test_out_of_range_display() {
        let err = AlignError::OutOfRange {
            axis: "z".into(),
            target: 120.0,
            min: -100.0,
            max: 100.0,
        };
        assert!(err.to_string().contains("Axis 'z' cannot reach 120"));
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(AlignError::Transient("usb timeout".into()).is_transient());
        assert!(!AlignError::DriverFault("dead".into()).is_transient());
        assert!(!AlignError::invalid("npoints").is_transient());
    }
}
