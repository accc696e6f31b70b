//! Configuration system using Figment
//!
//! Settings are loaded from, in increasing order of precedence:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `SPECTRO_ALIGN_`
//!
//! Nested keys are separated by a double underscore in environment variables:
//!
//! ```text
//! SPECTRO_ALIGN_ALIGNER__STEP_SIZE=0.2
//! SPECTRO_ALIGN_ALIGNER__FIT_METHOD=parabola
//! SPECTRO_ALIGN_LOGGING__LEVEL=debug
//! ```
//!
//! # Example file
//!
//! ```toml
//! [aligner]
//! settling_time_s = 0.2
//! step_size = 0.3
//! tolerance = [0.05, 0.05, 0.1]
//! number_of_points = 6
//! fit_method = "centroid"
//!
//! [retry]
//! max_retries = 3
//! initial_backoff_ms = 20
//!
//! [logging]
//! level = "debug"
//! ```

use crate::alignment::{FitMethod, Tolerance};
use crate::error::{AlignError, AppResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SPECTRO_ALIGN_";

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Alignment tuning parameters
    pub aligner: AlignerSettings,
    /// Spectrometer retry behaviour
    pub retry: RetrySettings,
    /// Log output
    pub logging: LoggingSettings,
}

/// Tuning parameters of the aligner. All length values are in stage units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlignerSettings {
    /// Pause after each stage move before acquiring, in seconds
    pub settling_time_s: f64,
    /// Radius of the circle and spacing of the grid primitives
    pub step_size: f64,
    /// Convergence threshold; scalar or per-axis
    pub tolerance: Tolerance,
    /// Ring size for circle iterations
    pub number_of_points: usize,
    /// Half-span of the focus (z) iteration
    pub dz: f64,
    /// Iteration budget for the composite optimisers
    pub max_steps: usize,
    /// Fit used by circle and z iterations
    pub fit_method: FitMethod,
    /// Sum raw exposures instead of processed spectra
    pub align_to_raw_spectra: bool,
    /// Shorten the exposure threefold during XY optimisation
    pub reduce_integration_time: bool,
}

impl Default for AlignerSettings {
    fn default() -> Self {
        Self {
            settling_time_s: default_settling_time(),
            step_size: 0.5,
            tolerance: Tolerance::Scalar(0.05),
            number_of_points: 3,
            dz: 0.5,
            max_steps: 10,
            fit_method: FitMethod::Centroid,
            align_to_raw_spectra: false,
            reduce_integration_time: true,
        }
    }
}

/// Retry behaviour for transient spectrometer errors
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_backoff_ms: u64,
    /// Growth factor of the delay between retries
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 20,
            backoff_multiplier: 2.0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_settling_time() -> f64 {
    0.3
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    ///
    /// A path that does not exist is an error rather than an empty layer.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(AlignError::invalid(format!(
                    "configuration file '{}' not found",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading
    pub fn validate(&self) -> AppResult<()> {
        self.aligner.validate()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(AlignError::invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(AlignError::invalid(format!(
                "backoff_multiplier must be a finite number >= 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        Ok(())
    }
}

impl AlignerSettings {
    /// Check every tuning parameter against its contract.
    pub fn validate(&self) -> AppResult<()> {
        self.settling_time()?;
        validate_positive("step_size", self.step_size)?;
        validate_positive("dz", self.dz)?;
        self.tolerance.validate()?;
        validate_number_of_points(self.number_of_points)?;
        if self.max_steps == 0 {
            return Err(AlignError::invalid("max_steps must be at least 1"));
        }
        Ok(())
    }

    /// Settling time as a `Duration`; rejects values a `Duration` cannot hold.
    pub fn settling_time(&self) -> AppResult<Duration> {
        validate_duration_secs("settling_time_s", self.settling_time_s)
    }
}

/// Convert non-negative seconds to a `Duration`, rejecting NaN, negatives and overflow.
pub(crate) fn validate_duration_secs(name: &str, seconds: f64) -> AppResult<Duration> {
    validate_non_negative(name, seconds)?;
    Duration::try_from_secs_f64(seconds).map_err(|err| {
        AlignError::invalid(format!("{} of {} s is out of range: {}", name, seconds, err))
    })
}

pub(crate) fn validate_positive(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(AlignError::invalid(format!(
            "{} must be a positive finite number, got {}",
            name, value
        )))
    }
}

pub(crate) fn validate_non_negative(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(AlignError::invalid(format!(
            "{} must be a non-negative finite number, got {}",
            name, value
        )))
    }
}

pub(crate) fn validate_number_of_points(npoints: usize) -> AppResult<()> {
    if npoints < 2 {
        return Err(AlignError::invalid(format!(
            "number_of_points must be at least 2, got {}",
            npoints
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.aligner.settling_time_s, 0.3);
        assert_eq!(settings.aligner.step_size, 0.5);
        assert_eq!(settings.aligner.number_of_points, 3);
        assert_eq!(settings.aligner.fit_method, FitMethod::Centroid);
        assert!(!settings.aligner.align_to_raw_spectra);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[aligner]
step_size = 0.3
tolerance = [0.05, 0.05, 0.1]
number_of_points = 6
fit_method = "gaussian"

[logging]
level = "debug"
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.aligner.step_size, 0.3);
        assert_eq!(
            settings.aligner.tolerance,
            Tolerance::PerAxis([0.05, 0.05, 0.1])
        );
        assert_eq!(settings.aligner.number_of_points, 6);
        assert_eq!(settings.aligner.fit_method, FitMethod::Gaussian);
        // untouched keys keep their defaults
        assert_eq!(settings.aligner.settling_time_s, 0.3);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn test_scalar_tolerance_in_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[aligner]\ntolerance = 0.1").unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.aligner.tolerance, Tolerance::Scalar(0.1));
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let result = Settings::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(result, Err(AlignError::InvalidParameter(_))));
    }

    #[test]
    fn test_too_few_points_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[aligner]\nnumber_of_points = 1").unwrap();
        let result = Settings::load(Some(file.path()));
        assert!(matches!(result, Err(AlignError::InvalidParameter(_))));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.logging.level = "verbose".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_huge_settling_time_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[aligner]\nsettling_time_s = 1e20").unwrap();
        let result = Settings::load(Some(file.path()));
        assert!(matches!(result, Err(AlignError::InvalidParameter(_))));

        let mut settings = AlignerSettings::default();
        assert!((settings.settling_time().unwrap().as_secs_f64() - 0.3).abs() < 1e-9);
        settings.settling_time_s = f64::MAX;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unbounded_backoff_multiplier_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nbackoff_multiplier = 1e300").unwrap();
        assert!(Settings::load(Some(file.path())).is_ok());

        let mut settings = Settings::default();
        settings.retry.backoff_multiplier = f64::INFINITY;
        assert!(matches!(
            settings.validate(),
            Err(AlignError::InvalidParameter(_))
        ));
        settings.retry.backoff_multiplier = f64::NAN;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unknown_fit_method_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[aligner]\nfit_method = \"spline\"").unwrap();
        let result = Settings::load(Some(file.path()));
        assert!(matches!(result, Err(AlignError::Config(_))));
    }
}
