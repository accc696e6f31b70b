//! Tunables for the composite optimisers and the cancellation token.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{validate_number_of_points, validate_positive, AlignerSettings};
use crate::error::{AlignError, AppResult};
use crate::hardware::Position;

/// Convergence threshold, either one length for all axes or one per axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tolerance {
    /// Same length on every axis
    Scalar(f64),
    /// x, y, z lengths
    PerAxis([f64; 3]),
}

impl Tolerance {
    /// Tolerance of each axis.
    pub fn per_axis(&self) -> [f64; 3] {
        match *self {
            Tolerance::Scalar(value) => [value; 3],
            Tolerance::PerAxis(values) => values,
        }
    }

    /// Single length for plain Euclidean tests; the tightest axis when per-axis.
    pub fn euclidean(&self) -> f64 {
        match *self {
            Tolerance::Scalar(value) => value,
            Tolerance::PerAxis(values) => values.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }

    /// `Σ (Δ_k / tol_k)²`; a move has converged when this is at most 1.
    pub fn convergence_score(&self, delta: &Position) -> f64 {
        self.per_axis()
            .iter()
            .enumerate()
            .map(|(axis, tolerance)| (delta[axis] / tolerance).powi(2))
            .sum()
    }

    /// Every axis tolerance must be positive and finite.
    pub fn validate(&self) -> AppResult<()> {
        for value in self.per_axis() {
            validate_positive("tolerance", value)?;
        }
        Ok(())
    }
}

impl From<f64> for Tolerance {
    fn from(value: f64) -> Self {
        Tolerance::Scalar(value)
    }
}

impl From<[f64; 3]> for Tolerance {
    fn from(values: [f64; 3]) -> Self {
        Tolerance::PerAxis(values)
    }
}

/// Parameters of the alternating circle/focus optimiser.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimiseOptions {
    /// Stationarity threshold between iterations
    pub tolerance: Tolerance,
    /// Iteration cap
    pub max_steps: usize,
    /// Radius of the circle iteration
    pub step_size: f64,
    /// Points on the circle
    pub number_of_points: usize,
    /// Half-span of the focus iteration
    pub dz: f64,
}

impl OptimiseOptions {
    /// Reject non-positive lengths, rings under two points and a zero step cap.
    pub fn validate(&self) -> AppResult<()> {
        self.tolerance.validate()?;
        validate_positive("step_size", self.step_size)?;
        validate_positive("dz", self.dz)?;
        validate_number_of_points(self.number_of_points)?;
        validate_max_steps(self.max_steps)
    }
}

impl From<&AlignerSettings> for OptimiseOptions {
    fn from(settings: &AlignerSettings) -> Self {
        Self {
            tolerance: settings.tolerance,
            max_steps: settings.max_steps,
            step_size: settings.step_size,
            number_of_points: settings.number_of_points,
            dz: settings.dz,
        }
    }
}

/// Parameters of the XY grid optimiser.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimise2dOptions {
    /// Euclidean distance below which a step counts as stationary
    pub tolerance: f64,
    /// Iteration cap
    pub max_steps: usize,
    /// Initial grid spacing; halved whenever the stage stays put
    pub step_size: f64,
    /// Divide the integration time by three for the duration of the run
    pub reduce_integration_time: bool,
}

impl Optimise2dOptions {
    /// Tolerance and step must be positive, `max_steps` at least one.
    pub fn validate(&self) -> AppResult<()> {
        validate_positive("tolerance", self.tolerance)?;
        validate_positive("step_size", self.step_size)?;
        validate_max_steps(self.max_steps)
    }
}

impl From<&AlignerSettings> for Optimise2dOptions {
    fn from(settings: &AlignerSettings) -> Self {
        Self {
            tolerance: settings.tolerance.euclidean(),
            max_steps: settings.max_steps,
            step_size: settings.step_size,
            reduce_integration_time: settings.reduce_integration_time,
        }
    }
}

fn validate_max_steps(max_steps: usize) -> AppResult<()> {
    if max_steps == 0 {
        return Err(AlignError::invalid("max_steps must be at least 1"));
    }
    Ok(())
}

/// Shared stop request, checked between point visits and while waiting for motion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop; every clone observes it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested since the last reset.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_and_per_axis_scores_agree() {
        let delta = Position::new(0.03, 0.04, 0.0);
        assert!((Tolerance::Scalar(0.05).convergence_score(&delta) - 1.0).abs() < 1e-12);
        assert!((Tolerance::PerAxis([0.05; 3]).convergence_score(&delta) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn per_axis_tolerance_weights_axes() {
        let tolerance = Tolerance::PerAxis([0.1, 0.1, 1.0]);
        assert!(tolerance.convergence_score(&Position::new(0.0, 0.0, 0.9)) <= 1.0);
        assert!(tolerance.convergence_score(&Position::new(0.2, 0.0, 0.0)) > 1.0);
        assert_eq!(tolerance.euclidean(), 0.1);
    }

    #[test]
    fn tolerance_must_be_positive() {
        assert!(Tolerance::Scalar(0.0).validate().is_err());
        assert!(Tolerance::PerAxis([0.1, -0.1, 0.1]).validate().is_err());
        assert!(Tolerance::from(0.2).validate().is_ok());
    }

    #[test]
    fn options_follow_settings() {
        let settings = AlignerSettings::default();
        let options = OptimiseOptions::from(&settings);
        assert_eq!(options.number_of_points, 3);
        options.validate().unwrap();

        let mut bad = options.clone();
        bad.number_of_points = 1;
        assert!(bad.validate().is_err());

        let grid = Optimise2dOptions::from(&settings);
        assert_eq!(grid.tolerance, 0.05);
        assert!(grid.reduce_integration_time);
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }
}
