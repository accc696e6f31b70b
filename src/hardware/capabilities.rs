//! Capability traits consumed by the aligner.
//!
//! Device drivers are external to this crate. Anything that can translate a
//! sample along three orthogonal axes implements [`Stage`]; anything that can
//! deliver a one-dimensional intensity array implements [`SpectrometerDriver`].
//! The aligner only ever sees these traits (usually behind an `Arc<dyn ...>`).
//!
//! ## Position Units
//! - Positions are in the stage's native length unit, reported by [`Stage::units`]
//! - The aligner is unit-agnostic; its length tunables share the stage unit
//!
//! ## Blocking
//! - [`Stage::move_to`] blocks until motion completes
//! - [`SpectrometerDriver::read_raw`] blocks for at least one integration time

use crate::error::{AlignError, AppResult};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::thread::sleep;
use std::time::Duration;

/// Stage coordinates (or displacements) in stage units, ordered x, y, z.
pub type Position = Vector3<f64>;

/// Axis names used when a stage does not override [`Stage::axis_names`].
pub const DEFAULT_AXIS_NAMES: [&str; 3] = ["x", "y", "z"];

/// Polling cadence of [`Stage::wait_until_stopped`].
pub const STAGE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One of the three translation axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// First lateral axis
    X,
    /// Second lateral axis
    Y,
    /// Focus axis
    Z,
}

impl Axis {
    /// All axes in position order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Index of this axis inside a [`Position`].
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(DEFAULT_AXIS_NAMES[self.index()])
    }
}

/// Uniform, axis-addressable motion interface.
///
/// # Errors
/// - `OutOfRange` when a target lies beyond the device travel
/// - `DriverFault` when the controller reports a non-recoverable error
///
/// No retry is performed at this layer.
pub trait Stage: Send + Sync {
    /// Names of the three axes, in position order.
    fn axis_names(&self) -> [&str; 3] {
        DEFAULT_AXIS_NAMES
    }

    /// Native length unit of this stage (e.g. "um", "m", "deg").
    fn units(&self) -> &str {
        "um"
    }

    /// Move all axes to `target`, or by `target` when `relative` is set.
    ///
    /// Blocks until the motion is complete.
    fn move_to(&self, target: Position, relative: bool) -> AppResult<()>;

    /// Current position of all axes. Must be cheap.
    fn position(&self) -> AppResult<Position>;

    /// True while at least one of `axes` (all axes when `None`) is moving.
    fn is_moving(&self, axes: Option<&[Axis]>) -> AppResult<bool>;

    /// Move a single axis, leaving the others where they are.
    ///
    /// The default issues a full-position move for stages that cannot
    /// address axes individually.
    fn move_axis(&self, axis: Axis, target: f64, relative: bool) -> AppResult<()> {
        let mut full = if relative {
            Position::zeros()
        } else {
            self.position()?
        };
        full[axis.index()] = target;
        self.move_to(full, relative)
    }

    /// Relative move by `offset`.
    fn move_rel(&self, offset: Position) -> AppResult<()> {
        self.move_to(offset, true)
    }

    /// Current position of one axis.
    fn axis_position(&self, axis: Axis) -> AppResult<f64> {
        Ok(self.position()?[axis.index()])
    }

    /// Look up an axis by the name this stage gives it.
    fn axis_index(&self, name: &str) -> AppResult<Axis> {
        self.axis_names()
            .iter()
            .position(|candidate| *candidate == name)
            .map(|i| Axis::ALL[i])
            .ok_or_else(|| {
                AlignError::invalid(format!(
                    "{} is not a valid axis, must be one of {:?}",
                    name,
                    self.axis_names()
                ))
            })
    }

    /// Block until none of `axes` is moving.
    fn wait_until_stopped(&self, axes: Option<&[Axis]>) -> AppResult<()> {
        while self.is_moving(axes)? {
            sleep(STAGE_POLL_INTERVAL);
        }
        Ok(())
    }
}

/// Raw detector access for a spectrometer.
///
/// Background subtraction, referencing and caching are handled by
/// [`crate::spectrometer::SpectrumPipeline`]; drivers only deliver counts.
pub trait SpectrometerDriver: Send + Sync {
    /// Instrument model, used in metadata.
    fn model_name(&self) -> String;

    /// Instrument serial number, used in metadata.
    fn serial_number(&self) -> String;

    /// Trigger one exposure at the current integration time and return raw counts.
    ///
    /// Recoverable hiccups are reported as `AlignError::Transient`.
    fn read_raw(&self) -> AppResult<Vec<f64>>;

    /// Compute the wavelength of every pixel. May be slow; callers cache it.
    fn wavelengths(&self) -> AppResult<Vec<f64>>;

    /// Current integration time in milliseconds.
    fn integration_time_ms(&self) -> f64;

    /// Program a new integration time in milliseconds.
    fn set_integration_time_ms(&self, milliseconds: f64) -> AppResult<()>;

    /// Shortest integration time the device accepts, in milliseconds.
    fn min_integration_time_ms(&self) -> f64;

    /// Detector cooler temperature, if the device has one.
    fn tec_temperature(&self) -> Option<f64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockStage;

    #[test]
    fn axis_lookup_by_name() {
        let stage = MockStage::new();
        assert_eq!(stage.axis_index("y").unwrap(), Axis::Y);
        assert!(matches!(
            stage.axis_index("theta"),
            Err(AlignError::InvalidParameter(_))
        ));
    }

    #[test]
    fn single_axis_move_keeps_other_axes() {
        let stage = MockStage::new();
        stage.move_to(Position::new(1.0, 2.0, 3.0), false).unwrap();
        stage.move_axis(Axis::Z, 5.0, false).unwrap();
        assert_eq!(stage.position().unwrap(), Position::new(1.0, 2.0, 5.0));

        stage.move_axis(Axis::X, -0.5, true).unwrap();
        assert_eq!(stage.position().unwrap(), Position::new(0.5, 2.0, 5.0));
        assert_eq!(stage.axis_position(Axis::Y).unwrap(), 2.0);
    }

    #[test]
    fn wait_until_stopped_returns_when_idle() {
        let stage = MockStage::new();
        stage.move_rel(Position::new(0.1, 0.0, 0.0)).unwrap();
        stage.wait_until_stopped(None).unwrap();
        assert!(!stage.is_moving(Some(&[Axis::X])).unwrap());
    }
}
