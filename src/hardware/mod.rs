//! Hardware capability traits and simulated devices.

pub mod capabilities;
pub mod mock;

pub use capabilities::{Axis, Position, SpectrometerDriver, Stage};
