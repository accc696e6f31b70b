//! Core library for spectrometer-guided stage alignment.
//!
//! This library moves a three-axis stage to the position where a spectrometer
//! collects the most light. It contains the capability traits the hardware
//! must implement, the spectrum processing pipeline, the merit evaluator and
//! the alignment controller, plus simulated devices for tests.
//!
//! ```rust,ignore
//! let stage = Arc::new(MockStage::new());
//! let driver = Arc::new(MockSpectrometer::new(stage.clone(), |p| 100.0 - p.norm_squared()));
//! let aligner = Aligner::new(Arc::new(SpectrumPipeline::new(driver)), stage);
//! let trace = aligner.optimise(&aligner.optimise_options())?;
//! ```

pub mod alignment;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod logging;
pub mod merit;
pub mod spectrometer;

pub use alignment::{Aligner, AlignerState, AlignmentTrace, FitMethod, Tolerance, ZScan};
pub use error::{AlignError, AppResult};
pub use hardware::{Axis, Position, SpectrometerDriver, Stage};
pub use spectrometer::SpectrumPipeline;
