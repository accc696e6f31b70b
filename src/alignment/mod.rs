//! Closed-loop alignment: fitters, traces and the aligner itself.

pub mod aligner;
pub mod fit;
pub mod options;
pub mod trace;

pub use aligner::{circle_points, focus_points, grid_points, Aligner, AlignerState};
pub use fit::{predict_best, Estimate, EstimateSource, FitMethod};
pub use options::{CancelToken, Optimise2dOptions, OptimiseOptions, Tolerance};
pub use trace::{default_z_offsets, AlignmentTrace, SpectraEnvelope, TraceHint, TraceSink, ZScan};
