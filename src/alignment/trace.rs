//! Alignment traces, trace sinks and z-scan results.
//!
//! Every primitive returns an [`AlignmentTrace`]: the positions it visited, the
//! merit measured at each one and the position it predicted. Observers that
//! want to plot progress register a [`TraceSink`] with the aligner; the trace
//! is handed over synchronously, before the call that produced it returns.

use chrono::{DateTime, Utc};
use nalgebra::DMatrix;
use serde::Serialize;

use crate::alignment::fit::{EstimateSource, FitMethod};
use crate::error::AppResult;
use crate::hardware::Position;
use crate::spectrometer::SpectrometerMetadata;

/// Record of one alignment primitive or composite run.
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentTrace {
    /// Absolute positions visited, in visiting order
    pub positions: Vec<Position>,
    /// Merit measured at each position
    pub merits: Vec<f64>,
    /// Where the fit placed the optimum; `None` when the run was cancelled
    pub predicted_best: Option<Position>,
    /// Fit requested for the run
    pub fit_method: FitMethod,
    /// Estimator that produced `predicted_best` after fallbacks
    pub estimate_source: Option<EstimateSource>,
    /// Completed iterations (composites only)
    pub iterations: usize,
    /// The composite stopped because its convergence test passed
    pub converged: bool,
    /// A stop request cut the run short
    pub cancelled: bool,
    /// When the run began
    pub started_at: DateTime<Utc>,
}

impl AlignmentTrace {
    /// An empty trace stamped with the current time.
    pub fn new(fit_method: FitMethod) -> Self {
        Self {
            positions: Vec::new(),
            merits: Vec::new(),
            predicted_best: None,
            fit_method,
            estimate_source: None,
            iterations: 0,
            converged: false,
            cancelled: false,
            started_at: Utc::now(),
        }
    }

    /// Append a visited position and its merit.
    pub fn record(&mut self, position: Position, merit: f64) {
        self.positions.push(position);
        self.merits.push(merit);
    }

    /// Number of visited positions.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// True before the first visit.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// The visited position with the highest merit.
    pub fn best_visited(&self) -> Option<(Position, f64)> {
        self.positions
            .iter()
            .zip(&self.merits)
            .filter(|(_, merit)| merit.is_finite())
            .fold(None, |best: Option<(Position, f64)>, (position, merit)| match best {
                Some((_, best_merit)) if best_merit >= *merit => best,
                _ => Some((*position, *merit)),
            })
    }
}

/// What kind of run a trace came from, so observers can style it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceHint {
    /// A standalone primitive call
    Primitive,
    /// One iteration inside `optimise` or `optimise_2d`
    Iteration,
    /// The per-iteration positions of a finished composite
    Summary,
}

/// Receives every trace the aligner produces.
pub trait TraceSink: Send + Sync {
    fn on_trace(&self, trace: &AlignmentTrace, hint: TraceHint);
}

impl<F> TraceSink for F
where
    F: Fn(&AlignmentTrace, TraceHint) + Send + Sync,
{
    fn on_trace(&self, trace: &AlignmentTrace, hint: TraceHint) {
        self(trace, hint)
    }
}

// =============================================================================
// Z-scan
// =============================================================================

/// Focus offsets used when the caller does not supply any: -4.0 to 3.6 in 0.4 steps.
pub fn default_z_offsets() -> Vec<f64> {
    (0..20).map(|i| -4.0 + 0.4 * i as f64).collect()
}

/// Raw spectra taken at a series of focus offsets.
#[derive(Debug, Clone)]
pub struct ZScan {
    /// One row per visited offset, one column per pixel
    pub spectra: DMatrix<f64>,
    /// Offsets actually visited, relative to the start position
    pub dz: Vec<f64>,
    /// Instrument state when the scan finished
    pub metadata: SpectrometerMetadata,
    /// The scan stopped early on request
    pub cancelled: bool,
}

impl ZScan {
    pub(crate) fn new(
        rows: Vec<Vec<f64>>,
        dz: Vec<f64>,
        metadata: SpectrometerMetadata,
        cancelled: bool,
    ) -> Self {
        let pixels = rows
            .first()
            .map(Vec::len)
            .unwrap_or(metadata.wavelengths.len());
        let spectra = DMatrix::from_fn(rows.len(), pixels, |row, pixel| rows[row][pixel]);
        Self {
            spectra,
            dz,
            metadata,
            cancelled,
        }
    }

    /// (offsets, pixels)
    pub fn shape(&self) -> (usize, usize) {
        self.spectra.shape()
    }

    /// Spectrum recorded at the `index`-th offset.
    pub fn spectrum(&self, index: usize) -> Option<Vec<f64>> {
        (index < self.spectra.nrows())
            .then(|| self.spectra.row(index).iter().copied().collect())
    }

    /// Package the scan with its instrument metadata for storage.
    pub fn envelope(&self) -> SpectraEnvelope {
        SpectraEnvelope {
            data: (0..self.spectra.nrows())
                .map(|row| self.spectra.row(row).iter().copied().collect())
                .collect(),
            dz: self.dz.clone(),
            wavelengths: self.metadata.wavelengths.clone(),
            background: self.metadata.background.clone(),
            reference: self.metadata.reference.clone(),
            integration_time_ms: self.metadata.integration_time_ms,
            model_name: self.metadata.model_name.clone(),
            serial_number: self.metadata.serial_number.clone(),
            tec_temperature: self.metadata.tec_temperature,
            captured_at: self.metadata.captured_at,
        }
    }
}

/// Self-describing, serialisable form of a [`ZScan`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpectraEnvelope {
    /// Raw spectra, one row per offset
    pub data: Vec<Vec<f64>>,
    /// Focus offsets of the rows
    pub dz: Vec<f64>,
    /// Wavelength of each pixel (nm)
    pub wavelengths: Vec<f64>,
    /// Background in force during the scan (empty when none)
    pub background: Vec<f64>,
    /// Reference in force during the scan (empty when none)
    pub reference: Vec<f64>,
    /// Exposure length
    pub integration_time_ms: f64,
    /// Spectrometer model
    pub model_name: String,
    /// Spectrometer serial number
    pub serial_number: String,
    /// Detector cooler temperature (°C), when the device reports one
    pub tec_temperature: Option<f64>,
    /// When the metadata was sampled
    pub captured_at: DateTime<Utc>,
}

impl SpectraEnvelope {
    /// Encode as a single JSON object.
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pixels: usize) -> SpectrometerMetadata {
        SpectrometerMetadata {
            model_name: "Test".into(),
            serial_number: "T-1".into(),
            integration_time_ms: 50.0,
            background: Vec::new(),
            reference: Vec::new(),
            wavelengths: (0..pixels).map(|i| 500.0 + i as f64).collect(),
            tec_temperature: None,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn default_offsets_cover_minus_four_to_three_point_six() {
        let offsets = default_z_offsets();
        assert_eq!(offsets.len(), 20);
        assert_eq!(offsets[0], -4.0);
        assert!((offsets[19] - 3.6).abs() < 1e-12);
    }

    #[test]
    fn best_visited_picks_highest_merit() {
        let mut trace = AlignmentTrace::new(FitMethod::Centroid);
        assert!(trace.best_visited().is_none());
        trace.record(Position::new(0.0, 0.0, 0.0), 1.0);
        trace.record(Position::new(1.0, 0.0, 0.0), 4.0);
        trace.record(Position::new(2.0, 0.0, 0.0), f64::NAN);
        assert_eq!(trace.best_visited(), Some((Position::new(1.0, 0.0, 0.0), 4.0)));
    }

    #[test]
    fn closures_are_sinks() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |trace: &AlignmentTrace, hint: TraceHint| {
            seen.lock().unwrap().push((trace.len(), hint));
        };
        sink.on_trace(&AlignmentTrace::new(FitMethod::Maximum), TraceHint::Summary);
        assert_eq!(seen.lock().unwrap().as_slice(), &[(0, TraceHint::Summary)]);
    }

    #[test]
    fn scan_rows_follow_offsets() {
        let scan = ZScan::new(
            vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
            vec![-0.5, 0.5],
            metadata(3),
            false,
        );
        assert_eq!(scan.shape(), (2, 3));
        assert_eq!(scan.spectrum(1), Some(vec![4.0, 5.0, 6.0]));
        assert_eq!(scan.spectrum(2), None);

        let json = scan.envelope().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["data"][0][2], 3.0);
        assert_eq!(value["dz"][1], 0.5);
        assert_eq!(value["model_name"], "Test");
    }

    #[test]
    fn empty_scan_keeps_pixel_count() {
        let scan = ZScan::new(Vec::new(), Vec::new(), metadata(4), true);
        assert_eq!(scan.shape(), (0, 4));
        assert!(scan.cancelled);
    }
}
