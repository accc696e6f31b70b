//! Merit evaluation: one scalar describing "how good is here".
//!
//! The merit is the sum of the (optionally masked) spectrum. Infinities are
//! treated as NaN and NaNs are left out of the sum, so a dead or saturated
//! pixel can never poison the alignment. No smoothing or peak detection is
//! done here; framing the problem is the aligner's job.

use serde::{Deserialize, Serialize};

use crate::error::{AlignError, AppResult};
use crate::spectrometer::SpectrumPipeline;

/// Boolean pixel selection applied before summing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectrumMask(Vec<bool>);

impl SpectrumMask {
    /// One flag per pixel; `true` pixels enter the merit.
    pub fn new(pixels: Vec<bool>) -> Self {
        Self(pixels)
    }

    /// Select the pixels in `range` out of `len`.
    pub fn from_range(len: usize, range: std::ops::Range<usize>) -> Self {
        Self((0..len).map(|i| range.contains(&i)).collect())
    }

    /// Number of pixels the mask covers, selected or not.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a zero-length mask.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of selected pixels.
    pub fn selected(&self) -> usize {
        self.0.iter().filter(|selected| **selected).count()
    }

    /// The per-pixel flags.
    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }
}

impl From<Vec<bool>> for SpectrumMask {
    fn from(pixels: Vec<bool>) -> Self {
        Self(pixels)
    }
}

/// Sum the finite entries of `spectrum`, restricted to `mask` when given.
pub fn sum_merit(spectrum: &[f64], mask: Option<&SpectrumMask>) -> AppResult<f64> {
    match mask {
        None => Ok(spectrum.iter().filter(|v| v.is_finite()).sum()),
        Some(mask) => {
            if mask.len() != spectrum.len() {
                return Err(AlignError::invalid(format!(
                    "mask has {} pixels, spectrum has {}",
                    mask.len(),
                    spectrum.len()
                )));
            }
            Ok(spectrum
                .iter()
                .zip(mask.as_slice())
                .filter(|(value, selected)| **selected && value.is_finite())
                .map(|(value, _)| *value)
                .sum())
        }
    }
}

/// Reads the spectrometer and reduces the exposure to a merit value.
#[derive(Clone, Copy)]
pub struct MeritEvaluator<'a> {
    pipeline: &'a SpectrumPipeline,
    align_to_raw_spectra: bool,
    mask: Option<&'a SpectrumMask>,
}

impl<'a> MeritEvaluator<'a> {
    /// Sum processed spectra from `pipeline` over all pixels.
    pub fn new(pipeline: &'a SpectrumPipeline) -> Self {
        Self {
            pipeline,
            align_to_raw_spectra: false,
            mask: None,
        }
    }

    /// Sum raw counts, bypassing background and reference.
    pub fn raw(mut self, align_to_raw_spectra: bool) -> Self {
        self.align_to_raw_spectra = align_to_raw_spectra;
        self
    }

    /// Restrict the sum to the pixels `mask` selects.
    pub fn masked(mut self, mask: Option<&'a SpectrumMask>) -> Self {
        self.mask = mask;
        self
    }

    /// Take one exposure and return its merit.
    pub fn evaluate(&self) -> AppResult<f64> {
        let reading = self.pipeline.acquire(None)?;
        let spectrum = if self.align_to_raw_spectra {
            &reading.raw
        } else {
            &reading.processed
        };
        sum_merit(spectrum, self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockSpectrometer, MockStage};
    use std::sync::Arc;

    #[test]
    fn nan_and_infinity_are_ignored() {
        let spectrum = [1.0, f64::NAN, 2.0, f64::INFINITY, f64::NEG_INFINITY];
        assert_eq!(sum_merit(&spectrum, None).unwrap(), 3.0);
    }

    #[test]
    fn mask_selects_pixels() {
        let spectrum = [1.0, 2.0, 4.0, 8.0];
        let mask = SpectrumMask::from_range(4, 1..3);
        assert_eq!(mask.selected(), 2);
        assert_eq!(sum_merit(&spectrum, Some(&mask)).unwrap(), 6.0);
    }

    #[test]
    fn mask_length_must_match() {
        let mask = SpectrumMask::new(vec![true; 3]);
        assert!(matches!(
            sum_merit(&[1.0; 4], Some(&mask)),
            Err(AlignError::InvalidParameter(_))
        ));
    }

    #[test]
    fn evaluator_subtracts_background_unless_raw() {
        let stage = Arc::new(MockStage::new());
        let driver = Arc::new(
            MockSpectrometer::new(stage, |_| 40.0)
                .with_pixels(4)
                .with_dark_level(5.0),
        );
        let pipeline = SpectrumPipeline::new(driver);
        pipeline.set_background(vec![5.0; 4]).unwrap();

        let processed = MeritEvaluator::new(&pipeline).evaluate().unwrap();
        assert!((processed - 40.0).abs() < 1e-9);

        let raw = MeritEvaluator::new(&pipeline).raw(true).evaluate().unwrap();
        assert!((raw - 60.0).abs() < 1e-9);
    }
}
