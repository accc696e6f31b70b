//! Spectrometer acquisition pipeline.
//!
//! `SpectrumPipeline` wraps a [`SpectrometerDriver`] and owns everything the
//! driver does not: the cached wavelength axis, the background and reference
//! spectra, and the most recent raw and processed spectra.
//!
//! # Processing
//!
//! ```text
//! no background            s = r
//! background only          s = r - b
//! background + reference   s = (r - b) / (ref - b)   NaN where ref - b <= 0
//! ```
//!
//! The division never touches global floating-point state: every element is
//! computed independently and anything non-finite is replaced by NaN.
//!
//! # Concurrency
//!
//! Exposures and integration-time changes are serialised by an internal
//! communications lock. Background, reference and the latest spectra are kept
//! as `Arc<[f64]>` snapshots behind `RwLock`s; they are replaced whole, never
//! edited in place, so readers always see a consistent array.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AlignError, AppResult};
use crate::hardware::SpectrometerDriver;
use crate::merit::SpectrumMask;

/// An immutable spectrum snapshot.
pub type Spectrum = Arc<[f64]>;

/// One exposure before and after correction.
#[derive(Debug, Clone)]
pub struct Reading {
    /// Detector counts as delivered by the driver
    pub raw: Spectrum,
    /// Background-subtracted and, when referenced, normalised spectrum
    pub processed: Spectrum,
}

/// Instrument state needed to interpret stored spectra.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpectrometerMetadata {
    /// Device model
    pub model_name: String,
    /// Device serial number
    pub serial_number: String,
    /// Current exposure length
    pub integration_time_ms: f64,
    /// Stored background (empty when none)
    pub background: Vec<f64>,
    /// Stored reference (empty when none)
    pub reference: Vec<f64>,
    /// Wavelength of each pixel (nm)
    pub wavelengths: Vec<f64>,
    /// Detector cooler temperature (°C)
    pub tec_temperature: Option<f64>,
    /// Sampling time
    pub captured_at: DateTime<Utc>,
}

impl SpectrometerMetadata {
    /// The metadata as a JSON object, for persistence layers that take a mapping.
    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Corrections {
    background: Spectrum,
    reference: Spectrum,
}

#[derive(Debug, Clone, Default)]
struct Latest {
    raw: Option<Spectrum>,
    processed: Option<Spectrum>,
}

fn empty_spectrum() -> Spectrum {
    Arc::from(Vec::<f64>::new())
}

/// Background/reference-corrected acquisition on top of a driver.
pub struct SpectrumPipeline {
    driver: Arc<dyn SpectrometerDriver>,
    comms: Mutex<()>,
    wavelengths: OnceCell<Spectrum>,
    corrections: RwLock<Corrections>,
    latest: RwLock<Latest>,
}

impl SpectrumPipeline {
    /// Wrap `driver` with no background or reference stored.
    pub fn new(driver: Arc<dyn SpectrometerDriver>) -> Self {
        Self {
            driver,
            comms: Mutex::new(()),
            wavelengths: OnceCell::new(),
            corrections: RwLock::new(Corrections {
                background: empty_spectrum(),
                reference: empty_spectrum(),
            }),
            latest: RwLock::new(Latest::default()),
        }
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &Arc<dyn SpectrometerDriver> {
        &self.driver
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    /// Take one exposure and return the raw counts.
    pub fn read_raw(&self) -> AppResult<Spectrum> {
        let raw = {
            let _comms = self.comms.lock();
            self.driver.read_raw()?
        };
        let expected = self.wavelengths()?.len();
        if raw.len() != expected {
            return Err(AlignError::DriverFault(format!(
                "exposure returned {} pixels, wavelength axis has {}",
                raw.len(),
                expected
            )));
        }
        let raw: Spectrum = Arc::from(raw);
        self.latest.write().raw = Some(raw.clone());
        Ok(raw)
    }

    /// Process `raw` (or a fresh exposure when `None`) and remember both spectra.
    pub fn acquire(&self, raw: Option<Vec<f64>>) -> AppResult<Reading> {
        let raw = match raw {
            Some(raw) => {
                let raw: Spectrum = Arc::from(raw);
                self.latest.write().raw = Some(raw.clone());
                raw
            }
            None => self.read_raw()?,
        };

        let corrections = self.corrections.read().clone();
        let processed: Spectrum =
            process_spectrum(&raw, &corrections.background, &corrections.reference)?.into();
        self.latest.write().processed = Some(processed.clone());
        Ok(Reading { raw, processed })
    }

    /// Compute the processed spectrum and store it as the latest spectrum.
    pub fn update_spectrum(&self, raw: Option<Vec<f64>>) -> AppResult<Spectrum> {
        Ok(self.acquire(raw)?.processed)
    }

    /// Wavelength axis and processed spectrum from a single exposure.
    pub fn read(&self) -> AppResult<(Spectrum, Spectrum)> {
        let processed = self.update_spectrum(None)?;
        Ok((self.wavelengths()?, processed))
    }

    /// Most recent raw exposure, if any.
    pub fn latest_raw_spectrum(&self) -> Option<Spectrum> {
        self.latest.read().raw.clone()
    }

    /// Most recent processed spectrum, if any.
    pub fn latest_spectrum(&self) -> Option<Spectrum> {
        self.latest.read().processed.clone()
    }

    /// Wavelength of every pixel. Computed by the driver once and cached.
    pub fn wavelengths(&self) -> AppResult<Spectrum> {
        self.wavelengths
            .get_or_try_init(|| {
                let wavelengths = self.driver.wavelengths()?;
                if wavelengths.windows(2).any(|pair| pair[1] <= pair[0]) {
                    return Err(AlignError::DriverFault(
                        "wavelength axis is not strictly increasing".to_string(),
                    ));
                }
                debug!(pixels = wavelengths.len(), "Wavelength axis cached");
                Ok(Arc::from(wavelengths))
            })
            .cloned()
    }

    // =========================================================================
    // Background and reference
    // =========================================================================

    /// Acquire one raw spectrum and keep it as the background.
    pub fn capture_background(&self) -> AppResult<()> {
        let raw = self.read_raw()?;
        self.set_background(raw.to_vec())?;
        info!(model = %self.driver.model_name(), "Background captured");
        Ok(())
    }

    /// Acquire one raw spectrum and keep it as the reference.
    pub fn capture_reference(&self) -> AppResult<()> {
        let raw = self.read_raw()?;
        self.set_reference(raw.to_vec())?;
        info!(model = %self.driver.model_name(), "Reference captured");
        Ok(())
    }

    /// Replace the background. Its length must match the wavelength axis.
    pub fn set_background(&self, background: Vec<f64>) -> AppResult<()> {
        self.check_length("background", background.len())?;
        self.corrections.write().background = Arc::from(background);
        Ok(())
    }

    /// Replace the reference. Its length must match the wavelength axis.
    pub fn set_reference(&self, reference: Vec<f64>) -> AppResult<()> {
        self.check_length("reference", reference.len())?;
        self.corrections.write().reference = Arc::from(reference);
        Ok(())
    }

    /// Drop the background; processing then passes raw counts through.
    pub fn clear_background(&self) {
        self.corrections.write().background = empty_spectrum();
    }

    /// Drop the reference.
    pub fn clear_reference(&self) {
        self.corrections.write().reference = empty_spectrum();
    }

    /// Current background (empty when none).
    pub fn background(&self) -> Spectrum {
        self.corrections.read().background.clone()
    }

    /// Current reference (empty when none).
    pub fn reference(&self) -> Spectrum {
        self.corrections.read().reference.clone()
    }

    /// A background matching the wavelength axis is stored.
    pub fn is_background_compensated(&self) -> bool {
        let background = self.background();
        !background.is_empty() && self.matches_axis(background.len())
    }

    /// Both a background and a reference matching the wavelength axis are stored.
    pub fn is_referenced(&self) -> bool {
        let corrections = self.corrections.read().clone();
        !corrections.background.is_empty()
            && !corrections.reference.is_empty()
            && self.matches_axis(corrections.background.len())
            && self.matches_axis(corrections.reference.len())
    }

    /// Pixels where the referenced signal `ref - b` reaches `threshold` times
    /// its maximum. `None` when the pipeline is not referenced.
    pub fn reference_mask(&self, threshold: f64) -> Option<SpectrumMask> {
        if !self.is_referenced() {
            return None;
        }
        let corrections = self.corrections.read().clone();
        let signal: Vec<f64> = corrections
            .reference
            .iter()
            .zip(corrections.background.iter())
            .map(|(r, b)| r - b)
            .collect();
        let peak = signal
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        Some(SpectrumMask::new(
            signal.iter().map(|v| *v >= peak * threshold).collect(),
        ))
    }

    fn matches_axis(&self, len: usize) -> bool {
        self.wavelengths()
            .map(|axis| axis.len() == len)
            .unwrap_or(false)
    }

    fn check_length(&self, what: &str, len: usize) -> AppResult<()> {
        let expected = self.wavelengths()?.len();
        if len != expected {
            return Err(AlignError::invalid(format!(
                "{} has {} pixels, expected {}",
                what, len, expected
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Integration time and metadata
    // =========================================================================

    /// Current integration time in milliseconds.
    pub fn integration_time_ms(&self) -> f64 {
        self.driver.integration_time_ms()
    }

    /// Program a new integration time, rejecting values below the device minimum.
    pub fn set_integration_time_ms(&self, milliseconds: f64) -> AppResult<()> {
        let minimum = self.driver.min_integration_time_ms();
        if !milliseconds.is_finite() || milliseconds < minimum {
            return Err(AlignError::invalid(format!(
                "integration time {} ms is below the minimum of {} ms",
                milliseconds, minimum
            )));
        }
        let _comms = self.comms.lock();
        self.driver.set_integration_time_ms(milliseconds)?;
        debug!(integration_time_ms = milliseconds, "Integration time set");
        Ok(())
    }

    /// Shortest accepted integration time in milliseconds.
    pub fn min_integration_time_ms(&self) -> f64 {
        self.driver.min_integration_time_ms()
    }

    /// Snapshot of the instrument state and stored corrections.
    pub fn metadata(&self) -> AppResult<SpectrometerMetadata> {
        let corrections = self.corrections.read().clone();
        Ok(SpectrometerMetadata {
            model_name: self.driver.model_name(),
            serial_number: self.driver.serial_number(),
            integration_time_ms: self.driver.integration_time_ms(),
            background: corrections.background.to_vec(),
            reference: corrections.reference.to_vec(),
            wavelengths: self.wavelengths()?.to_vec(),
            tec_temperature: self.driver.tec_temperature(),
            captured_at: Utc::now(),
        })
    }
}

/// Apply background subtraction and reference normalisation to `raw`.
///
/// An empty `background` disables both corrections; an empty `reference`
/// disables normalisation. Mismatched lengths are rejected.
pub fn process_spectrum(raw: &[f64], background: &[f64], reference: &[f64]) -> AppResult<Vec<f64>> {
    if background.is_empty() {
        return Ok(raw.to_vec());
    }
    if background.len() != raw.len() {
        return Err(AlignError::invalid(format!(
            "background has {} pixels, spectrum has {}",
            background.len(),
            raw.len()
        )));
    }
    if reference.is_empty() {
        return Ok(raw.iter().zip(background).map(|(r, b)| r - b).collect());
    }
    if reference.len() != raw.len() {
        return Err(AlignError::invalid(format!(
            "reference has {} pixels, spectrum has {}",
            reference.len(),
            raw.len()
        )));
    }

    Ok(raw
        .iter()
        .zip(background)
        .zip(reference)
        .map(|((r, b), rf)| {
            let denominator = rf - b;
            if denominator > 0.0 {
                let value = (r - b) / denominator;
                if value.is_finite() {
                    value
                } else {
                    f64::NAN
                }
            } else {
                f64::NAN
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockSpectrometer, MockStage};

    fn pipeline(pixels: usize) -> (Arc<MockSpectrometer>, SpectrumPipeline) {
        let stage = Arc::new(MockStage::new());
        let driver = Arc::new(MockSpectrometer::new(stage, |_| 40.0).with_pixels(pixels));
        let pipeline = SpectrumPipeline::new(driver.clone());
        (driver, pipeline)
    }

    #[test]
    fn process_without_corrections_is_identity() {
        let raw = [1.0, 2.0, 3.0];
        assert_eq!(process_spectrum(&raw, &[], &[]).unwrap(), raw.to_vec());
        // a reference alone does nothing
        assert_eq!(process_spectrum(&raw, &[], &[5.0, 5.0, 5.0]).unwrap(), raw.to_vec());
    }

    #[test]
    fn process_background_only() {
        let s = process_spectrum(&[5.0, 6.0], &[1.0, 2.0], &[]).unwrap();
        assert_eq!(s, vec![4.0, 4.0]);
    }

    #[test]
    fn process_negative_denominator_is_nan() {
        let s = process_spectrum(&[60.0, 60.0], &[10.0, 10.0], &[5.0, 110.0]).unwrap();
        assert!(s[0].is_nan());
        assert_eq!(s[1], 0.5);
    }

    #[test]
    fn process_rejects_length_mismatch() {
        assert!(process_spectrum(&[1.0, 2.0], &[1.0], &[]).is_err());
        assert!(process_spectrum(&[1.0, 2.0], &[1.0, 1.0], &[3.0]).is_err());
    }

    #[test]
    fn wavelengths_are_computed_once() {
        let (driver, pipeline) = pipeline(8);
        assert_eq!(driver.wavelength_reads(), 0);
        pipeline.read_raw().unwrap();
        pipeline.read_raw().unwrap();
        assert_eq!(pipeline.wavelengths().unwrap().len(), 8);
        assert_eq!(driver.wavelength_reads(), 1);
    }

    #[test]
    fn capture_and_clear_background() {
        let (_driver, pipeline) = pipeline(4);
        assert!(!pipeline.is_background_compensated());
        pipeline.capture_background().unwrap();
        assert!(pipeline.is_background_compensated());
        assert!(!pipeline.is_referenced());

        // background equals the signal, so the processed spectrum is zero
        let s = pipeline.update_spectrum(None).unwrap();
        assert!(s.iter().all(|v| v.abs() < 1e-12));

        pipeline.clear_background();
        assert!(!pipeline.is_background_compensated());
        assert!(pipeline.background().is_empty());
    }

    #[test]
    fn set_background_checks_length() {
        let (_driver, pipeline) = pipeline(4);
        assert!(matches!(
            pipeline.set_background(vec![1.0; 3]),
            Err(AlignError::InvalidParameter(_))
        ));
        assert!(!pipeline.is_background_compensated());
    }

    #[test]
    fn integration_time_lower_bound() {
        let (driver, pipeline) = pipeline(4);
        pipeline.set_integration_time_ms(5.0).unwrap();
        assert_eq!(driver.integration_time_ms(), 5.0);
        assert!(matches!(
            pipeline.set_integration_time_ms(0.5),
            Err(AlignError::InvalidParameter(_))
        ));
        assert_eq!(pipeline.integration_time_ms(), 5.0);
    }

    #[test]
    fn reference_mask_selects_bright_pixels() {
        let (_driver, pipeline) = pipeline(4);
        assert!(pipeline.reference_mask(0.5).is_none());
        pipeline.set_background(vec![10.0; 4]).unwrap();
        pipeline
            .set_reference(vec![110.0, 20.0, 80.0, 60.0])
            .unwrap();
        let mask = pipeline.reference_mask(0.5).unwrap();
        assert_eq!(mask.as_slice(), &[true, false, true, true]);
    }

    #[test]
    fn metadata_carries_corrections() {
        let (_driver, pipeline) = pipeline(4);
        pipeline.set_background(vec![1.0; 4]).unwrap();
        let metadata = pipeline.metadata().unwrap();
        assert_eq!(metadata.model_name, "MockSpectrometer");
        assert_eq!(metadata.background, vec![1.0; 4]);
        assert!(metadata.reference.is_empty());
        assert_eq!(metadata.wavelengths.len(), 4);
        assert_eq!(metadata.tec_temperature, Some(-10.0));

        let map = metadata.to_map();
        assert!(map.contains_key("integration_time_ms"));
        assert!(map.contains_key("serial_number"));
    }

    #[test]
    fn read_pairs_axis_and_spectrum() {
        let (_driver, pipeline) = pipeline(4);
        let (wavelengths, spectrum) = pipeline.read().unwrap();
        assert_eq!(wavelengths.len(), spectrum.len());
        assert_eq!(pipeline.latest_spectrum().unwrap(), spectrum);
        assert!(pipeline.latest_raw_spectrum().is_some());
    }
}
