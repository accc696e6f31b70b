//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for testing without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockStage` - Simulated three-axis stage with travel limits and optional motion time
//! - `MockSpectrometer` - Simulated spectrometer whose signal is a function of the
//!   stage position, with fault injection for transient and fatal errors
//!
//! # Performance Characteristics
//!
//! - MockStage: instantaneous by default, `with_move_duration` adds a fixed time per move
//!   and `with_settle_polls` keeps `is_moving` true for a number of polls after each move
//! - MockSpectrometer: returns immediately unless `with_realtime_exposure` is enabled

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use tracing::trace;

use crate::error::{AlignError, AppResult};
use crate::hardware::capabilities::{Axis, Position, SpectrometerDriver, Stage};

// =============================================================================
// MockStage - Simulated Motion Stage
// =============================================================================

/// Mock three-axis stage
///
/// Simulates a piezo/stepper stage with:
/// - Per-axis travel limits (default ±100 units)
/// - Optional fixed motion time per move
/// - Optional ringing after a move: `is_moving` reports true for the next
///   `settle_polls` queries
/// - Injectable driver faults after a number of moves
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockStage::new();
/// stage.move_to(Position::new(1.0, 0.0, 0.0), false)?;
/// assert_eq!(stage.position()?, Position::new(1.0, 0.0, 0.0));
/// ```
pub struct MockStage {
    position: RwLock<Position>,
    travel: [(f64, f64); 3],
    move_duration: Duration,
    moving: AtomicBool,
    settle_polls: usize,
    pending_polls: AtomicUsize,
    poll_count: AtomicUsize,
    move_count: AtomicUsize,
    fault_after_moves: Mutex<Option<usize>>,
}

impl MockStage {
    /// Create new mock stage at the origin
    pub fn new() -> Self {
        Self {
            position: RwLock::new(Position::zeros()),
            travel: [(-100.0, 100.0); 3],
            move_duration: Duration::ZERO,
            moving: AtomicBool::new(false),
            settle_polls: 0,
            pending_polls: AtomicUsize::new(0),
            poll_count: AtomicUsize::new(0),
            move_count: AtomicUsize::new(0),
            fault_after_moves: Mutex::new(None),
        }
    }

    /// Start at `position` instead of the origin
    pub fn at(self, position: Position) -> Self {
        *self.position.write() = position;
        self
    }

    /// Restrict the travel of one axis
    pub fn with_travel(mut self, axis: Axis, min: f64, max: f64) -> Self {
        self.travel[axis.index()] = (min, max);
        self
    }

    /// Make every move take `duration`
    pub fn with_move_duration(mut self, duration: Duration) -> Self {
        self.move_duration = duration;
        self
    }

    /// Report motion for `polls` queries of `is_moving` after every move
    pub fn with_settle_polls(mut self, polls: usize) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Fail every move after `moves` more successful ones with a driver fault
    pub fn fail_after_moves(&self, moves: usize) {
        *self.fault_after_moves.lock() = Some(moves);
    }

    /// Number of completed moves
    pub fn move_count(&self) -> usize {
        self.move_count.load(Ordering::SeqCst)
    }

    /// Number of `is_moving` queries so far
    pub fn poll_count(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }

    /// Whether the stage is still ringing after its last move.
    ///
    /// Unlike `is_moving` this does not consume a poll.
    pub fn is_settling(&self) -> bool {
        self.pending_polls.load(Ordering::SeqCst) > 0
    }

    fn check_travel(&self, target: &Position) -> AppResult<()> {
        for axis in Axis::ALL {
            let (min, max) = self.travel[axis.index()];
            let value = target[axis.index()];
            if !(min..=max).contains(&value) {
                return Err(AlignError::OutOfRange {
                    axis: axis.to_string(),
                    target: value,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for MockStage {
    fn move_to(&self, target: Position, relative: bool) -> AppResult<()> {
        let current = *self.position.read();
        let target = if relative { current + target } else { target };
        self.check_travel(&target)?;

        {
            let mut fault = self.fault_after_moves.lock();
            match fault.as_mut() {
                Some(0) => {
                    return Err(AlignError::DriverFault(
                        "MockStage: controller stopped responding".to_string(),
                    ))
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }

        trace!(from = ?current, to = ?target, "MockStage: moving");
        if !self.move_duration.is_zero() {
            self.moving.store(true, Ordering::SeqCst);
            sleep(self.move_duration);
        }
        *self.position.write() = target;
        self.pending_polls.store(self.settle_polls, Ordering::SeqCst);
        self.moving.store(false, Ordering::SeqCst);
        self.move_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn position(&self) -> AppResult<Position> {
        Ok(*self.position.read())
    }

    fn is_moving(&self, _axes: Option<&[Axis]>) -> AppResult<bool> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        let ringing = self
            .pending_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(ringing || self.moving.load(Ordering::SeqCst))
    }
}

// =============================================================================
// MockSpectrometer - Simulated Spectrometer
// =============================================================================

/// Signal model: integrated counts as a function of stage position.
pub type SignalModel = dyn Fn(&Position) -> f64 + Send + Sync;

/// Mock spectrometer coupled to a [`MockStage`]
///
/// Each exposure spreads `signal(position)` evenly across the pixels and adds
/// a constant dark level, so the pixel sum equals the signal plus
/// `dark_level * pixels`.
pub struct MockSpectrometer {
    stage: Arc<dyn Stage>,
    signal: Box<SignalModel>,
    pixels: usize,
    dark_level: f64,
    integration_time_ms: RwLock<f64>,
    min_integration_time_ms: f64,
    realtime: bool,
    queued_failures: Mutex<VecDeque<AlignError>>,
    injected_raw: Mutex<VecDeque<Vec<f64>>>,
    exposure_log: Mutex<Vec<f64>>,
    wavelength_reads: AtomicUsize,
}

impl MockSpectrometer {
    /// Create a mock reading `signal` at the current position of `stage`
    pub fn new<F>(stage: Arc<dyn Stage>, signal: F) -> Self
    where
        F: Fn(&Position) -> f64 + Send + Sync + 'static,
    {
        Self {
            stage,
            signal: Box::new(signal),
            pixels: 64,
            dark_level: 0.0,
            integration_time_ms: RwLock::new(100.0),
            min_integration_time_ms: 1.0,
            realtime: false,
            queued_failures: Mutex::new(VecDeque::new()),
            injected_raw: Mutex::new(VecDeque::new()),
            exposure_log: Mutex::new(Vec::new()),
            wavelength_reads: AtomicUsize::new(0),
        }
    }

    /// Number of detector pixels
    pub fn with_pixels(mut self, pixels: usize) -> Self {
        self.pixels = pixels;
        self
    }

    /// Constant counts added to every pixel
    pub fn with_dark_level(mut self, dark_level: f64) -> Self {
        self.dark_level = dark_level;
        self
    }

    /// Sleep for the integration time on every exposure
    pub fn with_realtime_exposure(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Queue an error to be returned by the next exposure instead of data
    pub fn push_failure(&self, error: AlignError) {
        self.queued_failures.lock().push_back(error);
    }

    /// Queue a raw spectrum to be returned verbatim by the next exposure
    pub fn push_raw(&self, raw: Vec<f64>) {
        self.injected_raw.lock().push_back(raw);
    }

    /// Integration time of every exposure taken so far
    pub fn exposure_log(&self) -> Vec<f64> {
        self.exposure_log.lock().clone()
    }

    /// Number of exposures taken so far (failed ones excluded)
    pub fn exposure_count(&self) -> usize {
        self.exposure_log.lock().len()
    }

    /// How many times the wavelength axis was computed
    pub fn wavelength_reads(&self) -> usize {
        self.wavelength_reads.load(Ordering::SeqCst)
    }
}

impl SpectrometerDriver for MockSpectrometer {
    fn model_name(&self) -> String {
        "MockSpectrometer".to_string()
    }

    fn serial_number(&self) -> String {
        "MOCK-0001".to_string()
    }

    fn read_raw(&self) -> AppResult<Vec<f64>> {
        if let Some(error) = self.queued_failures.lock().pop_front() {
            return Err(error);
        }

        let integration_time = *self.integration_time_ms.read();
        if self.realtime {
            let exposure = Duration::try_from_secs_f64(integration_time / 1000.0)
                .map_err(|err| AlignError::DriverFault(format!("MockSpectrometer: {}", err)))?;
            sleep(exposure);
        }
        self.exposure_log.lock().push(integration_time);

        if let Some(raw) = self.injected_raw.lock().pop_front() {
            return Ok(raw);
        }

        let position = self.stage.position()?;
        let per_pixel = (self.signal)(&position) / self.pixels as f64;
        Ok(vec![per_pixel + self.dark_level; self.pixels])
    }

    fn wavelengths(&self) -> AppResult<Vec<f64>> {
        self.wavelength_reads.fetch_add(1, Ordering::SeqCst);
        Ok((0..self.pixels).map(|i| 400.0 + i as f64).collect())
    }

    fn integration_time_ms(&self) -> f64 {
        *self.integration_time_ms.read()
    }

    fn set_integration_time_ms(&self, milliseconds: f64) -> AppResult<()> {
        *self.integration_time_ms.write() = milliseconds;
        Ok(())
    }

    fn min_integration_time_ms(&self) -> f64 {
        self.min_integration_time_ms
    }

    fn tec_temperature(&self) -> Option<f64> {
        Some(-10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_rejects_moves_beyond_travel() {
        let stage = MockStage::new().with_travel(Axis::Z, -1.0, 1.0);
        let err = stage
            .move_to(Position::new(0.0, 0.0, 2.0), false)
            .unwrap_err();
        assert!(matches!(err, AlignError::OutOfRange { .. }));
        assert_eq!(stage.position().unwrap(), Position::zeros());
    }

    #[test]
    fn stage_fault_injection() {
        let stage = MockStage::new();
        stage.fail_after_moves(1);
        stage.move_rel(Position::new(1.0, 0.0, 0.0)).unwrap();
        assert!(matches!(
            stage.move_rel(Position::new(1.0, 0.0, 0.0)),
            Err(AlignError::DriverFault(_))
        ));
        assert_eq!(stage.position().unwrap(), Position::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn stage_reports_motion_while_moving() {
        let stage = Arc::new(MockStage::new().with_move_duration(Duration::from_millis(200)));
        let mover = {
            let stage = stage.clone();
            std::thread::spawn(move || stage.move_to(Position::new(1.0, 0.0, 0.0), false))
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !stage.is_moving(None).unwrap() {
            assert!(std::time::Instant::now() < deadline, "move never started");
            sleep(Duration::from_millis(1));
        }
        stage.wait_until_stopped(None).unwrap();
        assert_eq!(stage.position().unwrap(), Position::new(1.0, 0.0, 0.0));
        mover.join().unwrap().unwrap();
        assert!(!stage.is_moving(None).unwrap());
    }

    #[test]
    fn stage_rings_for_settle_polls() {
        let stage = MockStage::new().with_settle_polls(2);
        stage.move_rel(Position::new(0.5, 0.0, 0.0)).unwrap();
        assert!(stage.is_settling());
        assert!(stage.is_moving(None).unwrap());
        assert!(stage.is_moving(None).unwrap());
        assert!(!stage.is_moving(None).unwrap());
        assert!(!stage.is_settling());
        assert_eq!(stage.poll_count(), 3);
    }

    #[test]
    fn realtime_exposure_takes_the_integration_time() {
        let stage = Arc::new(MockStage::new());
        let spectrometer = MockSpectrometer::new(stage, |_| 1.0).with_realtime_exposure(true);
        spectrometer.set_integration_time_ms(30.0).unwrap();

        let started = std::time::Instant::now();
        spectrometer.read_raw().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(29));
        assert_eq!(spectrometer.exposure_log(), vec![30.0]);
    }

    #[test]
    fn spectrometer_signal_follows_stage() {
        let stage = Arc::new(MockStage::new());
        let spectrometer = MockSpectrometer::new(stage.clone(), |p| 10.0 + p.x).with_pixels(4);

        let sum: f64 = spectrometer.read_raw().unwrap().iter().sum();
        assert!((sum - 10.0).abs() < 1e-12);

        stage.move_to(Position::new(2.0, 0.0, 0.0), false).unwrap();
        let sum: f64 = spectrometer.read_raw().unwrap().iter().sum();
        assert!((sum - 12.0).abs() < 1e-12);
        assert_eq!(spectrometer.exposure_count(), 2);
    }

    #[test]
    fn spectrometer_returns_queued_failure_first() {
        let stage = Arc::new(MockStage::new());
        let spectrometer = MockSpectrometer::new(stage, |_| 1.0);
        spectrometer.push_failure(AlignError::Transient("frame lost".into()));
        assert!(spectrometer.read_raw().unwrap_err().is_transient());
        assert!(spectrometer.read_raw().is_ok());
    }
}
