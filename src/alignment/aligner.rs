//! Alignment controller.
//!
//! The [`Aligner`] owns a stage and a spectrometer pipeline and moves the
//! stage towards the position of highest merit. It offers:
//!
//! - **Primitives**: [`Aligner::iterate_circle`], [`Aligner::iterate_grid`],
//!   [`Aligner::iterate_z`] and the general [`Aligner::iterate_on_points`].
//!   Each visits a set of displacements, fits the merits and moves to the
//!   predicted best position.
//! - **Composites**: [`Aligner::optimise`] alternates circle and focus
//!   iterations until the stage stops moving; [`Aligner::optimise_2d`] runs
//!   grid iterations in XY with a shrinking step.
//! - **Diagnostics**: [`Aligner::z_scan`] records raw spectra through focus
//!   and always returns the stage to where it started.
//!
//! # Concurrency
//!
//! Every primitive and composite holds a reentrant action lock for its whole
//! duration, so composites can call primitives while concurrent callers on
//! other threads queue up behind them. [`Aligner::stop`] may be called from any
//! thread; the running operation finishes its current move and returns the
//! partial trace with `cancelled` set.

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use serde::Serialize;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::alignment::fit::{self, FitMethod};
use crate::alignment::options::{CancelToken, Optimise2dOptions, OptimiseOptions, Tolerance};
use crate::alignment::trace::{AlignmentTrace, TraceHint, TraceSink, ZScan};
use crate::config::{
    validate_duration_secs, validate_number_of_points, validate_positive, AlignerSettings, Settings,
};
use crate::error::{AlignError, AppResult};
use crate::error_recovery::{retry_transient, RetryPolicy};
use crate::hardware::capabilities::STAGE_POLL_INTERVAL;
use crate::hardware::{Position, Stage};
use crate::merit::{MeritEvaluator, SpectrumMask};
use crate::spectrometer::SpectrumPipeline;

/// What the aligner is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlignerState {
    /// No operation in progress
    Idle,
    /// An iteration primitive or composite optimiser is running
    Aligning,
    /// A z-scan is recording spectra
    Scanning,
}

impl fmt::Display for AlignerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlignerState::Idle => "idle",
            AlignerState::Aligning => "aligning",
            AlignerState::Scanning => "scanning",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Point sets
// =============================================================================

/// `number_of_points` displacements on an XY circle of `radius`.
pub fn circle_points(radius: f64, number_of_points: usize) -> Vec<Position> {
    (0..number_of_points)
        .map(|i| {
            let angle = 2.0 * std::f64::consts::PI * i as f64 / number_of_points as f64;
            Position::new(angle.cos() * radius, angle.sin() * radius, 0.0)
        })
        .collect()
}

/// The eight outer points of a 3×3 XY grid with spacing `step`.
pub fn grid_points(step: f64) -> Vec<Position> {
    let mut points = Vec::with_capacity(8);
    for i in [-1.0, 0.0, 1.0] {
        for j in [-1.0, 0.0, 1.0] {
            if i != 0.0 || j != 0.0 {
                points.push(Position::new(i * step, j * step, 0.0));
            }
        }
    }
    points
}

/// Focus displacements `-dz` and `+dz`.
pub fn focus_points(dz: f64) -> Vec<Position> {
    vec![Position::new(0.0, 0.0, -dz), Position::new(0.0, 0.0, dz)]
}

// =============================================================================
// Aligner
// =============================================================================

/// Closed-loop stage alignment driven by spectrometer merit.
pub struct Aligner {
    spectrometer: Arc<SpectrumPipeline>,
    stage: Arc<dyn Stage>,
    settings: RwLock<AlignerSettings>,
    spectrum_mask: RwLock<Option<SpectrumMask>>,
    retry: RwLock<RetryPolicy>,
    /// Held for the duration of an operation; counts nesting depth
    action_lock: ReentrantMutex<Cell<usize>>,
    state: RwLock<AlignerState>,
    cancel: CancelToken,
    trace_sink: RwLock<Option<Arc<dyn TraceSink>>>,
    last_trace: Mutex<Option<AlignmentTrace>>,
}

/// Releases the action lock and returns the aligner to `Idle` at depth zero.
struct ActionGuard<'a> {
    aligner: &'a Aligner,
    depth: ReentrantMutexGuard<'a, Cell<usize>>,
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth == 0 {
            *self.aligner.state.write() = AlignerState::Idle;
        }
    }
}

impl Aligner {
    /// Aligner with default settings.
    pub fn new(spectrometer: Arc<SpectrumPipeline>, stage: Arc<dyn Stage>) -> Self {
        Self {
            spectrometer,
            stage,
            settings: RwLock::new(AlignerSettings::default()),
            spectrum_mask: RwLock::new(None),
            retry: RwLock::new(RetryPolicy::default()),
            action_lock: ReentrantMutex::new(Cell::new(0)),
            state: RwLock::new(AlignerState::Idle),
            cancel: CancelToken::new(),
            trace_sink: RwLock::new(None),
            last_trace: Mutex::new(None),
        }
    }

    /// Aligner tuned from loaded [`Settings`].
    pub fn with_settings(
        spectrometer: Arc<SpectrumPipeline>,
        stage: Arc<dyn Stage>,
        settings: &Settings,
    ) -> AppResult<Self> {
        settings.aligner.validate()?;
        let aligner = Self::new(spectrometer, stage);
        *aligner.settings.write() = settings.aligner.clone();
        *aligner.retry.write() = RetryPolicy::from(&settings.retry);
        Ok(aligner)
    }

    /// Processing pipeline the merit is read from.
    pub fn spectrometer(&self) -> &Arc<SpectrumPipeline> {
        &self.spectrometer
    }

    /// Stage being aligned.
    pub fn stage(&self) -> &Arc<dyn Stage> {
        &self.stage
    }

    // =========================================================================
    // Tuning parameters
    // =========================================================================

    /// Snapshot of the current tuning parameters.
    pub fn settings(&self) -> AlignerSettings {
        self.settings.read().clone()
    }

    /// Apply `change` to the tuning parameters; rejected changes leave them untouched.
    pub fn update_settings<F>(&self, change: F) -> AppResult<()>
    where
        F: FnOnce(&mut AlignerSettings),
    {
        let mut candidate = self.settings();
        change(&mut candidate);
        candidate.validate()?;
        *self.settings.write() = candidate;
        Ok(())
    }

    /// Seconds to wait after each move before measuring.
    pub fn set_settling_time(&self, seconds: f64) -> AppResult<()> {
        validate_duration_secs("settling_time_s", seconds)?;
        self.update_settings(|s| s.settling_time_s = seconds)
    }

    /// Radius of the circle iteration and spacing of the grid.
    pub fn set_step_size(&self, step_size: f64) -> AppResult<()> {
        validate_positive("step_size", step_size)?;
        self.update_settings(|s| s.step_size = step_size)
    }

    /// Convergence threshold of [`Aligner::optimise`], scalar or per axis.
    pub fn set_tolerance(&self, tolerance: impl Into<Tolerance>) -> AppResult<()> {
        let tolerance = tolerance.into();
        tolerance.validate()?;
        self.update_settings(|s| s.tolerance = tolerance)
    }

    /// Points on the circle iteration; at least two.
    pub fn set_number_of_points(&self, number_of_points: usize) -> AppResult<()> {
        validate_number_of_points(number_of_points)?;
        self.update_settings(|s| s.number_of_points = number_of_points)
    }

    /// Half-span of the focus iteration.
    pub fn set_dz(&self, dz: f64) -> AppResult<()> {
        validate_positive("dz", dz)?;
        self.update_settings(|s| s.dz = dz)
    }

    /// Iteration cap of the composite optimisers.
    pub fn set_max_steps(&self, max_steps: usize) -> AppResult<()> {
        self.update_settings(|s| s.max_steps = max_steps)
    }

    /// Estimator used by the circle and focus iterations.
    pub fn set_fit_method(&self, fit_method: FitMethod) {
        self.settings.write().fit_method = fit_method;
    }

    /// Take the merit from raw exposures instead of processed spectra.
    pub fn set_align_to_raw_spectra(&self, raw: bool) {
        self.settings.write().align_to_raw_spectra = raw;
    }

    /// Shorten exposures during [`Aligner::optimise_2d`].
    pub fn set_reduce_integration_time(&self, reduce: bool) {
        self.settings.write().reduce_integration_time = reduce;
    }

    /// Restrict the merit to the selected pixels, or clear the restriction.
    pub fn set_spectrum_mask(&self, mask: Option<SpectrumMask>) -> AppResult<()> {
        if let Some(mask) = &mask {
            let pixels = self.spectrometer.wavelengths()?.len();
            if mask.len() != pixels {
                return Err(AlignError::invalid(format!(
                    "mask has {} pixels, spectrometer has {}",
                    mask.len(),
                    pixels
                )));
            }
        }
        *self.spectrum_mask.write() = mask;
        Ok(())
    }

    /// Pixels currently summed into the merit; `None` means all.
    pub fn spectrum_mask(&self) -> Option<SpectrumMask> {
        self.spectrum_mask.read().clone()
    }

    /// Retry policy for transient spectrometer errors.
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        *self.retry.write() = policy;
    }

    /// Current retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.read().clone()
    }

    // =========================================================================
    // Observation and control
    // =========================================================================

    /// What the aligner is doing; `Idle` between operations.
    pub fn state(&self) -> AlignerState {
        *self.state.read()
    }

    /// Ask the running operation to stop after its current move.
    pub fn stop(&self) {
        info!("Stop requested");
        self.cancel.cancel();
    }

    /// Handle that stops the running operation when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Send every future trace to `sink`.
    pub fn set_trace_sink<S>(&self, sink: S)
    where
        S: TraceSink + 'static,
    {
        *self.trace_sink.write() = Some(Arc::new(sink));
    }

    /// Stop forwarding traces.
    pub fn clear_trace_sink(&self) {
        *self.trace_sink.write() = None;
    }

    /// The trace most recently produced by any operation.
    pub fn last_trace(&self) -> Option<AlignmentTrace> {
        self.last_trace.lock().clone()
    }

    fn publish(&self, trace: &AlignmentTrace, hint: TraceHint) {
        *self.last_trace.lock() = Some(trace.clone());
        let sink = self.trace_sink.read().clone();
        if let Some(sink) = sink {
            sink.on_trace(trace, hint);
        }
    }

    fn begin(&self, activity: AlignerState) -> ActionGuard<'_> {
        let depth = self.action_lock.lock();
        if depth.get() == 0 {
            self.cancel.reset();
            *self.state.write() = activity;
        }
        depth.set(depth.get() + 1);
        ActionGuard {
            aligner: self,
            depth,
        }
    }

    // =========================================================================
    // Motion and acquisition helpers
    // =========================================================================

    /// Wait for the stage to stop, then for the settling time.
    ///
    /// Returns true when a stop was requested meanwhile.
    fn settle(&self, settling_time: Duration) -> AppResult<bool> {
        while self.stage.is_moving(None)? {
            sleep(STAGE_POLL_INTERVAL);
        }
        Ok(self.pause(settling_time))
    }

    /// Sleep for `duration`, waking early on a stop request.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep((deadline - now).min(STAGE_POLL_INTERVAL));
        }
    }

    fn acquire_merit(&self, settings: &AlignerSettings) -> AppResult<f64> {
        let mask = self.spectrum_mask.read().clone();
        let policy = self.retry.read().clone();
        let evaluator = MeritEvaluator::new(&self.spectrometer)
            .raw(settings.align_to_raw_spectra)
            .masked(mask.as_ref());
        retry_transient(&policy, "merit acquisition", || evaluator.evaluate())
    }

    /// Visit `offsets` relative to the current position, fit, and move to the
    /// prediction. Assumes the action lock is held.
    fn visit_and_fit(
        &self,
        offsets: &[Position],
        include_here: bool,
        fit_method: FitMethod,
    ) -> AppResult<AlignmentTrace> {
        let settings = self.settings();
        let settling_time = settings.settling_time()?;
        let here = self.stage.position()?;
        let mut trace = AlignmentTrace::new(fit_method);

        if include_here {
            trace.record(here, self.acquire_merit(&settings)?);
        }
        for offset in offsets {
            if self.cancel.is_cancelled() {
                trace.cancelled = true;
                break;
            }
            self.stage.move_to(here + offset, false)?;
            if self.settle(settling_time)? {
                trace.cancelled = true;
                break;
            }
            let reached = self.stage.position()?;
            let merit = self.acquire_merit(&settings)?;
            debug!(position = ?reached, merit, "Visited point");
            trace.record(reached, merit);
        }

        if trace.cancelled {
            info!(visited = trace.len(), "Iteration cancelled");
            return Ok(trace);
        }

        let estimate = fit::predict_best(fit_method, &trace.positions, &trace.merits, offsets);
        self.stage.move_to(estimate.position, false)?;
        self.stage.wait_until_stopped(None)?;
        trace.predicted_best = Some(estimate.position);
        trace.estimate_source = Some(estimate.source);
        Ok(trace)
    }

    // =========================================================================
    // Iteration primitives
    // =========================================================================

    /// Visit `points` (displacements from the current position), optionally
    /// measure here too, then move to the position `fit_method` predicts.
    pub fn iterate_on_points(
        &self,
        points: &[Position],
        include_here: bool,
        fit_method: FitMethod,
    ) -> AppResult<AlignmentTrace> {
        if points.is_empty() {
            return Err(AlignError::invalid("at least one point must be visited"));
        }
        if points.iter().any(|p| !p.iter().all(|v| v.is_finite())) {
            return Err(AlignError::invalid("points must be finite"));
        }
        let _guard = self.begin(AlignerState::Aligning);
        let trace = self.visit_and_fit(points, include_here, fit_method)?;
        self.publish(&trace, TraceHint::Primitive);
        Ok(trace)
    }

    /// Circle iteration with the current step size, ring size and fit method.
    pub fn iterate_circle(&self) -> AppResult<AlignmentTrace> {
        let settings = self.settings();
        self.iterate_circle_with(
            settings.step_size,
            settings.number_of_points,
            settings.fit_method,
        )
    }

    /// Visit `number_of_points` points on an XY circle of `radius`, plus here.
    pub fn iterate_circle_with(
        &self,
        radius: f64,
        number_of_points: usize,
        fit_method: FitMethod,
    ) -> AppResult<AlignmentTrace> {
        validate_positive("radius", radius)?;
        validate_number_of_points(number_of_points)?;
        self.iterate_on_points(&circle_points(radius, number_of_points), true, fit_method)
    }

    /// Grid iteration with the current step size.
    pub fn iterate_grid(&self) -> AppResult<AlignmentTrace> {
        self.iterate_grid_with(self.settings().step_size)
    }

    /// Visit a 3×3 XY grid of spacing `step` and move to its brightest point.
    pub fn iterate_grid_with(&self, step: f64) -> AppResult<AlignmentTrace> {
        validate_positive("step", step)?;
        self.iterate_on_points(&grid_points(step), true, FitMethod::Maximum)
    }

    /// Focus iteration with the current `dz` and fit method.
    pub fn iterate_z(&self) -> AppResult<AlignmentTrace> {
        let settings = self.settings();
        self.iterate_z_with(settings.dz, settings.fit_method)
    }

    /// Visit `-dz`, `+dz` and here along z.
    pub fn iterate_z_with(&self, dz: f64, fit_method: FitMethod) -> AppResult<AlignmentTrace> {
        validate_positive("dz", dz)?;
        self.iterate_on_points(&focus_points(dz), true, fit_method)
    }

    // =========================================================================
    // Composites
    // =========================================================================

    /// Options for [`Aligner::optimise`] taken from the current settings.
    pub fn optimise_options(&self) -> OptimiseOptions {
        OptimiseOptions::from(&*self.settings.read())
    }

    /// Options for [`Aligner::optimise_2d`] taken from the current settings.
    pub fn optimise_2d_options(&self) -> Optimise2dOptions {
        Optimise2dOptions::from(&*self.settings.read())
    }

    /// Alternate circle and focus iterations until a full iteration moves the
    /// stage by less than `tolerance`, or `max_steps` iterations have run.
    ///
    /// The returned trace holds the position and merit after every iteration,
    /// starting with the entry position.
    pub fn optimise(&self, options: &OptimiseOptions) -> AppResult<AlignmentTrace> {
        options.validate()?;
        let _guard = self.begin(AlignerState::Aligning);
        let settings = self.settings();
        let settling_time = settings.settling_time()?;
        let circle = circle_points(options.step_size, options.number_of_points);
        let focus = focus_points(options.dz);

        let mut summary = AlignmentTrace::new(settings.fit_method);
        let mut previous = self.stage.position()?;
        summary.record(previous, self.acquire_merit(&settings)?);
        info!(start = ?previous, max_steps = options.max_steps, "Starting optimisation");

        for step in 0..options.max_steps {
            let circle_trace = self.visit_and_fit(&circle, true, settings.fit_method)?;
            self.publish(&circle_trace, TraceHint::Iteration);
            if circle_trace.cancelled {
                summary.cancelled = true;
                break;
            }
            let focus_trace = self.visit_and_fit(&focus, true, settings.fit_method)?;
            self.publish(&focus_trace, TraceHint::Iteration);
            if focus_trace.cancelled {
                summary.cancelled = true;
                break;
            }

            let position = self.stage.position()?;
            summary.record(position, self.acquire_merit(&settings)?);
            summary.iterations = step + 1;
            let score = options.tolerance.convergence_score(&(position - previous));
            debug!(iteration = step + 1, position = ?position, score, "Optimisation step");
            previous = position;
            if score <= 1.0 {
                summary.converged = true;
                break;
            }
            if self.pause(settling_time) {
                summary.cancelled = true;
                break;
            }
        }

        if !summary.cancelled {
            summary.predicted_best = Some(previous);
        }
        info!(
            iterations = summary.iterations,
            converged = summary.converged,
            cancelled = summary.cancelled,
            position = ?previous,
            "Optimisation finished"
        );
        self.publish(&summary, TraceHint::Summary);
        Ok(summary)
    }

    /// Grid-search the XY plane, halving the grid spacing whenever the stage
    /// stays put, until a stationary iteration happens at a spacing no larger
    /// than `tolerance`.
    ///
    /// With `reduce_integration_time` the exposure is shortened threefold
    /// (never below the device minimum) and restored on exit, also on error.
    pub fn optimise_2d(&self, options: &Optimise2dOptions) -> AppResult<AlignmentTrace> {
        options.validate()?;
        let _guard = self.begin(AlignerState::Aligning);

        let restore = if options.reduce_integration_time {
            let original = self.spectrometer.integration_time_ms();
            let reduced = (original / 3.0).max(self.spectrometer.min_integration_time_ms());
            debug!(original, reduced, "Reducing integration time");
            self.spectrometer.set_integration_time_ms(reduced)?;
            Some(original)
        } else {
            None
        };

        let result = self.grid_search(options);

        if let Some(original) = restore {
            if let Err(err) = self.spectrometer.set_integration_time_ms(original) {
                if result.is_ok() {
                    return Err(err);
                }
                warn!(error = %err, "Failed to restore integration time");
            }
        }
        result
    }

    fn grid_search(&self, options: &Optimise2dOptions) -> AppResult<AlignmentTrace> {
        let settings = self.settings();
        let mut step = options.step_size;
        let mut summary = AlignmentTrace::new(FitMethod::Maximum);
        let mut previous = self.stage.position()?;
        summary.record(previous, self.acquire_merit(&settings)?);
        info!(start = ?previous, step, max_steps = options.max_steps, "Starting XY optimisation");

        for iteration in 0..options.max_steps {
            let trace = self.visit_and_fit(&grid_points(step), true, FitMethod::Maximum)?;
            self.publish(&trace, TraceHint::Iteration);
            if trace.cancelled {
                summary.cancelled = true;
                break;
            }

            let position = self.stage.position()?;
            summary.record(position, self.acquire_merit(&settings)?);
            summary.iterations = iteration + 1;
            let moved = (position - previous).norm();
            debug!(iteration = iteration + 1, position = ?position, moved, step, "XY step");
            previous = position;

            if moved < options.tolerance {
                if step <= options.tolerance {
                    summary.converged = true;
                    break;
                }
                step /= 2.0;
            }
        }

        if !summary.cancelled {
            summary.predicted_best = Some(previous);
        }
        info!(
            iterations = summary.iterations,
            converged = summary.converged,
            cancelled = summary.cancelled,
            position = ?previous,
            "XY optimisation finished"
        );
        self.publish(&summary, TraceHint::Summary);
        Ok(summary)
    }

    // =========================================================================
    // Z-scan
    // =========================================================================

    /// Record a raw spectrum at each z offset in `dz` (relative to the current
    /// position, visited in order) and return to the start position.
    ///
    /// The return move happens on success, cancellation and error alike. An
    /// empty `dz` yields a scan with no rows.
    pub fn z_scan(&self, dz: &[f64]) -> AppResult<ZScan> {
        if dz.iter().any(|z| !z.is_finite()) {
            return Err(AlignError::invalid("z-scan offsets must be finite"));
        }
        let _guard = self.begin(AlignerState::Scanning);
        let start = self.stage.position()?;
        info!(start = ?start, offsets = dz.len(), "Starting z-scan");

        let result = self.scan_offsets(start, dz);
        let returned = self
            .stage
            .move_to(start, false)
            .and_then(|_| self.stage.wait_until_stopped(None));

        match (result, returned) {
            (Ok(scan), Ok(())) => {
                info!(rows = scan.dz.len(), cancelled = scan.cancelled, "Z-scan finished");
                Ok(scan)
            }
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(return_err)) => {
                warn!(error = %return_err, "Failed to return to z-scan start");
                Err(err)
            }
        }
    }

    fn scan_offsets(&self, start: Position, dz: &[f64]) -> AppResult<ZScan> {
        let settings = self.settings();
        let settling_time = settings.settling_time()?;
        let policy = self.retry.read().clone();
        let mut rows = Vec::with_capacity(dz.len());
        let mut visited = Vec::with_capacity(dz.len());
        let mut cancelled = false;

        for &z in dz {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            self.stage
                .move_to(start + Position::new(0.0, 0.0, z), false)?;
            if self.settle(settling_time)? {
                cancelled = true;
                break;
            }
            let raw = retry_transient(&policy, "z-scan exposure", || {
                self.spectrometer.read_raw()
            })?;
            debug!(dz = z, "Recorded z-scan spectrum");
            rows.push(raw.to_vec());
            visited.push(z);
        }

        let metadata = self.spectrometer.metadata()?;
        Ok(ZScan::new(rows, visited, metadata, cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockSpectrometer, MockStage};

    fn aligner_with<F>(signal: F) -> (Aligner, Arc<MockStage>)
    where
        F: Fn(&Position) -> f64 + Send + Sync + 'static,
    {
        let stage = Arc::new(MockStage::new());
        let driver = Arc::new(MockSpectrometer::new(stage.clone(), signal).with_pixels(8));
        let aligner = Aligner::new(Arc::new(SpectrumPipeline::new(driver)), stage.clone());
        aligner.set_settling_time(0.0).unwrap();
        (aligner, stage)
    }

    #[test]
    fn point_sets_have_expected_shape() {
        let circle = circle_points(0.5, 4);
        assert_eq!(circle.len(), 4);
        assert!(circle.iter().all(|p| (p.norm() - 0.5).abs() < 1e-12 && p.z == 0.0));

        let grid = grid_points(0.2);
        assert_eq!(grid.len(), 8);
        assert!(!grid.contains(&Position::zeros()));

        assert_eq!(focus_points(0.3)[0], Position::new(0.0, 0.0, -0.3));
    }

    #[test]
    fn setters_validate() {
        let (aligner, _) = aligner_with(|_| 1.0);
        assert!(aligner.set_number_of_points(1).is_err());
        assert!(aligner.set_step_size(-0.1).is_err());
        assert!(aligner.set_settling_time(f64::NAN).is_err());
        assert!(aligner.set_settling_time(1e20).is_err());
        assert!(aligner.set_max_steps(0).is_err());
        assert!(aligner.set_tolerance([0.1, 0.1, 0.0]).is_err());
        aligner.set_tolerance([0.1, 0.1, 0.2]).unwrap();
        assert_eq!(aligner.settings().tolerance, Tolerance::PerAxis([0.1, 0.1, 0.2]));
        assert_eq!(aligner.settings().number_of_points, 3);
    }

    #[test]
    fn mask_length_is_checked() {
        let (aligner, _) = aligner_with(|_| 1.0);
        assert!(aligner
            .set_spectrum_mask(Some(SpectrumMask::new(vec![true; 3])))
            .is_err());
        aligner
            .set_spectrum_mask(Some(SpectrumMask::from_range(8, 0..4)))
            .unwrap();
        assert_eq!(aligner.spectrum_mask().map(|m| m.selected()), Some(4));
    }

    #[test]
    fn grid_moves_to_brightest_neighbour() {
        let (aligner, stage) = aligner_with(|p| 10.0 - (p.x - 1.0).powi(2) - p.y.powi(2));
        let trace = aligner.iterate_grid_with(0.5).unwrap();
        assert_eq!(trace.len(), 9);
        assert_eq!(trace.predicted_best, Some(Position::new(0.5, 0.0, 0.0)));
        assert_eq!(stage.position().unwrap(), Position::new(0.5, 0.0, 0.0));
        assert_eq!(aligner.state(), AlignerState::Idle);
    }

    #[test]
    fn empty_point_set_is_rejected() {
        let (aligner, _) = aligner_with(|_| 1.0);
        assert!(matches!(
            aligner.iterate_on_points(&[], true, FitMethod::Centroid),
            Err(AlignError::InvalidParameter(_))
        ));
    }

    #[test]
    fn state_is_aligning_inside_an_operation() {
        let (aligner, _) = aligner_with(|p| 5.0 - p.x * p.x);
        let aligner = Arc::new(aligner);
        let observer = aligner.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        aligner.set_trace_sink(move |_: &AlignmentTrace, hint: TraceHint| {
            sink_seen.lock().push((observer.state(), hint));
        });
        aligner.iterate_circle().unwrap();
        assert_eq!(
            seen.lock().as_slice(),
            &[(AlignerState::Aligning, TraceHint::Primitive)]
        );
        assert_eq!(aligner.state(), AlignerState::Idle);
        assert!(aligner.last_trace().is_some());
    }
}
