//! Estimators for the best stage position from a set of visited points.
//!
//! Every estimator takes the absolute positions that were visited and the
//! merit measured at each one, and returns an absolute position. The
//! [`predict_best`] dispatcher owns the fallback chain:
//!
//! ```text
//! requested method --fail--> centroid --fail--> arithmetic mean
//! ```
//!
//! so the aligner always gets somewhere to move to.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{AlignError, AppResult};
use crate::hardware::Position;

/// Strategy used to turn (position, merit) samples into a predicted best position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMethod {
    /// Merit-weighted centre of mass, after shifting the merits to be non-negative.
    #[default]
    Centroid,
    /// The visited point with the highest merit.
    Maximum,
    /// Per-axis quadratic least squares (no cross terms).
    Parabola,
    /// Gaussian peak with per-axis width, fitted by Levenberg-Marquardt.
    Gaussian,
}

impl FitMethod {
    /// Lower-case name, as accepted by `FromStr` and the config file.
    pub fn as_str(&self) -> &'static str {
        match self {
            FitMethod::Centroid => "centroid",
            FitMethod::Maximum => "maximum",
            FitMethod::Parabola => "parabola",
            FitMethod::Gaussian => "gaussian",
        }
    }
}

impl fmt::Display for FitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FitMethod {
    type Err = AlignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "centroid" => Ok(FitMethod::Centroid),
            "maximum" => Ok(FitMethod::Maximum),
            "parabola" => Ok(FitMethod::Parabola),
            "gaussian" => Ok(FitMethod::Gaussian),
            other => Err(AlignError::invalid(format!("unknown fit method '{}'", other))),
        }
    }
}

/// Which estimator produced a predicted position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EstimateSource {
    /// The named fit, either the requested one or the centroid fallback.
    Fit(FitMethod),
    /// Every fit failed; the arithmetic mean of the visited points was used.
    Mean,
}

/// A predicted best position and where it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    /// Absolute predicted position
    pub position: Position,
    /// Estimator that produced it
    pub source: EstimateSource,
}

/// Predict the best position with `method`, falling back to the centroid and
/// then to the mean of `positions`.
///
/// `offsets` are the displacements that were requested (not the measured
/// positions); axes along which they do not vary are not fitted.
pub fn predict_best(
    method: FitMethod,
    positions: &[Position],
    merits: &[f64],
    offsets: &[Position],
) -> Estimate {
    let attempt = match method {
        FitMethod::Centroid => centroid(positions, merits),
        FitMethod::Maximum => maximum(positions, merits),
        FitMethod::Parabola => parabola(positions, merits, &axes_with_motion(offsets)),
        FitMethod::Gaussian => gaussian(positions, merits, &axes_with_motion(offsets)),
    };

    match attempt {
        Ok(position) => {
            debug!(method = %method, best = ?position, "Fit succeeded");
            return Estimate {
                position,
                source: EstimateSource::Fit(method),
            };
        }
        Err(err) if method != FitMethod::Centroid => {
            warn!(method = %method, error = %err, "Fit failed, falling back to centroid");
            match centroid(positions, merits) {
                Ok(position) => {
                    return Estimate {
                        position,
                        source: EstimateSource::Fit(FitMethod::Centroid),
                    }
                }
                Err(err) => warn!(error = %err, "Centroid failed, using mean position"),
            }
        }
        Err(err) => warn!(error = %err, "Centroid failed, using mean position"),
    }

    Estimate {
        position: mean_position(positions),
        source: EstimateSource::Mean,
    }
}

/// Indices of the axes along which `offsets` vary.
pub fn axes_with_motion(offsets: &[Position]) -> Vec<usize> {
    (0..3)
        .filter(|&axis| {
            offsets
                .iter()
                .any(|offset| offset[axis] != offsets[0][axis])
        })
        .collect()
}

/// Arithmetic mean of `positions` (the origin when empty).
pub fn mean_position(positions: &[Position]) -> Position {
    if positions.is_empty() {
        return Position::zeros();
    }
    positions.iter().sum::<Position>() / positions.len() as f64
}

fn check_samples(positions: &[Position], merits: &[f64]) -> AppResult<()> {
    if positions.is_empty() || positions.len() != merits.len() {
        return Err(AlignError::FitFailure(format!(
            "{} positions for {} merits",
            positions.len(),
            merits.len()
        )));
    }
    if merits.iter().any(|m| !m.is_finite()) || positions.iter().any(|p| !p.iter().all(|v| v.is_finite())) {
        return Err(AlignError::FitFailure("non-finite sample".to_string()));
    }
    Ok(())
}

fn merit_range(merits: &[f64]) -> (f64, f64) {
    merits
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &m| {
            (lo.min(m), hi.max(m))
        })
}

// =============================================================================
// Centroid
// =============================================================================

/// Merit-weighted centre of mass.
///
/// Merits are shifted by `-1.1 * min + 0.1 * max` so the weakest point carries
/// a small positive weight. Fails when the merits carry no contrast.
pub fn centroid(positions: &[Position], merits: &[f64]) -> AppResult<Position> {
    check_samples(positions, merits)?;
    let (min, max) = merit_range(merits);
    let weights: Vec<f64> = merits.iter().map(|m| m - min * 1.1 + max * 0.1).collect();
    let total: f64 = weights.iter().sum();

    let scale = min.abs().max(max.abs());
    if !total.is_finite() || total.abs() <= f64::EPSILON * scale * merits.len() as f64 {
        return Err(AlignError::FitFailure(
            "merits carry no contrast".to_string(),
        ));
    }

    let weighted: Position = positions
        .iter()
        .zip(&weights)
        .map(|(position, weight)| position * *weight)
        .sum();
    Ok(weighted / total)
}

// =============================================================================
// Maximum
// =============================================================================

/// The visited position with the highest merit; ties go to the earliest.
pub fn maximum(positions: &[Position], merits: &[f64]) -> AppResult<Position> {
    check_samples(positions, merits)?;
    let mut best = 0;
    for (i, merit) in merits.iter().enumerate().skip(1) {
        if *merit > merits[best] {
            best = i;
        }
    }
    Ok(positions[best])
}

// =============================================================================
// Parabola
// =============================================================================

/// Least-squares fit of `a + Σ b_k p_k + Σ c_k p_k²` over the moving axes.
///
/// The maximum `-b_k / 2c_k` is only defined for `c_k < 0`; a flat or
/// upward-opening axis is a failure. The prediction is clipped to half the
/// travel observed on each axis, measured from the mean visited position.
pub fn parabola(positions: &[Position], merits: &[f64], axes: &[usize]) -> AppResult<Position> {
    check_samples(positions, merits)?;
    if axes.is_empty() {
        return Err(AlignError::FitFailure("no axis moved".to_string()));
    }

    let mean = mean_position(positions);
    let centred: Vec<Position> = positions.iter().map(|p| p - mean).collect();
    let n = axes.len();
    let columns = 1 + 2 * n;
    if centred.len() < columns {
        return Err(AlignError::FitFailure(format!(
            "{} samples cannot determine {} coefficients",
            centred.len(),
            columns
        )));
    }

    let design = DMatrix::from_fn(centred.len(), columns, |row, column| {
        if column == 0 {
            1.0
        } else if column <= n {
            centred[row][axes[column - 1]]
        } else {
            centred[row][axes[column - 1 - n]].powi(2)
        }
    });
    let svd = design.svd(true, true);
    let largest = svd.singular_values.max();
    let eps = largest * 1e-10;
    if svd.rank(eps) < columns {
        return Err(AlignError::FitFailure("design matrix is rank deficient".to_string()));
    }
    let coefficients = svd
        .solve(&DVector::from_column_slice(merits), eps)
        .map_err(|err| AlignError::FitFailure(err.to_string()))?;

    let mut best = Position::zeros();
    for (i, &axis) in axes.iter().enumerate() {
        let linear = coefficients[(1 + i, 0)];
        let quadratic = coefficients[(1 + n + i, 0)];
        if !(quadratic < 0.0) {
            return Err(AlignError::FitFailure(format!(
                "no maximum along axis {} (curvature {:.3e})",
                axis, quadratic
            )));
        }
        best[axis] = -linear / (2.0 * quadratic);
    }

    for axis in 0..3 {
        let (lo, hi) = centred.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p[axis]), hi.max(p[axis]))
        });
        best[axis] = best[axis].clamp(lo / 2.0, hi / 2.0);
    }
    Ok(best + mean)
}

// =============================================================================
// Gaussian
// =============================================================================

const GAUSSIAN_INITIAL_WIDTH: f64 = 0.3;
const LM_MAX_ITERATIONS: usize = 200;

/// Least-squares fit of `offset + amplitude * exp(-Σ (p_k - c_k)² / 2σ_k²)`
/// over the moving axes, starting from the mean position with `σ = 0.3`.
pub fn gaussian(positions: &[Position], merits: &[f64], axes: &[usize]) -> AppResult<Position> {
    check_samples(positions, merits)?;
    if axes.is_empty() {
        return Err(AlignError::FitFailure("no axis moved".to_string()));
    }
    let (min, max) = merit_range(merits);
    if max - min <= f64::EPSILON * min.abs().max(max.abs()) {
        return Err(AlignError::FitFailure("merit is flat".to_string()));
    }

    let mean = mean_position(positions);
    let samples: Vec<Vec<f64>> = positions
        .iter()
        .map(|p| axes.iter().map(|&axis| p[axis] - mean[axis]).collect())
        .collect();
    let n = axes.len();

    // offset, amplitude, centres, widths
    let mut initial = vec![0.0, max];
    initial.extend(std::iter::repeat(0.0).take(n));
    initial.extend(std::iter::repeat(GAUSSIAN_INITIAL_WIDTH).take(n));
    let params = levenberg_marquardt(&samples, merits, DVector::from_vec(initial))?;

    let amplitude = params[1];
    if !(amplitude > 0.0) {
        return Err(AlignError::FitFailure(format!(
            "fitted amplitude {:.3e} is not a peak",
            amplitude
        )));
    }

    let mut best = mean;
    for (i, &axis) in axes.iter().enumerate() {
        let centre = params[2 + i];
        let width = params[2 + n + i];
        let (lo, hi) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(s[i]), hi.max(s[i]))
        });
        let span = hi - lo;
        if width == 0.0 || centre < lo - span || centre > hi + span {
            return Err(AlignError::FitFailure(format!(
                "fitted centre {:.3} on axis {} is outside the sampled region",
                centre, axis
            )));
        }
        best[axis] += centre;
    }
    Ok(best)
}

fn gaussian_model(sample: &[f64], params: &DVector<f64>) -> (f64, f64) {
    let n = sample.len();
    let exponent: f64 = (0..n)
        .map(|k| {
            let d = sample[k] - params[2 + k];
            let width = params[2 + n + k];
            d * d / (2.0 * width * width)
        })
        .sum();
    let envelope = (-exponent).exp();
    (params[0] + params[1] * envelope, envelope)
}

fn residuals(samples: &[Vec<f64>], merits: &[f64], params: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(
        samples.len(),
        samples
            .iter()
            .zip(merits)
            .map(|(sample, merit)| merit - gaussian_model(sample, params).0),
    )
}

fn jacobian(samples: &[Vec<f64>], params: &DVector<f64>) -> DMatrix<f64> {
    let n = (params.len() - 2) / 2;
    let amplitude = params[1];
    DMatrix::from_fn(samples.len(), params.len(), |row, column| {
        let sample = &samples[row];
        let (_, envelope) = gaussian_model(sample, params);
        match column {
            0 => 1.0,
            1 => envelope,
            c if c < 2 + n => {
                let k = c - 2;
                let width = params[2 + n + k];
                amplitude * envelope * (sample[k] - params[2 + k]) / (width * width)
            }
            c => {
                let k = c - 2 - n;
                let width = params[2 + n + k];
                let d = sample[k] - params[2 + k];
                amplitude * envelope * d * d / (width * width * width)
            }
        }
    })
}

fn levenberg_marquardt(
    samples: &[Vec<f64>],
    merits: &[f64],
    mut params: DVector<f64>,
) -> AppResult<DVector<f64>> {
    let scale = merits.iter().fold(0.0_f64, |acc, m| acc.max(m.abs())).max(f64::MIN_POSITIVE);
    let mut lambda = 1e-3;
    let mut cost = residuals(samples, merits, &params).norm_squared();

    for _ in 0..LM_MAX_ITERATIONS {
        if cost <= (1e-12 * scale).powi(2) {
            return Ok(params);
        }
        let r = residuals(samples, merits, &params);
        let j = jacobian(samples, &params);
        let jt = j.transpose();
        let normal = &jt * &j;
        let gradient = &jt * &r;

        let mut damped = normal.clone();
        for i in 0..damped.nrows() {
            damped[(i, i)] += lambda * normal[(i, i)].max(1e-12);
        }
        let step = match damped.cholesky() {
            Some(cholesky) => cholesky.solve(&gradient),
            None => {
                lambda *= 10.0;
                if lambda > 1e12 {
                    break;
                }
                continue;
            }
        };

        let candidate = &params + &step;
        let candidate_cost = residuals(samples, merits, &candidate).norm_squared();
        if candidate_cost.is_finite() && candidate_cost < cost {
            let improvement = (cost - candidate_cost) / cost.max(f64::MIN_POSITIVE);
            params = candidate;
            cost = candidate_cost;
            lambda = (lambda / 10.0).max(1e-12);
            if improvement < 1e-12 || step.norm() < 1e-12 * (1.0 + params.norm()) {
                return Ok(params);
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e12 {
                // no downhill direction left: we are at a minimum
                return if params.iter().all(|v| v.is_finite()) {
                    Ok(params)
                } else {
                    Err(AlignError::FitFailure("diverged".to_string()))
                };
            }
        }
    }
    Err(AlignError::FitFailure(
        "Levenberg-Marquardt did not converge".to_string(),
    ))
}
