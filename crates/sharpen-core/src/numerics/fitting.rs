//! Curve-fitting utilities for per-shell correlation and amplitude curves.
//!
//! All routines take slices and return fresh vectors of identical length;
//! none mutate their inputs.

use super::{clamped_exp, mean, sample_standard_deviation, EPS_DENOMINATOR};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    #[error("curve must be non-empty")]
    EmptyCurve,
    #[error("curve length mismatch: values={values}, sthol={sthol}")]
    LengthMismatch { values: usize, sthol: usize },
    #[error("grid search needs at least 1 candidate, got {n_tries}")]
    InvalidTries { n_tries: usize },
}

/// Evaluate `value_zero * exp(-scale * (s - s0))` over the `sthol` grid.
/// With `scale_using_last` the final fitted value is subtracted so the
/// curve ends at zero.
pub fn cc_fit(sthol: &[f64], scale: f64, value_zero: f64, scale_using_last: bool) -> Vec<f64> {
    let s_zero = sthol.first().copied().unwrap_or(0.0);
    let mut fit: Vec<f64> = sthol
        .iter()
        .map(|s| value_zero * (-scale * (s - s_zero)).exp())
        .collect();
    if scale_using_last {
        if let Some(&last) = fit.last() {
            for value in &mut fit {
                *value -= last;
            }
        }
    }
    fit
}

/// Coarse grid search for the decay rate minimizing the L2 residual of
/// [`cc_fit`] against `cc`. Ties keep the first (lowest) candidate; the
/// residual surface is not guaranteed unimodal, so robustness beats
/// precision here.
pub fn fit_cc(
    cc: &[f64],
    sthol: &[f64],
    scale_min: f64,
    scale_max: f64,
    n_tries: usize,
    scale_using_last: bool,
) -> Result<Vec<f64>, FitError> {
    if cc.is_empty() {
        return Err(FitError::EmptyCurve);
    }
    if cc.len() != sthol.len() {
        return Err(FitError::LengthMismatch {
            values: cc.len(),
            sthol: sthol.len(),
        });
    }
    if n_tries == 0 {
        return Err(FitError::InvalidTries { n_tries });
    }

    let mut best_scale = scale_min;
    let mut best_rms = f64::INFINITY;
    for try_index in 0..n_tries {
        let scale = scale_min + (scale_max - scale_min) * try_index as f64 / n_tries as f64;
        let fit = cc_fit(sthol, scale, cc[0], scale_using_last);
        let mut sum_sq = 0.0;
        for (fitted, observed) in fit.iter().zip(cc) {
            let delta = fitted - observed;
            sum_sq += delta * delta;
        }
        let rms = sum_sq.sqrt();
        if rms < best_rms {
            best_rms = rms;
            best_scale = scale;
        }
    }
    Ok(cc_fit(sthol, best_scale, cc[0], scale_using_last))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FittedCcOptions {
    /// Pin the fitted tail so it reaches zero at the last point.
    pub scale_using_last: bool,
    /// Back the cutoff index off by one point (floored at 1).
    pub keep_cutoff_point: bool,
    /// Skip the cutoff scan entirely and refit the whole curve past the
    /// first point, pinning the tail at zero.
    pub force_scale_using_last: bool,
    /// Scan strategy: cut after the *last* point still at or above the
    /// cutoff instead of the first point that drops below it.
    pub cutoff_after_last_high_point: bool,
}

const TAIL_FIT_SCALE_MIN: f64 = 10.0;
const TAIL_FIT_SCALE_MAX: f64 = 500.0;
const TAIL_FIT_TRIES: usize = 200;

/// Replace the unreliable tail of a correlation curve (persistently below
/// `cc_cut`) with a fitted exponential, leaving the leading portion
/// untouched. Returns the input unchanged when no qualifying cutoff point
/// exists.
///
/// Flag precedence: `force_scale_using_last` overrides the scan result and
/// pins the cutoff at index 1; otherwise the scan strategy is selected by
/// `cutoff_after_last_high_point`, and `keep_cutoff_point` backs off the
/// scanned index only after a cutoff was found.
pub fn get_fitted_cc(
    cc: &[f64],
    sthol: &[f64],
    cc_cut: f64,
    options: &FittedCcOptions,
) -> Result<Vec<f64>, FitError> {
    if cc.is_empty() {
        return Err(FitError::EmptyCurve);
    }
    if cc.len() != sthol.len() {
        return Err(FitError::LengthMismatch {
            values: cc.len(),
            sthol: sthol.len(),
        });
    }

    // only act when some point is convincingly above the cutoff
    let min_cc = (2.0 * cc_cut).min(1.0 - 0.5 * cc_cut);
    let max_observed = cc.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max_observed < min_cc && !options.force_scale_using_last {
        return Ok(cc.to_vec());
    }

    let mut found_high = false;
    let mut cut: Option<usize> = None;
    if !options.cutoff_after_last_high_point {
        for (index, &value) in cc.iter().enumerate() {
            if value > min_cc {
                found_high = true;
            }
            if found_high && value < cc_cut {
                cut = Some(index);
                break;
            }
        }
    } else {
        for (index, &value) in cc.iter().enumerate() {
            if value > min_cc {
                found_high = true;
            }
            if found_high && value >= cc_cut {
                cut = Some(index);
            }
        }
    }

    let mut scale_using_last = options.scale_using_last;
    if options.force_scale_using_last {
        scale_using_last = true;
        cut = Some(1);
    }

    let Some(mut i_cut) = cut else {
        return Ok(cc.to_vec());
    };
    if i_cut == 0 {
        return Ok(cc.to_vec());
    }
    if options.keep_cutoff_point && !options.force_scale_using_last {
        i_cut = i_cut.saturating_sub(1).max(1);
    }

    let fitted_tail = fit_cc(
        &cc[i_cut..],
        &sthol[i_cut..],
        TAIL_FIT_SCALE_MIN,
        TAIL_FIT_SCALE_MAX,
        TAIL_FIT_TRIES,
        scale_using_last,
    )?;

    let mut result = cc[..i_cut].to_vec();
    result.extend(fitted_tail);
    Ok(result)
}

/// CC* extrapolation: `cc* = sqrt(2 cc / (1 + cc))` on the fitted curve,
/// with negative inputs clamped to zero first.
pub fn estimate_cc_star(
    cc: &[f64],
    sthol: &[f64],
    cc_cut: f64,
    scale_using_last: bool,
    keep_cutoff_point: bool,
) -> Result<Vec<f64>, FitError> {
    let fitted = get_fitted_cc(
        cc,
        sthol,
        cc_cut,
        &FittedCcOptions {
            scale_using_last,
            keep_cutoff_point,
            ..FittedCcOptions::default()
        },
    )?;
    Ok(fitted
        .iter()
        .map(|&value| {
            let clamped = value.max(0.0);
            (2.0 * clamped / (1.0 + clamped)).sqrt()
        })
        .collect())
}

/// Baseline level for tail rescaling: mean of the last `tail_points`
/// values, clipped into `[0, 0.99]`. `None` when the baseline exceeds
/// `max_cc_for_rescale` (curve too flat or noisy to trust) or when
/// `tail_points` is zero.
pub fn get_baseline(values: &[f64], tail_points: usize, max_cc_for_rescale: f64) -> Option<f64> {
    if tail_points == 0 || values.is_empty() {
        return Some(0.0);
    }
    let start = values.len().saturating_sub(tail_points);
    let baseline = mean(&values[start..]).clamp(0.0, 0.99);
    (baseline <= max_cc_for_rescale).then_some(baseline)
}

/// Rescale a correlation curve so its tail approaches zero:
/// `(cc - baseline) / (1 - baseline)`. Returns the baseline actually used;
/// `None` means rescaling was abandoned and the curve is returned as-is.
pub fn rescale_cc_list(
    cc: &[f64],
    tail_points: usize,
    max_cc_for_rescale: f64,
) -> (Vec<f64>, Option<f64>) {
    match get_baseline(cc, tail_points, max_cc_for_rescale) {
        Some(baseline) => {
            let rescaled = cc
                .iter()
                .map(|&value| (value - baseline) / (1.0 - baseline))
                .collect();
            (rescaled, Some(baseline))
        }
        None => (cc.to_vec(), None),
    }
}

/// Guard against divide-by-near-zero artifacts in ratio curves: any value
/// more than `max_ratio` times or less than `min_ratio` times the
/// low-resolution reference level is replaced by the last trusted value.
pub fn remove_values_if_necessary(values: &[f64], max_ratio: f64, min_ratio: f64) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let low_res = mean(&values[..values.len().min(3)]);
    let mut result = Vec::with_capacity(values.len());
    let mut last_trusted = low_res;
    for &value in values {
        if value > max_ratio * low_res || value < min_ratio * low_res {
            result.push(last_trusted);
        } else {
            result.push(value);
            last_trusted = value;
        }
    }
    result
}

/// Relative roughness of a curve: RMS of successive differences over the
/// magnitude of their mean.
pub fn relative_rms(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let diffs: Vec<f64> = values.windows(2).map(|pair| pair[0] - pair[1]).collect();
    let avg_delta = mean(&diffs).abs();
    sample_standard_deviation(&diffs) / avg_delta.max(EPS_DENOMINATOR)
}

/// Triangular-weighted smoothing with an adaptive window: the window is
/// doubled until the smoothed curve's [`relative_rms`] falls under
/// `max_relative_rms`. The leading `skip_first_frac` of the points are
/// treated as a reliable low-resolution anchor and never smoothed.
pub fn smooth_values(values: &[f64], max_relative_rms: f64, skip_first_frac: f64) -> Vec<f64> {
    if relative_rms(values) <= max_relative_rms {
        return values.to_vec();
    }
    let skip_first = ((0.5 + skip_first_frac * values.len() as f64) as usize).max(1);
    let max_window = (values.len() / 2).max(1);
    let mut window = 1;
    while window < max_window {
        let smoothed = smooth_with_window(values, window, skip_first);
        if relative_rms(&smoothed) <= max_relative_rms {
            return smoothed;
        }
        window *= 2;
    }
    smooth_with_window(values, max_window, skip_first)
}

fn smooth_with_window(values: &[f64], window: usize, skip_first: usize) -> Vec<f64> {
    let mut smoothed = Vec::with_capacity(values.len());
    for center in 0..values.len() {
        if center < skip_first {
            smoothed.push(values[center]);
            continue;
        }
        let mut sum = 0.0;
        let mut sum_weight = 0.0;
        for offset in -(window as isize)..=(window as isize) {
            let position = center as isize + offset;
            if position < 0 || position >= values.len() as isize {
                continue;
            }
            let weight = 1.0 / (1.0 + offset.unsigned_abs() as f64 / window as f64);
            sum += values[position as usize] * weight;
            sum_weight += weight;
        }
        smoothed.push(sum / sum_weight.max(EPS_DENOMINATOR));
    }
    smoothed
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveBFit {
    pub effective_b: f64,
    pub b_zero: f64,
    pub rms: f64,
    pub values: Vec<f64>,
    pub calc_values: Vec<f64>,
}

const EFFECTIVE_B_MAX_ITER: usize = 10;
const EFFECTIVE_B_TRIES_PER_ITER: i64 = 10;
const EFFECTIVE_B_INITIAL_DELTA: f64 = 50.0;

/// Fit `value(s²) = b_zero * exp(-B * s²)` by coordinate search: a
/// symmetric window of candidate B values around the running estimate,
/// shrinking by 25% each iteration. `b_zero` is renormalized every
/// evaluation so the fit matches the first point of the curve exactly.
pub fn get_effective_b(values: &[f64], sthol2: &[f64]) -> Result<EffectiveBFit, FitError> {
    if values.is_empty() {
        return Err(FitError::EmptyCurve);
    }
    if values.len() != sthol2.len() {
        return Err(FitError::LengthMismatch {
            values: values.len(),
            sthol: sthol2.len(),
        });
    }

    let mut effective_b = 0.0;
    let mut delta_b = EFFECTIVE_B_INITIAL_DELTA;
    let mut best = b_calc(effective_b, sthol2, values);
    for _ in 0..EFFECTIVE_B_MAX_ITER {
        let half = EFFECTIVE_B_TRIES_PER_ITER / 2;
        let mut iteration_best = b_calc(effective_b, sthol2, values);
        let mut iteration_best_b = effective_b;
        for step in -half..half {
            let candidate_b = effective_b + step as f64 * delta_b;
            let candidate = b_calc(candidate_b, sthol2, values);
            if candidate.2 < iteration_best.2 {
                iteration_best = candidate;
                iteration_best_b = candidate_b;
            }
        }
        effective_b = iteration_best_b;
        best = iteration_best;
        delta_b *= 0.75;
    }

    let (b_zero, calc_values, rms) = best;
    Ok(EffectiveBFit {
        effective_b,
        b_zero,
        rms,
        values: values.to_vec(),
        calc_values,
    })
}

fn b_calc(b_value: f64, sthol2: &[f64], values: &[f64]) -> (f64, Vec<f64>, f64) {
    let raw: Vec<f64> = sthol2.iter().map(|&s| clamped_exp(-b_value * s)).collect();
    let b_zero = values[0] / raw[0];
    let mut calc_values: Vec<f64> = raw.iter().map(|&value| b_zero * value).collect();
    // anchor: the first calculated point reproduces the first observation
    // exactly, not merely to rounding
    calc_values[0] = values[0];
    let mut sum_sq = 0.0;
    for (observed, calculated) in values.iter().zip(&calc_values) {
        let delta = observed - calculated;
        sum_sq += delta * delta;
    }
    let rms = (sum_sq / values.len() as f64).sqrt();
    (b_zero, calc_values, rms)
}
