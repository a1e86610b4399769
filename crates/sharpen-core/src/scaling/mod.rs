//! Per-shell amplitude scale factors and quasi-normalization.

use tracing::debug;

use crate::binning::{BinningError, ResolutionBinner};
use crate::domain::MapCoefficients;
use crate::numerics::{clamped_exp, EPS_DENOMINATOR};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScalingError {
    #[error("per-shell curve length mismatch: {field} has {actual}, expected {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("scale factor calculation needs at least one shell")]
    EmptyCurves,
    #[error(transparent)]
    Binning(#[from] BinningError),
    #[error(transparent)]
    Domain(#[from] crate::domain::DomainError),
}

/// Per-shell curves feeding the target-scale-factor formulas. All slices
/// run in binner order (low to high resolution) and must share one length.
#[derive(Debug, Clone, Copy)]
pub struct TargetScaleInputs<'a> {
    pub cc_list: &'a [f64],
    pub ratio_list: &'a [f64],
    pub sthol2_list: &'a [f64],
    pub rms_fo_list: &'a [f64],
    pub populations: &'a [usize],
    pub is_model_based: bool,
    pub b_eff: Option<f64>,
    pub pseudo_likelihood: bool,
    pub max_possible_cc: f64,
    pub equalize_power: bool,
    pub skip_scale_factor: bool,
    pub maximum_scale_factor: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetScaleOutcome {
    pub target_scale_factors: Vec<f64>,
    /// Mean corrected CC weighted by `n · rms_fo · scale`, a single
    /// diagnostic used by the b_eff optimization.
    pub weighted_cc: f64,
}

const MIN_CORRECTED_CC: f64 = 1.0e-5;

/// Compute one amplitude scale factor per shell from the fitted CC curve,
/// the reference/observed amplitude ratio, and the error model.
pub fn target_scale_factors(inputs: &TargetScaleInputs<'_>) -> Result<TargetScaleOutcome, ScalingError> {
    let n_shells = inputs.cc_list.len();
    if n_shells == 0 {
        return Err(ScalingError::EmptyCurves);
    }
    check_length("ratio_list", inputs.ratio_list.len(), n_shells)?;
    check_length("sthol2_list", inputs.sthol2_list.len(), n_shells)?;
    check_length("rms_fo_list", inputs.rms_fo_list.len(), n_shells)?;
    check_length("populations", inputs.populations.len(), n_shells)?;

    let mut scales = Vec::with_capacity(n_shells);
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    for shell in 0..n_shells {
        let cc = inputs.cc_list[shell];
        let ratio = inputs.ratio_list[shell];
        let sthol2 = inputs.sthol2_list[shell];
        let corrected_cc = (cc / inputs.max_possible_cc.max(EPS_DENOMINATOR))
            .clamp(MIN_CORRECTED_CC, 1.0);

        let scale = if !inputs.is_model_based {
            ratio * corrected_cc
        } else if let Some(b_eff) = inputs.b_eff {
            if inputs.pseudo_likelihood {
                cc / (1.0 - cc * cc).max(0.001)
            } else {
                ratio * (corrected_cc * clamped_exp(sthol2 * b_eff)).min(1.0)
            }
        } else {
            ratio * corrected_cc
        };
        let scale = scale.max(0.0);
        let weight = inputs.populations[shell] as f64 * inputs.rms_fo_list[shell] * scale;
        weighted_sum += weight * corrected_cc;
        weight_sum += weight;
        scales.push(scale);
    }
    let weighted_cc = weighted_sum / weight_sum.max(EPS_DENOMINATOR);

    if !inputs.pseudo_likelihood && !inputs.skip_scale_factor {
        let power_rms = power_weighted_rms(&scales, inputs.populations, inputs.rms_fo_list);
        let norm = if inputs.equalize_power && power_rms > EPS_DENOMINATOR {
            power_rms
        } else {
            // degenerate power curves fall back to the peak
            scales.iter().copied().fold(0.0, f64::max)
        };
        if norm > 0.0 {
            for scale in &mut scales {
                *scale /= norm;
            }
        }
    }

    if let Some(ceiling) = inputs.maximum_scale_factor {
        for scale in &mut scales {
            if *scale > ceiling {
                *scale = ceiling;
            }
        }
    }

    debug!(n_shells, weighted_cc, "computed target scale factors");
    Ok(TargetScaleOutcome {
        target_scale_factors: scales,
        weighted_cc,
    })
}

fn check_length(field: &'static str, actual: usize, expected: usize) -> Result<(), ScalingError> {
    if actual != expected {
        return Err(ScalingError::LengthMismatch {
            field,
            expected,
            actual,
        });
    }
    Ok(())
}

fn power_weighted_rms(scales: &[f64], populations: &[usize], rms_fo_list: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for shell in 0..scales.len() {
        let weight = populations[shell] as f64 * rms_fo_list[shell] * rms_fo_list[shell];
        sum += weight * scales[shell] * scales[shell];
        weight_sum += weight;
    }
    (sum / weight_sum.max(EPS_DENOMINATOR)).sqrt()
}

const B_EFF_CANDIDATES: usize = 20;

/// Grid search over candidate error-model B values (`0.1·i·b_eff` for
/// `i = 1..=20`) keeping the candidate whose scale curve maximizes the
/// weighted CC diagnostic. Returns the winning B value and its outcome.
pub fn optimize_b_eff(
    inputs: &TargetScaleInputs<'_>,
    b_eff: f64,
) -> Result<(f64, TargetScaleOutcome), ScalingError> {
    let mut best_b = b_eff;
    let mut best = target_scale_factors(inputs)?;
    for step in 1..=B_EFF_CANDIDATES {
        let candidate_b = 0.1 * step as f64 * b_eff;
        let candidate_inputs = TargetScaleInputs {
            b_eff: Some(candidate_b),
            ..*inputs
        };
        let candidate = target_scale_factors(&candidate_inputs)?;
        if candidate.weighted_cc > best.weighted_cc {
            best = candidate;
            best_b = candidate_b;
        }
    }
    debug!(best_b_eff = best_b, weighted_cc = best.weighted_cc, "optimized b_eff");
    Ok((best_b, best))
}

/// Divide amplitudes by the square root of the smoothed per-shell mean
/// amplitude (mean squared amplitude under pseudo-likelihood), turning them
/// into quasi-normalized E-like values. Negative normalizations are flipped
/// in sign, then anything below `set_to_minimum` is floored there.
pub fn quasi_normalize_amplitudes(
    coefficients: &MapCoefficients,
    binner: &ResolutionBinner,
    pseudo_likelihood: bool,
    set_to_minimum: f64,
) -> Result<MapCoefficients, ScalingError> {
    let amplitudes = coefficients.amplitudes();
    let mut per_shell = Vec::with_capacity(binner.n_bins());
    for shell in binner.shells() {
        let mut sum = 0.0;
        for &member in shell.members() {
            let amplitude = amplitudes[member];
            sum += if pseudo_likelihood {
                amplitude * amplitude
            } else {
                amplitude
            };
        }
        per_shell.push(sum / shell.population() as f64);
    }

    let mut normalizations = binner.interpolate(&per_shell, coefficients.d_spacings(), 1.0)?;
    clamp_normalizations(&mut normalizations, set_to_minimum);

    let normalized: Vec<f64> = amplitudes
        .iter()
        .zip(&normalizations)
        .map(|(amplitude, norm)| amplitude / norm.sqrt())
        .collect();
    Ok(coefficients.with_amplitudes(normalized)?)
}

fn clamp_normalizations(normalizations: &mut [f64], set_to_minimum: f64) {
    for value in normalizations {
        if *value < 0.0 {
            *value = -*value;
        }
        if *value < set_to_minimum {
            *value = set_to_minimum;
        }
    }
}
