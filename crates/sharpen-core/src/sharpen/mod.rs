//! Application of per-shell scale curves and piecewise-linear B-factor
//! models to map coefficients.

use tracing::{debug, info};

use crate::binning::{BinningError, ResolutionBinner};
use crate::domain::{BFactorModel, DomainError, MapCoefficients, MapSynthesis, RealSpaceMap};
use crate::numerics::{clamped_exp, EPS_DENOMINATOR};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SharpenError {
    #[error("resolution must be finite and > 0, got {value}")]
    InvalidResolution { value: f64 },
    #[error("d_min_ratio must be finite and in (0, 1], got {value}")]
    InvalidDMinRatio { value: f64 },
    #[error(transparent)]
    Binning(#[from] BinningError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Scaled coefficients together with the Wilson-slope B before and after.
#[derive(Debug, Clone)]
pub struct ScaledCoefficients {
    pub coefficients: MapCoefficients,
    pub starting_b_iso: Option<f64>,
    pub final_b_iso: Option<f64>,
}

/// Interpolate the per-shell scale curve onto every reflection and apply
/// it to the amplitudes, keeping phases. An empty curve means no scaling
/// information; the coefficients pass through unchanged.
pub fn apply_target_scale_factors(
    coefficients: &MapCoefficients,
    binner: &ResolutionBinner,
    target_scale_factors: &[f64],
) -> Result<ScaledCoefficients, SharpenError> {
    let starting_b_iso = wilson_b_iso(coefficients, binner);
    if target_scale_factors.is_empty() {
        info!("no scaling applied, empty target scale curve");
        return Ok(ScaledCoefficients {
            coefficients: coefficients.clone(),
            starting_b_iso,
            final_b_iso: starting_b_iso,
        });
    }

    let scales = binner.interpolate(target_scale_factors, coefficients.d_spacings(), 1.0)?;
    let scaled = coefficients.scaled_by(&scales)?;
    let final_b_iso = wilson_b_iso(&scaled, binner);
    debug!(?starting_b_iso, ?final_b_iso, "target scale factors applied");
    Ok(ScaledCoefficients {
        coefficients: scaled,
        starting_b_iso,
        final_b_iso,
    })
}

/// Wilson-slope estimate of the overall B on amplitudes: least-squares
/// slope of `ln(mean F²)` per shell against `sin(θ)/λ)²`, with amplitude
/// convention `F ∝ exp(-B·sthol2)` so `B = -slope/2`. `None` when fewer
/// than two shells carry signal.
pub fn wilson_b_iso(coefficients: &MapCoefficients, binner: &ResolutionBinner) -> Option<f64> {
    let amplitudes = coefficients.amplitudes();
    let mut points = Vec::with_capacity(binner.n_bins());
    for shell in binner.shells() {
        let mut sum = 0.0;
        for &member in shell.members() {
            sum += amplitudes[member] * amplitudes[member];
        }
        let mean_intensity = sum / shell.population() as f64;
        if mean_intensity > 0.0 {
            points.push((shell.sthol2(), mean_intensity.ln()));
        }
    }
    if points.len() < 2 {
        return None;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut covariance = 0.0;
    let mut variance = 0.0;
    for (x, y) in &points {
        covariance += (x - mean_x) * (y - mean_y);
        variance += (x - mean_x) * (x - mean_x);
    }
    if variance <= EPS_DENOMINATOR {
        return None;
    }
    Some(-0.5 * covariance / variance)
}

struct Breakpoints {
    sthol2_1: f64,
    sthol2_2: f64,
    sthol2_3: f64,
}

fn breakpoints(resolution: f64, d_min_ratio: f64) -> Result<Breakpoints, SharpenError> {
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(SharpenError::InvalidResolution { value: resolution });
    }
    if !d_min_ratio.is_finite() || d_min_ratio <= 0.0 || d_min_ratio > 1.0 {
        return Err(SharpenError::InvalidDMinRatio { value: d_min_ratio });
    }
    let sthol2_2 = 0.25 / (resolution * resolution);
    let d_min = d_min_ratio * resolution;
    Ok(Breakpoints {
        sthol2_1: 0.5 * sthol2_2,
        sthol2_2,
        sthol2_3: 0.25 / (d_min * d_min),
    })
}

fn b_model_value(sthol2: f64, model: &BFactorModel, breaks: &Breakpoints) -> f64 {
    let (b1, b2) = (model.b1(), model.b2());
    let b3_use = b2 + model.b3();
    if sthol2 > breaks.sthol2_2 {
        // past the high-resolution breakpoint the last slope continues
        b2 + (sthol2 - breaks.sthol2_2) * (b3_use - b2) / (breaks.sthol2_3 - breaks.sthol2_2)
    } else if sthol2 > breaks.sthol2_1 {
        b1 + (sthol2 - breaks.sthol2_1) * (b2 - b1) / (breaks.sthol2_2 - breaks.sthol2_1)
    } else {
        sthol2 * b1 / breaks.sthol2_1
    }
}

/// Apply the three-parameter piecewise-linear B model: each reflection's
/// amplitude is multiplied by `exp(value(sthol2))` where `value` ramps
/// 0 → b1 → b2 → b2+b3 at the breakpoints set by `resolution` and
/// `d_min_ratio`.
pub fn adjust_amplitudes_linear(
    coefficients: &MapCoefficients,
    model: &BFactorModel,
    resolution: f64,
    d_min_ratio: f64,
) -> Result<MapCoefficients, SharpenError> {
    let breaks = breakpoints(resolution, d_min_ratio)?;
    let scales: Vec<f64> = coefficients
        .sthol2()
        .iter()
        .map(|&sthol2| clamped_exp(b_model_value(sthol2, model, &breaks)))
        .collect();
    Ok(coefficients.scaled_by(&scales)?)
}

/// Pseudo-B at each of the three breakpoint resolutions: the constant
/// isotropic B that would reproduce the model's value at that point
/// (`b = -value/sthol2`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveBValues {
    pub d_spacings: [f64; 3],
    pub b_values: [f64; 3],
}

pub fn effective_b_values(
    model: &BFactorModel,
    resolution: f64,
    d_min_ratio: f64,
) -> Result<EffectiveBValues, SharpenError> {
    let breaks = breakpoints(resolution, d_min_ratio)?;
    let points = [breaks.sthol2_1, breaks.sthol2_2, breaks.sthol2_3];
    let mut d_spacings = [0.0; 3];
    let mut b_values = [0.0; 3];
    for (slot, &sthol2) in points.iter().enumerate() {
        d_spacings[slot] = (0.25 / sthol2).sqrt();
        b_values[slot] = -b_model_value(sthol2, model, &breaks) / sthol2;
    }
    Ok(EffectiveBValues {
        d_spacings,
        b_values,
    })
}

/// Fourth standardized moment of a map's grid values. Zero-variance input
/// (a flat map) yields 0.
pub fn kurtosis(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let mut m2 = 0.0;
    let mut m4 = 0.0;
    for &value in values {
        let delta = value - mean;
        m2 += delta * delta;
        m4 += delta * delta * delta * delta;
    }
    m2 /= n;
    m4 /= n;
    if m2 <= EPS_DENOMINATOR {
        return 0.0;
    }
    m4 / (m2 * m2)
}

/// Synthesize the real-space map for a set of coefficients.
pub fn sharpened_map(
    coefficients: &MapCoefficients,
    synthesis: &dyn MapSynthesis,
    shape: [usize; 3],
) -> RealSpaceMap {
    synthesis.synthesize(coefficients, shape)
}

#[cfg(test)]
mod tests {
    use super::{
        adjust_amplitudes_linear, apply_target_scale_factors, effective_b_values, kurtosis,
        wilson_b_iso, SharpenError,
    };
    use crate::binning::ResolutionBinner;
    use crate::domain::{BFactorModel, MapCoefficients, MillerIndex};

    fn coefficients_with_b(count: usize, b: f64) -> MapCoefficients {
        let indices: Vec<MillerIndex> = (0..count).map(|i| MillerIndex([1 + i as i32, 0, 0])).collect();
        let d_spacings: Vec<f64> = (0..count)
            .map(|i| 10.0 - 8.0 * (i as f64) / (count as f64))
            .collect();
        let amplitudes: Vec<f64> = d_spacings
            .iter()
            .map(|d| 100.0 * (-b * 0.25 / (d * d)).exp())
            .collect();
        MapCoefficients::new(indices, amplitudes, vec![0.0; count], d_spacings)
            .expect("coefficients")
    }

    #[test]
    fn wilson_slope_recovers_synthetic_b() {
        let coefficients = coefficients_with_b(60, 120.0);
        let binner = ResolutionBinner::setup(coefficients.d_spacings(), 10).expect("binner");
        let b_iso = wilson_b_iso(&coefficients, &binner).expect("b_iso");
        assert!((b_iso - 120.0).abs() < 5.0, "b_iso {b_iso}");
    }

    #[test]
    fn empty_scale_curve_passes_coefficients_through() {
        let coefficients = coefficients_with_b(30, 50.0);
        let binner = ResolutionBinner::setup(coefficients.d_spacings(), 5).expect("binner");
        let scaled = apply_target_scale_factors(&coefficients, &binner, &[]).expect("scaled");
        assert_eq!(scaled.coefficients, coefficients);
        assert_eq!(scaled.starting_b_iso, scaled.final_b_iso);
    }

    #[test]
    fn flattening_scale_curve_reduces_wilson_b() {
        let coefficients = coefficients_with_b(60, 120.0);
        let binner = ResolutionBinner::setup(coefficients.d_spacings(), 6).expect("binner");
        // inverse of the per-shell mean amplitude flattens the falloff
        let target: Vec<f64> = binner
            .shells()
            .iter()
            .map(|shell| {
                let mean: f64 = shell
                    .members()
                    .iter()
                    .map(|&m| coefficients.amplitudes()[m])
                    .sum::<f64>()
                    / shell.population() as f64;
                100.0 / mean
            })
            .collect();
        let scaled = apply_target_scale_factors(&coefficients, &binner, &target).expect("scaled");
        let before = scaled.starting_b_iso.expect("before");
        let after = scaled.final_b_iso.expect("after");
        assert!(after.abs() < before.abs());
    }

    #[test]
    fn b_model_is_continuous_at_both_breakpoints() {
        let model = BFactorModel([30.0, -60.0, 20.0]);
        let resolution = 3.0;
        let d_min_ratio = 0.833;
        let breaks = super::breakpoints(resolution, d_min_ratio).expect("breaks");
        for sthol2 in [breaks.sthol2_1, breaks.sthol2_2] {
            let below = super::b_model_value(sthol2 - 1.0e-9, &model, &breaks);
            let above = super::b_model_value(sthol2 + 1.0e-9, &model, &breaks);
            assert!(
                (below - above).abs() < 1.0e-5,
                "discontinuity at sthol2 {sthol2}: {below} vs {above}"
            );
        }
    }

    #[test]
    fn b_model_hits_its_anchor_values() {
        let model = BFactorModel([10.0, -40.0, 15.0]);
        let breaks = super::breakpoints(2.5, 0.833).expect("breaks");
        assert!((super::b_model_value(0.0, &model, &breaks)).abs() < 1.0e-12);
        assert!((super::b_model_value(breaks.sthol2_1, &model, &breaks) - 10.0).abs() < 1.0e-9);
        assert!((super::b_model_value(breaks.sthol2_2, &model, &breaks) + 40.0).abs() < 1.0e-9);
        assert!(
            (super::b_model_value(breaks.sthol2_3, &model, &breaks) - (-40.0 + 15.0)).abs()
                < 1.0e-9
        );
    }

    #[test]
    fn zero_model_leaves_amplitudes_unchanged() {
        let coefficients = coefficients_with_b(20, 80.0);
        let adjusted =
            adjust_amplitudes_linear(&coefficients, &BFactorModel::ZERO, 3.0, 0.833)
                .expect("adjusted");
        for (before, after) in coefficients.amplitudes().iter().zip(adjusted.amplitudes()) {
            assert!((before - after).abs() < 1.0e-12);
        }
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let coefficients = coefficients_with_b(10, 80.0);
        let model = BFactorModel([1.0, 2.0, 3.0]);
        assert!(matches!(
            adjust_amplitudes_linear(&coefficients, &model, 0.0, 0.833),
            Err(SharpenError::InvalidResolution { .. })
        ));
        assert!(matches!(
            adjust_amplitudes_linear(&coefficients, &model, 3.0, 1.5),
            Err(SharpenError::InvalidDMinRatio { .. })
        ));
    }

    #[test]
    fn effective_b_values_convert_segment_values() {
        let model = BFactorModel([20.0, -50.0, 10.0]);
        let values = effective_b_values(&model, 3.0, 0.833).expect("values");
        // at the nominal resolution the model value is b2, so the pseudo-B
        // there is -b2/sthol2_2
        let sthol2_2 = 0.25 / 9.0;
        assert!((values.b_values[1] - 50.0 / sthol2_2).abs() < 1.0e-9);
        assert!((values.d_spacings[1] - 3.0).abs() < 1.0e-12);
        assert!(values.d_spacings[0] > values.d_spacings[1]);
        assert!(values.d_spacings[1] > values.d_spacings[2]);
    }

    #[test]
    fn kurtosis_of_flat_map_is_zero_and_gaussianish_is_near_three() {
        assert_eq!(kurtosis(&[5.0; 100]), 0.0);
        // symmetric two-point distribution has kurtosis exactly 1
        let two_point: Vec<f64> = (0..100)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        assert!((kurtosis(&two_point) - 1.0).abs() < 1.0e-12);
    }
}
