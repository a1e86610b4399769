//! Anisotropic falloff tensor fitted to directional scale samples.
//!
//! Each directional analysis contributes scale observations placed at the
//! lattice points closest to its direction vector at each shell's
//! resolution. A 6-component U-cart tensor (plus an overall log-scale
//! offset) is fitted to the log of those observations by linear least
//! squares; the normal equations are solved in place with partial
//! pivoting over a dense `faer` matrix.

use faer::Mat;
use tracing::debug;

use super::{DirectionScaling, FscError};
use crate::domain::{MillerIndex, UnitCellView};
use crate::numerics::{clamped_exp, EPS_DENOMINATOR};

/// One scale observation in reciprocal space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleSample {
    pub index: MillerIndex,
    pub d_spacing: f64,
    pub scale: f64,
}

/// Fits a U-cart tensor to scale samples. The least-squares fit below is
/// the default; callers with their own anisotropy machinery substitute it
/// here.
pub trait AnisotropyModel {
    fn fit_u_cart(
        &self,
        cell: &UnitCellView,
        samples: &[ScaleSample],
    ) -> Result<[f64; 6], FscError>;
}

/// `ln(scale) = c - 2π² (u11 x² + u22 y² + u33 z² + 2 u12 xy + 2 u13 xz +
/// 2 u23 yz)` over reciprocal vectors `(x, y, z)`, solved as a 7-parameter
/// linear system.
pub struct LeastSquaresAniso;

const N_PARAMS: usize = 7;
const SINGULAR_PIVOT_EPSILON: f64 = 1.0e-12;

impl AnisotropyModel for LeastSquaresAniso {
    fn fit_u_cart(
        &self,
        _cell: &UnitCellView,
        samples: &[ScaleSample],
    ) -> Result<[f64; 6], FscError> {
        if samples.len() < N_PARAMS {
            return Err(FscError::TooFewAnisoSamples {
                needed: N_PARAMS,
                actual: samples.len(),
            });
        }

        let mut normal = Mat::<f64>::zeros(N_PARAMS, N_PARAMS);
        let mut rhs = [0.0; N_PARAMS];
        for sample in samples {
            let Some(row) = design_row(sample) else {
                continue;
            };
            let target = sample.scale.max(EPS_DENOMINATOR).ln();
            for i in 0..N_PARAMS {
                for j in 0..N_PARAMS {
                    normal[(i, j)] += row[i] * row[j];
                }
                rhs[i] += row[i] * target;
            }
        }

        let solution = solve_in_place(normal, rhs)?;
        let u_cart = [
            solution[1],
            solution[2],
            solution[3],
            solution[4],
            solution[5],
            solution[6],
        ];
        debug!(?u_cart, n_samples = samples.len(), "anisotropy tensor fitted");
        Ok(u_cart)
    }
}

const TWO_PI_SQ: f64 = 2.0 * std::f64::consts::PI * std::f64::consts::PI;

fn design_row(sample: &ScaleSample) -> Option<[f64; N_PARAMS]> {
    let [h, k, l] = sample.index.0;
    let raw = [h as f64, k as f64, l as f64];
    let norm = (raw[0] * raw[0] + raw[1] * raw[1] + raw[2] * raw[2]).sqrt();
    if norm == 0.0 || sample.d_spacing <= 0.0 {
        return None;
    }
    let d_star = 1.0 / sample.d_spacing;
    let x = raw[0] / norm * d_star;
    let y = raw[1] / norm * d_star;
    let z = raw[2] / norm * d_star;
    Some([
        1.0,
        -TWO_PI_SQ * x * x,
        -TWO_PI_SQ * y * y,
        -TWO_PI_SQ * z * z,
        -TWO_PI_SQ * 2.0 * x * y,
        -TWO_PI_SQ * 2.0 * x * z,
        -TWO_PI_SQ * 2.0 * y * z,
    ])
}

fn solve_in_place(
    mut matrix: Mat<f64>,
    mut rhs: [f64; N_PARAMS],
) -> Result<[f64; N_PARAMS], FscError> {
    for pivot_col in 0..N_PARAMS {
        let mut pivot_row = pivot_col;
        let mut pivot_magnitude = matrix[(pivot_col, pivot_col)].abs();
        for row in (pivot_col + 1)..N_PARAMS {
            let magnitude = matrix[(row, pivot_col)].abs();
            if magnitude > pivot_magnitude {
                pivot_magnitude = magnitude;
                pivot_row = row;
            }
        }
        if pivot_magnitude <= SINGULAR_PIVOT_EPSILON {
            return Err(FscError::SingularAnisoFit);
        }
        if pivot_row != pivot_col {
            for col in 0..N_PARAMS {
                let held = matrix[(pivot_col, col)];
                matrix[(pivot_col, col)] = matrix[(pivot_row, col)];
                matrix[(pivot_row, col)] = held;
            }
            rhs.swap(pivot_col, pivot_row);
        }

        let pivot = matrix[(pivot_col, pivot_col)];
        for row in (pivot_col + 1)..N_PARAMS {
            let multiplier = matrix[(row, pivot_col)] / pivot;
            for col in pivot_col..N_PARAMS {
                let updated = matrix[(row, col)] - multiplier * matrix[(pivot_col, col)];
                matrix[(row, col)] = updated;
            }
            rhs[row] -= multiplier * rhs[pivot_col];
        }
    }

    let mut solution = [0.0; N_PARAMS];
    for row in (0..N_PARAMS).rev() {
        let mut value = rhs[row];
        for col in (row + 1)..N_PARAMS {
            value -= matrix[(row, col)] * solution[col];
        }
        solution[row] = value / matrix[(row, row)];
    }
    Ok(solution)
}

/// Scale observations derived from each direction's fitted CC falloff,
/// placed at the lattice point nearest the direction at each shell's
/// resolution. Directions without an effective-B fit fall back to the raw
/// scale curve.
pub fn calculated_scale_factors(
    cell: &UnitCellView,
    per_direction: &[DirectionScaling],
) -> Vec<ScaleSample> {
    samples_from(cell, per_direction, |scaling, shell| {
        match (scaling.b_zero, scaling.effective_b) {
            (Some(b_zero), Some(effective_b)) => {
                b_zero * clamped_exp(-effective_b * scaling.target_sthol2[shell])
            }
            _ => scaling.target_scale_factors.get(shell).copied().unwrap_or(1.0),
        }
    })
}

/// Observed amplitude observations, normalized per direction to the
/// lowest-resolution shell.
pub fn observed_amplitude_samples(
    cell: &UnitCellView,
    per_direction: &[DirectionScaling],
) -> Vec<ScaleSample> {
    samples_from(cell, per_direction, |scaling, shell| {
        let first = scaling.rms_fo_list.first().copied().unwrap_or(0.0);
        let value = scaling.rms_fo_list.get(shell).copied().unwrap_or(0.0);
        value / first.max(EPS_DENOMINATOR)
    })
}

fn samples_from(
    cell: &UnitCellView,
    per_direction: &[DirectionScaling],
    value: impl Fn(&crate::domain::ScalingResult, usize) -> f64,
) -> Vec<ScaleSample> {
    let mut samples = Vec::new();
    for direction in per_direction {
        let scaling = &direction.scaling;
        for shell in 0..scaling.target_sthol2.len() {
            let sthol2 = scaling.target_sthol2[shell];
            if sthol2 <= 0.0 {
                continue;
            }
            let d_spacing = (0.25 / sthol2).sqrt();
            let index = cell.nearest_lattice_point(direction.direction.scaled(1.0 / d_spacing));
            samples.push(ScaleSample {
                index,
                d_spacing,
                scale: value(scaling, shell),
            });
        }
    }
    samples
}

/// Element-wise difference of two U-cart tensors.
pub fn subtract_u_cart(a: [f64; 6], b: [f64; 6]) -> [f64; 6] {
    [
        a[0] - b[0],
        a[1] - b[1],
        a[2] - b[2],
        a[3] - b[3],
        a[4] - b[4],
        a[5] - b[5],
    ]
}
