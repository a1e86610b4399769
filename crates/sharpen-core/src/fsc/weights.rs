//! Per-reflection weights for direction-resolved FSC analysis.
//!
//! Each reflection is weighted by how closely its reciprocal-space
//! direction aligns with the analysis direction, through a sharpened
//! cosine kernel. Weights are normalized across the direction set so every
//! reflection contributes unit total weight, and the lowest-resolution
//! shell is forced to full weight in every direction so the absolute scale
//! of each directional curve stays anchored.

use crate::binning::ResolutionBinner;
use crate::domain::{DirectionVector, MillerIndex};
use crate::numerics::clamped_exp;

const MIN_DOT: f64 = 0.7;
const VERY_HIGH_DOT: f64 = 0.9;
const PRE_FACTOR: f64 = 10.0;

fn kernel(dot: f64) -> f64 {
    if dot < MIN_DOT {
        return 0.0;
    }
    let shifted = (dot + (1.0 - VERY_HIGH_DOT)).min(1.0);
    clamped_exp(PRE_FACTOR * (shifted - 1.0))
}

fn unit_reciprocal(index: MillerIndex) -> Option<[f64; 3]> {
    let [h, k, l] = index.0;
    let vector = [h as f64, k as f64, l as f64];
    let norm = (vector[0] * vector[0] + vector[1] * vector[1] + vector[2] * vector[2]).sqrt();
    if norm == 0.0 {
        return None;
    }
    Some([vector[0] / norm, vector[1] / norm, vector[2] / norm])
}

/// One weight vector per direction, reflections in input order. The raw
/// kernel values are normalized so the per-reflection sum across
/// directions is 1 (reflections no direction covers fall back to equal
/// weights), then the lowest-resolution shell is overridden to 1.
pub fn direction_weights(
    indices: &[MillerIndex],
    directions: &[DirectionVector],
    binner: &ResolutionBinner,
) -> Vec<Vec<f64>> {
    let mut per_direction: Vec<Vec<f64>> = directions
        .iter()
        .map(|direction| {
            indices
                .iter()
                .map(|&index| match unit_reciprocal(index) {
                    Some(unit) => kernel(direction.dot(unit).abs()),
                    // the F000 term has no direction
                    None => 1.0,
                })
                .collect()
        })
        .collect();

    let n_directions = directions.len();
    for reflection in 0..indices.len() {
        let total: f64 = per_direction
            .iter()
            .map(|weights| weights[reflection])
            .sum();
        if total > 0.0 {
            for weights in &mut per_direction {
                weights[reflection] /= total;
            }
        } else {
            for weights in &mut per_direction {
                weights[reflection] = 1.0 / n_directions as f64;
            }
        }
    }

    if binner.n_bins() > 0 {
        for &member in binner.selection(0) {
            for weights in &mut per_direction {
                weights[member] = 1.0;
            }
        }
    }

    per_direction
}
