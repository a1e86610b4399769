//! Shell-resolved correlation analysis between observed map coefficients
//! and a reference, producing the per-shell scale curve.
//!
//! One [`FscEstimator`] owns a single analysis configuration. The isotropic
//! entry point is [`FscEstimator::analyze`]; [`FscEstimator::analyze_directions`]
//! repeats the analysis once per direction vector with cosine-kernel
//! weighting and fits an anisotropic correction tensor to the directional
//! scale samples.

pub mod aniso;
pub mod weights;

pub use aniso::{AnisotropyModel, LeastSquaresAniso, ScaleSample};
pub use weights::direction_weights;

use std::f64::consts::PI;

use tracing::{debug, info};

use crate::binning::{BinningError, ResolutionBinner};
use crate::domain::{
    AnalysisKind, DirectionVector, MapCoefficients, ReferenceSource, ScalingResult,
    ScalingResultBuilder, UnitCellView,
};
use crate::numerics::{
    clamped_exp, estimate_cc_star, get_effective_b, get_fitted_cc, mean,
    remove_values_if_necessary, rescale_cc_list, smooth_values, FitError, FittedCcOptions,
    EPS_DENOMINATOR,
};
use crate::scaling::{optimize_b_eff, target_scale_factors, ScalingError, TargetScaleInputs};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FscError {
    #[error("{field} has {actual} reflections, expected {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("directional analysis requested with no direction vectors")]
    NoDirections,
    #[error("anisotropy fit needs at least {needed} samples, got {actual}")]
    TooFewAnisoSamples { needed: usize, actual: usize },
    #[error("singular normal equations in anisotropy fit")]
    SingularAnisoFit,
    #[error(transparent)]
    Binning(#[from] BinningError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Scaling(#[from] ScalingError),
}

/// Analysis configuration. Field defaults mirror the values the driver
/// uses when nothing is overridden.
#[derive(Debug, Clone)]
pub struct FscParams {
    /// Nominal resolution of the map (Angstrom).
    pub resolution: f64,
    /// Coordinate error estimate; derived from the resolution when unset
    /// on model-based runs.
    pub rmsd: Option<f64>,
    pub rmsd_resolution_factor: f64,
    /// CC level below which the curve tail is replaced by a fitted
    /// exponential.
    pub cc_cut: f64,
    /// Tail-point count for baseline rescaling of the CC curve; `None`
    /// disables rescaling.
    pub scale_using_last: Option<usize>,
    pub max_cc_for_rescale: f64,
    pub pseudo_likelihood: bool,
    pub equalize_power: bool,
    pub skip_scale_factor: bool,
    pub maximum_scale_factor: Option<f64>,
    pub optimize_b_eff: bool,
    /// Shell count averaged into the low-resolution CC diagnostic.
    pub low_res_bins: usize,
    pub fraction_complete: Option<f64>,
    pub min_fraction_complete: f64,
    pub smooth_fsc: bool,
    pub max_relative_rms: f64,
    pub keep_cutoff_point: bool,
    pub cutoff_after_last_high_point: bool,
    /// Caller-supplied expected reference rms per shell, overriding the
    /// reference amplitudes.
    pub expected_rms_fc: Option<Vec<f64>>,
    pub directions: Vec<DirectionVector>,
}

impl Default for FscParams {
    fn default() -> Self {
        Self {
            resolution: 3.0,
            rmsd: None,
            rmsd_resolution_factor: 0.25,
            cc_cut: 0.2,
            scale_using_last: None,
            max_cc_for_rescale: 0.2,
            pseudo_likelihood: false,
            equalize_power: true,
            skip_scale_factor: false,
            maximum_scale_factor: None,
            optimize_b_eff: false,
            low_res_bins: 3,
            fraction_complete: None,
            min_fraction_complete: 0.05,
            smooth_fsc: false,
            max_relative_rms: 10.0,
            keep_cutoff_point: false,
            cutoff_after_last_high_point: false,
            expected_rms_fc: None,
            directions: Vec::new(),
        }
    }
}

/// One directional analysis result.
#[derive(Debug, Clone)]
pub struct DirectionScaling {
    pub direction: DirectionVector,
    pub scaling: ScalingResult,
}

/// Outcome of a multi-direction analysis.
#[derive(Debug, Clone)]
pub struct DirectionalScaling {
    pub per_direction: Vec<DirectionScaling>,
    /// Tensor fitted to the observed amplitude falloff.
    pub starting_u_cart: [f64; 6],
    /// Tensor fitted to the directional scale curves.
    pub scaling_u_cart: [f64; 6],
    /// Starting tensor minus scaling tensor, the correction to remove
    /// from the map.
    pub overall_u_cart_to_remove: [f64; 6],
}

#[derive(Debug)]
pub struct FscEstimator<'a> {
    observed: &'a MapCoefficients,
    reference: &'a ReferenceSource,
    binner: &'a ResolutionBinner,
    params: FscParams,
}

impl<'a> FscEstimator<'a> {
    pub fn new(
        observed: &'a MapCoefficients,
        reference: &'a ReferenceSource,
        binner: &'a ResolutionBinner,
        params: FscParams,
    ) -> Result<Self, FscError> {
        let expected = observed.len();
        if binner.n_observations() != expected {
            return Err(FscError::LengthMismatch {
                field: "binner",
                expected,
                actual: binner.n_observations(),
            });
        }
        let check = |field: &'static str, coefficients: &MapCoefficients| {
            if coefficients.len() != expected {
                return Err(FscError::LengthMismatch {
                    field,
                    expected,
                    actual: coefficients.len(),
                });
            }
            Ok(())
        };
        match reference {
            ReferenceSource::ModelBased { model } => check("model", model)?,
            ReferenceSource::ExternalReference { reference } => check("reference", reference)?,
            ReferenceSource::HalfDatasets { first, second } => {
                check("first half", first)?;
                check("second half", second)?;
            }
        }
        if let Some(expected_rms_fc) = &params.expected_rms_fc {
            if expected_rms_fc.len() != binner.n_bins() {
                return Err(FscError::LengthMismatch {
                    field: "expected_rms_fc",
                    expected: binner.n_bins(),
                    actual: expected_rms_fc.len(),
                });
            }
        }
        Ok(Self {
            observed,
            reference,
            binner,
            params,
        })
    }

    pub fn kind(&self) -> AnalysisKind {
        self.reference.kind()
    }

    /// Isotropic analysis: every reflection carries unit weight.
    pub fn analyze(&self) -> Result<ScalingResult, FscError> {
        self.analyze_with_weights(None)
    }

    /// Direction-resolved analysis plus anisotropic tensor fit.
    pub fn analyze_directions(
        &self,
        cell: &UnitCellView,
        model: &dyn AnisotropyModel,
    ) -> Result<DirectionalScaling, FscError> {
        if self.params.directions.is_empty() {
            return Err(FscError::NoDirections);
        }
        let weights =
            direction_weights(self.observed.indices(), &self.params.directions, self.binner);

        let mut per_direction = Vec::with_capacity(self.params.directions.len());
        for (direction, weight_set) in self.params.directions.iter().zip(&weights) {
            let scaling = self.analyze_with_weights(Some(weight_set.as_slice()))?;
            per_direction.push(DirectionScaling {
                direction: *direction,
                scaling,
            });
        }

        let scale_samples = aniso::calculated_scale_factors(cell, &per_direction);
        let amplitude_samples = aniso::observed_amplitude_samples(cell, &per_direction);
        let scaling_u_cart = model.fit_u_cart(cell, &scale_samples)?;
        let starting_u_cart = model.fit_u_cart(cell, &amplitude_samples)?;
        let overall_u_cart_to_remove = aniso::subtract_u_cart(starting_u_cart, scaling_u_cart);
        debug!(?scaling_u_cart, ?starting_u_cart, "anisotropy tensors fitted");

        Ok(DirectionalScaling {
            per_direction,
            starting_u_cart,
            scaling_u_cart,
            overall_u_cart_to_remove,
        })
    }

    fn analyze_with_weights(&self, weights: Option<&[f64]>) -> Result<ScalingResult, FscError> {
        let is_model_based = matches!(self.reference, ReferenceSource::ModelBased { .. });
        let (pair_a, pair_b) = match self.reference {
            ReferenceSource::ModelBased { model } => (self.observed, model),
            ReferenceSource::ExternalReference { reference } => (self.observed, reference),
            ReferenceSource::HalfDatasets { first, second } => (first, second),
        };

        let n_shells = self.binner.n_bins();
        let mut cc_list = Vec::with_capacity(n_shells);
        let mut ratio_list = Vec::with_capacity(n_shells);
        let mut rms_fo_list = Vec::with_capacity(n_shells);
        let mut sthol2_list = Vec::with_capacity(n_shells);
        let mut sthol_list = Vec::with_capacity(n_shells);
        let mut d_min_list = Vec::with_capacity(n_shells);
        let mut populations = Vec::with_capacity(n_shells);

        for (shell_index, shell) in self.binner.shells().iter().enumerate() {
            let members = shell.members();
            let cc = if matches!(self.reference, ReferenceSource::ExternalReference { .. }) {
                1.0
            } else {
                weighted_map_correlation(pair_a, pair_b, members, weights)
            };
            let rms_fo = weighted_rms(self.observed.amplitudes(), members, weights);
            // half-dataset runs scale toward CC* with no reference
            // amplitude curve, so their rms_fc is the unit level
            let rms_fc = match (&self.params.expected_rms_fc, self.reference) {
                (Some(expected), _) => expected[shell_index],
                (None, ReferenceSource::HalfDatasets { .. }) => 1.0,
                (None, _) => weighted_rms(pair_b.amplitudes(), members, weights),
            };
            cc_list.push(cc);
            ratio_list.push(rms_fc.max(EPS_DENOMINATOR) / rms_fo.max(EPS_DENOMINATOR));
            rms_fo_list.push(rms_fo);
            sthol2_list.push(shell.sthol2());
            sthol_list.push(1.0 / shell.d_mean());
            d_min_list.push(shell.d_min());
            populations.push(shell.population());
        }

        let ratio_list = remove_values_if_necessary(&ratio_list, 100.0, 0.01);
        let rms_fo_list = remove_values_if_necessary(&rms_fo_list, 100.0, 0.01);

        let mut cc_work = cc_list.clone();
        let mut scale_using_last = self.params.scale_using_last.is_some();
        if let Some(tail_points) = self.params.scale_using_last {
            let (rescaled, baseline) =
                rescale_cc_list(&cc_work, tail_points, self.params.max_cc_for_rescale);
            debug!(?baseline, "cc baseline rescaling");
            if baseline.is_none() {
                // baseline too high to trust, drop the tail pinning too
                scale_using_last = false;
            }
            cc_work = rescaled;
        }
        if self.params.smooth_fsc {
            cc_work = smooth_values(&cc_work, self.params.max_relative_rms, 0.1);
        }
        let cc_fitted = if is_model_based {
            get_fitted_cc(
                &cc_work,
                &sthol_list,
                self.params.cc_cut,
                &FittedCcOptions {
                    scale_using_last,
                    keep_cutoff_point: self.params.keep_cutoff_point,
                    force_scale_using_last: false,
                    cutoff_after_last_high_point: self.params.cutoff_after_last_high_point,
                },
            )?
        } else {
            estimate_cc_star(
                &cc_work,
                &sthol_list,
                self.params.cc_cut,
                scale_using_last,
                self.params.keep_cutoff_point,
            )?
        };

        let rmsd = if is_model_based {
            let rmsd = self
                .params
                .rmsd
                .unwrap_or(self.params.resolution * self.params.rmsd_resolution_factor);
            if self.params.rmsd.is_none() {
                info!(rmsd, resolution = self.params.resolution, "rmsd set from resolution");
            }
            Some(rmsd)
        } else {
            self.params.rmsd
        };
        let mut b_eff = rmsd
            .filter(|_| is_model_based)
            .map(|rmsd| 8.0 * PI * rmsd * rmsd);

        let (max_possible_cc, fraction_complete) = if is_model_based {
            let mut running_max: f64 = 0.0;
            if let Some(b_eff) = b_eff {
                for (cc, sthol2) in cc_list.iter().zip(&sthol2_list) {
                    let possible = (cc * clamped_exp(sthol2 * b_eff)).clamp(0.0, 1.0);
                    running_max = running_max.max(possible);
                }
            }
            match self.params.fraction_complete {
                Some(fraction_complete) => (fraction_complete.max(0.0).sqrt(), fraction_complete),
                None => (running_max, running_max * running_max),
            }
        } else {
            (1.0, 1.0)
        };

        let mut builder = ScalingResultBuilder::new(self.kind(), self.params.resolution)
            .rmsd(rmsd)
            .pseudo_likelihood(self.params.pseudo_likelihood)
            .shell_geometry(sthol2_list.clone(), d_min_list)
            .fraction_complete(fraction_complete)
            .low_res_cc(mean(
                &cc_fitted[..self.params.low_res_bins.min(cc_fitted.len())],
            ));

        // exponential falloff of the fitted CC and of the normalized
        // observed amplitudes, consumed by the anisotropy fit
        let cc_b_fit = get_effective_b(&cc_fitted, &sthol2_list)?;
        let normalized_fo: Vec<f64> = rms_fo_list
            .iter()
            .map(|rms| rms / rms_fo_list[0].max(EPS_DENOMINATOR))
            .collect();
        let fo_b_fit = get_effective_b(&normalized_fo, &sthol2_list)?;
        builder = builder.effective_b_fit(
            Some(cc_b_fit.effective_b),
            Some(fo_b_fit.effective_b),
            Some(cc_b_fit.b_zero),
            Some(cc_b_fit.rms),
        );

        if fraction_complete < self.params.min_fraction_complete {
            info!(
                fraction_complete,
                min_fraction_complete = self.params.min_fraction_complete,
                "scaling skipped, data too incomplete"
            );
            return Ok(builder
                .correlation_curves(cc_fitted.clone(), rms_fo_list)
                .target_scale_factors(vec![1.0; n_shells])
                .build());
        }

        let inputs = TargetScaleInputs {
            cc_list: &cc_fitted,
            ratio_list: &ratio_list,
            sthol2_list: &sthol2_list,
            rms_fo_list: &rms_fo_list,
            populations: &populations,
            is_model_based,
            b_eff,
            pseudo_likelihood: self.params.pseudo_likelihood,
            max_possible_cc,
            equalize_power: self.params.equalize_power,
            skip_scale_factor: self.params.skip_scale_factor,
            maximum_scale_factor: self.params.maximum_scale_factor,
        };
        let outcome = match (self.params.optimize_b_eff && is_model_based, b_eff) {
            (true, Some(starting_b_eff)) => {
                let (best_b_eff, outcome) = optimize_b_eff(&inputs, starting_b_eff)?;
                b_eff = Some(best_b_eff);
                outcome
            }
            _ => target_scale_factors(&inputs)?,
        };
        debug!(weighted_cc = outcome.weighted_cc, ?b_eff, "scale curve computed");

        Ok(builder
            .correlation_curves(cc_fitted, rms_fo_list)
            .target_scale_factors(outcome.target_scale_factors)
            .build())
    }
}

/// Complex map correlation over one shell, optionally with per-reflection
/// weights applied as `sqrt(w)` on both sides. Undefined (zero-norm)
/// correlations collapse to 0.
fn weighted_map_correlation(
    a: &MapCoefficients,
    b: &MapCoefficients,
    members: &[usize],
    weights: Option<&[f64]>,
) -> f64 {
    let mut cross = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for &member in members {
        let weight = weights.map_or(1.0, |w| w[member]);
        let root = weight.sqrt();
        let value_a = a.complex_value(member) * root;
        let value_b = b.complex_value(member) * root;
        cross += (value_a * value_b.conj()).re;
        norm_a += value_a.norm_sqr();
        norm_b += value_b.norm_sqr();
    }
    let cc = cross / (norm_a * norm_b).sqrt();
    if cc.is_finite() { cc } else { 0.0 }
}

/// Weighted rms amplitude over one shell, `sqrt(Σ w·a² / Σ w)`.
fn weighted_rms(amplitudes: &[f64], members: &[usize], weights: Option<&[f64]>) -> f64 {
    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for &member in members {
        let weight = weights.map_or(1.0, |w| w[member]);
        sum += weight * amplitudes[member] * amplitudes[member];
        weight_sum += weight;
    }
    if weight_sum <= 0.0 {
        return 0.0;
    }
    (sum / weight_sum).sqrt()
}

/// Lowest resolution at which any direction's observed signal has fallen
/// below 5 % of its low-resolution level; the anisotropy fit is restricted
/// to data better than this. `None` when the signal never collapses.
pub fn resolution_for_aniso(per_direction: &[DirectionScaling]) -> Option<f64> {
    let mut worst: Option<f64> = None;
    for direction in per_direction {
        let rms = &direction.scaling.rms_fo_list;
        let Some(&first) = rms.first() else { continue };
        if first <= 0.0 {
            continue;
        }
        for (shell, &value) in rms.iter().enumerate() {
            if value / first < 0.05 {
                let d = direction.scaling.d_min_list[shell];
                worst = Some(worst.map_or(d, |current: f64| current.max(d)));
                break;
            }
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::{resolution_for_aniso, weighted_map_correlation, weighted_rms, DirectionScaling,
        FscError, FscEstimator, FscParams};
    use crate::binning::ResolutionBinner;
    use crate::domain::{
        AnalysisKind, DirectionVector, MapCoefficients, MillerIndex, ReferenceSource,
        ScalingResultBuilder,
    };

    fn synthetic_coefficients(count: usize, amplitude: impl Fn(usize) -> f64) -> MapCoefficients {
        let indices: Vec<MillerIndex> = (0..count)
            .map(|i| MillerIndex([1 + i as i32, (i % 3) as i32, (i % 2) as i32]))
            .collect();
        let d_spacings: Vec<f64> = (0..count)
            .map(|i| 10.0 - 8.0 * (i as f64) / (count as f64))
            .collect();
        let amplitudes: Vec<f64> = (0..count).map(&amplitude).collect();
        let phases: Vec<f64> = (0..count).map(|i| 10.0 * i as f64).collect();
        MapCoefficients::new(indices, amplitudes, phases, d_spacings).expect("coefficients")
    }

    #[test]
    fn self_correlation_gives_unit_cc_and_flattening_scales() {
        let observed = synthetic_coefficients(60, |i| 100.0 - i as f64);
        let reference = ReferenceSource::HalfDatasets {
            first: observed.clone(),
            second: observed.clone(),
        };
        let binner = ResolutionBinner::setup(observed.d_spacings(), 6).expect("binner");
        let estimator =
            FscEstimator::new(&observed, &reference, &binner, FscParams::default())
                .expect("estimator");
        let result = estimator.analyze().expect("analysis");

        assert_eq!(result.kind, AnalysisKind::HalfDataset);
        for cc in &result.cc_list {
            assert!((cc - 1.0).abs() < 1.0e-9, "cc {cc} should be 1");
        }
        // perfect CC* scales toward flat power: scale proportional to
        // 1/rms_fo, so the scaled rms is the same in every shell
        let products: Vec<f64> = result
            .target_scale_factors
            .iter()
            .zip(&result.rms_fo_list)
            .map(|(scale, rms_fo)| scale * rms_fo)
            .collect();
        for product in &products {
            assert!(
                (product - products[0]).abs() < 1.0e-9 * products[0],
                "scaled rms should be constant, got {products:?}"
            );
        }
        assert!((result.low_res_cc - 1.0).abs() < 1.0e-9);
        assert_eq!(result.fraction_complete, 1.0);
    }

    #[test]
    fn zero_half_map_degrades_gracefully() {
        let observed = synthetic_coefficients(40, |i| 50.0 - i as f64);
        let zero = observed
            .with_amplitudes(vec![0.0; observed.len()])
            .expect("zero map");
        let reference = ReferenceSource::HalfDatasets {
            first: observed.clone(),
            second: zero,
        };
        let binner = ResolutionBinner::setup(observed.d_spacings(), 4).expect("binner");
        let estimator =
            FscEstimator::new(&observed, &reference, &binner, FscParams::default())
                .expect("estimator");
        let result = estimator.analyze().expect("analysis");

        for cc in &result.cc_list {
            assert!(cc.is_finite());
            assert!(cc.abs() < 1.0e-9, "zero reference carries no correlation");
        }
        for scale in &result.target_scale_factors {
            assert!(scale.is_finite());
            assert!(*scale >= 0.0);
        }
    }

    #[test]
    fn external_reference_forces_unit_cc() {
        let observed = synthetic_coefficients(30, |i| 40.0 - i as f64);
        let reference_coeffs = synthetic_coefficients(30, |i| 80.0 - 2.0 * i as f64);
        let reference = ReferenceSource::ExternalReference {
            reference: reference_coeffs,
        };
        let binner = ResolutionBinner::setup(observed.d_spacings(), 3).expect("binner");
        let estimator =
            FscEstimator::new(&observed, &reference, &binner, FscParams::default())
                .expect("estimator");
        let result = estimator.analyze().expect("analysis");
        for cc in &result.cc_list {
            assert!((cc - 1.0).abs() < 1.0e-12);
        }
    }

    #[test]
    fn model_based_run_derives_rmsd_from_resolution() {
        let observed = synthetic_coefficients(50, |i| 60.0 - i as f64);
        let model = observed.clone();
        let reference = ReferenceSource::ModelBased { model };
        let binner = ResolutionBinner::setup(observed.d_spacings(), 5).expect("binner");
        let params = FscParams {
            resolution: 4.0,
            ..FscParams::default()
        };
        let estimator =
            FscEstimator::new(&observed, &reference, &binner, params).expect("estimator");
        let result = estimator.analyze().expect("analysis");
        assert_eq!(result.rmsd, Some(1.0));
        assert!(result.effective_b.is_some());
    }

    #[test]
    fn incomplete_data_skips_scaling_with_unit_curve() {
        let observed = synthetic_coefficients(40, |i| 50.0 - i as f64);
        let reference = ReferenceSource::ModelBased {
            model: observed.clone(),
        };
        let binner = ResolutionBinner::setup(observed.d_spacings(), 4).expect("binner");
        let params = FscParams {
            fraction_complete: Some(0.01),
            min_fraction_complete: 0.05,
            ..FscParams::default()
        };
        let estimator =
            FscEstimator::new(&observed, &reference, &binner, params).expect("estimator");
        let result = estimator.analyze().expect("analysis");
        assert_eq!(result.target_scale_factors, vec![1.0; 4]);
        assert_eq!(result.fraction_complete, 0.01);
        // the falloff fits are still recorded on the skipped analysis
        assert!(result.effective_b.is_some());
        assert!(result.effective_b_f_obs.is_some());
        assert!(result.b_zero.is_some());
    }

    fn with_phase_offsets(base: &MapCoefficients, phases: Vec<f64>) -> MapCoefficients {
        MapCoefficients::new(
            base.indices().to_vec(),
            base.amplitudes().to_vec(),
            phases,
            base.d_spacings().to_vec(),
        )
        .expect("coefficients")
    }

    #[test]
    fn fraction_complete_follows_model_error_decay() {
        // a uniform 60 degree phase error gives cc = 0.5 in every shell;
        // with rmsd fixed the completeness estimate is fully determined
        let observed = synthetic_coefficients(60, |i| 100.0 - i as f64);
        let shifted: Vec<f64> = observed.phases_deg().iter().map(|p| p + 60.0).collect();
        let model = with_phase_offsets(&observed, shifted);
        let reference = ReferenceSource::ModelBased { model };
        let binner = ResolutionBinner::setup(observed.d_spacings(), 6).expect("binner");
        let params = FscParams {
            rmsd: Some(0.5),
            ..FscParams::default()
        };
        let estimator =
            FscEstimator::new(&observed, &reference, &binner, params).expect("estimator");
        let result = estimator.analyze().expect("analysis");

        let b_eff = 8.0 * std::f64::consts::PI * 0.5 * 0.5;
        let mut expected_max: f64 = 0.0;
        for shell in binner.shells() {
            let possible = (0.5 * (shell.sthol2() * b_eff).min(20.0).exp()).clamp(0.0, 1.0);
            expected_max = expected_max.max(possible);
        }
        assert!(
            (result.fraction_complete - expected_max * expected_max).abs() < 1.0e-6,
            "fraction_complete {} vs expected {}",
            result.fraction_complete,
            expected_max * expected_max
        );
    }

    #[test]
    fn abandoned_baseline_rescale_drops_tail_pinning() {
        let observed = synthetic_coefficients(60, |i| 100.0 - i as f64);
        let binner = ResolutionBinner::setup(observed.d_spacings(), 6).expect("binner");
        // phase errors in the two highest shells push cc down to ~0.1 there
        let mut phases = observed.phases_deg().to_vec();
        let delta = 0.1_f64.acos().to_degrees();
        for shell in [4usize, 5] {
            for &member in binner.selection(shell) {
                phases[member] += delta;
            }
        }
        let second = with_phase_offsets(&observed, phases);
        let reference = ReferenceSource::HalfDatasets {
            first: observed.clone(),
            second,
        };
        let params = FscParams {
            scale_using_last: Some(2),
            max_cc_for_rescale: 0.05,
            ..FscParams::default()
        };
        let estimator =
            FscEstimator::new(&observed, &reference, &binner, params).expect("estimator");
        let result = estimator.analyze().expect("analysis");

        // the tail baseline (~0.1) exceeds the rescale limit, so rescaling
        // is abandoned and the refit tail must not be forced to zero
        assert!(
            *result.cc_list.last().expect("shells") > 1.0e-6,
            "tail cc {:?} should stay positive",
            result.cc_list.last()
        );
    }

    #[test]
    fn fitted_tail_decays_in_inverse_d_units() {
        let observed = synthetic_coefficients(70, |i| 90.0 - i as f64);
        let binner = ResolutionBinner::setup(observed.d_spacings(), 7).expect("binner");
        let s: Vec<f64> = binner
            .shells()
            .iter()
            .map(|shell| 1.0 / shell.d_mean())
            .collect();

        // tail correlations placed exactly on an exponential in 1/d whose
        // decay rate sits on the refit search grid, so the refit can
        // reproduce them without residual
        let mut targets = vec![0.9, 0.85, 0.8, 0.75];
        targets.push(0.15);
        targets.push(0.15 * (-59.0 * (s[5] - s[4])).exp());
        targets.push(0.15 * (-59.0 * (s[6] - s[4])).exp());

        let mut phases = observed.phases_deg().to_vec();
        for (shell_index, target) in targets.iter().enumerate() {
            let delta = target.acos().to_degrees();
            for &member in binner.selection(shell_index) {
                phases[member] += delta;
            }
        }
        let second = with_phase_offsets(&observed, phases);
        let reference = ReferenceSource::HalfDatasets {
            first: observed.clone(),
            second,
        };
        let estimator =
            FscEstimator::new(&observed, &reference, &binner, FscParams::default())
                .expect("estimator");
        let result = estimator.analyze().expect("analysis");

        for shell in 4..7 {
            let expected = (2.0 * targets[shell] / (1.0 + targets[shell])).sqrt();
            assert!(
                (result.cc_list[shell] - expected).abs() < 1.0e-6,
                "shell {shell}: cc* {} vs expected {expected}",
                result.cc_list[shell]
            );
        }
    }

    #[test]
    fn mismatched_reference_length_is_rejected() {
        let observed = synthetic_coefficients(20, |i| 30.0 - i as f64);
        let short = synthetic_coefficients(10, |i| 30.0 - i as f64);
        let reference = ReferenceSource::ModelBased { model: short };
        let binner = ResolutionBinner::setup(observed.d_spacings(), 2).expect("binner");
        let error = FscEstimator::new(&observed, &reference, &binner, FscParams::default())
            .expect_err("length mismatch");
        assert_eq!(
            error,
            FscError::LengthMismatch {
                field: "model",
                expected: 20,
                actual: 10
            }
        );
    }

    #[test]
    fn directional_analysis_requires_directions() {
        let observed = synthetic_coefficients(20, |i| 30.0 - i as f64);
        let reference = ReferenceSource::HalfDatasets {
            first: observed.clone(),
            second: observed.clone(),
        };
        let binner = ResolutionBinner::setup(observed.d_spacings(), 2).expect("binner");
        let estimator =
            FscEstimator::new(&observed, &reference, &binner, FscParams::default())
                .expect("estimator");
        let cell = crate::domain::UnitCellView::orthorhombic(50.0, 50.0, 50.0);
        let error = estimator
            .analyze_directions(&cell, &super::LeastSquaresAniso)
            .expect_err("no directions");
        assert_eq!(error, FscError::NoDirections);
    }

    #[test]
    fn weighted_correlation_of_identical_sets_is_one() {
        let coeffs = synthetic_coefficients(10, |i| 10.0 + i as f64);
        let members: Vec<usize> = (0..10).collect();
        let cc = weighted_map_correlation(&coeffs, &coeffs, &members, None);
        assert!((cc - 1.0).abs() < 1.0e-12);
    }

    #[test]
    fn weighted_rms_ignores_zero_weight_members() {
        let amplitudes = [3.0, 1000.0, 3.0];
        let members = [0, 1, 2];
        let weights = [1.0, 0.0, 1.0];
        let rms = weighted_rms(&amplitudes, &members, Some(&weights));
        assert!((rms - 3.0).abs() < 1.0e-12);
    }

    #[test]
    fn resolution_for_aniso_tracks_signal_collapse() {
        let make = |rms_fo: Vec<f64>, d_min: Vec<f64>| DirectionScaling {
            direction: DirectionVector::normalized(1.0, 0.0, 0.0).expect("direction"),
            scaling: ScalingResultBuilder::new(AnalysisKind::HalfDataset, 3.0)
                .shell_geometry(vec![0.0; rms_fo.len()], d_min)
                .correlation_curves(vec![1.0; rms_fo.len()], rms_fo)
                .build(),
        };
        let strong = make(vec![100.0, 50.0, 20.0], vec![8.0, 5.0, 3.0]);
        let weak = make(vec![100.0, 4.0, 1.0], vec![8.0, 5.0, 3.0]);
        assert_eq!(resolution_for_aniso(&[strong.clone()]), None);
        assert_eq!(resolution_for_aniso(&[strong, weak]), Some(5.0));
    }
}
