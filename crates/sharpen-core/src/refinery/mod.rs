//! Local refinement of the three-parameter B-factor model against a map
//! quality score.

use tracing::{debug, info};

use crate::binning::ResolutionBinner;
use crate::domain::{
    BFactorModel, MapCoefficients, MapSynthesis, SurfaceAreaParams, SurfaceAreaScorer,
};
use crate::numerics::{
    numerical_gradient, BfgsLineSearch, Minimizer, TerminationReason, EPS_DENOMINATOR,
};
use crate::scaling::quasi_normalize_amplitudes;
use crate::sharpen::{adjust_amplitudes_linear, kurtosis};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RefineryError {
    #[error("adjusted surface area scoring requires a solvent fraction in (0, 1), got {value:?}")]
    MissingSolventFraction { value: Option<f64> },
    #[error("adjusted surface area scoring requires a surface area scorer")]
    MissingSurfaceScorer,
    #[error(
        "model match target curves must be non-empty and equal length, \
         got {sthol2} sthol2 values and {scale_factors} scale factors"
    )]
    InvalidMatchTarget { sthol2: usize, scale_factors: usize },
    #[error("resolution must be finite and > 0, got {value}")]
    InvalidResolution { value: f64 },
    #[error(transparent)]
    Scaling(#[from] crate::scaling::ScalingError),
    #[error(transparent)]
    Binning(#[from] crate::binning::BinningError),
}

/// How a candidate sharpening is scored. Every variant names its own
/// required parameters so an incomplete configuration cannot be
/// constructed past [`Refinery::new`].
#[derive(Debug, Clone)]
pub enum ScoringMode {
    /// Fourth moment of the sharpened map.
    Kurtosis,
    /// Solvent-flatness score from the surface-area collaborator.
    AdjustedSurfaceArea {
        solvent_fraction: Option<f64>,
        region_weight: f64,
        sa_percent: f64,
        fraction_occupied: f64,
        max_regions_to_test: usize,
        wrapping: bool,
    },
    /// Match the B-model's scale curve to a target curve from a scaling
    /// analysis. No map synthesis involved.
    ModelMatch {
        target_sthol2: Vec<f64>,
        target_scale_factors: Vec<f64>,
    },
}

impl ScoringMode {
    pub fn adjusted_surface_area_defaults(solvent_fraction: f64) -> Self {
        Self::AdjustedSurfaceArea {
            solvent_fraction: Some(solvent_fraction),
            region_weight: 20.0,
            sa_percent: 30.0,
            fraction_occupied: 0.2,
            max_regions_to_test: 30,
            wrapping: false,
        }
    }

}

enum ValidatedMode {
    Kurtosis,
    AdjustedSurfaceArea(SurfaceAreaParams),
    ModelMatch {
        target_sthol2: Vec<f64>,
        target_scale_factors: Vec<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct RefineryParams {
    pub resolution: f64,
    pub d_min_ratio: f64,
    /// Finite-difference step; defaults per scoring mode when `None`.
    pub eps: Option<f64>,
    pub n_bins: usize,
    /// Coordinate error folded into the model-match curve; defaults to
    /// `resolution / 3`.
    pub rmsd: Option<f64>,
    /// Also try the analysis on quasi-normalized amplitudes.
    pub quasi_normalize: bool,
    pub set_to_minimum: f64,
    pub map_shape: [usize; 3],
}

impl Default for RefineryParams {
    fn default() -> Self {
        Self {
            resolution: 3.0,
            d_min_ratio: 0.833,
            eps: None,
            n_bins: 20,
            rmsd: None,
            quasi_normalize: true,
            set_to_minimum: 0.01,
            map_shape: [32, 32, 32],
        }
    }
}

/// Best result of a refinement run. The score is the negated residual, so
/// higher is better.
#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    pub b_model: BFactorModel,
    pub score: f64,
    /// Whether the winning run started from quasi-normalized amplitudes.
    pub quasi_normalized: bool,
    pub coefficients: MapCoefficients,
    pub termination: TerminationReason,
    pub iterations: usize,
}

pub struct Refinery<'a> {
    mode: ValidatedMode,
    synthesis: &'a dyn MapSynthesis,
    surface_scorer: Option<&'a dyn SurfaceAreaScorer>,
    minimizer: &'a dyn Minimizer,
    params: RefineryParams,
}

const RESTRAINT_WEIGHT: f64 = 100.0;

impl<'a> Refinery<'a> {
    pub fn new(
        mode: ScoringMode,
        synthesis: &'a dyn MapSynthesis,
        surface_scorer: Option<&'a dyn SurfaceAreaScorer>,
        minimizer: &'a dyn Minimizer,
        params: RefineryParams,
    ) -> Result<Self, RefineryError> {
        if !params.resolution.is_finite() || params.resolution <= 0.0 {
            return Err(RefineryError::InvalidResolution {
                value: params.resolution,
            });
        }
        let mode = match mode {
            ScoringMode::Kurtosis => ValidatedMode::Kurtosis,
            ScoringMode::AdjustedSurfaceArea {
                solvent_fraction,
                region_weight,
                sa_percent,
                fraction_occupied,
                max_regions_to_test,
                wrapping,
            } => {
                let value = solvent_fraction
                    .filter(|fraction| fraction.is_finite() && *fraction > 0.0 && *fraction < 1.0)
                    .ok_or(RefineryError::MissingSolventFraction {
                        value: solvent_fraction,
                    })?;
                if surface_scorer.is_none() {
                    return Err(RefineryError::MissingSurfaceScorer);
                }
                ValidatedMode::AdjustedSurfaceArea(SurfaceAreaParams {
                    solvent_fraction: value,
                    region_weight,
                    sa_percent,
                    fraction_occupied,
                    max_regions_to_test,
                    wrapping,
                })
            }
            ScoringMode::ModelMatch {
                target_sthol2,
                target_scale_factors,
            } => {
                if target_sthol2.is_empty() || target_sthol2.len() != target_scale_factors.len() {
                    return Err(RefineryError::InvalidMatchTarget {
                        sthol2: target_sthol2.len(),
                        scale_factors: target_scale_factors.len(),
                    });
                }
                ValidatedMode::ModelMatch {
                    target_sthol2,
                    target_scale_factors,
                }
            }
        };
        Ok(Self {
            mode,
            synthesis,
            surface_scorer,
            minimizer,
            params,
        })
    }

    /// Residual for one candidate B model: negated quality score plus the
    /// soft restraints discouraging sharpening reversal (`b2 > b1`) and
    /// positive high-resolution increments (`b3 > 0`).
    pub fn residual(&self, model: &BFactorModel, coefficients: &MapCoefficients) -> f64 {
        let base = match &self.mode {
            ValidatedMode::Kurtosis => match adjust_amplitudes_linear(
                coefficients,
                model,
                self.params.resolution,
                self.params.d_min_ratio,
            ) {
                Ok(adjusted) => {
                    let map = self.synthesis.synthesize(&adjusted, self.params.map_shape);
                    -kurtosis(&map.data)
                }
                Err(_) => f64::INFINITY,
            },
            ValidatedMode::AdjustedSurfaceArea(surface_params) => match adjust_amplitudes_linear(
                coefficients,
                model,
                self.params.resolution,
                self.params.d_min_ratio,
            ) {
                Ok(adjusted) => {
                    let map = self.synthesis.synthesize(&adjusted, self.params.map_shape);
                    match self.surface_scorer {
                        Some(scorer) => -scorer.adjusted_surface_area(&map, surface_params),
                        None => f64::INFINITY,
                    }
                }
                Err(_) => f64::INFINITY,
            },
            ValidatedMode::ModelMatch {
                target_sthol2,
                target_scale_factors,
            } => self.calculate_match(model, target_sthol2, target_scale_factors),
        };

        let mut residual = base;
        if model.b2() > model.b1() {
            residual += (model.b2() - model.b1()) * RESTRAINT_WEIGHT;
        }
        if model.b3() > 0.0 {
            residual += model.b3() * RESTRAINT_WEIGHT;
        }
        residual
    }

    /// Mean squared deviation between the target scale curve and the
    /// mean-matched B-model curve. The error model `exp(-sthol2·b_eff)`
    /// with `b_eff = 8π·rmsd²` damps the model curve; incomplete data is
    /// not modeled here and `fraction_complete` is deliberately ignored.
    fn calculate_match(
        &self,
        model: &BFactorModel,
        target_sthol2: &[f64],
        target_scale_factors: &[f64],
    ) -> f64 {
        let rmsd = self
            .params
            .rmsd
            .unwrap_or(self.params.resolution / 3.0);
        let b_eff = 8.0 * std::f64::consts::PI * rmsd * rmsd;
        let sthol2_2 = 0.25 / (self.params.resolution * self.params.resolution);
        let sthol2_1 = 0.5 * sthol2_2;
        let d_min = self.params.d_min_ratio * self.params.resolution;
        let sthol2_3 = 0.25 / (d_min * d_min);

        let mut calc = Vec::with_capacity(target_sthol2.len());
        for &sthol2 in target_sthol2 {
            let b3_use = model.b2() + model.b3();
            let value = if sthol2 > sthol2_2 {
                model.b2() + (sthol2 - sthol2_2) * (b3_use - model.b2()) / (sthol2_3 - sthol2_2)
            } else if sthol2 > sthol2_1 {
                model.b1() + (sthol2 - sthol2_1) * (model.b2() - model.b1()) / (sthol2_2 - sthol2_1)
            } else {
                sthol2 * model.b1() / sthol2_1
            };
            calc.push(value.clamp(-20.0, 20.0).exp() * (-(sthol2 * b_eff).min(20.0)).exp());
        }

        let calc_mean = calc.iter().sum::<f64>() / calc.len() as f64;
        let target_mean = target_scale_factors.iter().sum::<f64>() / calc.len() as f64;
        let rescale = target_mean / calc_mean.max(EPS_DENOMINATOR);
        let mut sum_sq = 0.0;
        for (calculated, target) in calc.iter().zip(target_scale_factors) {
            let delta = calculated * rescale - target;
            sum_sq += delta * delta;
        }
        sum_sq / calc.len() as f64
    }

    fn starting_outcome(
        &self,
        coefficients: MapCoefficients,
        quasi_normalized: bool,
    ) -> RefinementOutcome {
        let residual = self.residual(&BFactorModel::ZERO, &coefficients);
        RefinementOutcome {
            b_model: BFactorModel::ZERO,
            score: -residual,
            quasi_normalized,
            coefficients,
            termination: TerminationReason::Converged,
            iterations: 0,
        }
    }

    /// Refine from the zero model, optionally repeating the whole run on
    /// quasi-normalized amplitudes, and keep the best scoring result of
    /// the starting point and every refined candidate.
    pub fn run(&self, coefficients: &MapCoefficients) -> Result<RefinementOutcome, RefineryError> {
        let mut candidates: Vec<(MapCoefficients, bool)> =
            vec![(coefficients.clone(), false)];
        if self.params.quasi_normalize {
            let binner = ResolutionBinner::setup(coefficients.d_spacings(), self.params.n_bins)?;
            let normalized = quasi_normalize_amplitudes(
                coefficients,
                &binner,
                false,
                self.params.set_to_minimum,
            )?;
            candidates.push((normalized, true));
        }

        let eps = self.params.eps.unwrap_or_else(|| {
            match &self.mode {
                ValidatedMode::Kurtosis => 0.01,
                _ => 0.5,
            }
        });

        let mut best = self.starting_outcome(coefficients.clone(), false);
        for (candidate, quasi_normalized) in candidates {
            if quasi_normalized {
                consider(&mut best, self.starting_outcome(candidate.clone(), true));
            }

            let mut objective = |x: &[f64]| {
                let model = BFactorModel::from_slice(x);
                let value = self.residual(&model, &candidate);
                let mut residual_only =
                    |point: &[f64]| self.residual(&BFactorModel::from_slice(point), &candidate);
                let gradient = numerical_gradient(&mut residual_only, x, eps);
                (value, gradient)
            };
            let outcome = self
                .minimizer
                .minimize(BFactorModel::ZERO.as_slice(), &mut objective);
            debug!(
                quasi_normalized,
                refined_residual = outcome.f,
                ?outcome.reason,
                "refinement pass finished"
            );
            let refined_model = BFactorModel::from_slice(&outcome.x);
            let refined = match adjust_amplitudes_linear(
                &candidate,
                &refined_model,
                self.params.resolution,
                self.params.d_min_ratio,
            ) {
                Ok(refined) => refined,
                Err(_) => candidate.clone(),
            };
            consider(
                &mut best,
                RefinementOutcome {
                    b_model: refined_model,
                    score: -outcome.f,
                    quasi_normalized,
                    coefficients: refined,
                    termination: outcome.reason,
                    iterations: outcome.iterations,
                },
            );
        }

        info!(
            score = best.score,
            b1 = best.b_model.b1(),
            b2 = best.b_model.b2(),
            b3 = best.b_model.b3(),
            quasi_normalized = best.quasi_normalized,
            "refinement complete"
        );
        Ok(best)
    }
}

fn consider(best: &mut RefinementOutcome, candidate: RefinementOutcome) {
    if candidate.score > best.score {
        *best = candidate;
    }
}

/// Default refinement entry point wiring in the built-in minimizer.
pub fn run_refinement(
    mode: ScoringMode,
    synthesis: &dyn MapSynthesis,
    surface_scorer: Option<&dyn SurfaceAreaScorer>,
    coefficients: &MapCoefficients,
    params: RefineryParams,
) -> Result<RefinementOutcome, RefineryError> {
    let minimizer = BfgsLineSearch::default();
    Refinery::new(mode, synthesis, surface_scorer, &minimizer, params)?.run(coefficients)
}
