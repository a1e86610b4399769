//! Resolution-dependent sharpening and scaling of map coefficients.
//!
//! The crate estimates shell-by-shell correlation between an observed map
//! and a reference (an atomic model, an external map, or a pair of half
//! maps), converts the fitted correlation curves into per-shell amplitude
//! scale factors, applies them back onto the coefficients, and optionally
//! refines a compact three-parameter B-factor model against a map quality
//! score.

pub mod binning;
pub mod domain;
pub mod fsc;
pub mod numerics;
pub mod refinery;
pub mod scaling;
pub mod sharpen;

pub use binning::{BinningError, ResolutionBinner, Shell};
pub use domain::{
    AnalysisKind, BFactorModel, DirectionVector, DomainError, MapCoefficients, MapSynthesis,
    MillerIndex, RealSpaceMap, ReferenceSource, ScalingResult, ScalingResultBuilder,
    SurfaceAreaParams, SurfaceAreaScorer, UnitCellView,
};
pub use fsc::{
    resolution_for_aniso, AnisotropyModel, DirectionScaling, DirectionalScaling, FscError,
    FscEstimator, FscParams, LeastSquaresAniso,
};
pub use refinery::{
    run_refinement, RefineryError, RefineryParams, Refinery, RefinementOutcome, ScoringMode,
};
pub use scaling::{
    optimize_b_eff, quasi_normalize_amplitudes, target_scale_factors, ScalingError,
    TargetScaleInputs, TargetScaleOutcome,
};
pub use sharpen::{
    adjust_amplitudes_linear, apply_target_scale_factors, effective_b_values, kurtosis,
    sharpened_map, wilson_b_iso, EffectiveBValues, ScaledCoefficients, SharpenError,
};
