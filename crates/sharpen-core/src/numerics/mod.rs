pub mod fitting;
pub mod gradient;
pub mod minimize;

pub use fitting::{
    cc_fit, estimate_cc_star, fit_cc, get_baseline, get_effective_b, get_fitted_cc,
    relative_rms, remove_values_if_necessary, rescale_cc_list, smooth_values, EffectiveBFit,
    FitError, FittedCcOptions,
};
pub use gradient::numerical_gradient;
pub use minimize::{
    BfgsLineSearch, Minimizer, MinimizeOutcome, Termination, TerminationReason,
};

/// Exponent window used throughout the scaling formulas to keep
/// `exp()` terms from overflowing on noisy inputs.
pub const EXP_WINDOW: f64 = 20.0;

/// Floor applied to denominators before division.
pub const EPS_DENOMINATOR: f64 = 1.0e-10;

/// `exp(x)` with `x` clamped into `[-EXP_WINDOW, EXP_WINDOW]`.
pub fn clamped_exp(x: f64) -> f64 {
    x.clamp(-EXP_WINDOW, EXP_WINDOW).exp()
}

fn kahan_add(sum: &mut f64, correction: &mut f64, value: f64) {
    let corrected = value - *correction;
    let next = *sum + corrected;
    *correction = (next - *sum) - corrected;
    *sum = next;
}

pub fn stable_sum(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut correction = 0.0;
    for &value in values {
        kahan_add(&mut sum, &mut correction, value);
    }
    sum
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    stable_sum(values) / values.len() as f64
}

pub fn root_mean_square(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sum = 0.0;
    let mut correction = 0.0;
    for &value in values {
        kahan_add(&mut sum, &mut correction, value * value);
    }
    (sum / values.len() as f64).sqrt()
}

/// Standard deviation of the sample (denominator `n`, not `n-1`).
pub fn sample_standard_deviation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean_value = mean(values);
    let mut sum = 0.0;
    let mut correction = 0.0;
    for &value in values {
        let delta = value - mean_value;
        kahan_add(&mut sum, &mut correction, delta * delta);
    }
    (sum / values.len() as f64).sqrt()
}
