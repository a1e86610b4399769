//! End-to-end scaling scenarios through the public API.

use sharpen_core::{
    apply_target_scale_factors, FscEstimator, FscParams, MapCoefficients, MillerIndex,
    ReferenceSource, ResolutionBinner,
};

fn coefficients_with_falloff(count: usize, b: f64) -> MapCoefficients {
    let indices: Vec<MillerIndex> = (0..count)
        .map(|i| MillerIndex([1 + i as i32, (i % 4) as i32, (i % 3) as i32]))
        .collect();
    let d_spacings: Vec<f64> = (0..count)
        .map(|i| 10.0 - 7.5 * (i as f64) / (count as f64))
        .collect();
    let amplitudes: Vec<f64> = d_spacings
        .iter()
        .map(|d| 200.0 * (-b * 0.25 / (d * d)).exp())
        .collect();
    let phases: Vec<f64> = (0..count).map(|i| (17.0 * i as f64) % 360.0).collect();
    MapCoefficients::new(indices, amplitudes, phases, d_spacings).expect("coefficients")
}

#[test]
fn self_correlated_half_maps_yield_flattening_scale_curve() {
    let observed = coefficients_with_falloff(120, 60.0);
    let reference = ReferenceSource::HalfDatasets {
        first: observed.clone(),
        second: observed.clone(),
    };
    let binner = ResolutionBinner::setup(observed.d_spacings(), 10).expect("binner");
    let estimator = FscEstimator::new(&observed, &reference, &binner, FscParams::default())
        .expect("estimator");
    let result = estimator.analyze().expect("analysis");

    assert_eq!(result.n_shells(), 10);
    for cc in &result.cc_list {
        assert!((cc - 1.0).abs() < 1.0e-9);
    }
    // with perfect CC* the scale curve is 1/rms_fo up to one overall
    // normalization, so every shell is scaled to the same signal level
    let products: Vec<f64> = result
        .target_scale_factors
        .iter()
        .zip(&result.rms_fo_list)
        .map(|(scale, rms_fo)| scale * rms_fo)
        .collect();
    for product in &products {
        assert!((product - products[0]).abs() < 1.0e-9 * products[0]);
    }

    // applying the curve flattens the falloff and keeps amplitudes finite
    let scaled =
        apply_target_scale_factors(&observed, &binner, &result.target_scale_factors)
            .expect("scaled");
    let before = scaled.starting_b_iso.expect("starting b");
    let after = scaled.final_b_iso.expect("final b");
    assert!(after < before, "flattening should sharpen: {before} -> {after}");
    for amplitude in scaled.coefficients.amplitudes() {
        assert!(amplitude.is_finite());
    }
}

#[test]
fn zero_half_map_degrades_without_crashing() {
    let observed = coefficients_with_falloff(80, 40.0);
    let zero = observed
        .with_amplitudes(vec![0.0; observed.len()])
        .expect("zero map");
    let reference = ReferenceSource::HalfDatasets {
        first: observed.clone(),
        second: zero,
    };
    let binner = ResolutionBinner::setup(observed.d_spacings(), 8).expect("binner");
    let estimator = FscEstimator::new(&observed, &reference, &binner, FscParams::default())
        .expect("estimator");
    let result = estimator.analyze().expect("analysis");

    for cc in &result.cc_list {
        assert!(cc.is_finite());
    }
    assert!(result.low_res_cc.abs() < 1.0e-9);
    let scaled =
        apply_target_scale_factors(&observed, &binner, &result.target_scale_factors)
            .expect("scaled");
    for amplitude in scaled.coefficients.amplitudes() {
        assert!(amplitude.is_finite());
    }
}

#[test]
fn model_based_scaling_flattens_amplitude_falloff() {
    // observed decays faster than the model; scaling toward the model
    // should reduce the Wilson B of the observed set
    let observed = coefficients_with_falloff(120, 150.0);
    let model = coefficients_with_falloff(120, 30.0);
    let reference = ReferenceSource::ModelBased { model };
    let binner = ResolutionBinner::setup(observed.d_spacings(), 10).expect("binner");
    let params = FscParams {
        resolution: 3.0,
        equalize_power: false,
        ..FscParams::default()
    };
    let estimator =
        FscEstimator::new(&observed, &reference, &binner, params).expect("estimator");
    let result = estimator.analyze().expect("analysis");
    assert!(result.has_scale_factors());

    let scaled =
        apply_target_scale_factors(&observed, &binner, &result.target_scale_factors)
            .expect("scaled");
    let before = scaled.starting_b_iso.expect("starting b");
    let after = scaled.final_b_iso.expect("final b");
    assert!(
        after < before,
        "scaling should sharpen: before {before}, after {after}"
    );
}

#[test]
fn scaling_result_round_trips_through_json() {
    let observed = coefficients_with_falloff(60, 50.0);
    let reference = ReferenceSource::HalfDatasets {
        first: observed.clone(),
        second: observed.clone(),
    };
    let binner = ResolutionBinner::setup(observed.d_spacings(), 6).expect("binner");
    let estimator = FscEstimator::new(&observed, &reference, &binner, FscParams::default())
        .expect("estimator");
    let result = estimator.analyze().expect("analysis");

    let json = serde_json::to_string(&result).expect("serialize");
    let restored: sharpen_core::ScalingResult =
        serde_json::from_str(&json).expect("deserialize");
    assert_eq!(restored, result);
}
