//! Integration tests for dual estimation over a simulated cell

mod common;

use common::{make_timeseries, rint_model, rint_setup};
use healthkf::estimators::{DualEstimator, DualUkfParams, EstimatorSetup, OnlineEstimator};
use healthkf::filters::ukf::{Kappa, UkfParams};
use healthkf::interface::run_online_estimate;
use healthkf::models::ModelWrapper;
use healthkf::types::distribution::MultivariateGaussian;
use healthkf::Error;
use nalgebra::dvector;

fn make_dual(normalize: bool) -> DualEstimator<f64, common::RintModel> {
    DualEstimator::initialize_unscented_kalman_filter(
        rint_model(),
        rint_setup().with_normalized_asoh(normalize),
        DualUkfParams::default(),
    )
    .expect("dual estimator")
}

#[test]
fn test_dual_filter_dimensions() {
    let estimator = make_dual(false);
    assert_eq!(estimator.transient_filter().model().num_hidden_dimensions(), 2);
    assert_eq!(estimator.health_filter().model().num_hidden_dimensions(), 1);
    assert_eq!(estimator.num_state_dimensions(), 3);
    assert_eq!(estimator.num_transients(), 2);
}

#[test]
fn test_dual_state_is_transient_first() {
    let mut estimator = make_dual(true);
    let controls = MultivariateGaussian::deterministic(dvector![30.0, 2.0]);
    let measurement = MultivariateGaussian::deterministic(dvector![3.8]);
    let (state, output) = estimator.step(&controls, &measurement).unwrap();

    assert_eq!(state.dimension(), 3);
    assert_eq!(output.dimension(), 1);

    let transients = estimator.transient_filter().hidden();
    for i in 0..2 {
        assert_eq!(state.get_mean()[i], transients.get_mean()[i]);
    }
    // The health filter works relative to the initial resistance
    let relative = estimator.health_filter().hidden().get_mean()[0];
    assert!((state.get_mean()[2] - relative * 0.045).abs() < 1e-12);

    // Transients and health are uncorrelated in the combined state
    assert_eq!(state.get_covariance()[(0, 2)], 0.0);
    assert_eq!(state.get_covariance()[(2, 1)], 0.0);
}

#[test]
fn test_dual_injection_uses_previous_step() {
    let mut estimator = make_dual(false);
    let controls = MultivariateGaussian::deterministic(dvector![30.0, 2.0]);
    let measurement = MultivariateGaussian::deterministic(dvector![3.8]);

    let (first, _) = estimator.step(&controls, &measurement).unwrap();
    let controls = MultivariateGaussian::deterministic(dvector![60.0, 2.0]);
    estimator.step(&controls, &measurement).unwrap();

    // Contexts hold the posterior of the first step, not the second
    let injected_r0 = estimator
        .transient_filter()
        .model()
        .health()
        .parameter("r0")
        .unwrap()[(0, 0)];
    assert_eq!(injected_r0, first.get_mean()[2]);

    let health_model = estimator.health_filter().model();
    assert_eq!(health_model.transients().to_vector()[0], first.get_mean()[0]);
    assert_eq!(health_model.transients().to_vector()[1], first.get_mean()[1]);
    assert_eq!(health_model.context_inputs().to_vector(), dvector![30.0, 2.0]);
}

#[test]
fn test_dual_interface_shape() {
    let dataset = make_timeseries(150, 50, 11);
    let mut estimator = make_dual(true);

    let results = run_online_estimate(&dataset, &mut estimator, None).unwrap();
    assert_eq!(results.shape(), (150, 2 * 3 + 2));
    assert!(results.iter().all(|v| v.is_finite()));

    let (_, health) = estimator.get_estimated_state().unwrap();
    let r0 = health.parameter("r0").unwrap()[(0, 0)];
    assert!(r0 > 0.0 && r0 < 0.2, "r0 = {}", r0);
    // Parameters outside the selection are untouched
    assert_eq!(health.parameter("q_t").unwrap()[(0, 0)], 10.0);
}

#[test]
fn test_dual_separate_tuning() {
    let params = DualUkfParams {
        transient: UkfParams::default(),
        asoh: UkfParams::new(0.5, 2.0, Kappa::Automatic).unwrap(),
    };
    let estimator =
        DualEstimator::initialize_unscented_kalman_filter(rint_model(), rint_setup(), params)
            .unwrap();
    assert_eq!(estimator.health_filter().params().kappa, Kappa::Automatic);
    assert_eq!(estimator.transient_filter().params().kappa, Kappa::Value(0.0));
}

#[test]
fn test_dual_failed_step_leaves_filters_untouched() {
    // Without sensor noise and without current the health filter cannot see
    // r0, so its output covariance is singular
    let setup = EstimatorSetup {
        sensor_noise: None,
        ..rint_setup()
    };
    let mut estimator = DualEstimator::initialize_unscented_kalman_filter(
        rint_model(),
        setup,
        DualUkfParams::default(),
    )
    .unwrap();
    let measurement = MultivariateGaussian::deterministic(dvector![3.8]);
    estimator
        .step(&MultivariateGaussian::deterministic(dvector![30.0, 2.0]), &measurement)
        .unwrap();

    let transient_hidden = estimator.transient_filter().hidden().clone();
    let transient_controls = estimator.transient_filter().controls().clone();
    let health_hidden = estimator.health_filter().hidden().clone();
    let health_controls = estimator.health_filter().controls().clone();
    let injected_health = estimator.transient_filter().model().health().clone();
    let frozen_transients = estimator.health_filter().model().transients().clone();
    let frozen_inputs = estimator.health_filter().model().context_inputs().clone();

    let result = estimator.step(
        &MultivariateGaussian::deterministic(dvector![60.0, 0.0]),
        &measurement,
    );
    assert!(matches!(result, Err(Error::SingularMatrix(_))));

    assert_eq!(estimator.transient_filter().hidden(), &transient_hidden);
    assert_eq!(estimator.transient_filter().controls(), &transient_controls);
    assert_eq!(estimator.health_filter().hidden(), &health_hidden);
    assert_eq!(estimator.health_filter().controls(), &health_controls);
    assert_eq!(estimator.transient_filter().model().health(), &injected_health);
    assert_eq!(estimator.health_filter().model().transients(), &frozen_transients);
    assert_eq!(estimator.health_filter().model().context_inputs(), &frozen_inputs);

    // The estimator keeps working once the current is back
    let (state, _) = estimator
        .step(&MultivariateGaussian::deterministic(dvector![60.0, 2.0]), &measurement)
        .unwrap();
    assert!(state.get_mean().iter().all(|v| v.is_finite()));
}
