//! Joint estimation: one filter over transients and health together
//!
//! The hidden vector is the transient state followed by the updatable health
//! components, so the filter tracks the cross-covariance between the two.
//! When the two differ by orders of magnitude the dual strategy is usually
//! better conditioned.

use std::sync::Arc;

use nalgebra::{DMatrix, RealField};
use tracing::info;

use super::{
    check_noise, partial_normalizer, EstimatorCore, EstimatorSetup, OnlineEstimator,
};
use crate::filters::ukf::{UkfParams, UnscentedKalmanFilter};
use crate::models::{CellContext, CellModel, Conversions, JointModelWrapper, ModelWrapper};
use crate::types::distribution::MultivariateGaussian;
use crate::Result;

/// Estimates transients and health parameters with a single UKF.
#[derive(Debug, Clone)]
pub struct JointEstimator<T: RealField + Copy, M> {
    core: EstimatorCore<T>,
    filter: UnscentedKalmanFilter<T, JointModelWrapper<T, M>>,
}

impl<T: RealField + Copy, M: CellModel<T>> JointEstimator<T, M> {
    /// Wraps an already configured filter.
    pub fn new(filter: UnscentedKalmanFilter<T, JointModelWrapper<T, M>>) -> Result<Self> {
        let wrapper = filter.model();
        let core = EstimatorCore::new(wrapper.context(), wrapper.updatable().to_vec())?;
        Ok(Self { core, filter })
    }

    /// Builds the wrapper and the filter from raw, model-coordinate settings.
    ///
    /// Every matrix is checked against the model's dimensions before the
    /// filter is created.
    pub fn initialize_unscented_kalman_filter(
        model: Arc<M>,
        setup: EstimatorSetup<T>,
        params: UkfParams<T>,
    ) -> Result<Self> {
        let context = CellContext::new(
            model,
            &setup.initial_transients,
            &setup.initial_health,
            &setup.initial_inputs,
        )?;
        let updatable = setup.updatable.resolve(&setup.initial_health)?;
        let num_transients = setup.initial_transients.len();
        let num_health = setup.initial_health.num_components(&updatable)?;
        let num_outputs = context.num_outputs();

        check_noise(
            setup.transient_process_noise.as_ref(),
            num_transients,
            "transient process noise",
        )?;
        check_noise(setup.asoh_process_noise.as_ref(), num_health, "health process noise")?;
        check_noise(setup.sensor_noise.as_ref(), num_outputs, "sensor noise")?;

        let conversions = match setup.asoh_normalizer(&updatable)? {
            Some(scale) => {
                Conversions::with_hidden(Arc::new(partial_normalizer(num_transients, &scale)))
            }
            None => Conversions::default(),
        };
        let wrapper = JointModelWrapper::new(context, updatable, conversions)?;

        let prior = setup
            .transient_prior()?
            .combine_with(&setup.asoh_prior(wrapper.updatable())?);
        let initial_hidden = prior.convert(wrapper.hidden_conversion(), true)?;
        let initial_controls = setup
            .initial_controls()?
            .convert(wrapper.control_conversion(), true)?;

        let process_noise = joint_process_noise(
            setup.transient_process_noise.as_ref(),
            setup.asoh_process_noise.as_ref(),
            num_transients,
            num_health,
        )
        .map(|noise| wrapper.hidden_conversion().inverse_transform_covariance(&noise))
        .transpose()?;
        let sensor_noise = setup
            .sensor_noise
            .as_ref()
            .map(|noise| wrapper.output_conversion().inverse_transform_covariance(noise))
            .transpose()?;

        info!(
            transients = num_transients,
            health_components = num_health,
            outputs = num_outputs,
            normalized = setup.normalize_asoh,
            "initializing joint estimator"
        );

        let filter = UnscentedKalmanFilter::new(
            wrapper,
            initial_hidden,
            initial_controls,
            process_noise,
            sensor_noise,
            params,
        )?;
        Self::new(filter)
    }

    #[inline]
    pub fn filter(&self) -> &UnscentedKalmanFilter<T, JointModelWrapper<T, M>> {
        &self.filter
    }
}

/// Block-diagonal process noise over the joint hidden vector. Returns `None`
/// when neither part is given.
fn joint_process_noise<T: RealField + Copy>(
    transient: Option<&DMatrix<T>>,
    asoh: Option<&DMatrix<T>>,
    num_transients: usize,
    num_health: usize,
) -> Option<DMatrix<T>> {
    if transient.is_none() && asoh.is_none() {
        return None;
    }
    let n = num_transients + num_health;
    let mut noise = DMatrix::zeros(n, n);
    if let Some(q) = transient {
        noise.view_mut((0, 0), (num_transients, num_transients)).copy_from(q);
    }
    if let Some(q) = asoh {
        noise
            .view_mut((num_transients, num_transients), (num_health, num_health))
            .copy_from(q);
    }
    Some(noise)
}

impl<T: RealField + Copy, M: CellModel<T>> OnlineEstimator<T> for JointEstimator<T, M> {
    fn core(&self) -> &EstimatorCore<T> {
        &self.core
    }

    fn step(
        &mut self,
        controls: &MultivariateGaussian<T>,
        measurements: &MultivariateGaussian<T>,
    ) -> Result<(MultivariateGaussian<T>, MultivariateGaussian<T>)> {
        let wrapper = self.filter.model();
        let controls = controls.convert(wrapper.control_conversion(), true)?;
        let measurements = measurements.convert(wrapper.output_conversion(), true)?;

        let (hidden, output) = self.filter.step(&controls, &measurements)?;

        let wrapper = self.filter.model();
        Ok((
            hidden.convert(wrapper.hidden_conversion(), false)?,
            output.convert(wrapper.output_conversion(), false)?,
        ))
    }

    fn state(&self) -> Result<MultivariateGaussian<T>> {
        self.filter
            .hidden()
            .convert(self.filter.model().hidden_conversion(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimators::UpdatableSelection;
    use crate::types::containers::{HealthParameters, Quantities};
    use crate::Error;
    use nalgebra::{dmatrix, dvector};

    /// Integrates current into charge; voltage is charge + r0 * current.
    struct Integrator;

    impl CellModel<f64> for Integrator {
        fn update_transient_state(
            &self,
            previous_inputs: &Quantities<f64>,
            new_inputs: &Quantities<f64>,
            transients: &Quantities<f64>,
            _health: &HealthParameters<f64>,
        ) -> Result<Quantities<f64>> {
            let dt = new_inputs.values()[(0, 0)] - previous_inputs.values()[(0, 0)];
            let current = new_inputs.values()[(0, 1)];
            transients.make_copy(transients.values().map(|q| q + current * dt))
        }

        fn calculate_outputs(
            &self,
            inputs: &Quantities<f64>,
            transients: &Quantities<f64>,
            health: &HealthParameters<f64>,
        ) -> Result<Quantities<f64>> {
            let current = inputs.values()[(0, 1)];
            let r0 = health.parameter("r0").cloned().unwrap_or_else(|| dmatrix![0.0]);
            let q = transients.values();
            let batch = q.nrows().max(r0.nrows());
            let values = DMatrix::from_fn(batch, 1, |i, _| {
                q[(i.min(q.nrows() - 1), 0)] + r0[(i.min(r0.nrows() - 1), 0)] * current
            });
            Quantities::new(vec!["voltage".into()], values)
        }
    }

    fn setup() -> EstimatorSetup<f64> {
        EstimatorSetup::new(
            Quantities::from_slice(&["charge"], &[1.0]).unwrap(),
            HealthParameters::new().with_parameter("r0", &[0.1], true).unwrap(),
            Quantities::from_slice(&["time", "current"], &[0.0, 1.0]).unwrap(),
            dmatrix![0.1],
            dmatrix![1e-3],
        )
        .with_transient_process_noise(dmatrix![1e-6])
        .with_asoh_process_noise(dmatrix![1e-8])
        .with_sensor_noise(dmatrix![1e-4])
    }

    fn build(setup: EstimatorSetup<f64>) -> Result<JointEstimator<f64, Integrator>> {
        JointEstimator::initialize_unscented_kalman_filter(
            Arc::new(Integrator),
            setup,
            UkfParams::default(),
        )
    }

    #[test]
    fn test_joint_dimensions() {
        let estimator = build(setup()).unwrap();
        assert_eq!(estimator.num_state_dimensions(), 2);
        assert_eq!(estimator.num_transients(), 1);
        assert_eq!(estimator.num_output_dimensions(), 1);
        assert_eq!(estimator.state_names(), &["charge".to_string(), "r0".to_string()]);
        assert_eq!(estimator.filter().process_noise()[(1, 1)], 1e-8);
    }

    #[test]
    fn test_joint_step_tracks_truth() {
        let mut estimator = build(setup()).unwrap();

        // True system: charge starts at 1.2, r0 = 0.1, current alternates
        let mut charge = 1.2;
        for k in 1..=40 {
            let current = if k % 2 == 0 { 1.0 } else { -0.5 };
            charge += current * 1.0;
            let controls = MultivariateGaussian::deterministic(dvector![k as f64, current]);
            let voltage = charge + 0.1 * current;
            let measurement = MultivariateGaussian::deterministic(dvector![voltage]);
            let (state, output) = estimator.step(&controls, &measurement).unwrap();
            assert_eq!(state.dimension(), 2);
            assert_eq!(output.dimension(), 1);
        }

        let (transients, health) = estimator.get_estimated_state().unwrap();
        assert!((transients.to_vector()[0] - charge).abs() < 0.05);
        assert!((health.parameter("r0").unwrap()[(0, 0)] - 0.1).abs() < 0.05);
    }

    #[test]
    fn test_normalized_asoh_reports_model_units() {
        let normalized = setup().with_normalized_asoh(true);
        let estimator = build(normalized).unwrap();

        // Inside the filter r0 is relative to its initial value
        let hidden = estimator.filter().hidden();
        assert!((hidden.get_mean()[1] - 1.0).abs() < 1e-12);
        assert!((hidden.get_covariance()[(1, 1)] - 1e-3 / 0.01).abs() < 1e-9);

        let state = estimator.state().unwrap();
        assert!((state.get_mean()[1] - 0.1).abs() < 1e-12);
        assert!((state.get_covariance()[(1, 1)] - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_without_updatable_health() {
        let transient_only = setup().with_updatable(UpdatableSelection::None);
        let mut estimator = build(EstimatorSetup {
            covariance_asoh: DMatrix::zeros(0, 0),
            asoh_process_noise: None,
            ..transient_only
        })
        .unwrap();

        assert_eq!(estimator.num_state_dimensions(), 1);
        let (state, _) = estimator
            .step(
                &MultivariateGaussian::deterministic(dvector![1.0, 1.0]),
                &MultivariateGaussian::deterministic(dvector![2.1]),
            )
            .unwrap();
        assert_eq!(state.dimension(), 1);
    }

    #[test]
    fn test_construction_rejects_bad_covariances() {
        let bad_transient = EstimatorSetup {
            covariance_transient: DMatrix::identity(2, 2),
            ..setup()
        };
        assert!(matches!(build(bad_transient), Err(Error::DimensionMismatch { .. })));

        let bad_sensor = setup().with_sensor_noise(DMatrix::identity(2, 2));
        assert!(build(bad_sensor).is_err());

        let unknown = setup().with_updatable(UpdatableSelection::named(&["c0"]));
        assert!(matches!(build(unknown), Err(Error::UnknownParameter(_))));
    }
}
