//! Dual estimation: separate filters for transients and health
//!
//! The transient filter sees the health parameters as frozen context and the
//! health filter sees the transients as frozen context. Before each step both
//! contexts are refreshed with the other filter's *previous* posterior. The
//! cross-covariance between the two groups is lost, in exchange each filter
//! only works with quantities of similar magnitude.

use std::sync::Arc;

use nalgebra::{DMatrix, RealField};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{check_noise, EstimatorCore, EstimatorSetup, OnlineEstimator};
use crate::filters::ukf::{UkfParams, UnscentedKalmanFilter};
use crate::models::{
    CellContext, CellModel, Conversions, HealthModelWrapper, ModelWrapper, TransientModelWrapper,
};
use crate::types::containers::{HealthParameters, Quantities};
use crate::types::conversion::LinearConversion;
use crate::types::distribution::MultivariateGaussian;
use crate::{Error, Result};

/// Tuning of the two filters of a [`DualEstimator`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DualUkfParams<T> {
    pub transient: UkfParams<T>,
    pub asoh: UkfParams<T>,
}

impl<T: RealField + Copy> Default for DualUkfParams<T> {
    fn default() -> Self {
        Self {
            transient: UkfParams::default(),
            asoh: UkfParams::default(),
        }
    }
}

/// Estimates transients and health parameters with two cooperating UKFs.
///
/// The predicted output returned by [`step`](OnlineEstimator::step) is the
/// transient filter's prediction. The health filter's prediction is available
/// through [`last_health_output`](Self::last_health_output).
#[derive(Debug, Clone)]
pub struct DualEstimator<T: RealField + Copy, M> {
    core: EstimatorCore<T>,
    transient_filter: UnscentedKalmanFilter<T, TransientModelWrapper<T, M>>,
    health_filter: UnscentedKalmanFilter<T, HealthModelWrapper<T, M>>,
    last_health_output: Option<MultivariateGaussian<T>>,
}

impl<T: RealField + Copy, M: CellModel<T>> DualEstimator<T, M> {
    /// Pairs two already configured filters.
    ///
    /// Both wrappers must describe the same model layout.
    pub fn new(
        transient_filter: UnscentedKalmanFilter<T, TransientModelWrapper<T, M>>,
        health_filter: UnscentedKalmanFilter<T, HealthModelWrapper<T, M>>,
    ) -> Result<Self> {
        let transients = transient_filter.model();
        let health = health_filter.model();
        if transients.num_output_dimensions() != health.num_output_dimensions() {
            return Err(Error::DimensionMismatch {
                context: "dual filter outputs",
                expected: transients.num_output_dimensions(),
                found: health.num_output_dimensions(),
            });
        }
        if health.updatable().is_empty() {
            return Err(Error::InvalidParameter(
                "dual estimation needs at least one updatable health parameter".into(),
            ));
        }

        // Health parameters come from the health wrapper, transients and
        // inputs from the transient wrapper
        let mut context = transients.context().clone();
        context.health = health.context().health().clone();
        let core = EstimatorCore::new(&context, health.updatable().to_vec())?;

        Ok(Self {
            core,
            transient_filter,
            health_filter,
            last_health_output: None,
        })
    }

    /// Builds both wrappers and filters from raw, model-coordinate settings.
    pub fn initialize_unscented_kalman_filter(
        model: Arc<M>,
        setup: EstimatorSetup<T>,
        params: DualUkfParams<T>,
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

        let health_conversions = match setup.asoh_normalizer(&updatable)? {
            Some(scale) => Conversions::with_hidden(Arc::new(LinearConversion::new(scale))),
            None => Conversions::default(),
        };
        let transient_wrapper = TransientModelWrapper::new(context.clone(), Conversions::default());
        let health_wrapper = HealthModelWrapper::new(context, updatable, health_conversions)?;

        let transient_hidden = setup
            .transient_prior()?
            .convert(transient_wrapper.hidden_conversion(), true)?;
        let health_hidden = setup
            .asoh_prior(health_wrapper.updatable())?
            .convert(health_wrapper.hidden_conversion(), true)?;
        let controls = setup.initial_controls()?;

        let transient_noise = setup
            .transient_process_noise
            .as_ref()
            .map(|q| transient_wrapper.hidden_conversion().inverse_transform_covariance(q))
            .transpose()?;
        let health_noise = setup
            .asoh_process_noise
            .as_ref()
            .map(|q| health_wrapper.hidden_conversion().inverse_transform_covariance(q))
            .transpose()?;
        let transient_sensor_noise =
            filter_sensor_noise(&transient_wrapper, setup.sensor_noise.as_ref())?;
        let health_sensor_noise =
            filter_sensor_noise(&health_wrapper, setup.sensor_noise.as_ref())?;

        info!(
            transients = num_transients,
            health_components = num_health,
            outputs = num_outputs,
            normalized = setup.normalize_asoh,
            "initializing dual estimator"
        );

        let transient_controls = controls.convert(transient_wrapper.control_conversion(), true)?;
        let transient_filter = UnscentedKalmanFilter::new(
            transient_wrapper,
            transient_hidden,
            transient_controls,
            transient_noise,
            transient_sensor_noise,
            params.transient,
        )?;
        let health_controls = controls.convert(health_wrapper.control_conversion(), true)?;
        let health_filter = UnscentedKalmanFilter::new(
            health_wrapper,
            health_hidden,
            health_controls,
            health_noise,
            health_sensor_noise,
            params.asoh,
        )?;

        Self::new(transient_filter, health_filter)
    }

    #[inline]
    pub fn transient_filter(&self) -> &UnscentedKalmanFilter<T, TransientModelWrapper<T, M>> {
        &self.transient_filter
    }

    #[inline]
    pub fn health_filter(&self) -> &UnscentedKalmanFilter<T, HealthModelWrapper<T, M>> {
        &self.health_filter
    }

    /// Output predicted by the health filter during the last step.
    #[inline]
    pub fn last_health_output(&self) -> Option<&MultivariateGaussian<T>> {
        self.last_health_output.as_ref()
    }

    /// Posteriors of both filters in model coordinates.
    fn converted_states(&self) -> Result<(MultivariateGaussian<T>, MultivariateGaussian<T>)> {
        let transients = self
            .transient_filter
            .hidden()
            .convert(self.transient_filter.model().hidden_conversion(), false)?;
        let health = self
            .health_filter
            .hidden()
            .convert(self.health_filter.model().hidden_conversion(), false)?;
        Ok((transients, health))
    }

    /// Refreshes the frozen context of both wrappers.
    fn inject(
        &mut self,
        health: HealthParameters<T>,
        transients: Quantities<T>,
        inputs: Quantities<T>,
    ) -> Result<()> {
        self.transient_filter.model_mut().set_health(health)?;
        self.health_filter.model_mut().set_transients(transients, inputs)
    }

    /// Runs both filters on the injected contexts without committing either.
    fn advance_filters(
        &self,
        controls: &MultivariateGaussian<T>,
        measurements: &MultivariateGaussian<T>,
    ) -> Result<(FilterStep<T>, FilterStep<T>)> {
        let wrapper = self.transient_filter.model();
        let transient_controls = controls.convert(wrapper.control_conversion(), true)?;
        let transient_measurements = measurements.convert(wrapper.output_conversion(), true)?;
        let (transient_posterior, transient_output) = self
            .transient_filter
            .advance(&transient_controls, &transient_measurements)?;

        let wrapper = self.health_filter.model();
        let health_controls = controls.convert(wrapper.control_conversion(), true)?;
        let health_measurements = measurements.convert(wrapper.output_conversion(), true)?;
        let (health_posterior, health_output) = self
            .health_filter
            .advance(&health_controls, &health_measurements)?;

        Ok((
            (transient_posterior, transient_output, transient_controls),
            (health_posterior, health_output, health_controls),
        ))
    }
}

/// Posterior, predicted output and filter-coordinate controls of one filter.
type FilterStep<T> = (
    MultivariateGaussian<T>,
    MultivariateGaussian<T>,
    MultivariateGaussian<T>,
);

/// Sensor noise in the output coordinates of one filter.
fn filter_sensor_noise<T: RealField + Copy, W: ModelWrapper<T>>(
    wrapper: &W,
    noise: Option<&DMatrix<T>>,
) -> Result<Option<DMatrix<T>>> {
    noise
        .map(|r| wrapper.output_conversion().inverse_transform_covariance(r))
        .transpose()
}

impl<T: RealField + Copy, M: CellModel<T>> OnlineEstimator<T> for DualEstimator<T, M> {
    fn core(&self) -> &EstimatorCore<T> {
        &self.core
    }

    fn step(
        &mut self,
        controls: &MultivariateGaussian<T>,
        measurements: &MultivariateGaussian<T>,
    ) -> Result<(MultivariateGaussian<T>, MultivariateGaussian<T>)> {
        // Previous posteriors, and the controls the transient posterior refers to
        let (transient_prior, health_prior) = self.converted_states()?;
        let (transients, health) =
            self.core
                .split_means(transient_prior.get_mean(), health_prior.get_mean())?;
        let previous_controls = self
            .transient_filter
            .controls()
            .convert(self.transient_filter.model().control_conversion(), false)?;
        let previous_inputs = self
            .core
            .inputs()
            .make_copy(DMatrix::from_row_slice(
                1,
                previous_controls.dimension(),
                previous_controls.get_mean().as_slice(),
            ))?;

        // Cross-injection happens before either filter advances. The previous
        // contexts are restored if either filter fails.
        let saved_health = self.transient_filter.model().health().clone();
        let health_model = self.health_filter.model();
        let saved_transients = health_model.transients().clone();
        let saved_inputs = health_model.context_inputs().clone();

        let advanced = self
            .inject(health, transients, previous_inputs)
            .and_then(|()| self.advance_filters(controls, measurements));
        let (transient_step, health_step) = match advanced {
            Ok(steps) => steps,
            Err(err) => {
                self.inject(saved_health, saved_transients, saved_inputs)?;
                return Err(err);
            }
        };

        let (transient_posterior, transient_output, transient_controls) = transient_step;
        let (health_posterior, health_output, health_controls) = health_step;
        self.transient_filter
            .commit(transient_posterior.clone(), transient_controls)?;
        self.health_filter
            .commit(health_posterior.clone(), health_controls)?;

        let transient_wrapper = self.transient_filter.model();
        let health_wrapper = self.health_filter.model();
        let transient_posterior =
            transient_posterior.convert(transient_wrapper.hidden_conversion(), false)?;
        let health_posterior =
            health_posterior.convert(health_wrapper.hidden_conversion(), false)?;
        let output = transient_output.convert(transient_wrapper.output_conversion(), false)?;
        self.last_health_output =
            Some(health_output.convert(health_wrapper.output_conversion(), false)?);

        debug!(
            transient_trace = ?transient_posterior.get_covariance().trace(),
            health_trace = ?health_posterior.get_covariance().trace(),
            "dual step"
        );

        Ok((transient_posterior.combine_with(&health_posterior), output))
    }

    fn state(&self) -> Result<MultivariateGaussian<T>> {
        let (transients, health) = self.converted_states()?;
        Ok(transients.combine_with(&health))
    }
}
