//! Online estimators
//!
//! An estimator binds a [`CellModel`] and initial estimates of its transient
//! state and health parameters to one or more Unscented Kalman Filters, and is
//! driven one record at a time through [`OnlineEstimator::step`].
//!
//! - [`JointEstimator`]: one filter over transients and health together
//! - [`DualEstimator`]: separate transient and health filters that exchange
//!   their previous posteriors on every step
//!
//! Distributions passed to and returned from an estimator are always in model
//! coordinates. Conversion into each filter's own coordinates happens inside.

pub mod dual;
pub mod joint;

pub use dual::{DualEstimator, DualUkfParams};
pub use joint::JointEstimator;

use nalgebra::{DMatrix, DVector, RealField};
use serde::{Deserialize, Serialize};

use crate::models::{CellContext, CellModel};
use crate::types::containers::{HealthParameters, Quantities};
use crate::types::distribution::MultivariateGaussian;
use crate::types::conversion::LinearConversion;
use crate::{Error, Result};

// ============================================================================
// Estimator trait
// ============================================================================

/// Trait for sequential estimators of transient state and health.
pub trait OnlineEstimator<T: RealField + Copy> {
    /// Shared bookkeeping for the accessors below.
    fn core(&self) -> &EstimatorCore<T>;

    /// Advances the estimate with the controls and measurements of a new
    /// time step.
    ///
    /// Returns the posterior of the full state (transients first, then the
    /// updatable health components) and the predicted output distribution.
    fn step(
        &mut self,
        controls: &MultivariateGaussian<T>,
        measurements: &MultivariateGaussian<T>,
    ) -> Result<(MultivariateGaussian<T>, MultivariateGaussian<T>)>;

    /// Current estimate of the full state.
    fn state(&self) -> Result<MultivariateGaussian<T>>;

    /// Mean of the current state written back into the model's containers.
    fn get_estimated_state(&self) -> Result<(Quantities<T>, HealthParameters<T>)> {
        self.core().estimated_state(&self.state()?)
    }

    fn num_state_dimensions(&self) -> usize {
        self.core().num_state_dimensions()
    }

    fn num_transients(&self) -> usize {
        self.core().num_transients()
    }

    fn num_output_dimensions(&self) -> usize {
        self.core().num_output_dimensions()
    }

    /// Names of each state component, transients first.
    fn state_names(&self) -> &[String] {
        self.core().state_names()
    }

    fn output_names(&self) -> &[String] {
        self.core().output_names()
    }

    fn control_names(&self) -> &[String] {
        self.core().control_names()
    }
}

// ============================================================================
// Updatable selection
// ============================================================================

/// Which health parameters an estimator updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatableSelection {
    /// Every parameter flagged updatable in the initial health parameters
    #[default]
    All,
    /// No health parameter; only the transients are estimated
    None,
    /// An explicit list, in the order given
    Named(Vec<String>),
}

impl UpdatableSelection {
    pub fn named<S: AsRef<str>>(names: &[S]) -> Self {
        Self::Named(names.iter().map(|n| n.as_ref().to_string()).collect())
    }

    /// Resolves the selection against a set of health parameters.
    pub fn resolve<T: RealField + Copy>(
        &self,
        health: &HealthParameters<T>,
    ) -> Result<Vec<String>> {
        match self {
            Self::All => Ok(health.updatable_names()),
            Self::None => Ok(Vec::new()),
            Self::Named(names) => {
                // Fails on the first unknown name
                health.num_components(names)?;
                let repeated = names
                    .iter()
                    .enumerate()
                    .find(|(i, name)| names[..*i].contains(name));
                if let Some((_, name)) = repeated {
                    return Err(Error::InvalidParameter(format!(
                        "health parameter {name} selected twice"
                    )));
                }
                Ok(names.clone())
            }
        }
    }
}

impl From<bool> for UpdatableSelection {
    fn from(all: bool) -> Self {
        if all {
            Self::All
        } else {
            Self::None
        }
    }
}

// ============================================================================
// Estimator core
// ============================================================================

/// The bookkeeping every estimator shares.
///
/// Holds private copies of the initial containers, the output layout found by
/// evaluating the model once, and the frozen list of updatable health
/// parameters.
#[derive(Debug, Clone)]
pub struct EstimatorCore<T: RealField> {
    transients: Quantities<T>,
    health: HealthParameters<T>,
    inputs: Quantities<T>,
    output_names: Vec<String>,
    updatable: Vec<String>,
    state_names: Vec<String>,
    num_health: usize,
}

impl<T: RealField + Copy> EstimatorCore<T> {
    pub fn new<M: CellModel<T>>(
        context: &CellContext<T, M>,
        updatable: Vec<String>,
    ) -> Result<Self> {
        let num_health = context.health().num_components(&updatable)?;
        let mut state_names = context.transients().names().to_vec();
        state_names.extend(context.health().expand_names(&updatable)?);

        Ok(Self {
            transients: context.transients().clone(),
            health: context.health().clone(),
            inputs: context.inputs().clone(),
            output_names: context.output_names().to_vec(),
            updatable,
            state_names,
            num_health,
        })
    }

    #[inline]
    pub fn num_transients(&self) -> usize {
        self.transients.len()
    }

    /// Number of scalar components across the updatable health parameters.
    #[inline]
    pub fn num_health(&self) -> usize {
        self.num_health
    }

    #[inline]
    pub fn num_state_dimensions(&self) -> usize {
        self.num_transients() + self.num_health
    }

    #[inline]
    pub fn num_output_dimensions(&self) -> usize {
        self.output_names.len()
    }

    #[inline]
    pub fn state_names(&self) -> &[String] {
        &self.state_names
    }

    #[inline]
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    #[inline]
    pub fn control_names(&self) -> &[String] {
        self.inputs.names()
    }

    #[inline]
    pub fn updatable(&self) -> &[String] {
        &self.updatable
    }

    #[inline]
    pub fn inputs(&self) -> &Quantities<T> {
        &self.inputs
    }

    /// Builds containers from separate transient and health means.
    pub fn split_means(
        &self,
        transients: &DVector<T>,
        health: &DVector<T>,
    ) -> Result<(Quantities<T>, HealthParameters<T>)> {
        let transients = self.transients.make_copy(row(transients))?;
        let mut updated = self.health.clone();
        updated.update_parameters(&row(health), &self.updatable)?;
        Ok((transients, updated))
    }

    /// Builds containers from the mean of a full state distribution.
    pub fn estimated_state(
        &self,
        state: &MultivariateGaussian<T>,
    ) -> Result<(Quantities<T>, HealthParameters<T>)> {
        if state.dimension() != self.num_state_dimensions() {
            return Err(Error::DimensionMismatch {
                context: "estimated state",
                expected: self.num_state_dimensions(),
                found: state.dimension(),
            });
        }
        let mean = state.get_mean();
        let nt = self.num_transients();
        self.split_means(
            &mean.rows(0, nt).into_owned(),
            &mean.rows(nt, self.num_health).into_owned(),
        )
    }
}

fn row<T: RealField + Copy>(values: &DVector<T>) -> DMatrix<T> {
    DMatrix::from_row_slice(1, values.len(), values.as_slice())
}

// ============================================================================
// Setup
// ============================================================================

/// Everything needed to build an estimator besides the model and the filter
/// tuning.
///
/// All covariances are given in model coordinates. Missing noise terms default
/// to zero and missing input uncertainty means the inputs are exact.
#[derive(Debug, Clone)]
pub struct EstimatorSetup<T: RealField> {
    pub initial_transients: Quantities<T>,
    pub initial_health: HealthParameters<T>,
    pub initial_inputs: Quantities<T>,
    pub covariance_transient: DMatrix<T>,
    pub covariance_asoh: DMatrix<T>,
    pub inputs_uncertainty: Option<DMatrix<T>>,
    pub transient_process_noise: Option<DMatrix<T>>,
    pub asoh_process_noise: Option<DMatrix<T>>,
    pub sensor_noise: Option<DMatrix<T>>,
    /// Estimate the updatable health parameters relative to their initial
    /// values rather than in absolute units
    pub normalize_asoh: bool,
    pub updatable: UpdatableSelection,
}

impl<T: RealField + Copy> EstimatorSetup<T> {
    pub fn new(
        initial_transients: Quantities<T>,
        initial_health: HealthParameters<T>,
        initial_inputs: Quantities<T>,
        covariance_transient: DMatrix<T>,
        covariance_asoh: DMatrix<T>,
    ) -> Self {
        Self {
            initial_transients,
            initial_health,
            initial_inputs,
            covariance_transient,
            covariance_asoh,
            inputs_uncertainty: None,
            transient_process_noise: None,
            asoh_process_noise: None,
            sensor_noise: None,
            normalize_asoh: false,
            updatable: UpdatableSelection::All,
        }
    }

    pub fn with_inputs_uncertainty(mut self, uncertainty: DMatrix<T>) -> Self {
        self.inputs_uncertainty = Some(uncertainty);
        self
    }

    pub fn with_transient_process_noise(mut self, noise: DMatrix<T>) -> Self {
        self.transient_process_noise = Some(noise);
        self
    }

    pub fn with_asoh_process_noise(mut self, noise: DMatrix<T>) -> Self {
        self.asoh_process_noise = Some(noise);
        self
    }

    pub fn with_sensor_noise(mut self, noise: DMatrix<T>) -> Self {
        self.sensor_noise = Some(noise);
        self
    }

    pub fn with_normalized_asoh(mut self, normalize: bool) -> Self {
        self.normalize_asoh = normalize;
        self
    }

    pub fn with_updatable(mut self, updatable: UpdatableSelection) -> Self {
        self.updatable = updatable;
        self
    }

    /// Prior over the transients.
    pub(crate) fn transient_prior(&self) -> Result<MultivariateGaussian<T>> {
        MultivariateGaussian::new(
            self.initial_transients.to_vector(),
            self.covariance_transient.clone(),
        )
    }

    /// Prior over the selected health components.
    pub(crate) fn asoh_prior(&self, updatable: &[String]) -> Result<MultivariateGaussian<T>> {
        let values = self.initial_health.get_parameters(updatable)?;
        MultivariateGaussian::new(values.row(0).transpose(), self.covariance_asoh.clone())
    }

    /// Distribution of the initial controls.
    pub(crate) fn initial_controls(&self) -> Result<MultivariateGaussian<T>> {
        let mean = self.initial_inputs.to_vector();
        match &self.inputs_uncertainty {
            Some(cov) => MultivariateGaussian::new(mean, cov.clone()),
            None => Ok(MultivariateGaussian::deterministic(mean)),
        }
    }

    /// Scale used to normalize the selected health components, if requested.
    pub(crate) fn asoh_normalizer(&self, updatable: &[String]) -> Result<Option<DVector<T>>> {
        if !self.normalize_asoh {
            return Ok(None);
        }
        let values = self.initial_health.get_parameters(updatable)?;
        Ok(Some(values.row(0).transpose()))
    }
}

/// Checks that an optional noise covariance is `dim × dim`.
pub(crate) fn check_noise<T: RealField>(
    noise: Option<&DMatrix<T>>,
    dim: usize,
    context: &'static str,
) -> Result<()> {
    if let Some(noise) = noise {
        if noise.nrows() != dim || noise.ncols() != dim {
            return Err(Error::DimensionMismatch {
                context,
                expected: dim,
                found: if noise.nrows() != dim { noise.nrows() } else { noise.ncols() },
            });
        }
    }
    Ok(())
}

/// Normalizing conversion for a hidden vector whose first `leading`
/// components stay in absolute units.
pub(crate) fn partial_normalizer<T: RealField + Copy>(
    leading: usize,
    scale: &DVector<T>,
) -> LinearConversion<T> {
    let mut full = DVector::from_element(leading + scale.len(), T::one());
    full.rows_mut(leading, scale.len()).copy_from(scale);
    LinearConversion::new(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::containers::Quantities;
    use nalgebra::{dmatrix, dvector};
    use std::sync::Arc;

    /// Output equals the first transient plus the first health parameter.
    struct SumModel;

    impl CellModel<f64> for SumModel {
        fn update_transient_state(
            &self,
            _previous_inputs: &Quantities<f64>,
            _new_inputs: &Quantities<f64>,
            transients: &Quantities<f64>,
            _health: &HealthParameters<f64>,
        ) -> Result<Quantities<f64>> {
            Ok(transients.clone())
        }

        fn calculate_outputs(
            &self,
            _inputs: &Quantities<f64>,
            transients: &Quantities<f64>,
            health: &HealthParameters<f64>,
        ) -> Result<Quantities<f64>> {
            let x = transients.values().column(0).into_owned();
            let r = health.get_parameters(&health.all_names())?.column(0).into_owned();
            let batch = x.len().max(r.len());
            let values = DMatrix::from_fn(batch, 1, |i, _| {
                x[i.min(x.len() - 1)] + r[i.min(r.len() - 1)]
            });
            Quantities::new(vec!["y".into()], values)
        }
    }

    fn context() -> CellContext<f64, SumModel> {
        let transients = Quantities::from_slice(&["soc", "hyst"], &[0.5, 0.0]).unwrap();
        let health = HealthParameters::new()
            .with_parameter("r0", &[0.05], true)
            .unwrap()
            .with_parameter("ocv", &[3.0, 3.5, 4.0], false)
            .unwrap();
        let inputs = Quantities::from_slice(&["time", "current"], &[0.0, 1.0]).unwrap();
        CellContext::new(Arc::new(SumModel), &transients, &health, &inputs).unwrap()
    }

    #[test]
    fn test_selection_resolution() {
        let ctx = context();
        let health = ctx.health();
        assert_eq!(UpdatableSelection::All.resolve(health).unwrap(), vec!["r0".to_string()]);
        assert!(UpdatableSelection::None.resolve(health).unwrap().is_empty());
        assert_eq!(UpdatableSelection::from(false), UpdatableSelection::None);

        let named = UpdatableSelection::named(&["ocv", "r0"]).resolve(health).unwrap();
        assert_eq!(named, vec!["ocv".to_string(), "r0".to_string()]);

        assert!(matches!(
            UpdatableSelection::named(&["c0"]).resolve(health),
            Err(Error::UnknownParameter(_))
        ));
        assert!(matches!(
            UpdatableSelection::named(&["r0", "ocv", "r0"]).resolve(health),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_core_dimensions_and_names() {
        let ctx = context();
        let core = EstimatorCore::new(&ctx, vec!["r0".into(), "ocv".into()]).unwrap();

        assert_eq!(core.num_transients(), 2);
        assert_eq!(core.num_health(), 4);
        assert_eq!(core.num_state_dimensions(), 6);
        assert_eq!(core.num_output_dimensions(), 1);
        assert_eq!(core.output_names(), &["y".to_string()]);
        assert_eq!(core.control_names(), &["time".to_string(), "current".to_string()]);
        assert_eq!(
            core.state_names(),
            &["soc", "hyst", "r0", "ocv[0]", "ocv[1]", "ocv[2]"].map(String::from)
        );
    }

    #[test]
    fn test_core_estimated_state() {
        let ctx = context();
        let core = EstimatorCore::new(&ctx, vec!["r0".into()]).unwrap();

        let state = MultivariateGaussian::deterministic(dvector![0.4, 0.01, 0.07]);
        let (transients, health) = core.estimated_state(&state).unwrap();
        assert_eq!(transients.to_vector(), dvector![0.4, 0.01]);
        assert_eq!(health.parameter("r0").unwrap(), &dmatrix![0.07]);
        // Non-updatable parameters keep their initial values
        assert_eq!(health.parameter("ocv").unwrap(), &dmatrix![3.0, 3.5, 4.0]);

        let short = MultivariateGaussian::deterministic(dvector![0.4]);
        assert!(core.estimated_state(&short).is_err());
    }

    #[test]
    fn test_context_rejects_batched_initial_state() {
        let transients = Quantities::new(
            vec!["soc".into()],
            dmatrix![0.5; 0.6],
        )
        .unwrap();
        let health = HealthParameters::new().with_parameter("r0", &[0.05], true).unwrap();
        let inputs = Quantities::from_slice(&["current"], &[1.0]).unwrap();
        let result = CellContext::new(Arc::new(SumModel), &transients, &health, &inputs);
        assert!(matches!(result, Err(Error::InvalidBatchSize { found: 2, .. })));
    }

    #[test]
    fn test_partial_normalizer_keeps_transients() {
        let op = partial_normalizer(2, &dvector![0.05, 0.0]);
        assert_eq!(op.scale(), &dvector![1.0, 1.0, 0.05, 1.0]);
    }

    #[test]
    fn test_check_noise() {
        assert!(check_noise::<f64>(None, 3, "noise").is_ok());
        assert!(check_noise(Some(&DMatrix::<f64>::identity(3, 3)), 3, "noise").is_ok());
        assert!(matches!(
            check_noise(Some(&DMatrix::<f64>::identity(2, 2)), 3, "noise"),
            Err(Error::DimensionMismatch { expected: 3, found: 2, .. })
        ));
    }
}
