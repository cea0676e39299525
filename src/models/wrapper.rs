//! Model wrappers: the numeric contract between a filter and a physical model
//!
//! A filter only sees raw arrays. Each wrapper decides which quantities make up
//! the hidden state it exposes, rebuilds the model's containers from a batch of
//! hidden states (one per row) and evaluates the [`CellModel`].
//!
//! Hidden states, controls and outputs reach a wrapper in *filter*
//! coordinates. The wrapper maps them to model coordinates with the forward
//! transform of its [`Conversions`] and maps results back with the inverse.
//!
//! Three wrappers are provided:
//!
//! - [`JointModelWrapper`]: hidden state is the transients followed by the
//!   updatable health components
//! - [`TransientModelWrapper`]: hidden state is the transients; the health
//!   parameters are frozen context
//! - [`HealthModelWrapper`]: hidden state is the updatable health components;
//!   the transients are frozen context

use std::sync::Arc;

use nalgebra::{DMatrix, RealField};

use super::cell::{CellContext, CellModel};
use crate::types::containers::{broadcast_rows, HealthParameters, Quantities};
use crate::types::conversion::{ConversionOperator, IdentityConversion};
use crate::{Error, Result};

/// Trait describing how a filter drives a model.
///
/// All arrays are batched by row. The batch dimension of each argument is 1 or
/// the common batch size of the call.
pub trait ModelWrapper<T: RealField + Copy> {
    /// Dimension of the hidden state estimated by the filter.
    fn num_hidden_dimensions(&self) -> usize;

    /// Dimension of the measured outputs.
    fn num_output_dimensions(&self) -> usize;

    /// Advances a batch of hidden states from `previous_controls` to `new_controls`.
    fn update_hidden_states(
        &self,
        hidden_states: &DMatrix<T>,
        previous_controls: &DMatrix<T>,
        new_controls: &DMatrix<T>,
    ) -> Result<DMatrix<T>>;

    /// Predicts the measurements for a batch of hidden states.
    fn predict_measurement(
        &self,
        hidden_states: &DMatrix<T>,
        controls: &DMatrix<T>,
    ) -> Result<DMatrix<T>>;

    /// Conversion between the filter's hidden coordinates and model coordinates.
    fn hidden_conversion(&self) -> &dyn ConversionOperator<T> {
        &IdentityConversion
    }

    /// Conversion between the filter's control coordinates and model coordinates.
    fn control_conversion(&self) -> &dyn ConversionOperator<T> {
        &IdentityConversion
    }

    /// Conversion between the filter's output coordinates and model coordinates.
    fn output_conversion(&self) -> &dyn ConversionOperator<T> {
        &IdentityConversion
    }
}

// ============================================================================
// Conversions
// ============================================================================

/// The three conversion operators used by a wrapper.
#[derive(Debug, Clone)]
pub struct Conversions<T: RealField + Copy> {
    pub hidden: Arc<dyn ConversionOperator<T>>,
    pub control: Arc<dyn ConversionOperator<T>>,
    pub output: Arc<dyn ConversionOperator<T>>,
}

impl<T: RealField + Copy> Default for Conversions<T> {
    fn default() -> Self {
        Self {
            hidden: Arc::new(IdentityConversion),
            control: Arc::new(IdentityConversion),
            output: Arc::new(IdentityConversion),
        }
    }
}

impl<T: RealField + Copy> Conversions<T> {
    /// Identity conversions except for the hidden state.
    pub fn with_hidden(hidden: Arc<dyn ConversionOperator<T>>) -> Self {
        Self {
            hidden,
            ..Self::default()
        }
    }

    fn model_inputs(
        &self,
        template: &Quantities<T>,
        controls: &DMatrix<T>,
    ) -> Result<Quantities<T>> {
        template.make_copy(self.control.transform_points(controls)?)
    }

    fn filter_outputs(&self, outputs: &Quantities<T>, rows: usize) -> Result<DMatrix<T>> {
        let values = broadcast_rows(outputs.values(), rows)?;
        self.output.inverse_transform_points(&values)
    }
}

fn check_hidden_width<T: RealField>(hidden: &DMatrix<T>, expected: usize) -> Result<()> {
    if hidden.ncols() != expected {
        return Err(Error::DimensionMismatch {
            context: "hidden state batch",
            expected,
            found: hidden.ncols(),
        });
    }
    Ok(())
}

// ============================================================================
// Joint wrapper
// ============================================================================

/// Hidden state: transients followed by the updatable health components.
///
/// The health part is carried through the transition unchanged; its evolution
/// is left entirely to the process noise.
#[derive(Debug, Clone)]
pub struct JointModelWrapper<T: RealField + Copy, M> {
    context: CellContext<T, M>,
    updatable: Vec<String>,
    num_health: usize,
    conversions: Conversions<T>,
}

impl<T: RealField + Copy, M: CellModel<T>> JointModelWrapper<T, M> {
    pub fn new(
        context: CellContext<T, M>,
        updatable: Vec<String>,
        conversions: Conversions<T>,
    ) -> Result<Self> {
        let num_health = context.health.num_components(&updatable)?;
        Ok(Self {
            context,
            updatable,
            num_health,
            conversions,
        })
    }

    #[inline]
    pub fn num_transients(&self) -> usize {
        self.context.transients.len()
    }

    #[inline]
    pub fn context(&self) -> &CellContext<T, M> {
        &self.context
    }

    /// Names of the health parameters carried in the hidden state.
    #[inline]
    pub fn updatable(&self) -> &[String] {
        &self.updatable
    }

    /// Splits a batch of model-coordinate hidden states into containers.
    fn unpack(&self, hidden: &DMatrix<T>) -> Result<(Quantities<T>, HealthParameters<T>)> {
        let nt = self.num_transients();
        let transients = self
            .context
            .transients
            .make_copy(hidden.columns(0, nt).into_owned())?;
        let mut health = self.context.health.clone();
        let values = hidden.columns(nt, self.num_health).into_owned();
        health.update_parameters(&values, &self.updatable)?;
        Ok((transients, health))
    }
}

impl<T: RealField + Copy, M: CellModel<T>> ModelWrapper<T> for JointModelWrapper<T, M> {
    fn num_hidden_dimensions(&self) -> usize {
        self.num_transients() + self.num_health
    }

    fn num_output_dimensions(&self) -> usize {
        self.context.num_outputs()
    }

    fn update_hidden_states(
        &self,
        hidden_states: &DMatrix<T>,
        previous_controls: &DMatrix<T>,
        new_controls: &DMatrix<T>,
    ) -> Result<DMatrix<T>> {
        check_hidden_width(hidden_states, self.num_hidden_dimensions())?;
        let hidden = self.conversions.hidden.transform_points(hidden_states)?;
        let previous = self.conversions.model_inputs(&self.context.inputs, previous_controls)?;
        let new = self.conversions.model_inputs(&self.context.inputs, new_controls)?;

        let (transients, health) = self.unpack(&hidden)?;
        let advanced = self
            .context
            .model
            .update_transient_state(&previous, &new, &transients, &health)?;

        let mut output = hidden;
        let rows = output.nrows();
        let nt = self.num_transients();
        output
            .columns_mut(0, nt)
            .copy_from(&broadcast_rows(advanced.values(), rows)?);
        self.conversions.hidden.inverse_transform_points(&output)
    }

    fn predict_measurement(
        &self,
        hidden_states: &DMatrix<T>,
        controls: &DMatrix<T>,
    ) -> Result<DMatrix<T>> {
        check_hidden_width(hidden_states, self.num_hidden_dimensions())?;
        let hidden = self.conversions.hidden.transform_points(hidden_states)?;
        let inputs = self.conversions.model_inputs(&self.context.inputs, controls)?;

        let (transients, health) = self.unpack(&hidden)?;
        let outputs = self.context.model.calculate_outputs(&inputs, &transients, &health)?;
        self.conversions.filter_outputs(&outputs, hidden.nrows())
    }

    fn hidden_conversion(&self) -> &dyn ConversionOperator<T> {
        self.conversions.hidden.as_ref()
    }

    fn control_conversion(&self) -> &dyn ConversionOperator<T> {
        self.conversions.control.as_ref()
    }

    fn output_conversion(&self) -> &dyn ConversionOperator<T> {
        self.conversions.output.as_ref()
    }
}

// ============================================================================
// Transient wrapper
// ============================================================================

/// Hidden state: the transients only. Health parameters are frozen context.
#[derive(Debug, Clone)]
pub struct TransientModelWrapper<T: RealField + Copy, M> {
    context: CellContext<T, M>,
    conversions: Conversions<T>,
}

impl<T: RealField + Copy, M: CellModel<T>> TransientModelWrapper<T, M> {
    pub fn new(context: CellContext<T, M>, conversions: Conversions<T>) -> Self {
        Self { context, conversions }
    }

    #[inline]
    pub fn context(&self) -> &CellContext<T, M> {
        &self.context
    }

    /// Health parameters the transients are currently evaluated with.
    #[inline]
    pub fn health(&self) -> &HealthParameters<T> {
        &self.context.health
    }

    /// Replaces the frozen health context.
    pub fn set_health(&mut self, health: HealthParameters<T>) -> Result<()> {
        if health.batch_size() != 1 {
            return Err(Error::InvalidBatchSize {
                what: "injected health parameters",
                found: health.batch_size(),
            });
        }
        self.context.health = health;
        Ok(())
    }
}

impl<T: RealField + Copy, M: CellModel<T>> ModelWrapper<T> for TransientModelWrapper<T, M> {
    fn num_hidden_dimensions(&self) -> usize {
        self.context.transients.len()
    }

    fn num_output_dimensions(&self) -> usize {
        self.context.num_outputs()
    }

    fn update_hidden_states(
        &self,
        hidden_states: &DMatrix<T>,
        previous_controls: &DMatrix<T>,
        new_controls: &DMatrix<T>,
    ) -> Result<DMatrix<T>> {
        check_hidden_width(hidden_states, self.num_hidden_dimensions())?;
        let hidden = self.conversions.hidden.transform_points(hidden_states)?;
        let previous = self.conversions.model_inputs(&self.context.inputs, previous_controls)?;
        let new = self.conversions.model_inputs(&self.context.inputs, new_controls)?;

        let transients = self.context.transients.make_copy(hidden)?;
        let advanced = self.context.model.update_transient_state(
            &previous,
            &new,
            &transients,
            &self.context.health,
        )?;
        let advanced = broadcast_rows(advanced.values(), hidden_states.nrows())?;
        self.conversions.hidden.inverse_transform_points(&advanced)
    }

    fn predict_measurement(
        &self,
        hidden_states: &DMatrix<T>,
        controls: &DMatrix<T>,
    ) -> Result<DMatrix<T>> {
        check_hidden_width(hidden_states, self.num_hidden_dimensions())?;
        let hidden = self.conversions.hidden.transform_points(hidden_states)?;
        let inputs = self.conversions.model_inputs(&self.context.inputs, controls)?;

        let transients = self.context.transients.make_copy(hidden)?;
        let outputs = self
            .context
            .model
            .calculate_outputs(&inputs, &transients, &self.context.health)?;
        self.conversions.filter_outputs(&outputs, hidden_states.nrows())
    }

    fn hidden_conversion(&self) -> &dyn ConversionOperator<T> {
        self.conversions.hidden.as_ref()
    }

    fn control_conversion(&self) -> &dyn ConversionOperator<T> {
        self.conversions.control.as_ref()
    }

    fn output_conversion(&self) -> &dyn ConversionOperator<T> {
        self.conversions.output.as_ref()
    }
}

// ============================================================================
// Health wrapper
// ============================================================================

/// Hidden state: the updatable health components. Transients are frozen
/// context.
///
/// The frozen context is the transient estimate of the previous time step
/// together with the inputs of that step. To predict a measurement the wrapper
/// first advances those transients to the new inputs using the candidate
/// health parameters, so the prediction refers to the same instant as the
/// measurement.
#[derive(Debug, Clone)]
pub struct HealthModelWrapper<T: RealField + Copy, M> {
    context: CellContext<T, M>,
    context_inputs: Quantities<T>,
    updatable: Vec<String>,
    num_health: usize,
    conversions: Conversions<T>,
}

impl<T: RealField + Copy, M: CellModel<T>> HealthModelWrapper<T, M> {
    pub fn new(
        context: CellContext<T, M>,
        updatable: Vec<String>,
        conversions: Conversions<T>,
    ) -> Result<Self> {
        let num_health = context.health.num_components(&updatable)?;
        let context_inputs = context.inputs.clone();
        Ok(Self {
            context,
            context_inputs,
            updatable,
            num_health,
            conversions,
        })
    }

    #[inline]
    pub fn context(&self) -> &CellContext<T, M> {
        &self.context
    }

    #[inline]
    pub fn updatable(&self) -> &[String] {
        &self.updatable
    }

    /// Inputs the frozen transients refer to.
    #[inline]
    pub fn context_inputs(&self) -> &Quantities<T> {
        &self.context_inputs
    }

    /// Transients the health parameters are currently evaluated with.
    #[inline]
    pub fn transients(&self) -> &Quantities<T> {
        &self.context.transients
    }

    /// Replaces the frozen transient context and the inputs it corresponds to.
    pub fn set_transients(
        &mut self,
        transients: Quantities<T>,
        inputs: Quantities<T>,
    ) -> Result<()> {
        if transients.batch_size() != 1 {
            return Err(Error::InvalidBatchSize {
                what: "injected transient state",
                found: transients.batch_size(),
            });
        }
        if transients.len() != self.context.transients.len() {
            return Err(Error::DimensionMismatch {
                context: "injected transient state",
                expected: self.context.transients.len(),
                found: transients.len(),
            });
        }
        self.context.transients = transients;
        self.context_inputs = inputs;
        Ok(())
    }
}

impl<T: RealField + Copy, M: CellModel<T>> ModelWrapper<T> for HealthModelWrapper<T, M> {
    fn num_hidden_dimensions(&self) -> usize {
        self.num_health
    }

    fn num_output_dimensions(&self) -> usize {
        self.context.num_outputs()
    }

    fn update_hidden_states(
        &self,
        hidden_states: &DMatrix<T>,
        _previous_controls: &DMatrix<T>,
        _new_controls: &DMatrix<T>,
    ) -> Result<DMatrix<T>> {
        check_hidden_width(hidden_states, self.num_hidden_dimensions())?;
        Ok(hidden_states.clone())
    }

    fn predict_measurement(
        &self,
        hidden_states: &DMatrix<T>,
        controls: &DMatrix<T>,
    ) -> Result<DMatrix<T>> {
        check_hidden_width(hidden_states, self.num_hidden_dimensions())?;
        let values = self.conversions.hidden.transform_points(hidden_states)?;
        let inputs = self.conversions.model_inputs(&self.context.inputs, controls)?;

        let mut health = self.context.health.clone();
        health.update_parameters(&values, &self.updatable)?;

        let transients = self.context.model.update_transient_state(
            &self.context_inputs,
            &inputs,
            &self.context.transients,
            &health,
        )?;
        let outputs = self.context.model.calculate_outputs(&inputs, &transients, &health)?;
        self.conversions.filter_outputs(&outputs, hidden_states.nrows())
    }

    fn hidden_conversion(&self) -> &dyn ConversionOperator<T> {
        self.conversions.hidden.as_ref()
    }

    fn control_conversion(&self) -> &dyn ConversionOperator<T> {
        self.conversions.control.as_ref()
    }

    fn output_conversion(&self) -> &dyn ConversionOperator<T> {
        self.conversions.output.as_ref()
    }
}
