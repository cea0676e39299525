//! Physical model contract
//!
//! The estimators never look inside the physics. A model only has to advance
//! its transient state between two sets of inputs and predict the measured
//! outputs, both over batched containers.

use core::fmt;
use std::sync::Arc;

use nalgebra::RealField;

use crate::types::containers::{HealthParameters, Quantities};
use crate::{Error, Result};

/// Trait for the physical model of the observed system.
///
/// Every container passed in may carry a batch of rows. A batch is either one
/// row or the common batch size of the call; implementations use
/// [`broadcast_rows`](crate::types::containers::broadcast_rows) to line them up
/// and must return one row per batch entry.
pub trait CellModel<T: RealField + Copy> {
    /// Advances the transient state from `previous_inputs` to `new_inputs`.
    fn update_transient_state(
        &self,
        previous_inputs: &Quantities<T>,
        new_inputs: &Quantities<T>,
        transients: &Quantities<T>,
        health: &HealthParameters<T>,
    ) -> Result<Quantities<T>>;

    /// Predicts the measured outputs for the given inputs and state.
    fn calculate_outputs(
        &self,
        inputs: &Quantities<T>,
        transients: &Quantities<T>,
        health: &HealthParameters<T>,
    ) -> Result<Quantities<T>>;
}

// ============================================================================
// Model context
// ============================================================================

/// A model together with the reference containers it is evaluated with.
///
/// Built once per estimator. The containers are private copies of what the
/// caller supplied, and the output layout is cached from a single evaluation
/// of the model at the initial state.
pub struct CellContext<T: RealField, M> {
    pub(crate) model: Arc<M>,
    pub(crate) transients: Quantities<T>,
    pub(crate) health: HealthParameters<T>,
    pub(crate) inputs: Quantities<T>,
    pub(crate) output_names: Vec<String>,
}

impl<T: RealField + Copy, M: CellModel<T>> CellContext<T, M> {
    /// Copies the initial containers and evaluates the model once.
    ///
    /// Transients and health parameters must have a batch size of 1.
    pub fn new(
        model: Arc<M>,
        transients: &Quantities<T>,
        health: &HealthParameters<T>,
        inputs: &Quantities<T>,
    ) -> Result<Self> {
        if transients.batch_size() != 1 {
            return Err(Error::InvalidBatchSize {
                what: "initial transient state",
                found: transients.batch_size(),
            });
        }
        if health.batch_size() != 1 {
            return Err(Error::InvalidBatchSize {
                what: "initial health parameters",
                found: health.batch_size(),
            });
        }
        if inputs.batch_size() != 1 {
            return Err(Error::InvalidBatchSize {
                what: "initial inputs",
                found: inputs.batch_size(),
            });
        }

        let outputs = model.calculate_outputs(inputs, transients, health)?;
        Ok(Self {
            model,
            transients: transients.clone(),
            health: health.clone(),
            inputs: inputs.clone(),
            output_names: outputs.names().to_vec(),
        })
    }
}

impl<T: RealField + Copy, M> CellContext<T, M> {
    #[inline]
    pub fn model(&self) -> &Arc<M> {
        &self.model
    }

    #[inline]
    pub fn transients(&self) -> &Quantities<T> {
        &self.transients
    }

    #[inline]
    pub fn health(&self) -> &HealthParameters<T> {
        &self.health
    }

    #[inline]
    pub fn inputs(&self) -> &Quantities<T> {
        &self.inputs
    }

    #[inline]
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    #[inline]
    pub fn num_outputs(&self) -> usize {
        self.output_names.len()
    }
}

impl<T: RealField + Copy, M> Clone for CellContext<T, M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            transients: self.transients.clone(),
            health: self.health.clone(),
            inputs: self.inputs.clone(),
            output_names: self.output_names.clone(),
        }
    }
}

impl<T: RealField + Copy, M> fmt::Debug for CellContext<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellContext")
            .field("transients", &self.transients)
            .field("health", &self.health)
            .field("inputs", &self.inputs)
            .field("output_names", &self.output_names)
            .finish_non_exhaustive()
    }
}
