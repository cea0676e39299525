//! Running estimators over recorded data
//!
//! [`run_online_estimate`] feeds a [`Timeseries`] through an estimator one
//! record at a time and collects the estimates, optionally recording them in a
//! [`StateWriter`].

pub mod store;

pub use store::{
    read_state_estimates, EstimateTable, StateRecord, StateWriter, WritePolicy, WriterSettings,
};

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::estimators::OnlineEstimator;
use crate::types::distribution::MultivariateGaussian;
use crate::{Error, Result};

/// One row of recorded data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesRecord {
    pub time: f64,
    pub cycle: u64,
    /// Values in the order of [`Timeseries::input_names`]
    pub inputs: Vec<f64>,
    /// Values in the order of [`Timeseries::output_names`]
    pub outputs: Vec<f64>,
}

/// Recorded controls and measurements, in time order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeseries {
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub records: Vec<TimeseriesRecord>,
}

impl Timeseries {
    pub fn new<S: AsRef<str>>(input_names: &[S], output_names: &[S]) -> Self {
        Self {
            input_names: input_names.iter().map(|n| n.as_ref().to_string()).collect(),
            output_names: output_names.iter().map(|n| n.as_ref().to_string()).collect(),
            records: Vec::new(),
        }
    }

    /// Appends a record, checking it against the column names.
    pub fn push(&mut self, time: f64, cycle: u64, inputs: &[f64], outputs: &[f64]) -> Result<()> {
        if inputs.len() != self.input_names.len() {
            return Err(Error::ComponentCountMismatch {
                what: "timeseries inputs".into(),
                expected: self.input_names.len(),
                found: inputs.len(),
            });
        }
        if outputs.len() != self.output_names.len() {
            return Err(Error::ComponentCountMismatch {
                what: "timeseries outputs".into(),
                expected: self.output_names.len(),
                found: outputs.len(),
            });
        }
        self.records.push(TimeseriesRecord {
            time,
            cycle,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        Ok(())
    }

    /// Writes the timeseries to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Reads a timeseries written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of times the cycle index changes from one record to the next,
    /// counting the first record. This is the number of rows a
    /// [`StateWriter`] keeps per cycle for this dataset.
    pub fn num_cycles(&self) -> usize {
        let mut previous = None;
        self.records
            .iter()
            .filter(|r| previous.replace(r.cycle) != Some(r.cycle))
            .count()
    }
}

fn column_indices(available: &[String], wanted: &[String]) -> Result<Vec<usize>> {
    wanted
        .iter()
        .map(|name| {
            available
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| Error::MissingColumn(name.clone()))
        })
        .collect()
}

fn select(values: &[f64], indices: &[usize]) -> DVector<f64> {
    DVector::from_iterator(indices.len(), indices.iter().map(|&i| values[i]))
}

/// Runs an estimator over every record of a timeseries.
///
/// Controls and measurements are taken from the dataset columns named after
/// the estimator's control and output names, and treated as exact. Returns one
/// row per record holding the state mean, the state variance, the output mean
/// and the output variance, in that order.
///
/// A writer that has not been prepared yet is prepared with the size of the
/// dataset.
pub fn run_online_estimate<E: OnlineEstimator<f64> + ?Sized>(
    dataset: &Timeseries,
    estimator: &mut E,
    mut writer: Option<&mut StateWriter>,
) -> Result<DMatrix<f64>> {
    let controls = column_indices(&dataset.input_names, estimator.control_names())?;
    let outputs = column_indices(&dataset.output_names, estimator.output_names())?;

    if let Some(writer) = writer.as_deref_mut() {
        if writer.is_ready() {
            writer.prepare(&*estimator, Some(dataset.len()), Some(dataset.num_cycles()))?;
        }
    }

    let state_dim = estimator.num_state_dimensions();
    let output_dim = estimator.num_output_dimensions();
    let width = 2 * (state_dim + output_dim);
    info!(records = dataset.len(), state_dim, output_dim, "running online estimate");

    let mut results = DMatrix::zeros(dataset.len(), width);
    for (i, record) in dataset.records.iter().enumerate() {
        if record.inputs.len() != dataset.input_names.len()
            || record.outputs.len() != dataset.output_names.len()
        {
            return Err(Error::ComponentCountMismatch {
                what: format!("timeseries record {i}"),
                expected: dataset.input_names.len() + dataset.output_names.len(),
                found: record.inputs.len() + record.outputs.len(),
            });
        }
        let u = MultivariateGaussian::deterministic(select(&record.inputs, &controls));
        let y = MultivariateGaussian::deterministic(select(&record.outputs, &outputs));
        let (state, output) = estimator.step(&u, &y)?;

        let row = state
            .get_mean()
            .iter()
            .chain(state.get_variance().iter())
            .chain(output.get_mean().iter())
            .chain(output.get_variance().iter())
            .copied()
            .collect::<Vec<_>>();
        results.row_mut(i).copy_from_slice(&row);

        if let Some(writer) = writer.as_deref_mut() {
            writer.append_step(record.time, record.cycle, &state, &output)?;
        }
    }

    debug!(records = dataset.len(), "online estimate finished");
    Ok(results)
}
