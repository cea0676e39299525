//! In-memory store for state estimates
//!
//! A [`StateWriter`] records the state and output distributions produced by an
//! estimator at two granularities: every time step, and the first step of each
//! cycle. Each granularity has its own [`WritePolicy`].
//!
//! Storage is either resizable (grown one chunk at a time) or sized once at
//! [`prepare`](StateWriter::prepare). Rows that have not been written yet hold
//! NaN. A finished store can be saved to and loaded from JSON.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::estimators::OnlineEstimator;
use crate::types::distribution::MultivariateGaussian;
use crate::{Error, Result};

/// One stored estimate: time, state distribution, output distribution.
pub type StateRecord = (f64, MultivariateGaussian<f64>, MultivariateGaussian<f64>);

// ============================================================================
// Settings
// ============================================================================

/// How much of each distribution to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Mean and full covariance
    Full,
    /// Mean and full covariance
    MeanCov,
    /// Mean and the diagonal of the covariance
    MeanVar,
    /// Mean only
    Mean,
    /// Nothing is stored for this granularity
    None,
}

impl WritePolicy {
    #[inline]
    pub fn stores_anything(&self) -> bool {
        !matches!(self, WritePolicy::None)
    }

    /// Number of stored values describing the spread of a `dim`-dimensional
    /// distribution.
    fn spread_width(&self, dim: usize) -> usize {
        match self {
            WritePolicy::Full | WritePolicy::MeanCov => dim * dim,
            WritePolicy::MeanVar => dim,
            WritePolicy::Mean | WritePolicy::None => 0,
        }
    }
}

/// Configuration for a [`StateWriter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterSettings {
    pub per_timestep: WritePolicy,
    pub per_cycle: WritePolicy,
    /// Grow storage as records arrive instead of sizing it at `prepare`
    pub resizable: bool,
    /// Rows added each time resizable storage runs out
    pub chunk_size: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            per_timestep: WritePolicy::Mean,
            per_cycle: WritePolicy::Full,
            resizable: true,
            chunk_size: 128,
        }
    }
}

// ============================================================================
// Estimate table
// ============================================================================

/// Stored estimates for one granularity.
///
/// Every array is row-major with one row per record slot.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateTable {
    policy: WritePolicy,
    state_dim: usize,
    output_dim: usize,
    capacity: usize,
    len: usize,
    time: Vec<f64>,
    state_mean: Vec<f64>,
    state_spread: Vec<f64>,
    output_mean: Vec<f64>,
    output_spread: Vec<f64>,
}

impl EstimateTable {
    fn new(policy: WritePolicy, state_dim: usize, output_dim: usize, capacity: usize) -> Self {
        let mut table = Self {
            policy,
            state_dim,
            output_dim,
            capacity: 0,
            len: 0,
            time: Vec::new(),
            state_mean: Vec::new(),
            state_spread: Vec::new(),
            output_mean: Vec::new(),
            output_spread: Vec::new(),
        };
        table.grow(capacity);
        table
    }

    fn grow(&mut self, rows: usize) {
        self.capacity += rows;
        let cap = self.capacity;
        self.time.resize(cap, f64::NAN);
        self.state_mean.resize(cap * self.state_dim, f64::NAN);
        self.state_spread
            .resize(cap * self.policy.spread_width(self.state_dim), f64::NAN);
        self.output_mean.resize(cap * self.output_dim, f64::NAN);
        self.output_spread
            .resize(cap * self.policy.spread_width(self.output_dim), f64::NAN);
    }

    /// Checks that a record fits without writing it.
    fn check(
        &self,
        what: &'static str,
        state: &MultivariateGaussian<f64>,
        output: &MultivariateGaussian<f64>,
        chunk: Option<usize>,
    ) -> Result<()> {
        if state.dimension() != self.state_dim {
            return Err(Error::DimensionMismatch {
                context: "stored state",
                expected: self.state_dim,
                found: state.dimension(),
            });
        }
        if output.dimension() != self.output_dim {
            return Err(Error::DimensionMismatch {
                context: "stored output",
                expected: self.output_dim,
                found: output.dimension(),
            });
        }
        if self.len == self.capacity && chunk.is_none() {
            return Err(Error::StorageFull {
                what,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn push(
        &mut self,
        what: &'static str,
        time: f64,
        state: &MultivariateGaussian<f64>,
        output: &MultivariateGaussian<f64>,
        chunk: Option<usize>,
    ) -> Result<()> {
        self.check(what, state, output, chunk)?;
        if self.len == self.capacity {
            self.grow(chunk.unwrap_or(1).max(1));
        }

        let row = self.len;
        self.time[row] = time;
        write_row(&mut self.state_mean, row, state.get_mean().as_slice());
        write_row(&mut self.output_mean, row, output.get_mean().as_slice());
        match self.policy {
            WritePolicy::Full | WritePolicy::MeanCov => {
                write_row(&mut self.state_spread, row, &row_major(state.get_covariance()));
                write_row(&mut self.output_spread, row, &row_major(output.get_covariance()));
            }
            WritePolicy::MeanVar => {
                write_row(&mut self.state_spread, row, state.get_variance().as_slice());
                write_row(&mut self.output_spread, row, output.get_variance().as_slice());
            }
            WritePolicy::Mean | WritePolicy::None => {}
        }
        self.len += 1;
        Ok(())
    }

    #[inline]
    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    /// Number of records written.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of allocated rows, written or not.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Time of every slot; unwritten slots are NaN.
    pub fn times(&self) -> &[f64] {
        &self.time
    }

    /// State means of every slot, one per row; unwritten rows are NaN.
    pub fn state_means(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.capacity, self.state_dim, &self.state_mean)
    }

    /// Output means of every slot, one per row; unwritten rows are NaN.
    pub fn output_means(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.capacity, self.output_dim, &self.output_mean)
    }

    /// Rebuilds the record in slot `row`.
    pub fn record(&self, row: usize) -> Result<StateRecord> {
        if row >= self.len {
            return Err(Error::DimensionMismatch {
                context: "stored record index",
                expected: self.len,
                found: row,
            });
        }
        let state = self.distribution(row, self.state_dim, &self.state_mean, &self.state_spread)?;
        let output =
            self.distribution(row, self.output_dim, &self.output_mean, &self.output_spread)?;
        Ok((self.time[row], state, output))
    }

    fn distribution(
        &self,
        row: usize,
        dim: usize,
        means: &[f64],
        spread: &[f64],
    ) -> Result<MultivariateGaussian<f64>> {
        let mean = DVector::from_row_slice(&means[row * dim..(row + 1) * dim]);
        let width = self.policy.spread_width(dim);
        let values = &spread[row * width..(row + 1) * width];
        let covariance = match self.policy {
            WritePolicy::Full | WritePolicy::MeanCov => DMatrix::from_row_slice(dim, dim, values),
            WritePolicy::MeanVar => DMatrix::from_diagonal(&DVector::from_row_slice(values)),
            WritePolicy::Mean | WritePolicy::None => DMatrix::zeros(dim, dim),
        };
        MultivariateGaussian::new(mean, covariance)
    }

    /// Iterates over the written records in append order.
    pub fn records(&self) -> impl Iterator<Item = Result<StateRecord>> + '_ {
        (0..self.len).map(move |row| self.record(row))
    }
}

fn write_row(target: &mut [f64], row: usize, values: &[f64]) {
    let width = values.len();
    target[row * width..(row + 1) * width].copy_from_slice(values);
}

fn row_major(matrix: &DMatrix<f64>) -> Vec<f64> {
    matrix.transpose().as_slice().to_vec()
}

// ============================================================================
// Writer
// ============================================================================

/// Records estimates as an estimator runs.
///
/// A writer is created from its settings, prepared once for a specific
/// estimator, then fed with [`append_step`](Self::append_step).
#[derive(Debug, Clone)]
pub struct StateWriter {
    settings: WriterSettings,
    estimator_name: Option<String>,
    state_names: Vec<String>,
    output_names: Vec<String>,
    per_timestep: Option<EstimateTable>,
    per_cycle: Option<EstimateTable>,
    last_cycle: Option<u64>,
    prepared: bool,
}

impl Default for StateWriter {
    fn default() -> Self {
        Self::new(WriterSettings::default())
    }
}

impl StateWriter {
    pub fn new(settings: WriterSettings) -> Self {
        Self {
            settings,
            estimator_name: None,
            state_names: Vec::new(),
            output_names: Vec::new(),
            per_timestep: None,
            per_cycle: None,
            last_cycle: None,
            prepared: false,
        }
    }

    #[inline]
    pub fn settings(&self) -> &WriterSettings {
        &self.settings
    }

    /// Whether the writer can still be prepared.
    #[inline]
    pub fn is_ready(&self) -> bool {
        !self.prepared
    }

    /// Allocates storage sized for an estimator.
    ///
    /// Fixed-size storage needs the total number of steps and of cycles for
    /// every granularity that stores anything. Resizable storage uses the
    /// sizes, when given, as the initial allocation.
    pub fn prepare<E: OnlineEstimator<f64> + ?Sized>(
        &mut self,
        estimator: &E,
        expected_steps: Option<usize>,
        expected_cycles: Option<usize>,
    ) -> Result<()> {
        if self.prepared {
            return Err(Error::AlreadyPrepared);
        }

        let state_dim = estimator.num_state_dimensions();
        let output_dim = estimator.num_output_dimensions();
        self.per_timestep = self.allocate(
            self.settings.per_timestep,
            expected_steps,
            "time steps",
            state_dim,
            output_dim,
        )?;
        self.per_cycle = self.allocate(
            self.settings.per_cycle,
            expected_cycles,
            "cycles",
            state_dim,
            output_dim,
        )?;

        self.estimator_name = Some(std::any::type_name::<E>().to_string());
        self.state_names = estimator.state_names().to_vec();
        self.output_names = estimator.output_names().to_vec();
        self.prepared = true;
        debug!(state_dim, output_dim, resizable = self.settings.resizable, "prepared state writer");
        Ok(())
    }

    fn allocate(
        &self,
        policy: WritePolicy,
        size: Option<usize>,
        what: &'static str,
        state_dim: usize,
        output_dim: usize,
    ) -> Result<Option<EstimateTable>> {
        if !policy.stores_anything() {
            return Ok(None);
        }
        let capacity = match (size, self.settings.resizable) {
            (Some(size), _) => size,
            (None, true) => self.settings.chunk_size,
            (None, false) => return Err(Error::MissingStorageSize(what)),
        };
        Ok(Some(EstimateTable::new(policy, state_dim, output_dim, capacity)))
    }

    /// Records the estimate of one time step.
    ///
    /// The per-cycle table keeps the first step after every change of the
    /// cycle index. A record that does not fit leaves both tables unchanged.
    pub fn append_step(
        &mut self,
        time: f64,
        cycle: u64,
        state: &MultivariateGaussian<f64>,
        output: &MultivariateGaussian<f64>,
    ) -> Result<()> {
        if !self.prepared {
            return Err(Error::NotPrepared);
        }
        let chunk = self.settings.resizable.then_some(self.settings.chunk_size);
        let new_cycle = self.last_cycle != Some(cycle);

        // Both tables accept the record or neither does
        if let Some(table) = self.per_timestep.as_ref() {
            table.check("time steps", state, output, chunk)?;
        }
        if let Some(table) = self.per_cycle.as_ref().filter(|_| new_cycle) {
            table.check("cycles", state, output, chunk)?;
        }

        if let Some(table) = self.per_timestep.as_mut() {
            table.push("time steps", time, state, output, chunk)?;
        }
        if new_cycle {
            if let Some(table) = self.per_cycle.as_mut() {
                table.push("cycles", time, state, output, chunk)?;
            }
            self.last_cycle = Some(cycle);
        }
        Ok(())
    }

    /// Name of the estimator type the writer was prepared for.
    pub fn estimator_name(&self) -> Option<&str> {
        self.estimator_name.as_deref()
    }

    pub fn state_names(&self) -> &[String] {
        &self.state_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub fn per_timestep(&self) -> Option<&EstimateTable> {
        self.per_timestep.as_ref()
    }

    pub fn per_cycle(&self) -> Option<&EstimateTable> {
        self.per_cycle.as_ref()
    }

    /// Iterates over the stored records of one granularity in append order.
    ///
    /// Fails with [`Error::NoData`] when that granularity was not stored.
    pub fn read_state_estimates(
        &self,
        per_timestep: bool,
    ) -> Result<impl Iterator<Item = Result<StateRecord>> + '_> {
        let (table, what) = if per_timestep {
            (self.per_timestep.as_ref(), "per_timestep")
        } else {
            (self.per_cycle.as_ref(), "per_cycle")
        };
        table.map(EstimateTable::records).ok_or(Error::NoData(what))
    }

    /// Writes the store to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(BufWriter::new(file), &StoreFile::from(self))?;
        Ok(())
    }

    /// Reads a store written by [`save`](Self::save). The loaded writer
    /// cannot be prepared again.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let stored: StoreFile = serde_json::from_reader(BufReader::new(file))?;
        stored.into_writer()
    }
}

/// Reads the records of one granularity from a saved store.
pub fn read_state_estimates(
    path: impl AsRef<Path>,
    per_timestep: bool,
) -> Result<Vec<StateRecord>> {
    let writer = StateWriter::load(path)?;
    let records: Result<Vec<StateRecord>> = writer.read_state_estimates(per_timestep)?.collect();
    records
}

// ============================================================================
// File format
// ============================================================================

/// Written rows only; NaN padding is rebuilt from `capacity` on load.
#[derive(Debug, Serialize, Deserialize)]
struct TableFile {
    policy: WritePolicy,
    state_dim: usize,
    output_dim: usize,
    capacity: usize,
    time: Vec<f64>,
    state_mean: Vec<f64>,
    state_spread: Vec<f64>,
    output_mean: Vec<f64>,
    output_spread: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    settings: WriterSettings,
    estimator_name: Option<String>,
    state_names: Vec<String>,
    output_names: Vec<String>,
    last_cycle: Option<u64>,
    per_timestep: Option<TableFile>,
    per_cycle: Option<TableFile>,
}

impl From<&EstimateTable> for TableFile {
    fn from(table: &EstimateTable) -> Self {
        let rows = table.len;
        let state_width = table.policy.spread_width(table.state_dim);
        let output_width = table.policy.spread_width(table.output_dim);
        Self {
            policy: table.policy,
            state_dim: table.state_dim,
            output_dim: table.output_dim,
            capacity: table.capacity,
            time: table.time[..rows].to_vec(),
            state_mean: table.state_mean[..rows * table.state_dim].to_vec(),
            state_spread: table.state_spread[..rows * state_width].to_vec(),
            output_mean: table.output_mean[..rows * table.output_dim].to_vec(),
            output_spread: table.output_spread[..rows * output_width].to_vec(),
        }
    }
}

impl TableFile {
    fn into_table(self) -> Result<EstimateTable> {
        let rows = self.time.len();
        let state_width = self.policy.spread_width(self.state_dim);
        let output_width = self.policy.spread_width(self.output_dim);
        let lengths = [
            (self.state_mean.len(), rows * self.state_dim),
            (self.state_spread.len(), rows * state_width),
            (self.output_mean.len(), rows * self.output_dim),
            (self.output_spread.len(), rows * output_width),
        ];
        for (found, expected) in lengths {
            if found != expected {
                return Err(Error::DimensionMismatch {
                    context: "stored estimate table",
                    expected,
                    found,
                });
            }
        }

        let capacity = self.capacity.max(rows);
        let mut table = EstimateTable::new(self.policy, self.state_dim, self.output_dim, capacity);
        table.time[..rows].copy_from_slice(&self.time);
        table.state_mean[..self.state_mean.len()].copy_from_slice(&self.state_mean);
        table.state_spread[..self.state_spread.len()].copy_from_slice(&self.state_spread);
        table.output_mean[..self.output_mean.len()].copy_from_slice(&self.output_mean);
        table.output_spread[..self.output_spread.len()].copy_from_slice(&self.output_spread);
        table.len = rows;
        Ok(table)
    }
}

impl From<&StateWriter> for StoreFile {
    fn from(writer: &StateWriter) -> Self {
        Self {
            settings: writer.settings.clone(),
            estimator_name: writer.estimator_name.clone(),
            state_names: writer.state_names.clone(),
            output_names: writer.output_names.clone(),
            last_cycle: writer.last_cycle,
            per_timestep: writer.per_timestep.as_ref().map(TableFile::from),
            per_cycle: writer.per_cycle.as_ref().map(TableFile::from),
        }
    }
}

impl StoreFile {
    fn into_writer(self) -> Result<StateWriter> {
        Ok(StateWriter {
            settings: self.settings,
            estimator_name: self.estimator_name,
            state_names: self.state_names,
            output_names: self.output_names,
            per_timestep: self.per_timestep.map(TableFile::into_table).transpose()?,
            per_cycle: self.per_cycle.map(TableFile::into_table).transpose()?,
            last_cycle: self.last_cycle,
            prepared: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    fn state() -> MultivariateGaussian<f64> {
        MultivariateGaussian::new(
            dvector![0.1, 0.0, 0.05],
            dmatrix![1.0 / 12.0, 0.01, 0.0; 0.01, 4.0 / 12.0, 0.0; 0.0, 0.0, 2.5e-5],
        )
        .unwrap()
    }

    fn output() -> MultivariateGaussian<f64> {
        MultivariateGaussian::new(dvector![0.0], dmatrix![1.0]).unwrap()
    }

    fn table_with_two(policy: WritePolicy) -> EstimateTable {
        let mut table = EstimateTable::new(policy, 3, 1, 4);
        let first = state();
        let second = first.with_mean(first.get_mean().add_scalar(0.1)).unwrap();
        table.push("test", 0.0, &first, &output(), None).unwrap();
        table.push("test", 1.0, &second, &output(), None).unwrap();
        table
    }

    #[test]
    fn test_policy_from_json() {
        let settings: WriterSettings = serde_json::from_str(
            r#"{
                "per_timestep": "mean_var",
                "per_cycle": "none",
                "resizable": false,
                "chunk_size": 16
            }"#,
        )
        .unwrap();
        assert_eq!(settings.per_timestep, WritePolicy::MeanVar);
        assert!(!settings.per_cycle.stores_anything());
    }

    #[test]
    fn test_unwritten_rows_are_nan() {
        let table = table_with_two(WritePolicy::Mean);
        let means = table.state_means();
        assert_eq!(means.nrows(), 4);
        assert!((means[(1, 0)] - 0.2).abs() < 1e-12);
        assert!(means.rows(2, 2).iter().all(|v| v.is_nan()));
        assert!(table.times()[3].is_nan());
    }

    #[test]
    fn test_table_full_round_trip() {
        let table = table_with_two(WritePolicy::Full);
        let records: Vec<_> = table.records().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 2);

        let (time, second, out) = &records[1];
        assert_eq!(*time, 1.0);
        assert!((second.get_mean()[0] - 0.2).abs() < 1e-12);
        assert_eq!(second.get_covariance(), state().get_covariance());
        assert_eq!(out, &output());
    }

    #[test]
    fn test_table_mean_var_keeps_diagonal() {
        let table = table_with_two(WritePolicy::MeanVar);
        let (_, first, _) = table.record(0).unwrap();
        assert_eq!(first.get_variance(), state().get_variance());
        assert_eq!(first.get_covariance()[(0, 1)], 0.0);
    }

    #[test]
    fn test_table_mean_only_has_zero_covariance() {
        let table = table_with_two(WritePolicy::Mean);
        let (_, first, _) = table.record(0).unwrap();
        assert_eq!(first.get_mean(), state().get_mean());
        assert!(first.get_covariance().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_fixed_table_reports_full() {
        let mut table = EstimateTable::new(WritePolicy::Mean, 3, 1, 1);
        table.push("test", 0.0, &state(), &output(), None).unwrap();
        assert!(matches!(
            table.push("test", 1.0, &state(), &output(), None),
            Err(Error::StorageFull { capacity: 1, .. })
        ));

        // Resizable tables grow instead
        table.push("test", 1.0, &state(), &output(), Some(8)).unwrap();
        assert_eq!(table.capacity(), 9);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_table_checks_dimensions() {
        let mut table = EstimateTable::new(WritePolicy::Full, 2, 1, 4);
        assert!(table.push("test", 0.0, &state(), &output(), None).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_unprepared_writer_rejects_records() {
        let mut writer = StateWriter::default();
        assert!(writer.is_ready());
        assert!(matches!(
            writer.append_step(0.0, 0, &state(), &output()),
            Err(Error::NotPrepared)
        ));
    }
}
