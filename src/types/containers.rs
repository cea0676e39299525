//! Named, batched containers exchanged with a physical model
//!
//! Every container stores its values as a `batch × components` matrix. The
//! estimators always start from a batch of one; the wrappers grow the batch to
//! one row per sigma point when they evaluate the model. Arrays combined in one
//! model call must have a batch size of 1 or a common batch size, see
//! [`common_batch_size`] and [`broadcast_rows`].

use nalgebra::{DMatrix, DVector, RealField};

use crate::{Error, Result};

// ============================================================================
// Broadcasting
// ============================================================================

/// Finds the batch size shared by a set of arrays.
///
/// Each array must have either one row or the common number of rows.
pub fn common_batch_size<T: RealField>(arrays: &[&DMatrix<T>]) -> Result<usize> {
    let batch = arrays.iter().map(|a| a.nrows()).max().unwrap_or(1).max(1);
    for array in arrays {
        if array.nrows() != 1 && array.nrows() != batch {
            return Err(Error::BatchMismatch {
                expected: batch,
                found: array.nrows(),
            });
        }
    }
    Ok(batch)
}

/// Repeats a single-row array to `rows` rows. Arrays that already have `rows`
/// rows are returned unchanged.
pub fn broadcast_rows<T: RealField + Copy>(array: &DMatrix<T>, rows: usize) -> Result<DMatrix<T>> {
    if array.nrows() == rows {
        return Ok(array.clone());
    }
    if array.nrows() != 1 {
        return Err(Error::BatchMismatch {
            expected: rows,
            found: array.nrows(),
        });
    }
    Ok(DMatrix::from_fn(rows, array.ncols(), |_, c| array[(0, c)]))
}

// ============================================================================
// Quantities
// ============================================================================

/// A set of named scalar quantities, batched by row.
///
/// Used for control inputs, transient states and model outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantities<T: RealField> {
    names: Vec<String>,
    values: DMatrix<T>,
}

impl<T: RealField + Copy> Quantities<T> {
    /// Creates a container; there must be one name per column.
    pub fn new(names: Vec<String>, values: DMatrix<T>) -> Result<Self> {
        if names.len() != values.ncols() {
            return Err(Error::ComponentCountMismatch {
                what: "quantities".into(),
                expected: names.len(),
                found: values.ncols(),
            });
        }
        Ok(Self { names, values })
    }

    /// Creates a batch-of-one container from names and values.
    pub fn from_slice<S: AsRef<str>>(names: &[S], values: &[T]) -> Result<Self> {
        let names = names.iter().map(|n| n.as_ref().to_string()).collect();
        Self::new(names, DMatrix::from_row_slice(1, values.len(), values))
    }

    /// Returns a container with the same names and new values.
    pub fn make_copy(&self, values: DMatrix<T>) -> Result<Self> {
        Self::new(self.names.clone(), values)
    }

    /// Replaces the values, keeping the names.
    pub fn set_values(&mut self, values: DMatrix<T>) -> Result<()> {
        if values.ncols() != self.names.len() {
            return Err(Error::ComponentCountMismatch {
                what: "quantities".into(),
                expected: self.names.len(),
                found: values.ncols(),
            });
        }
        self.values = values;
        Ok(())
    }

    #[inline]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[inline]
    pub fn values(&self) -> &DMatrix<T> {
        &self.values
    }

    /// Number of components.
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of rows in the batch.
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.values.nrows()
    }

    /// Position of a named component.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Values of one named component across the batch.
    pub fn column(&self, name: &str) -> Option<DVector<T>> {
        self.index_of(name).map(|i| self.values.column(i).into_owned())
    }

    /// The first batch row as a vector.
    pub fn to_vector(&self) -> DVector<T> {
        self.values.row(0).transpose()
    }
}

// ============================================================================
// Health parameters
// ============================================================================

/// One named health parameter. Vector-valued parameters (e.g. a lookup table)
/// occupy several columns.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthParameter<T: RealField> {
    pub name: String,
    pub values: DMatrix<T>,
    pub updatable: bool,
}

/// The ordered set of health parameters of a model.
///
/// The order in which parameters are added is the order in which their
/// components appear in every array produced by [`get_parameters`](Self::get_parameters).
#[derive(Debug, Clone, PartialEq)]
pub struct HealthParameters<T: RealField> {
    parameters: Vec<HealthParameter<T>>,
}

impl<T: RealField + Copy> Default for HealthParameters<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RealField + Copy> HealthParameters<T> {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    /// Adds a batch-of-one parameter, builder style.
    pub fn with_parameter(mut self, name: &str, values: &[T], updatable: bool) -> Result<Self> {
        self.add_parameter(
            name,
            DMatrix::from_row_slice(1, values.len(), values),
            updatable,
        )?;
        Ok(self)
    }

    /// Adds a parameter with batched values.
    pub fn add_parameter(&mut self, name: &str, values: DMatrix<T>, updatable: bool) -> Result<()> {
        if self.find(name).is_some() {
            return Err(Error::InvalidParameter(format!(
                "health parameter {name} defined twice"
            )));
        }
        if values.ncols() == 0 {
            return Err(Error::InvalidParameter(format!(
                "health parameter {name} has no components"
            )));
        }
        self.parameters.push(HealthParameter {
            name: name.to_string(),
            values,
            updatable,
        });
        Ok(())
    }

    /// Flags a parameter as one the estimators may update.
    pub fn mark_updatable(&mut self, name: &str) -> Result<()> {
        let index = self
            .find(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        self.parameters[index].updatable = true;
        Ok(())
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }

    /// All parameter names, in order.
    pub fn all_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    /// Names of the parameters flagged updatable, in order.
    pub fn updatable_names(&self) -> Vec<String> {
        self.parameters
            .iter()
            .filter(|p| p.updatable)
            .map(|p| p.name.clone())
            .collect()
    }

    /// Values of one parameter.
    pub fn parameter(&self, name: &str) -> Option<&DMatrix<T>> {
        self.find(name).map(|i| &self.parameters[i].values)
    }

    /// Iterates over the parameters in order.
    pub fn iter(&self) -> impl Iterator<Item = &HealthParameter<T>> {
        self.parameters.iter()
    }

    /// Largest batch among the parameters.
    pub fn batch_size(&self) -> usize {
        self.parameters
            .iter()
            .map(|p| p.values.nrows())
            .max()
            .unwrap_or(1)
    }

    fn selected(&self, names: &[String]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|n| self.find(n).ok_or_else(|| Error::UnknownParameter(n.clone())))
            .collect()
    }

    /// Total number of scalar components in the named parameters.
    pub fn num_components(&self, names: &[String]) -> Result<usize> {
        Ok(self
            .selected(names)?
            .into_iter()
            .map(|i| self.parameters[i].values.ncols())
            .sum())
    }

    /// Concatenates the named parameters into one `batch × components` array.
    pub fn get_parameters(&self, names: &[String]) -> Result<DMatrix<T>> {
        let indices = self.selected(names)?;
        let arrays: Vec<&DMatrix<T>> =
            indices.iter().map(|&i| &self.parameters[i].values).collect();
        let batch = common_batch_size(&arrays)?;
        let width: usize = arrays.iter().map(|a| a.ncols()).sum();

        let mut out = DMatrix::zeros(batch, width);
        let mut col = 0;
        for array in arrays {
            let broadcast = broadcast_rows(array, batch)?;
            out.view_mut((0, col), (batch, array.ncols())).copy_from(&broadcast);
            col += array.ncols();
        }
        Ok(out)
    }

    /// Overwrites the named parameters with consecutive column blocks of
    /// `values`. The parameters take on the batch size of `values`.
    pub fn update_parameters(&mut self, values: &DMatrix<T>, names: &[String]) -> Result<()> {
        let indices = self.selected(names)?;
        let expected = self.num_components(names)?;
        if values.ncols() != expected {
            return Err(Error::ComponentCountMismatch {
                what: "health parameter update".into(),
                expected,
                found: values.ncols(),
            });
        }

        let mut col = 0;
        for i in indices {
            let width = self.parameters[i].values.ncols();
            self.parameters[i].values = values.columns(col, width).into_owned();
            col += width;
        }
        Ok(())
    }

    /// Component names for the named parameters: the bare name for scalar
    /// parameters, `name[i]` for vector-valued ones.
    pub fn expand_names(&self, names: &[String]) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for i in self.selected(names)? {
            let p = &self.parameters[i];
            if p.values.ncols() == 1 {
                out.push(p.name.clone());
            } else {
                out.extend((0..p.values.ncols()).map(|k| format!("{}[{}]", p.name, k)));
            }
        }
        Ok(out)
    }
}
