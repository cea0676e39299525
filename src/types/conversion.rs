//! Coordinate conversions between model space and filter space
//!
//! A filter may work in a scaled (normalized) copy of the model's coordinates,
//! which keeps quantities of very different magnitudes well conditioned. A
//! [`ConversionOperator`] maps batched points and covariances between the two.
//!
//! # Direction Convention
//!
//! The *forward* transform maps filter coordinates to model coordinates. The
//! *inverse* transform is the normalizing direction, taking model coordinates
//! into filter coordinates. For [`LinearConversion`]:
//!
//! - forward: `x_model = x_filter * s + b`, covariance `D C Dᵀ` with `D = diag(s)`
//! - inverse: `x_filter = (x_model - b) / s`, covariance `D C Dᵀ` with `D = diag(1/s)`
//!
//! Points are stored one per row, so a batch of `k` points in `d` dimensions
//! is a `k×d` matrix.

use core::fmt::Debug;

use nalgebra::{DMatrix, DVector, RealField};
use tracing::warn;

use crate::{Error, Result};

// ============================================================================
// Conversion Operator
// ============================================================================

/// An invertible, affine map between two coordinate spaces of equal dimension.
pub trait ConversionOperator<T: RealField + Copy>: Debug {
    /// Maps a batch of points (one per row) from filter to model coordinates.
    fn transform_points(&self, points: &DMatrix<T>) -> Result<DMatrix<T>>;

    /// Maps a batch of points (one per row) from model to filter coordinates.
    fn inverse_transform_points(&self, points: &DMatrix<T>) -> Result<DMatrix<T>>;

    /// Maps a covariance from filter to model coordinates.
    fn transform_covariance(&self, covariance: &DMatrix<T>) -> Result<DMatrix<T>>;

    /// Maps a covariance from model to filter coordinates.
    fn inverse_transform_covariance(&self, covariance: &DMatrix<T>) -> Result<DMatrix<T>>;

    /// Maps a single point from filter to model coordinates.
    fn transform_vector(&self, point: &DVector<T>) -> Result<DVector<T>> {
        let row = DMatrix::from_row_slice(1, point.len(), point.as_slice());
        Ok(self.transform_points(&row)?.row(0).transpose())
    }

    /// Maps a single point from model to filter coordinates.
    fn inverse_transform_vector(&self, point: &DVector<T>) -> Result<DVector<T>> {
        let row = DMatrix::from_row_slice(1, point.len(), point.as_slice());
        Ok(self.inverse_transform_points(&row)?.row(0).transpose())
    }
}

/// Passthrough conversion. Points and covariances are returned unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityConversion;

impl<T: RealField + Copy> ConversionOperator<T> for IdentityConversion {
    fn transform_points(&self, points: &DMatrix<T>) -> Result<DMatrix<T>> {
        Ok(points.clone())
    }

    fn inverse_transform_points(&self, points: &DMatrix<T>) -> Result<DMatrix<T>> {
        Ok(points.clone())
    }

    fn transform_covariance(&self, covariance: &DMatrix<T>) -> Result<DMatrix<T>> {
        Ok(covariance.clone())
    }

    fn inverse_transform_covariance(&self, covariance: &DMatrix<T>) -> Result<DMatrix<T>> {
        Ok(covariance.clone())
    }
}

// ============================================================================
// Linear (diagonal scale) conversion
// ============================================================================

/// Elementwise scale plus offset.
///
/// Zero entries in the scale are replaced with one when the operator is built,
/// so parameters that are exactly zero are left unnormalized.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearConversion<T: RealField> {
    scale: DVector<T>,
    offset: DVector<T>,
}

impl<T: RealField + Copy> LinearConversion<T> {
    /// Creates a pure scaling conversion.
    pub fn new(scale: DVector<T>) -> Self {
        let offset = DVector::zeros(scale.len());
        Self {
            scale: replace_zero_scale(scale),
            offset,
        }
    }

    /// Creates a scaling conversion with an additive offset.
    pub fn with_offset(scale: DVector<T>, offset: DVector<T>) -> Result<Self> {
        if offset.len() != scale.len() {
            return Err(Error::DimensionMismatch {
                context: "conversion offset",
                expected: scale.len(),
                found: offset.len(),
            });
        }
        Ok(Self {
            scale: replace_zero_scale(scale),
            offset,
        })
    }

    /// Returns the (zero-corrected) scale vector.
    #[inline]
    pub fn scale(&self) -> &DVector<T> {
        &self.scale
    }

    /// Returns the offset vector.
    #[inline]
    pub fn offset(&self) -> &DVector<T> {
        &self.offset
    }

    /// Returns the dimension of the spaces this operator maps between.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.scale.len()
    }

    fn check_points(&self, points: &DMatrix<T>) -> Result<()> {
        if points.ncols() != self.dimension() {
            return Err(Error::DimensionMismatch {
                context: "conversion points",
                expected: self.dimension(),
                found: points.ncols(),
            });
        }
        Ok(())
    }

    fn check_covariance(&self, covariance: &DMatrix<T>) -> Result<()> {
        if covariance.nrows() != self.dimension() || covariance.ncols() != self.dimension() {
            return Err(Error::DimensionMismatch {
                context: "conversion covariance",
                expected: self.dimension(),
                found: covariance.nrows().max(covariance.ncols()),
            });
        }
        Ok(())
    }
}

fn replace_zero_scale<T: RealField + Copy>(mut scale: DVector<T>) -> DVector<T> {
    let mut replaced = 0usize;
    for s in scale.iter_mut() {
        if *s == T::zero() {
            *s = T::one();
            replaced += 1;
        }
    }
    if replaced > 0 {
        warn!(replaced, "zero entries in conversion scale left unnormalized");
    }
    scale
}

impl<T: RealField + Copy> ConversionOperator<T> for LinearConversion<T> {
    fn transform_points(&self, points: &DMatrix<T>) -> Result<DMatrix<T>> {
        self.check_points(points)?;
        Ok(DMatrix::from_fn(points.nrows(), points.ncols(), |r, c| {
            points[(r, c)] * self.scale[c] + self.offset[c]
        }))
    }

    fn inverse_transform_points(&self, points: &DMatrix<T>) -> Result<DMatrix<T>> {
        self.check_points(points)?;
        Ok(DMatrix::from_fn(points.nrows(), points.ncols(), |r, c| {
            (points[(r, c)] - self.offset[c]) / self.scale[c]
        }))
    }

    fn transform_covariance(&self, covariance: &DMatrix<T>) -> Result<DMatrix<T>> {
        self.check_covariance(covariance)?;
        // D C Dᵀ with diagonal D reduces to scaling entry (i, j) by s_i s_j
        Ok(DMatrix::from_fn(covariance.nrows(), covariance.ncols(), |r, c| {
            covariance[(r, c)] * self.scale[r] * self.scale[c]
        }))
    }

    fn inverse_transform_covariance(&self, covariance: &DMatrix<T>) -> Result<DMatrix<T>> {
        self.check_covariance(covariance)?;
        Ok(DMatrix::from_fn(covariance.nrows(), covariance.ncols(), |r, c| {
            covariance[(r, c)] / (self.scale[r] * self.scale[c])
        }))
    }
}
