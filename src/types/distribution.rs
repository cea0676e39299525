//! Multivariate Gaussian distributions
//!
//! The only distribution the filters exchange: a mean vector and a covariance
//! matrix of matching dimension. Combination, marginal extraction and affine
//! conversion all return new distributions; nothing is mutated in place except
//! through [`MultivariateGaussian::symmetrize`].

use nalgebra::{DMatrix, DVector, RealField};

use super::conversion::ConversionOperator;
use crate::{Error, Result};

// ============================================================================
// Multivariate Gaussian
// ============================================================================

/// A multivariate Gaussian described by its first two moments.
///
/// The covariance is expected to be symmetric positive semi-definite. The
/// filters call [`symmetrize`](Self::symmetrize) after every update so that
/// rounding error never accumulates into an asymmetric matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateGaussian<T: RealField> {
    mean: DVector<T>,
    covariance: DMatrix<T>,
}

impl<T: RealField + Copy> MultivariateGaussian<T> {
    /// Creates a distribution, checking that the covariance is `D×D` for a
    /// length-`D` mean.
    pub fn new(mean: DVector<T>, covariance: DMatrix<T>) -> Result<Self> {
        let dim = mean.len();
        if covariance.nrows() != dim {
            return Err(Error::DimensionMismatch {
                context: "distribution covariance rows",
                expected: dim,
                found: covariance.nrows(),
            });
        }
        if covariance.ncols() != dim {
            return Err(Error::DimensionMismatch {
                context: "distribution covariance columns",
                expected: dim,
                found: covariance.ncols(),
            });
        }
        Ok(Self { mean, covariance })
    }

    /// Creates a distribution with independent components.
    pub fn from_diagonal(mean: DVector<T>, variances: &DVector<T>) -> Result<Self> {
        Self::new(mean, DMatrix::from_diagonal(variances))
    }

    /// Creates a distribution with zero covariance (an exactly known value).
    pub fn deterministic(mean: DVector<T>) -> Self {
        let dim = mean.len();
        Self {
            mean,
            covariance: DMatrix::zeros(dim, dim),
        }
    }

    /// Returns the dimension of the distribution.
    #[inline]
    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Returns the mean vector.
    #[inline]
    pub fn get_mean(&self) -> &DVector<T> {
        &self.mean
    }

    /// Returns the covariance matrix.
    #[inline]
    pub fn get_covariance(&self) -> &DMatrix<T> {
        &self.covariance
    }

    /// Returns the marginal variances (the covariance diagonal).
    #[inline]
    pub fn get_variance(&self) -> DVector<T> {
        self.covariance.diagonal()
    }

    /// Consumes self and returns the mean and covariance.
    #[inline]
    pub fn into_parts(self) -> (DVector<T>, DMatrix<T>) {
        (self.mean, self.covariance)
    }

    /// Returns a copy with a different mean and the same covariance.
    pub fn with_mean(&self, mean: DVector<T>) -> Result<Self> {
        Self::new(mean, self.covariance.clone())
    }

    /// Replaces the covariance with `(C + Cᵀ) / 2`.
    pub fn symmetrize(&mut self) {
        let half: T = nalgebra::convert(0.5);
        let transposed = self.covariance.transpose();
        self.covariance = (&self.covariance + transposed) * half;
    }

    /// Concatenates two independent distributions.
    ///
    /// The mean of `self` comes first, followed by the mean of `other`. The
    /// covariance is block diagonal with zero cross terms.
    pub fn combine_with(&self, other: &Self) -> Self {
        let a = self.dimension();
        let b = other.dimension();
        let mut covariance = DMatrix::zeros(a + b, a + b);
        covariance.view_mut((0, 0), (a, a)).copy_from(&self.covariance);
        covariance.view_mut((a, a), (b, b)).copy_from(&other.covariance);

        Self {
            mean: stack_means(&self.mean, &other.mean),
            covariance,
        }
    }

    /// Concatenates two distributions that share a known cross-covariance.
    ///
    /// `cross` is the `a×b` covariance between the components of `self` and
    /// those of `other`.
    pub fn combine_with_cross(&self, other: &Self, cross: &DMatrix<T>) -> Result<Self> {
        let a = self.dimension();
        let b = other.dimension();
        if cross.nrows() != a {
            return Err(Error::DimensionMismatch {
                context: "cross-covariance rows",
                expected: a,
                found: cross.nrows(),
            });
        }
        if cross.ncols() != b {
            return Err(Error::DimensionMismatch {
                context: "cross-covariance columns",
                expected: b,
                found: cross.ncols(),
            });
        }

        let mut combined = self.combine_with(other);
        combined.covariance.view_mut((0, a), (a, b)).copy_from(cross);
        combined
            .covariance
            .view_mut((a, 0), (b, a))
            .copy_from(&cross.transpose());
        Ok(combined)
    }

    /// Extracts the marginal distribution of the selected components, in the
    /// order given.
    pub fn get_marginal(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.dimension()) {
            return Err(Error::InvalidParameter(format!(
                "component {bad} is out of range for a {}-dimensional distribution",
                self.dimension()
            )));
        }

        let k = indices.len();
        let mean = DVector::from_iterator(k, indices.iter().map(|&i| self.mean[i]));
        let covariance =
            DMatrix::from_fn(k, k, |r, c| self.covariance[(indices[r], indices[c])]);
        Ok(Self { mean, covariance })
    }

    /// Maps the distribution through a conversion operator.
    ///
    /// With `inverse == false` the forward transform is applied (filter to
    /// model coordinates for the operators in this crate); with `inverse ==
    /// true` the inverse transform is applied.
    pub fn convert(&self, operator: &dyn ConversionOperator<T>, inverse: bool) -> Result<Self> {
        let (mean, covariance) = if inverse {
            (
                operator.inverse_transform_vector(&self.mean)?,
                operator.inverse_transform_covariance(&self.covariance)?,
            )
        } else {
            (
                operator.transform_vector(&self.mean)?,
                operator.transform_covariance(&self.covariance)?,
            )
        };
        Self::new(mean, covariance)
    }
}

fn stack_means<T: RealField + Copy>(first: &DVector<T>, second: &DVector<T>) -> DVector<T> {
    DVector::from_iterator(
        first.len() + second.len(),
        first.iter().chain(second.iter()).copied(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    #[test]
    fn test_new_rejects_mismatched_covariance() {
        let result = MultivariateGaussian::new(dvector![1.0, 2.0], DMatrix::<f64>::identity(3, 3));
        assert!(matches!(
            result,
            Err(Error::DimensionMismatch { expected: 2, found: 3, .. })
        ));
    }

    #[test]
    fn test_combine_with_is_block_diagonal() {
        let first =
            MultivariateGaussian::new(dvector![1.0, 2.0], dmatrix![2.0, 0.5; 0.5, 1.0]).unwrap();
        let second = MultivariateGaussian::new(dvector![3.0], dmatrix![4.0]).unwrap();

        let combined = first.combine_with(&second);
        assert_eq!(combined.dimension(), 3);
        assert_eq!(combined.get_mean(), &dvector![1.0, 2.0, 3.0]);

        let expected = dmatrix![
            2.0, 0.5, 0.0;
            0.5, 1.0, 0.0;
            0.0, 0.0, 4.0
        ];
        assert_eq!(combined.get_covariance(), &expected);
    }

    #[test]
    fn test_combine_with_cross_fills_off_diagonal() {
        let first = MultivariateGaussian::<f64>::new(dvector![0.0], dmatrix![1.0]).unwrap();
        let second =
            MultivariateGaussian::new(dvector![0.0, 0.0], DMatrix::identity(2, 2)).unwrap();

        let combined = first
            .combine_with_cross(&second, &dmatrix![0.1, 0.2])
            .unwrap();
        let cov = combined.get_covariance();
        assert!((cov[(0, 2)] - 0.2).abs() < 1e-12);
        assert!((cov[(2, 0)] - 0.2).abs() < 1e-12);
        assert!((cov[(1, 0)] - 0.1).abs() < 1e-12);

        let bad = first.combine_with_cross(&second, &dmatrix![0.1; 0.2]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_marginal_extracts_sub_blocks() {
        let dist = MultivariateGaussian::new(
            dvector![1.0, 2.0, 3.0],
            dmatrix![
                1.0, 0.1, 0.2;
                0.1, 2.0, 0.3;
                0.2, 0.3, 3.0
            ],
        )
        .unwrap();

        let marginal = dist.get_marginal(&[2, 0]).unwrap();
        assert_eq!(marginal.get_mean(), &dvector![3.0, 1.0]);
        assert_eq!(marginal.get_covariance(), &dmatrix![3.0, 0.2; 0.2, 1.0]);

        assert!(dist.get_marginal(&[3]).is_err());
    }

    #[test]
    fn test_symmetrize() {
        let mut dist =
            MultivariateGaussian::<f64>::new(dvector![0.0, 0.0], dmatrix![1.0, 0.2; 0.4, 1.0])
                .unwrap();
        dist.symmetrize();
        let cov = dist.get_covariance();
        assert!((cov[(0, 1)] - 0.3).abs() < 1e-12);
        assert!((cov[(1, 0)] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_variance_is_diagonal() {
        let dist =
            MultivariateGaussian::from_diagonal(dvector![0.0, 0.0], &dvector![0.25, 4.0]).unwrap();
        assert_eq!(dist.get_variance(), dvector![0.25, 4.0]);
    }
}
