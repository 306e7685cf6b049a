//! Projection of point clouds onto a two-dimensional basis and back.
//!
//! The basis is either fitted by PCA (top two eigenvectors of the covariance
//! matrix), fitted from uncentered second moments (the right singular vectors
//! of the point matrix), or supplied from outside (prior stain directions).
//!
//! Point storage is explicit. With [`VectorDirection::RowVectors`] each row is
//! a point (`N × C`), the mean is `1 × C` and the basis is `C × 2`. With
//! [`VectorDirection::ColumnVectors`] each column is a point (`C × N`), the
//! mean is `C × 1` and the basis is `2 × C`. The direction picks the
//! multiplication order; shapes that disagree with it are rejected.

use crate::error::{Result, StainError};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Number of basis vectors kept: the angle histogram needs a plane.
pub const REQUIRED_BASIS_VECTORS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorDirection {
    RowVectors,
    ColumnVectors,
}

#[derive(Debug, Clone)]
pub struct BasisTransform {
    direction: VectorDirection,
    mean: Array2<f64>,
    eigenvalues: Array1<f64>,
    eigenvectors: Array2<f64>,
    basis: Array2<f64>,
}

impl BasisTransform {
    /// Fit a PCA basis to `points`.
    ///
    /// Needs strictly more points than channels. The covariance matrix uses
    /// the unbiased `1 / (N - 1)` scale; eigenpairs are sorted by descending
    /// eigenvalue.
    pub fn fit_pca(points: ArrayView2<f64>, direction: VectorDirection) -> Result<Self> {
        let samples = as_row_samples(points, direction);
        let (n, c) = samples.dim();
        check_overdetermined(n, c)?;
        let mean = samples
            .mean_axis(Axis(0))
            .ok_or(StainError::EmptyInput("points"))?;
        let centered = &samples - &mean.view().insert_axis(Axis(0));
        let covariance = centered.t().dot(&centered) / (n as f64 - 1.0);
        Self::from_scatter(&covariance, mean, direction)
    }

    /// Fit a basis from the uncentered second-moment matrix `XᵀX / N`.
    ///
    /// The eigenvectors are the right singular vectors of the point matrix,
    /// so the first axis follows the mean direction of the cloud. The stored
    /// mean is zero.
    pub fn fit_uncentered(points: ArrayView2<f64>, direction: VectorDirection) -> Result<Self> {
        let samples = as_row_samples(points, direction);
        let (n, c) = samples.dim();
        check_overdetermined(n, c)?;
        let scatter = samples.t().dot(&samples) / n as f64;
        Self::from_scatter(&scatter, Array1::zeros(c), direction)
    }

    /// Use fixed basis vectors, one per row of `vectors` (`2 × C`).
    ///
    /// `back_project` inverts `project` only when the vectors are
    /// orthonormal.
    pub fn from_basis_vectors(
        vectors: ArrayView2<f64>,
        mean: Option<Array1<f64>>,
        direction: VectorDirection,
    ) -> Result<Self> {
        if vectors.nrows() != REQUIRED_BASIS_VECTORS {
            return Err(StainError::DimensionMismatch(format!(
                "expected {REQUIRED_BASIS_VECTORS} basis vectors, got {}",
                vectors.nrows()
            )));
        }
        let c = vectors.ncols();
        let mean = mean.unwrap_or_else(|| Array1::zeros(c));
        if mean.len() != c {
            return Err(StainError::DimensionMismatch(format!(
                "mean has {} components, basis has {c}",
                mean.len()
            )));
        }
        let t = Self {
            direction,
            mean: shape_mean(mean, direction),
            eigenvalues: Array1::zeros(0),
            eigenvectors: vectors.t().to_owned(),
            basis: orient_basis(vectors.t().to_owned(), direction),
        };
        check_basis(t.basis.view())?;
        Ok(t)
    }

    fn from_scatter(
        scatter: &Array2<f64>,
        mean: Array1<f64>,
        direction: VectorDirection,
    ) -> Result<Self> {
        let c = scatter.nrows();
        let eigen = SymmetricEigen::new(DMatrix::from_fn(c, c, |i, j| scatter[[i, j]]));

        let mut order: Vec<usize> = (0..c).collect();
        order.sort_by(|&a, &b| {
            eigen.eigenvalues[b]
                .partial_cmp(&eigen.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let eigenvalues = Array1::from_iter(order.iter().map(|&k| eigen.eigenvalues[k]));
        let mut eigenvectors = Array2::zeros((c, c));
        for (dst, &src) in order.iter().enumerate() {
            for row in 0..c {
                eigenvectors[[row, dst]] = eigen.eigenvectors[(row, src)];
            }
        }
        let top = eigenvectors
            .slice(ndarray::s![.., ..REQUIRED_BASIS_VECTORS])
            .to_owned();

        tracing::trace!(?eigenvalues, "basis fitted");
        let t = Self {
            direction,
            mean: shape_mean(mean, direction),
            eigenvalues,
            eigenvectors,
            basis: orient_basis(top, direction),
        };
        check_basis(t.basis.view())?;
        Ok(t)
    }

    pub fn direction(&self) -> VectorDirection {
        self.direction
    }

    /// Mean, shaped `1 × C` or `C × 1` according to the direction.
    pub fn mean(&self) -> &Array2<f64> {
        &self.mean
    }

    /// Eigenvalues in descending order. Empty for a fixed basis.
    pub fn eigenvalues(&self) -> &Array1<f64> {
        &self.eigenvalues
    }

    /// Eigenvectors as columns, in eigenvalue order.
    pub fn eigenvectors(&self) -> &Array2<f64> {
        &self.eigenvectors
    }

    /// Basis, shaped `C × 2` or `2 × C` according to the direction.
    pub fn basis(&self) -> &Array2<f64> {
        &self.basis
    }

    /// Basis vector `index` (0 or 1) as a flat array.
    pub fn basis_vector(&self, index: usize) -> Array1<f64> {
        match self.direction {
            VectorDirection::RowVectors => self.basis.column(index).to_owned(),
            VectorDirection::ColumnVectors => self.basis.row(index).to_owned(),
        }
    }

    pub fn project(&self, points: ArrayView2<f64>, subtract_mean: bool) -> Result<Array2<f64>> {
        project(
            points,
            self.basis.view(),
            self.mean.view(),
            self.direction,
            subtract_mean,
        )
    }

    pub fn back_project(&self, projected: ArrayView2<f64>, add_mean: bool) -> Result<Array2<f64>> {
        back_project(
            projected,
            self.basis.view(),
            self.mean.view(),
            self.direction,
            add_mean,
        )
    }
}

/// Center `points` (unless `subtract_mean` is false) and map them onto `basis`.
///
/// Row vectors: `(X - mean) · B`, giving `N × 2`.
/// Column vectors: `B · (X - mean)`, giving `2 × N`.
pub fn project(
    points: ArrayView2<f64>,
    basis: ArrayView2<f64>,
    mean: ArrayView2<f64>,
    direction: VectorDirection,
    subtract_mean: bool,
) -> Result<Array2<f64>> {
    check_basis(basis)?;
    let channels = check_mean(mean, direction)?;
    match direction {
        VectorDirection::RowVectors => {
            if points.ncols() != channels || basis.nrows() != channels {
                return Err(shape_error("project", points, basis, mean));
            }
            if subtract_mean {
                Ok((&points - &mean).dot(&basis))
            } else {
                Ok(points.dot(&basis))
            }
        }
        VectorDirection::ColumnVectors => {
            if points.nrows() != channels || basis.ncols() != channels {
                return Err(shape_error("project", points, basis, mean));
            }
            if subtract_mean {
                Ok(basis.dot(&(&points - &mean)))
            } else {
                Ok(basis.dot(&points))
            }
        }
    }
}

/// Map projected coordinates back through `basis`, then add the mean
/// (unless `add_mean` is false).
///
/// Row vectors: `P · Bᵀ + mean`. Column vectors: `Bᵀ · P + mean`.
pub fn back_project(
    projected: ArrayView2<f64>,
    basis: ArrayView2<f64>,
    mean: ArrayView2<f64>,
    direction: VectorDirection,
    add_mean: bool,
) -> Result<Array2<f64>> {
    check_basis(basis)?;
    let channels = check_mean(mean, direction)?;
    let points = match direction {
        VectorDirection::RowVectors => {
            if projected.ncols() != basis.ncols() || basis.nrows() != channels {
                return Err(shape_error("back_project", projected, basis, mean));
            }
            projected.dot(&basis.t())
        }
        VectorDirection::ColumnVectors => {
            if projected.nrows() != basis.nrows() || basis.ncols() != channels {
                return Err(shape_error("back_project", projected, basis, mean));
            }
            basis.t().dot(&projected)
        }
    };
    if add_mean {
        Ok(points + &mean)
    } else {
        Ok(points)
    }
}

fn as_row_samples(points: ArrayView2<f64>, direction: VectorDirection) -> ArrayView2<f64> {
    match direction {
        VectorDirection::RowVectors => points,
        VectorDirection::ColumnVectors => points.reversed_axes(),
    }
}

fn check_overdetermined(n: usize, c: usize) -> Result<()> {
    if c < REQUIRED_BASIS_VECTORS {
        return Err(StainError::DimensionMismatch(format!(
            "need at least {REQUIRED_BASIS_VECTORS} channels, got {c}"
        )));
    }
    if n <= c {
        return Err(StainError::InsufficientSamples {
            required: c,
            actual: n,
        });
    }
    Ok(())
}

fn shape_mean(mean: Array1<f64>, direction: VectorDirection) -> Array2<f64> {
    match direction {
        VectorDirection::RowVectors => mean.insert_axis(Axis(0)),
        VectorDirection::ColumnVectors => mean.insert_axis(Axis(1)),
    }
}

/// `top` holds basis vectors as columns (`C × 2`).
fn orient_basis(top: Array2<f64>, direction: VectorDirection) -> Array2<f64> {
    match direction {
        VectorDirection::RowVectors => top,
        VectorDirection::ColumnVectors => top.reversed_axes(),
    }
}

fn check_basis(basis: ArrayView2<f64>) -> Result<()> {
    if basis.is_empty() || basis.iter().all(|&v| v == 0.0) {
        return Err(StainError::DegenerateBasis);
    }
    Ok(())
}

/// Validate the mean's orientation and return the channel count.
fn check_mean(mean: ArrayView2<f64>, direction: VectorDirection) -> Result<usize> {
    match direction {
        VectorDirection::RowVectors if mean.nrows() == 1 => Ok(mean.ncols()),
        VectorDirection::ColumnVectors if mean.ncols() == 1 => Ok(mean.nrows()),
        _ => Err(StainError::DimensionMismatch(format!(
            "mean of shape {:?} does not match {direction:?}",
            mean.shape()
        ))),
    }
}

fn shape_error(
    op: &str,
    points: ArrayView2<f64>,
    basis: ArrayView2<f64>,
    mean: ArrayView2<f64>,
) -> StainError {
    StainError::DimensionMismatch(format!(
        "{op}: points {:?}, basis {:?}, mean {:?}",
        points.shape(),
        basis.shape(),
        mean.shape()
    ))
}
