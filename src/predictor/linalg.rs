//! Dense least squares on top of `nalgebra`. Design matrices arrive as
//! row-major `Vec<Vec<f64>>`, one row per observation.

use nalgebra::{DMatrix, DVector};

/// Singular values below this fraction of the largest one count as zero.
const RANK_TOLERANCE: f64 = 1e-10;

/// Solution of an over- or under-determined system.
#[derive(Debug, Clone, PartialEq)]
pub struct Fit {
    /// Minimum-norm least squares coefficients.
    pub coefficients: DVector<f64>,
    /// Numerical rank of the design matrix.
    pub rank: usize,
}

impl Fit {
    pub fn is_full_rank(&self) -> bool {
        self.rank == self.coefficients.len()
    }
}

fn matrix(rows: &[Vec<f64>]) -> Option<DMatrix<f64>> {
    let p = rows.first()?.len();
    if p == 0 || rows.iter().any(|r| r.len() != p) {
        return None;
    }
    Some(DMatrix::from_row_iterator(
        rows.len(),
        p,
        rows.iter().flatten().copied(),
    ))
}

/// Least squares fit of `rows * x ≈ y` through the SVD.
///
/// Rank-deficient systems get the minimum-norm solution; `None` only for
/// empty or ragged input, or a non-finite result.
pub fn least_squares(rows: &[Vec<f64>], y: &[f64]) -> Option<Fit> {
    let a = matrix(rows)?;
    if a.nrows() != y.len() {
        return None;
    }
    let svd = a.svd(true, true);
    let largest = svd.singular_values.iter().copied().fold(0.0, f64::max);
    let eps = largest * RANK_TOLERANCE;
    let rank = svd.rank(eps);
    let coefficients = svd.solve(&DVector::from_column_slice(y), eps).ok()?;
    coefficients
        .iter()
        .all(|c| c.is_finite())
        .then_some(Fit { coefficients, rank })
}

/// Ridge regression: minimize `|rows * x - y|^2 + lambda * |x|^2`.
///
/// `lambda` must be positive; the regularized normal equations are then
/// positive definite and solved by Cholesky.
pub fn ridge(rows: &[Vec<f64>], y: &[f64], lambda: f64) -> Option<DVector<f64>> {
    let a = matrix(rows)?;
    if a.nrows() != y.len() || lambda <= 0.0 {
        return None;
    }
    let at = a.transpose();
    let gram = &at * &a + DMatrix::identity(a.ncols(), a.ncols()) * lambda;
    let x = gram.cholesky()?.solve(&(at * DVector::from_column_slice(y)));
    x.iter().all(|c| c.is_finite()).then_some(x)
}

/// Exact solution of the square system `a * x = b`; `None` when singular.
pub fn solve(a: &[Vec<f64>], b: &[f64]) -> Option<DVector<f64>> {
    if a.len() != b.len() || a.iter().any(|row| row.len() != b.len()) {
        return None;
    }
    least_squares(a, b)
        .filter(Fit::is_full_rank)
        .map(|fit| fit.coefficients)
}
