use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl FaerStorage<'_> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy view of an `ndarray` matrix as a `faer` matrix whenever the memory
/// layout allows it; otherwise an owned copy.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_row_major_slice(slice, array.nrows(), array.ncols()),
            ),
            Some(slice) if array.t().is_standard_layout() => FaerStorage::Borrowed(
                MatRef::from_column_major_slice(slice, array.nrows(), array.ncols()),
            ),
            _ => {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub trait FaerEigh {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let rhs_view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        mat_to_array(sol.as_ref())
    }

    /// Inverse of the factorized matrix.
    pub fn inverse(&self, n: usize) -> Array2<f64> {
        self.solve_mat(&Array2::eye(n))
    }

    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.factor.L().diagonal())
    }

    /// `ln |A|` from the diagonal of the lower factor.
    pub fn log_det(&self) -> f64 {
        2.0 * self.diag().mapv(f64::ln).sum()
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn cholesky_inverse_and_log_det_match_closed_form() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let factor = a.cholesky(Side::Lower).unwrap();
        assert_abs_diff_eq!(factor.log_det(), 8.0_f64.ln(), epsilon = 1e-12);

        let inv = factor.inverse(2);
        let expected = array![[3.0, -2.0], [-2.0, 4.0]] / 8.0;
        for (got, want) in inv.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-12);
        }
    }

    #[test]
    fn cholesky_rejects_indefinite_matrix() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(a.cholesky(Side::Lower).is_err());
    }

    #[test]
    fn eigh_recovers_diagonal_spectrum() {
        let a = array![[2.0, 0.0], [0.0, 5.0]];
        let (values, _) = a.eigh(Side::Lower).unwrap();
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_abs_diff_eq!(sorted[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sorted[1], 5.0, epsilon = 1e-12);
    }
}
