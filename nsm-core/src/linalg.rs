//! Factorizations used by dynamical systems, integrators and solvers.
//!
//! # Backends
//!
//! - [`Factorization::DenseLu`]: nalgebra partial-pivot LU, for general square matrices
//!   (iteration matrices of first-order systems, non-symmetric Delassus operators).
//! - [`Factorization::DenseCholesky`]: nalgebra LLᵀ for small SPD matrices.
//! - [`Factorization::SparseCholesky`]: sparse LLᵀ from the faer library, for large
//!   SPD mass matrices stored in CSR form and for `M + ρI` in ADMM.
//!
//! A factorization is computed once and reused for every subsequent solve;
//! callers own the decision of when it is stale.

use crate::error::{Error, Result};
use crate::sparse::CsrMatrix;
use crate::types::{Matrix, Vector};
use faer::linalg::cholesky::llt::factor::LltError;
use faer::prelude::*;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::sparse::linalg::LltError as SparseLltError;
use faer::sparse::{SparseColMat, SymbolicSparseColMat};
use nalgebra::{Cholesky, Dyn, LU};
use std::fmt;

/// A reusable factorization of a square matrix.
pub enum Factorization {
    DenseLu(LU<f64, Dyn, Dyn>),
    DenseCholesky(Cholesky<f64, Dyn>),
    SparseCholesky(SparseLlt),
}

impl Factorization {
    /// LU-factorize a dense square matrix (the `PLUFactorizationInPlace` contract).
    pub fn lu(matrix: Matrix) -> Result<Self> {
        let n = matrix.nrows();
        if n != matrix.ncols() {
            return Err(Error::size("LU factorization (square matrix)", n, matrix.ncols()));
        }
        let lu = matrix.lu();
        if n > 0 && !lu.is_invertible() {
            return Err(Error::SingularMatrix("LU factorization failed".into()));
        }
        Ok(Self::DenseLu(lu))
    }

    /// Cholesky-factorize a dense SPD matrix.
    pub fn cholesky(matrix: Matrix) -> Result<Self> {
        let n = matrix.nrows();
        if n != matrix.ncols() {
            return Err(Error::size("Cholesky factorization (square matrix)", n, matrix.ncols()));
        }
        let chol = Cholesky::new(matrix)
            .ok_or_else(|| Error::SingularMatrix("matrix is not positive definite".into()))?;
        Ok(Self::DenseCholesky(chol))
    }

    /// Sparse Cholesky factorization of a symmetric CSR matrix.
    pub fn sparse_cholesky(matrix: &CsrMatrix) -> Result<Self> {
        Ok(Self::SparseCholesky(SparseLlt::new(matrix)?))
    }

    /// Dimension of the factorized matrix.
    pub fn dim(&self) -> usize {
        match self {
            Factorization::DenseLu(lu) => lu.l().nrows(),
            Factorization::DenseCholesky(chol) => chol.l_dirty().nrows(),
            Factorization::SparseCholesky(llt) => llt.n,
        }
    }

    /// Solve A·x = b, overwriting `b` with x.
    pub fn solve_in_place(&self, b: &mut Vector) -> Result<()> {
        if b.len() != self.dim() {
            return Err(Error::size("factorized solve rhs", self.dim(), b.len()));
        }
        match self {
            Factorization::DenseLu(lu) => {
                if !lu.solve_mut(b) {
                    return Err(Error::SingularMatrix("LU solve failed".into()));
                }
            }
            Factorization::DenseCholesky(chol) => chol.solve_mut(b),
            Factorization::SparseCholesky(llt) => llt.solve_columns(b.as_mut_slice(), 1),
        }
        Ok(())
    }

    /// Solve A·X = B column by column, overwriting `b` with X.
    pub fn solve_matrix_in_place(&self, b: &mut Matrix) -> Result<()> {
        if b.nrows() != self.dim() {
            return Err(Error::size("factorized solve rhs rows", self.dim(), b.nrows()));
        }
        match self {
            Factorization::DenseLu(lu) => {
                if !lu.solve_mut(b) {
                    return Err(Error::SingularMatrix("LU solve failed".into()));
                }
            }
            Factorization::DenseCholesky(chol) => chol.solve_mut(b),
            Factorization::SparseCholesky(llt) => {
                let ncols = b.ncols();
                llt.solve_columns(b.as_mut_slice(), ncols)
            }
        }
        Ok(())
    }

    /// Solve A·x = b into a new vector.
    pub fn solve(&self, b: &Vector) -> Result<Vector> {
        let mut x = b.clone();
        self.solve_in_place(&mut x)?;
        Ok(x)
    }
}

impl fmt::Debug for Factorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Factorization::DenseLu(_) => "DenseLu",
            Factorization::DenseCholesky(_) => "DenseCholesky",
            Factorization::SparseCholesky(_) => "SparseCholesky",
        };
        f.debug_struct("Factorization")
            .field("kind", &kind)
            .field("dim", &self.dim())
            .finish()
    }
}

/// Convert a symmetric CSR matrix to faer SparseColMat (CSC format).
///
/// faer expects CSC format, which we get by treating CSR as CSC of the transpose.
/// Callers only pass symmetric matrices, so this works directly.
fn csr_to_faer_csc(csr: &CsrMatrix) -> SparseColMat<usize, f64> {
    let nrows = csr.nrows();
    let ncols = csr.ncols();

    let row_offsets = csr.row_offsets();
    let col_indices = csr.col_indices();
    let values = csr.values();

    let mut col_counts = vec![0usize; ncols];
    for &col in col_indices {
        col_counts[col] += 1;
    }

    let mut col_offsets = vec![0usize; ncols + 1];
    for i in 0..ncols {
        col_offsets[i + 1] = col_offsets[i] + col_counts[i];
    }

    let nnz = values.len();
    let mut csc_row_indices = vec![0usize; nnz];
    let mut csc_values = vec![0.0f64; nnz];
    let mut col_positions = col_offsets[..ncols].to_vec();

    for row in 0..nrows {
        for idx in row_offsets[row]..row_offsets[row + 1] {
            let col = col_indices[idx];
            let pos = col_positions[col];
            csc_row_indices[pos] = row;
            csc_values[pos] = values[idx];
            col_positions[col] += 1;
        }
    }

    // SAFETY: column offsets are non-decreasing and row indices are sorted within
    // each column because rows are visited in increasing order.
    unsafe {
        SparseColMat::new(
            SymbolicSparseColMat::new_unchecked(nrows, ncols, col_offsets, None, csc_row_indices),
            csc_values,
        )
    }
}

/// Numeric sparse LLᵀ factorization kept alive for repeated solves.
pub struct SparseLlt {
    n: usize,
    llt: Llt<usize, f64>,
}

impl SparseLlt {
    /// Symbolic analysis followed by numeric factorization.
    pub fn new(matrix: &CsrMatrix) -> Result<Self> {
        let n = matrix.nrows();
        if n != matrix.ncols() {
            return Err(Error::size("sparse Cholesky (square matrix)", n, matrix.ncols()));
        }

        let csc = csr_to_faer_csc(matrix);
        let csc_ref = csc.as_ref();

        let symbolic = SymbolicLlt::try_new(csc_ref.symbolic(), faer::Side::Lower)
            .map_err(|_| Error::SingularMatrix("symbolic Cholesky analysis failed".into()))?;

        let llt = Llt::try_new_with_symbolic(symbolic, csc_ref, faer::Side::Lower).map_err(|e| match e {
            SparseLltError::Generic(err) => {
                Error::SingularMatrix(format!("sparse Cholesky error: {:?}", err))
            }
            SparseLltError::Numeric(LltError::NonPositivePivot { index }) => Error::SingularMatrix(
                format!("matrix is not positive definite at pivot {}", index),
            ),
        })?;

        Ok(Self { n, llt })
    }

    /// Solve in place for `ncols` column-major right-hand sides stored in `data`.
    fn solve_columns(&self, data: &mut [f64], ncols: usize) {
        let n = self.n;
        let mut x = faer::Mat::from_fn(n, ncols, |i, j| data[j * n + i]);
        self.llt.solve_in_place(x.as_mut());
        for j in 0..ncols {
            for i in 0..n {
                data[j * n + i] = x[(i, j)];
            }
        }
    }
}
