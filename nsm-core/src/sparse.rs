//! Sparse matrix assembly.
//!
//! Uses CSR (Compressed Sparse Row) format for the assembled non-smooth
//! problem matrix when sparse storage is requested, and the faer LLᵀ path.

use crate::types::{Matrix, Vector};
use nalgebra_sparse::csr::CsrMatrix as NalgebraCsr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Compressed Sparse Row matrix.
pub type CsrMatrix = NalgebraCsr<f64>;

/// Coordinate entries of a block-structured matrix, turned into CSR once
/// every interaction block has been placed.
///
/// Entries landing on the same position add up, so coupling blocks of two
/// interactions sharing a system may be pushed independently.
pub struct TripletMatrix {
    shape: (usize, usize),
    entries: Vec<(usize, usize, f64)>,
}

impl TripletMatrix {
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        Self::with_capacity(n_rows, n_cols, 0)
    }

    /// `nnz_estimate` is usually the sum of the block sizes.
    pub fn with_capacity(n_rows: usize, n_cols: usize, nnz_estimate: usize) -> Self {
        Self {
            shape: (n_rows, n_cols),
            entries: Vec::with_capacity(nnz_estimate),
        }
    }

    /// Push one scalar entry; exact zeros are skipped.
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        debug_assert!(row < self.shape.0 && col < self.shape.1, "entry ({}, {}) outside {:?}", row, col, self.shape);
        if value != 0.0 {
            self.entries.push((row, col, value));
        }
    }

    /// Push a dense block whose top-left corner sits at (row_offset, col_offset).
    pub fn add_block(&mut self, row_offset: usize, col_offset: usize, block: &Matrix) {
        debug_assert!(row_offset + block.nrows() <= self.shape.0);
        debug_assert!(col_offset + block.ncols() <= self.shape.1);
        for (j, column) in block.column_iter().enumerate() {
            for (i, value) in column.iter().enumerate() {
                self.add(row_offset + i, col_offset + j, *value);
            }
        }
    }

    pub fn to_csr(self) -> CsrMatrix {
        use nalgebra_sparse::coo::CooMatrix;

        let (n_rows, n_cols) = self.shape;
        let mut coo = CooMatrix::new(n_rows, n_cols);
        for (r, c, v) in self.entries {
            coo.push(r, c, v);
        }
        CsrMatrix::from(&coo)
    }
}

/// Storage requested for an assembled non-smooth problem matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MatrixStorage {
    #[default]
    Dense,
    Sparse,
}

/// Matrix of a one-step non-smooth problem, dense or sparse.
#[derive(Debug, Clone)]
pub enum NsMatrix {
    Dense(Matrix),
    Sparse(CsrMatrix),
}

impl NsMatrix {
    pub fn nrows(&self) -> usize {
        match self {
            NsMatrix::Dense(m) => m.nrows(),
            NsMatrix::Sparse(m) => m.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            NsMatrix::Dense(m) => m.ncols(),
            NsMatrix::Sparse(m) => m.ncols(),
        }
    }

    pub fn is_square(&self) -> bool {
        self.nrows() == self.ncols()
    }

    /// Entry (i, j), zero when not stored.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        match self {
            NsMatrix::Dense(m) => m[(i, j)],
            NsMatrix::Sparse(m) => m
                .get_entry(i, j)
                .map(|e| e.into_value())
                .unwrap_or(0.0),
        }
    }

    /// Diagonal entry i.
    pub fn diagonal(&self, i: usize) -> f64 {
        self.get(i, i)
    }

    /// Dot product of row `i` with `x`.
    pub fn row_dot(&self, i: usize, x: &Vector) -> f64 {
        match self {
            NsMatrix::Dense(m) => m.row(i).iter().zip(x.iter()).map(|(a, b)| a * b).sum(),
            NsMatrix::Sparse(m) => {
                let row = m.row(i);
                row.col_indices()
                    .iter()
                    .zip(row.values())
                    .map(|(&j, v)| v * x[j])
                    .sum()
            }
        }
    }

    /// y ← alpha·A·x + beta·y
    pub fn gemv(&self, alpha: f64, x: &Vector, beta: f64, y: &mut Vector) {
        debug_assert_eq!(x.len(), self.ncols());
        debug_assert_eq!(y.len(), self.nrows());
        match self {
            NsMatrix::Dense(m) => y.gemv(alpha, m, x, beta),
            NsMatrix::Sparse(m) => {
                for i in 0..m.nrows() {
                    let row = m.row(i);
                    let dot: f64 = row
                        .col_indices()
                        .iter()
                        .zip(row.values())
                        .map(|(&j, v)| v * x[j])
                        .sum();
                    y[i] = alpha * dot + beta * y[i];
                }
            }
        }
    }

    /// A·x as a new vector.
    pub fn prod(&self, x: &Vector) -> Vector {
        let mut y = Vector::zeros(self.nrows());
        self.gemv(1.0, x, 0.0, &mut y);
        y
    }

    /// Dense copy (pivoting and enumerative solvers work densely).
    pub fn to_dense(&self) -> Matrix {
        match self {
            NsMatrix::Dense(m) => m.clone(),
            NsMatrix::Sparse(m) => Matrix::from(m),
        }
    }

    /// Dense sub-block of rows `r0..r0+nr` and columns `c0..c0+nc`.
    pub fn block(&self, r0: usize, c0: usize, nr: usize, nc: usize) -> Matrix {
        Matrix::from_fn(nr, nc, |i, j| self.get(r0 + i, c0 + j))
    }

    /// True if A = Aᵀ within `tol`.
    pub fn is_symmetric(&self, tol: f64) -> bool {
        if !self.is_square() {
            return false;
        }
        let n = self.nrows();
        (0..n).all(|i| (0..i).all(|j| (self.get(i, j) - self.get(j, i)).abs() <= tol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_entries_are_not_stored() {
        // diagonal of two 1x1 contact blocks with an empty coupling
        let mut triplet = TripletMatrix::new(2, 2);
        triplet.add_block(0, 0, &Matrix::from_element(1, 1, 0.5));
        triplet.add_block(0, 1, &Matrix::zeros(1, 1));
        triplet.add(1, 1, 0.25);

        let csr = triplet.to_csr();
        assert_eq!((csr.nrows(), csr.ncols()), (2, 2));
        assert_eq!(csr.nnz(), 2);
    }

    #[test]
    fn test_contributions_on_one_entry_add_up() {
        let mut triplet = TripletMatrix::new(2, 2);
        for w in [0.5, 0.25, 0.25] {
            triplet.add(1, 1, w);
        }
        let m = NsMatrix::Sparse(triplet.to_csr());
        assert_eq!(m.get(1, 1), 1.0);
        assert_eq!(m.get(0, 0), 0.0);
    }

    #[test]
    fn test_block_assembly_offsets() {
        let mut triplet = TripletMatrix::new(4, 4);
        let block = Matrix::from_row_slice(2, 2, &[1.0, 0.5, 0.25, 2.0]);
        triplet.add_block(2, 0, &block);
        triplet.add_block(2, 0, &block);

        let m = NsMatrix::Sparse(triplet.to_csr());
        assert_eq!(m.get(2, 0), 2.0);
        assert_eq!(m.get(2, 1), 1.0);
        assert_eq!(m.get(3, 0), 0.5);
        assert_eq!(m.get(0, 0), 0.0);
    }

    #[test]
    fn test_dense_and_sparse_products_agree() {
        let dense = Matrix::from_row_slice(3, 3, &[4.0, -1.0, 0.0, -1.0, 4.0, -1.0, 0.0, -1.0, 4.0]);
        let mut triplet = TripletMatrix::new(3, 3);
        triplet.add_block(0, 0, &dense);
        let sparse = NsMatrix::Sparse(triplet.to_csr());
        let dense = NsMatrix::Dense(dense);

        let x = Vector::from_vec(vec![1.0, 2.0, 3.0]);
        let a = dense.prod(&x);
        let b = sparse.prod(&x);
        for i in 0..3 {
            assert!((a[i] - b[i]).abs() < 1e-14);
            assert!((dense.row_dot(i, &x) - sparse.row_dot(i, &x)).abs() < 1e-14);
        }
        assert!(sparse.is_symmetric(1e-14));
    }
}
