//! Mixed linear complementarity problems.
//!
//! The first `n_equalities` unknowns are free and their rows of
//! w = M·z + q must vanish; the remaining unknowns are complementary to
//! their rows: `0 ≤ z_i ⊥ w_i ≥ 0`.

use super::lcp::ENUM_MAX_SIZE;
use super::mcp::{natural_residual, MixedComplementarityProblem};
use super::{check_solve_args, normalize, unknown_solver, NonSmoothProblem, SolverId, SolverOptions};
use crate::error::{Error, Result};
use crate::sparse::NsMatrix;
use crate::types::{Matrix, Vector};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct MixedLinearComplementarityProblem {
    pub m: NsMatrix,
    pub q: Vector,
    pub n_equalities: usize,
}

impl MixedLinearComplementarityProblem {
    pub fn new(m: NsMatrix, q: Vector, n_equalities: usize) -> Result<Self> {
        if !m.is_square() {
            return Err(Error::size("MLCP matrix columns", m.nrows(), m.ncols()));
        }
        if q.len() != m.nrows() {
            return Err(Error::size("MLCP vector q", m.nrows(), q.len()));
        }
        if n_equalities > q.len() {
            return Err(Error::InvalidConfiguration(format!(
                "MLCP with {} equalities but only {} unknowns",
                n_equalities,
                q.len()
            )));
        }
        Ok(Self { m, q, n_equalities })
    }

    /// w = M·z + q and the normalized error; info = 1 above `tolerance`.
    pub fn compute_error(&self, z: &Vector, w: &mut Vector, tolerance: f64) -> (i32, f64) {
        w.copy_from(&self.q);
        self.m.gemv(1.0, z, 1.0, w);
        let error = normalize(natural_residual(self.n_equalities, z, w), &self.q);
        (i32::from(error > tolerance), error)
    }

    fn pgs(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> i32 {
        let n = self.size();
        for i in 0..n {
            let d = self.m.diagonal(i);
            if d == 0.0 || (i >= self.n_equalities && d < 0.0) {
                warn!(row = i, diagonal = d, "MLCP PGS needs a non-zero diagonal (positive on complementarity rows)");
                options.record(0, f64::INFINITY);
                return 2;
            }
        }
        let tol = options.tolerance();
        let mut info = 1;
        let mut error = f64::INFINITY;
        let mut iterations = 0;
        while iterations < options.max_iterations() {
            iterations += 1;
            for i in 0..n {
                let wi = self.m.row_dot(i, z) + self.q[i];
                let zi = z[i] - wi / self.m.diagonal(i);
                z[i] = if i < self.n_equalities { zi } else { zi.max(0.0) };
            }
            (info, error) = self.compute_error(z, w, tol);
            if info == 0 {
                break;
            }
        }
        options.record(iterations, error);
        info
    }

    fn enumerative(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> Result<i32> {
        let n = self.size();
        let ne = self.n_equalities;
        let nc = n - ne;
        if nc > ENUM_MAX_SIZE {
            return Err(Error::InvalidConfiguration(format!(
                "enumerative MLCP solver handles at most {} complementarity rows, got {}",
                ENUM_MAX_SIZE, nc
            )));
        }
        let tol = options.tolerance();
        let m = self.m.to_dense();
        let mut candidate = Vector::zeros(n);
        let mut tried = 0;
        for mask in 0..(1usize << nc) {
            tried += 1;
            let unknowns: Vec<usize> = (0..ne).chain((0..nc).filter(|k| mask & (1 << k) != 0).map(|k| ne + k)).collect();
            candidate.fill(0.0);
            if !unknowns.is_empty() {
                let size = unknowns.len();
                let sub = Matrix::from_fn(size, size, |a, b| m[(unknowns[a], unknowns[b])]);
                let rhs = Vector::from_iterator(size, unknowns.iter().map(|i| -self.q[*i]));
                let Some(sol) = sub.lu().solve(&rhs) else {
                    continue;
                };
                for (k, i) in unknowns.iter().enumerate() {
                    candidate[*i] = sol[k];
                }
            }
            let (info, error) = self.compute_error(&candidate, w, tol);
            if info == 0 {
                z.copy_from(&candidate);
                options.record(tried, error);
                return Ok(0);
            }
        }
        let (_, error) = self.compute_error(z, w, tol);
        options.record(tried, error);
        Ok(1)
    }

    fn newton_fb(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> Result<i32> {
        let m = self.m.to_dense();
        let (mf, q) = (m.clone(), self.q.clone());
        let mcp = MixedComplementarityProblem::new(
            self.n_equalities,
            self.size() - self.n_equalities,
            Box::new(move |z: &Vector| &mf * z + &q),
            Box::new(move |_: &Vector| m.clone()),
        );
        let mut inner = options.clone();
        inner.solver_id = SolverId::McpNewtonFb;
        mcp.solve(z, w, &mut inner)?;
        let (info, error) = self.compute_error(z, w, options.tolerance());
        options.record(inner.iterations_done(), error);
        Ok(info)
    }
}

impl NonSmoothProblem for MixedLinearComplementarityProblem {
    fn name(&self) -> &'static str {
        "MLCP"
    }

    fn size(&self) -> usize {
        self.q.len()
    }

    fn solve(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> Result<i32> {
        check_solve_args(self, z, w, options)?;
        if self.size() == 0 {
            options.record(0, 0.0);
            return Ok(0);
        }
        let info = match options.solver_id {
            SolverId::MlcpPgs => self.pgs(z, w, options),
            SolverId::MlcpEnumerative => self.enumerative(z, w, options)?,
            SolverId::MlcpNewtonFb => self.newton_fb(z, w, options)?,
            other => return Err(unknown_solver("MLCP", other)),
        };
        debug!(
            solver = options.solver_id.name(),
            info,
            iterations = options.iterations_done(),
            residual = options.residual(),
            "MLCP solved"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SOLVERS: [SolverId; 3] = [SolverId::MlcpPgs, SolverId::MlcpEnumerative, SolverId::MlcpNewtonFb];

    fn problem(q: &[f64], n_equalities: usize) -> MixedLinearComplementarityProblem {
        let m = Matrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        MixedLinearComplementarityProblem::new(NsMatrix::Dense(m), Vector::from_row_slice(q), n_equalities).unwrap()
    }

    fn solve_all(mlcp: &MixedLinearComplementarityProblem, expected: &[f64]) {
        for id in SOLVERS {
            let mut z = Vector::zeros(2);
            let mut w = Vector::zeros(2);
            let mut options = SolverOptions::new(id);
            assert_eq!(mlcp.solve(&mut z, &mut w, &mut options).unwrap(), 0, "{}", id.name());
            for (zi, ei) in z.iter().zip(expected) {
                assert_relative_eq!(*zi, *ei, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_inactive_complementarity_row() {
        // 2u + v − 3 = 0, 0 ≤ v ⊥ u + 2v + 3 ≥ 0
        solve_all(&problem(&[-3.0, 3.0], 1), &[1.5, 0.0]);
    }

    #[test]
    fn test_active_complementarity_row() {
        solve_all(&problem(&[-3.0, -3.0], 1), &[1.0, 1.0]);
    }

    #[test]
    fn test_pure_equality_system() {
        solve_all(&problem(&[-3.0, -3.0], 2), &[1.0, 1.0]);
    }

    #[test]
    fn test_too_many_equalities_rejected() {
        let m = NsMatrix::Dense(Matrix::identity(1, 1));
        assert!(MixedLinearComplementarityProblem::new(m, Vector::zeros(1), 2).is_err());
    }
}
