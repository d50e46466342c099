//! Relay problems: box-constrained complementarity.
//!
//! ```text
//! w = M·z + q,   −w ∈ N_[lb, ub](z)
//! ```
//!
//! i.e. z_i = lb_i ⇒ w_i ≥ 0, z_i = ub_i ⇒ w_i ≤ 0, and w_i = 0 strictly inside.

use super::{check_solve_args, normalize, unknown_solver, NonSmoothProblem, SolverId, SolverOptions};
use crate::error::{Error, Result};
use crate::sparse::NsMatrix;
use crate::types::Vector;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RelayProblem {
    pub m: NsMatrix,
    pub q: Vector,
    pub lb: Vector,
    pub ub: Vector,
}

impl RelayProblem {
    pub fn new(m: NsMatrix, q: Vector, lb: Vector, ub: Vector) -> Result<Self> {
        let n = q.len();
        if m.nrows() != n || m.ncols() != n {
            return Err(Error::size("relay matrix", n, m.nrows()));
        }
        if lb.len() != n || ub.len() != n {
            return Err(Error::size("relay bounds", n, lb.len().min(ub.len())));
        }
        if lb.iter().zip(ub.iter()).any(|(l, u)| l > u) {
            return Err(Error::InvalidConfiguration("relay lower bound above upper bound".into()));
        }
        Ok(Self { m, q, lb, ub })
    }

    fn project(&self, i: usize, value: f64) -> f64 {
        value.clamp(self.lb[i], self.ub[i])
    }

    /// w = M·z + q and ‖z − proj(z − w)‖ / ‖q‖; info = 1 above `tolerance`.
    pub fn compute_error(&self, z: &Vector, w: &mut Vector, tolerance: f64) -> (i32, f64) {
        w.copy_from(&self.q);
        self.m.gemv(1.0, z, 1.0, w);
        let error = (0..z.len())
            .map(|i| {
                let d = z[i] - self.project(i, z[i] - w[i]);
                d * d
            })
            .sum::<f64>()
            .sqrt();
        let error = normalize(error, &self.q);
        (i32::from(error > tolerance), error)
    }

    fn pgs(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> i32 {
        let n = self.size();
        for i in 0..n {
            if self.m.diagonal(i) <= 0.0 {
                warn!(row = i, "relay PGS needs a positive diagonal");
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
                z[i] = self.project(i, z[i] - wi / self.m.diagonal(i));
            }
            (info, error) = self.compute_error(z, w, tol);
            if info == 0 {
                break;
            }
        }
        options.record(iterations, error);
        info
    }
}

impl NonSmoothProblem for RelayProblem {
    fn name(&self) -> &'static str {
        "Relay"
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
            SolverId::RelayPgs => self.pgs(z, w, options),
            other => return Err(unknown_solver("Relay", other)),
        };
        debug!(info, iterations = options.iterations_done(), residual = options.residual(), "relay solved");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Matrix;
    use approx::assert_relative_eq;

    fn relay(q: &[f64]) -> RelayProblem {
        RelayProblem::new(
            NsMatrix::Dense(Matrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0])),
            Vector::from_row_slice(q),
            Vector::from_element(2, -1.0),
            Vector::from_element(2, 1.0),
        )
        .unwrap()
    }

    #[test]
    fn test_interior_solution() {
        // M z = −q has z inside the box
        let problem = relay(&[-1.0, -0.25]);
        let mut z = Vector::zeros(2);
        let mut w = Vector::zeros(2);
        let mut options = SolverOptions::new(SolverId::RelayPgs);
        assert_eq!(problem.solve(&mut z, &mut w, &mut options).unwrap(), 0);
        assert_relative_eq!(z[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(z[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_saturated_solution() {
        let problem = relay(&[10.0, -10.0]);
        let mut z = Vector::zeros(2);
        let mut w = Vector::zeros(2);
        let mut options = SolverOptions::new(SolverId::RelayPgs);
        assert_eq!(problem.solve(&mut z, &mut w, &mut options).unwrap(), 0);
        assert_relative_eq!(z[0], -1.0, epsilon = 1e-9);
        assert_relative_eq!(z[1], 1.0, epsilon = 1e-9);
        assert!(w[0] >= 0.0 && w[1] <= 0.0);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let m = NsMatrix::Dense(Matrix::identity(1, 1));
        assert!(RelayProblem::new(m, Vector::zeros(1), Vector::from_element(1, 1.0), Vector::zeros(1)).is_err());
    }
}
