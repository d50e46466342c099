//! Nonlinear mixed complementarity problems.
//!
//! Find z = [u; v] with `n_equalities` free components u such that
//!
//! ```text
//! F_i(z) = 0                  i < n_equalities
//! 0 ≤ z_i ⊥ F_i(z) ≥ 0        otherwise
//! ```
//!
//! [`SolverId::McpNewtonFb`] is a semismooth Newton method on the
//! Fischer–Burmeister reformulation φ(a, b) = √(a² + b²) − a − b, globalized
//! by an Armijo line search on ½‖Φ‖².

use super::{check_solve_args, unknown_solver, NonSmoothProblem, SolverId, SolverOptions};
use crate::error::{Error, Result};
use crate::types::{Matrix, Vector};
use std::fmt;
use tracing::{debug, warn};

pub type McpFunction = Box<dyn Fn(&Vector) -> Vector + Send + Sync>;
pub type McpJacobian = Box<dyn Fn(&Vector) -> Matrix + Send + Sync>;

const ARMIJO_SIGMA: f64 = 1e-4;
const MAX_LINE_SEARCH: usize = 40;

pub struct MixedComplementarityProblem {
    pub n_equalities: usize,
    pub n_complementarities: usize,
    function: McpFunction,
    jacobian: McpJacobian,
}

impl fmt::Debug for MixedComplementarityProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixedComplementarityProblem")
            .field("n_equalities", &self.n_equalities)
            .field("n_complementarities", &self.n_complementarities)
            .finish()
    }
}

impl MixedComplementarityProblem {
    pub fn new(n_equalities: usize, n_complementarities: usize, function: McpFunction, jacobian: McpJacobian) -> Self {
        Self {
            n_equalities,
            n_complementarities,
            function,
            jacobian,
        }
    }

    /// F(z), checked for size.
    pub fn evaluate(&self, z: &Vector) -> Result<Vector> {
        let f = (self.function)(z);
        if f.len() != self.size() {
            return Err(Error::size("MCP function value", self.size(), f.len()));
        }
        Ok(f)
    }

    /// Natural-map residual sqrt(Σ_eq F² + Σ_comp (z − max(0, z − F))²).
    pub fn compute_error(&self, z: &Vector, f: &Vector) -> f64 {
        natural_residual(self.n_equalities, z, f)
    }

    fn fischer_burmeister(&self, z: &Vector, f: &Vector) -> Vector {
        Vector::from_fn(z.len(), |i, _| {
            if i < self.n_equalities {
                f[i]
            } else {
                z[i].hypot(f[i]) - z[i] - f[i]
            }
        })
    }

    /// An element of the generalized Jacobian of Φ.
    fn fb_jacobian(&self, z: &Vector, f: &Vector, jac: &Matrix) -> Matrix {
        let n = z.len();
        let mut h = jac.clone();
        for i in self.n_equalities..n {
            let r = z[i].hypot(f[i]);
            let (da, db) = if r > 1e-14 {
                (z[i] / r - 1.0, f[i] / r - 1.0)
            } else {
                let c = std::f64::consts::FRAC_1_SQRT_2 - 1.0;
                (c, c)
            };
            for j in 0..n {
                h[(i, j)] *= db;
            }
            h[(i, i)] += da;
        }
        h
    }

    fn newton_fb(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> Result<i32> {
        let tol = options.tolerance();
        let mut f = self.evaluate(z)?;
        let mut error = self.compute_error(z, &f);
        let mut iterations = 0;
        while error > tol && iterations < options.max_iterations() {
            iterations += 1;
            let jac = (self.jacobian)(z);
            if jac.nrows() != self.size() || jac.ncols() != self.size() {
                return Err(Error::size("MCP Jacobian", self.size(), jac.nrows()));
            }
            let phi = self.fischer_burmeister(z, &f);
            let h = self.fb_jacobian(z, &f, &jac);
            let merit = 0.5 * phi.norm_squared();
            let gradient = h.tr_mul(&phi);

            let mut direction = match h.clone().lu().solve(&(-&phi)) {
                Some(d) if d.iter().all(|v| v.is_finite()) => d,
                _ => -&gradient,
            };
            let mut slope = gradient.dot(&direction);
            if slope >= 0.0 {
                direction = -&gradient;
                slope = -gradient.norm_squared();
            }

            let mut t = 1.0;
            let mut accepted = false;
            for _ in 0..MAX_LINE_SEARCH {
                let trial = &*z + &direction * t;
                let f_trial = self.evaluate(&trial)?;
                let merit_trial = 0.5 * self.fischer_burmeister(&trial, &f_trial).norm_squared();
                if merit_trial <= merit + ARMIJO_SIGMA * t * slope {
                    z.copy_from(&trial);
                    f = f_trial;
                    accepted = true;
                    break;
                }
                t *= 0.5;
            }
            if !accepted {
                warn!(iterations, error, "MCP Newton: line search failed");
                break;
            }
            error = self.compute_error(z, &f);
        }
        w.copy_from(&f);
        options.record(iterations, error);
        Ok(if error <= tol { 0 } else { 1 })
    }
}

pub(crate) fn natural_residual(n_equalities: usize, z: &Vector, f: &Vector) -> f64 {
    z.iter()
        .zip(f.iter())
        .enumerate()
        .map(|(i, (zi, fi))| {
            let d = if i < n_equalities { *fi } else { zi - (zi - fi).max(0.0) };
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

impl NonSmoothProblem for MixedComplementarityProblem {
    fn name(&self) -> &'static str {
        "MCP"
    }

    fn size(&self) -> usize {
        self.n_equalities + self.n_complementarities
    }

    fn solve(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> Result<i32> {
        check_solve_args(self, z, w, options)?;
        let info = match options.solver_id {
            SolverId::McpNewtonFb => self.newton_fb(z, w, options)?,
            other => return Err(unknown_solver("MCP", other)),
        };
        debug!(info, iterations = options.iterations_done(), residual = options.residual(), "MCP solved");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cubic_complementarity() {
        // z³ + z − 2 = 0 at z = 1
        let mcp = MixedComplementarityProblem::new(
            0,
            1,
            Box::new(|z: &Vector| Vector::from_element(1, z[0].powi(3) + z[0] - 2.0)),
            Box::new(|z: &Vector| Matrix::from_element(1, 1, 3.0 * z[0] * z[0] + 1.0)),
        );
        let mut z = Vector::zeros(1);
        let mut w = Vector::zeros(1);
        let mut options = SolverOptions::new(SolverId::McpNewtonFb);
        assert_eq!(mcp.solve(&mut z, &mut w, &mut options).unwrap(), 0);
        assert_relative_eq!(z[0], 1.0, epsilon = 1e-8);
    }

    #[test]
    fn test_inactive_bound() {
        let mcp = MixedComplementarityProblem::new(
            0,
            1,
            Box::new(|z: &Vector| Vector::from_element(1, z[0] + 1.0)),
            Box::new(|_: &Vector| Matrix::identity(1, 1)),
        );
        let mut z = Vector::from_element(1, 2.0);
        let mut w = Vector::zeros(1);
        let mut options = SolverOptions::new(SolverId::McpNewtonFb);
        assert_eq!(mcp.solve(&mut z, &mut w, &mut options).unwrap(), 0);
        assert_relative_eq!(z[0], 0.0, epsilon = 1e-8);
        assert_relative_eq!(w[0], 1.0, epsilon = 1e-8);
    }

    #[test]
    fn test_mixed_equality_and_complementarity() {
        // u − v − 1 = 0, 0 ≤ v ⊥ u + v − 3 ≥ 0  →  u = 2, v = 1
        let mcp = MixedComplementarityProblem::new(
            1,
            1,
            Box::new(|z: &Vector| Vector::from_vec(vec![z[0] - z[1] - 1.0, z[0] + z[1] - 3.0])),
            Box::new(|_: &Vector| Matrix::from_row_slice(2, 2, &[1.0, -1.0, 1.0, 1.0])),
        );
        let mut z = Vector::zeros(2);
        let mut w = Vector::zeros(2);
        let mut options = SolverOptions::new(SolverId::McpNewtonFb);
        assert_eq!(mcp.solve(&mut z, &mut w, &mut options).unwrap(), 0);
        assert_relative_eq!(z[0], 2.0, epsilon = 1e-8);
        assert_relative_eq!(z[1], 1.0, epsilon = 1e-8);
    }
}
