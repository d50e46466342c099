//! Affine variational inequalities over a polyhedron.
//!
//! ```text
//! find z ∈ P = { z : H·z ≥ K }   with   (M·z + q)ᵀ(v − z) ≥ 0   ∀ v ∈ P
//! ```
//!
//! Equivalently −(M·z + q) ∈ N_P(z): w = M·z + q = H_Aᵀ·μ for some μ ≥ 0
//! supported on the rows A active at z.
//!
//! [`SolverId::AviEnumerative`] walks the candidate active sets by increasing
//! size and solves the KKT system of each
//!
//! ```text
//! [ M    −H_Sᵀ ] [z]   [−q ]
//! [ H_S   0    ] [μ] = [K_S]
//! ```
//!
//! with LU, falling back to a least-squares SVD solve when the system is
//! singular (rank-deficient M is common for first-order relay-like
//! feedback). A candidate is accepted when the KKT system is consistent,
//! μ ≥ 0 and z is feasible.

use super::lcp::ENUM_MAX_SIZE;
use super::{check_solve_args, unknown_solver, NonSmoothProblem, SolverId, SolverOptions};
use crate::error::{Error, Result};
use crate::sparse::NsMatrix;
use crate::types::{Matrix, Vector};
use tracing::{debug, trace};

const SVD_EPS: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct AffineVariationalInequality {
    pub m: NsMatrix,
    pub q: Vector,
    /// Polyhedron rows, one per facet.
    pub h: Matrix,
    pub k: Vector,
}

impl AffineVariationalInequality {
    pub fn new(m: NsMatrix, q: Vector, h: Matrix, k: Vector) -> Result<Self> {
        let n = q.len();
        if m.nrows() != n || m.ncols() != n {
            return Err(Error::size("AVI matrix", n, m.nrows()));
        }
        if h.ncols() != n {
            return Err(Error::size("AVI polyhedron columns", n, h.ncols()));
        }
        if k.len() != h.nrows() {
            return Err(Error::size("AVI polyhedron bounds", h.nrows(), k.len()));
        }
        Ok(Self { m, q, h, k })
    }

    pub fn facets(&self) -> usize {
        self.h.nrows()
    }

    /// Constraint slack H·z − K.
    pub fn slack(&self, z: &Vector) -> Vector {
        &self.h * z - &self.k
    }

    /// w = M·z + q and a KKT residual; info = 1 above `tolerance`.
    ///
    /// The multipliers are estimated by least squares on the facets active
    /// at z (slack below `tolerance`) and clipped at zero. The residual is
    /// scaled by max(1, ‖q‖).
    pub fn compute_error(&self, z: &Vector, w: &mut Vector, tolerance: f64) -> (i32, f64) {
        w.copy_from(&self.q);
        self.m.gemv(1.0, z, 1.0, w);
        let slack = self.slack(z);
        let active: Vec<usize> = (0..self.facets()).filter(|i| slack[*i] <= tolerance).collect();
        let mut mu = Vector::zeros(active.len());
        if !active.is_empty() {
            let ht = Matrix::from_fn(z.len(), active.len(), |r, c| self.h[(active[c], r)]);
            if let Ok(sol) = ht.svd(true, true).solve(&*w, SVD_EPS) {
                mu = sol.map(|v| v.max(0.0));
            }
        }
        let error = self.kkt_residual(&slack, w, &active, &mu);
        (i32::from(error > tolerance), error)
    }

    fn kkt_residual(&self, slack: &Vector, w: &Vector, active: &[usize], mu: &Vector) -> f64 {
        let mut stationarity = w.clone();
        for (a, row) in active.iter().enumerate() {
            for j in 0..w.len() {
                stationarity[j] -= self.h[(*row, j)] * mu[a];
            }
        }
        let infeasibility: f64 = slack.iter().map(|s| s.min(0.0).powi(2)).sum();
        let dual: f64 = mu.iter().map(|m| m.min(0.0).powi(2)).sum();
        let gap: f64 = active.iter().zip(mu.iter()).map(|(r, m)| (slack[*r] * m).powi(2)).sum();
        (stationarity.norm_squared() + infeasibility + dual + gap).sqrt() / self.q.norm().max(1.0)
    }

    /// Solve the KKT system for one active set; `None` when inconsistent.
    fn solve_active_set(&self, m: &Matrix, active: &[usize], tol: f64) -> Option<(Vector, Vector)> {
        let n = self.size();
        let size = n + active.len();
        let mut kkt = Matrix::zeros(size, size);
        let mut rhs = Vector::zeros(size);
        kkt.view_mut((0, 0), (n, n)).copy_from(m);
        for i in 0..n {
            rhs[i] = -self.q[i];
        }
        for (a, row) in active.iter().enumerate() {
            for j in 0..n {
                kkt[(j, n + a)] = -self.h[(*row, j)];
                kkt[(n + a, j)] = self.h[(*row, j)];
            }
            rhs[n + a] = self.k[*row];
        }
        let consistent = |x: &Vector| x.iter().all(|v| v.is_finite()) && (&kkt * x - &rhs).norm() <= tol * (1.0 + rhs.norm());
        let x = match kkt.clone().lu().solve(&rhs) {
            Some(x) if consistent(&x) => x,
            _ => {
                let x = kkt.clone().svd(true, true).solve(&rhs, SVD_EPS).ok()?;
                if !consistent(&x) {
                    return None;
                }
                x
            }
        };
        Some((x.rows(0, n).into_owned(), x.rows(n, active.len()).into_owned()))
    }

    fn enumerative(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> Result<i32> {
        let p = self.facets();
        if p > ENUM_MAX_SIZE {
            return Err(Error::InvalidConfiguration(format!(
                "enumerative AVI solver handles at most {} facets, got {}",
                ENUM_MAX_SIZE, p
            )));
        }
        let n = self.size();
        let tol = options.tolerance();
        let m = self.m.to_dense();
        let mut tried = 0;
        for size in 0..=n.min(p) {
            for mask in (0..(1usize << p)).filter(|mask| mask.count_ones() as usize == size) {
                tried += 1;
                let active: Vec<usize> = (0..p).filter(|i| mask & (1 << i) != 0).collect();
                let Some((candidate, mu)) = self.solve_active_set(&m, &active, tol) else {
                    continue;
                };
                let slack = self.slack(&candidate);
                if mu.iter().any(|v| *v < -tol) || slack.iter().zip(self.k.iter()).any(|(s, k)| *s < -tol * (1.0 + k.abs())) {
                    continue;
                }
                w.copy_from(&self.q);
                self.m.gemv(1.0, &candidate, 1.0, w);
                let error = self.kkt_residual(&slack, w, &active, &mu);
                if error <= tol {
                    trace!(?active, "AVI active set");
                    z.copy_from(&candidate);
                    options.record(tried, error);
                    return Ok(0);
                }
            }
        }
        let (_, error) = self.compute_error(z, w, tol);
        options.record(tried, error);
        Ok(1)
    }
}

impl NonSmoothProblem for AffineVariationalInequality {
    fn name(&self) -> &'static str {
        "AVI"
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
            SolverId::AviEnumerative => self.enumerative(z, w, options)?,
            other => return Err(unknown_solver("AVI", other)),
        };
        debug!(info, candidates = options.iterations_done(), residual = options.residual(), "AVI solved");
        Ok(info)
    }
}
