//! Linear complementarity problems.
//!
//! Find z such that
//!
//! ```text
//! w = M·z + q,   0 ≤ z ⊥ w ≥ 0
//! ```
//!
//! # Solvers
//!
//! - [`SolverId::LcpLemke`]: complementary pivoting on the tableau
//!   `[I | −M | −1 | q]`, lexicographic ratio test (no cycling on degenerate
//!   problems). Finite; ends on a secondary ray when the problem has no solution.
//! - [`SolverId::LcpPgs`]: projected Gauss–Seidel, needs a positive diagonal.
//! - [`SolverId::LcpEnumerative`]: tries every active set; small problems only.
//! - [`SolverId::LcpConvexQp`]: projected gradient on ½zᵀMz + qᵀz over z ≥ 0,
//!   symmetric M only.

use super::{check_solve_args, norm_inf, normalize, unknown_solver, NonSmoothProblem, SolverId, SolverOptions};
use crate::error::{Error, Result};
use crate::sparse::NsMatrix;
use crate::types::{Matrix, Vector};
use tracing::{debug, warn};

/// Largest size accepted by the enumerative solvers.
pub(crate) const ENUM_MAX_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct LinearComplementarityProblem {
    pub m: NsMatrix,
    pub q: Vector,
}

impl LinearComplementarityProblem {
    pub fn new(m: NsMatrix, q: Vector) -> Result<Self> {
        if !m.is_square() {
            return Err(Error::size("LCP matrix columns", m.nrows(), m.ncols()));
        }
        if q.len() != m.nrows() {
            return Err(Error::size("LCP vector q", m.nrows(), q.len()));
        }
        Ok(Self { m, q })
    }

    /// Dense constructor.
    pub fn dense(m: Matrix, q: Vector) -> Result<Self> {
        Self::new(NsMatrix::Dense(m), q)
    }
}

/// Complementarity error `‖z − max(0, z − w)‖ / ‖q‖` with w = M·z + q.
///
/// Writes w and returns `(info, error)`, info = 1 when the error exceeds
/// `tolerance`. The normalization is skipped when ‖q‖ ≤ ε.
pub fn lcp_compute_error(problem: &LinearComplementarityProblem, z: &Vector, w: &mut Vector, tolerance: f64) -> (i32, f64) {
    w.copy_from(&problem.q);
    problem.m.gemv(1.0, z, 1.0, w);
    let error = normalize(lcp_error_only(z, w), &problem.q);
    let info = if error > tolerance {
        debug!(error, tolerance, "lcp_compute_error: error above tolerance");
        1
    } else {
        0
    };
    (info, error)
}

/// ‖z − max(0, z − w)‖, without normalization.
pub(crate) fn lcp_error_only(z: &Vector, w: &Vector) -> f64 {
    z.iter()
        .zip(w.iter())
        .map(|(zi, wi)| {
            let d = zi - (zi - wi).max(0.0);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

impl NonSmoothProblem for LinearComplementarityProblem {
    fn name(&self) -> &'static str {
        "LCP"
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
            SolverId::LcpLemke => self.lemke(z, w, options),
            SolverId::LcpPgs => self.pgs(z, w, options),
            SolverId::LcpEnumerative => self.enumerative(z, w, options)?,
            SolverId::LcpConvexQp => self.convex_qp(z, w, options)?,
            other => return Err(unknown_solver("LCP", other)),
        };
        debug!(
            solver = options.solver_id.name(),
            info,
            iterations = options.iterations_done(),
            residual = options.residual(),
            "LCP solved"
        );
        Ok(info)
    }
}

impl LinearComplementarityProblem {
    fn lemke(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> i32 {
        let n = self.size();
        let tol = options.tolerance();
        if self.q.iter().all(|qi| *qi >= 0.0) {
            z.fill(0.0);
            let (info, error) = lcp_compute_error(self, z, w, tol);
            options.record(0, error);
            return info;
        }

        let m = self.m.to_dense();
        let z0 = 2 * n;
        let rhs = 2 * n + 1;
        let mut tableau = Matrix::zeros(n, 2 * n + 2);
        for i in 0..n {
            tableau[(i, i)] = 1.0;
            for j in 0..n {
                tableau[(i, n + j)] = -m[(i, j)];
            }
            tableau[(i, z0)] = -1.0;
            tableau[(i, rhs)] = self.q[i];
        }
        let mut basis: Vec<usize> = (0..n).collect();
        let complement = |v: usize| if v < n { v + n } else { v - n };

        // z0 enters at the most negative q
        let mut row = 0;
        for i in 1..n {
            if self.q[i] < self.q[row] {
                row = i;
            }
        }
        pivot(&mut tableau, row, z0);
        let mut entering = complement(basis[row]);
        basis[row] = z0;

        let max_iter = options.max_iterations();
        let mut iterations = 0;
        let mut terminated = false;
        while iterations < max_iter {
            iterations += 1;
            let mut best: Option<usize> = None;
            for i in 0..n {
                if tableau[(i, entering)] > f64::EPSILON {
                    best = match best {
                        Some(b) if !lexico_less(&tableau, i, b, entering, n) => Some(b),
                        _ => Some(i),
                    };
                }
            }
            let Some(r) = best else {
                warn!(iterations, "Lemke: secondary ray, no solution found");
                break;
            };
            pivot(&mut tableau, r, entering);
            let leaving = basis[r];
            basis[r] = entering;
            if leaving == z0 {
                terminated = true;
                break;
            }
            entering = complement(leaving);
        }

        z.fill(0.0);
        for (i, var) in basis.iter().enumerate() {
            if (n..2 * n).contains(var) {
                z[var - n] = tableau[(i, rhs)];
            }
        }
        let (info, error) = lcp_compute_error(self, z, w, tol);
        options.record(iterations, error);
        if terminated {
            info
        } else {
            1
        }
    }

    fn pgs(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> i32 {
        let n = self.size();
        let tol = options.tolerance();
        for i in 0..n {
            if self.m.diagonal(i) <= 0.0 {
                warn!(row = i, diagonal = self.m.diagonal(i), "LCP PGS needs a positive diagonal");
                options.record(0, f64::INFINITY);
                return 2;
            }
        }
        let mut info = 1;
        let mut error = f64::INFINITY;
        let mut iterations = 0;
        while iterations < options.max_iterations() {
            iterations += 1;
            for i in 0..n {
                let wi = self.m.row_dot(i, z) + self.q[i];
                z[i] = (z[i] - wi / self.m.diagonal(i)).max(0.0);
            }
            (info, error) = lcp_compute_error(self, z, w, tol);
            if info == 0 {
                break;
            }
        }
        options.record(iterations, error);
        info
    }

    fn enumerative(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> Result<i32> {
        let n = self.size();
        if n > ENUM_MAX_SIZE {
            return Err(Error::InvalidConfiguration(format!(
                "enumerative LCP solver handles at most {} unknowns, got {}",
                ENUM_MAX_SIZE, n
            )));
        }
        let tol = options.tolerance();
        let m = self.m.to_dense();
        let mut candidate = Vector::zeros(n);
        let mut tried = 0;
        for mask in 0..(1usize << n) {
            tried += 1;
            let active: Vec<usize> = (0..n).filter(|i| mask & (1 << i) != 0).collect();
            candidate.fill(0.0);
            if !active.is_empty() {
                let sub = Matrix::from_fn(active.len(), active.len(), |a, b| m[(active[a], active[b])]);
                let rhs = Vector::from_iterator(active.len(), active.iter().map(|i| -self.q[*i]));
                let Some(sol) = sub.lu().solve(&rhs) else {
                    continue;
                };
                for (k, i) in active.iter().enumerate() {
                    candidate[*i] = sol[k];
                }
            }
            let (info, error) = lcp_compute_error(self, &candidate, w, tol);
            if info == 0 {
                z.copy_from(&candidate);
                options.record(tried, error);
                return Ok(0);
            }
        }
        let (_, error) = lcp_compute_error(self, z, w, tol);
        options.record(tried, error);
        Ok(1)
    }

    fn convex_qp(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> Result<i32> {
        let scale = norm_inf(&self.m);
        if !self.m.is_symmetric(1e-12 * scale.max(1.0)) {
            return Err(Error::InvalidConfiguration("convex QP LCP solver needs a symmetric matrix".into()));
        }
        if scale <= 0.0 {
            options.record(0, f64::INFINITY);
            return Ok(2);
        }
        let tol = options.tolerance();
        let step = 1.0 / scale;
        let mut info = 1;
        let mut error = f64::INFINITY;
        let mut iterations = 0;
        let mut grad = Vector::zeros(self.size());
        while iterations < options.max_iterations() {
            iterations += 1;
            grad.copy_from(&self.q);
            self.m.gemv(1.0, z, 1.0, &mut grad);
            for (zi, gi) in z.iter_mut().zip(grad.iter()) {
                *zi = (*zi - step * gi).max(0.0);
            }
            (info, error) = lcp_compute_error(self, z, w, tol);
            if info == 0 {
                break;
            }
        }
        options.record(iterations, error);
        Ok(info)
    }
}

/// Gauss–Jordan pivot on (r, c).
pub(crate) fn pivot(t: &mut Matrix, r: usize, c: usize) {
    let p = t[(r, c)];
    let ncols = t.ncols();
    for j in 0..ncols {
        t[(r, j)] /= p;
    }
    for i in 0..t.nrows() {
        if i == r {
            continue;
        }
        let f = t[(i, c)];
        if f != 0.0 {
            for j in 0..ncols {
                let v = t[(r, j)];
                t[(i, j)] -= f * v;
            }
        }
    }
}

/// Lexicographic ratio comparison of rows `a` and `b` for entering column `c`:
/// first on rhs / t[c], then on the columns of the initial basis.
fn lexico_less(t: &Matrix, a: usize, b: usize, c: usize, n: usize) -> bool {
    let rhs = t.ncols() - 1;
    let columns = std::iter::once(rhs).chain(0..n);
    for k in columns {
        let ra = t[(a, k)] / t[(a, c)];
        let rb = t[(b, k)] / t[(b, c)];
        let scale = ra.abs().max(rb.abs()).max(1.0);
        if (ra - rb).abs() > 1e-12 * scale {
            return ra < rb;
        }
    }
    false
}
