//! Coulomb friction-contact problems in 2D and 3D.
//!
//! Each contact c has a local frame (normal first, then one or two tangent
//! directions). With u = M·r + q the relative velocities and r the contact
//! reactions, find r such that for every contact
//!
//! ```text
//! r_c ∈ K_c = { ‖r_t‖ ≤ μ_c·r_n },   û_c = u_c + μ_c‖u_t‖·e_n ∈ K_c*,   r_c ⊥ û_c
//! ```
//!
//! (De Saxcé's bipotential form of the Coulomb law). The error measure is the
//! natural-map residual `‖r − Π_K(r − û)‖ / ‖q‖`.

use super::{
    check_solve_args, norm_inf, normalize, unknown_solver, LocalSolver, NonSmoothProblem, RhoStrategy, SolverId, SolverOptions, DPARAM_RHO,
};
use crate::error::{Error, Result};
use crate::linalg::Factorization;
use crate::sparse::{NsMatrix, TripletMatrix};
use crate::types::{Matrix, Vector};
use tracing::{debug, trace};

const BALANCING_RATIO: f64 = 10.0;
const LINE_SEARCH_STEPS: usize = 20;
const ARMIJO: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct FrictionContactProblem {
    /// 2 or 3.
    pub dimension: usize,
    pub m: NsMatrix,
    pub q: Vector,
    /// One friction coefficient per contact.
    pub mu: Vec<f64>,
}

/// Project `r = (r_n, r_t)` onto the cone ‖r_t‖ ≤ μ·r_n.
pub fn project_on_cone(r: &mut [f64], mu: f64) {
    let normal = r[0];
    let tangent = r[1..].iter().map(|t| t * t).sum::<f64>().sqrt();
    if tangent <= mu * normal {
        return;
    }
    if mu * tangent <= -normal {
        r.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    let projected = (normal + mu * tangent) / (1.0 + mu * mu);
    r[0] = projected;
    for t in &mut r[1..] {
        *t *= mu * projected / tangent;
    }
}

impl FrictionContactProblem {
    pub fn new(dimension: usize, m: NsMatrix, q: Vector, mu: Vec<f64>) -> Result<Self> {
        if dimension != 2 && dimension != 3 {
            return Err(Error::InvalidConfiguration(format!(
                "friction contact dimension must be 2 or 3, got {}",
                dimension
            )));
        }
        let n = dimension * mu.len();
        if q.len() != n {
            return Err(Error::size("friction contact vector q", n, q.len()));
        }
        if m.nrows() != n || m.ncols() != n {
            return Err(Error::size("friction contact matrix", n, m.nrows()));
        }
        if mu.iter().any(|c| !(c.is_finite() && *c >= 0.0)) {
            return Err(Error::InvalidConfiguration("friction coefficients must be finite and non-negative".into()));
        }
        Ok(Self { dimension, m, q, mu })
    }

    pub fn number_of_contacts(&self) -> usize {
        self.mu.len()
    }

    fn range(&self, contact: usize) -> std::ops::Range<usize> {
        contact * self.dimension..(contact + 1) * self.dimension
    }

    fn tangent_norm(&self, u: &[f64]) -> f64 {
        u[1..].iter().map(|t| t * t).sum::<f64>().sqrt()
    }

    /// w = M·r + q, then the natural-map error; info = 1 above `tolerance`.
    pub fn compute_error(&self, r: &Vector, u: &mut Vector, tolerance: f64) -> (i32, f64) {
        u.copy_from(&self.q);
        self.m.gemv(1.0, r, 1.0, u);
        let mut sum = 0.0;
        let mut local = vec![0.0; self.dimension];
        for c in 0..self.number_of_contacts() {
            let range = self.range(c);
            let uc = &u.as_slice()[range.clone()];
            let rc = &r.as_slice()[range];
            let slip = self.mu[c] * self.tangent_norm(uc);
            for k in 0..self.dimension {
                local[k] = rc[k] - uc[k] - if k == 0 { slip } else { 0.0 };
            }
            project_on_cone(&mut local, self.mu[c]);
            sum += rc.iter().zip(&local).map(|(a, b)| (a - b) * (a - b)).sum::<f64>();
        }
        let error = normalize(sum.sqrt(), &self.q);
        (i32::from(error > tolerance), error)
    }

    /// Local velocity offset of a contact: q_c + Σ_{d≠c} M_cd·r_d.
    fn local_q(&self, contact: usize, r: &Vector) -> Vector {
        let range = self.range(contact);
        Vector::from_iterator(
            self.dimension,
            range.clone().map(|i| {
                let own: f64 = range.clone().map(|j| self.m.get(i, j) * r[j]).sum();
                self.q[i] + self.m.row_dot(i, r) - own
            }),
        )
    }

    fn nsgs(&self, r: &mut Vector, u: &mut Vector, options: &mut SolverOptions) -> i32 {
        let tol = options.tolerance();
        let blocks: Vec<Matrix> = (0..self.number_of_contacts())
            .map(|c| {
                let start = c * self.dimension;
                self.m.block(start, start, self.dimension, self.dimension)
            })
            .collect();
        let local_solver = options.local_solver();
        let local_iterations = options.local_max_iterations();
        let mut local_tol = options.local_tolerance();
        let mut info = 1;
        let mut error = f64::INFINITY;
        let mut iterations = 0;
        while iterations < options.max_iterations() {
            iterations += 1;
            for (c, w) in blocks.iter().enumerate() {
                let q_local = self.local_q(c, r);
                let range = self.range(c);
                let mut local = r.rows(range.start, self.dimension).into_owned();
                let exact = if self.dimension == 2 {
                    solve_local_2d(w, &q_local, self.mu[c])
                } else {
                    None
                };
                match exact {
                    Some(sol) => local = sol,
                    None => match local_solver {
                        LocalSolver::Projection => local_projection(w, &q_local, self.mu[c], &mut local, local_iterations, local_tol),
                        LocalSolver::AlartCurnierNewton => local_newton(w, &q_local, self.mu[c], &mut local, local_iterations, local_tol),
                    },
                }
                r.rows_mut(range.start, self.dimension).copy_from(&local);
            }
            (info, error) = self.compute_error(r, u, tol);
            if info == 0 {
                break;
            }
            local_tol = options.internal_tolerance(error, self.number_of_contacts());
            trace!(iterations, error, local_tol, "NSGS sweep");
        }
        options.record(iterations, error);
        info
    }

    fn fixed_point_projection(&self, r: &mut Vector, u: &mut Vector, options: &mut SolverOptions) -> i32 {
        let tol = options.tolerance();
        let rho = 1.0 / norm_inf(&self.m).max(f64::EPSILON);
        let mut info = 1;
        let mut error = f64::INFINITY;
        let mut iterations = 0;
        let mut velocity = Vector::zeros(self.size());
        while iterations < options.max_iterations() {
            iterations += 1;
            velocity.copy_from(&self.q);
            self.m.gemv(1.0, r, 1.0, &mut velocity);
            for c in 0..self.number_of_contacts() {
                let range = self.range(c);
                let slip = self.mu[c] * self.tangent_norm(&velocity.as_slice()[range.clone()]);
                velocity[range.start] += slip;
                let rc = &mut r.as_mut_slice()[range.clone()];
                for (k, i) in range.enumerate() {
                    rc[k] -= rho * velocity[i];
                }
                project_on_cone(rc, self.mu[c]);
            }
            (info, error) = self.compute_error(r, u, tol);
            if info == 0 {
                break;
            }
        }
        options.record(iterations, error);
        info
    }

    /// Factorize M + ρI, sparse LLᵀ when possible.
    fn admm_operator(&self, rho: f64) -> Result<Factorization> {
        let n = self.size();
        match &self.m {
            NsMatrix::Dense(m) => {
                let shifted = m + Matrix::identity(n, n) * rho;
                Factorization::cholesky(shifted.clone()).or_else(|_| Factorization::lu(shifted))
            }
            NsMatrix::Sparse(csr) => {
                let mut triplets = TripletMatrix::with_capacity(n, n, csr.nnz() + n);
                for (i, j, v) in csr.triplet_iter() {
                    triplets.add(i, j, *v);
                }
                for i in 0..n {
                    triplets.add(i, i, rho);
                }
                let shifted = triplets.to_csr();
                if self.m.is_symmetric(1e-12) {
                    if let Ok(llt) = Factorization::sparse_cholesky(&shifted) {
                        return Ok(llt);
                    }
                }
                Factorization::lu(NsMatrix::Sparse(shifted).to_dense())
            }
        }
    }

    /// ADMM on the splitting r = ξ, ξ ∈ K, with the De Saxcé term frozen
    /// at the current velocity each iteration.
    fn admm(&self, r: &mut Vector, u: &mut Vector, options: &mut SolverOptions) -> Result<i32> {
        let n = self.size();
        let tol = options.tolerance();
        let strategy = options.rho_strategy();
        let given = options.dparam[DPARAM_RHO];
        let mut rho = match strategy {
            RhoStrategy::Constant if given > 0.0 => given,
            RhoStrategy::Constant => 1.0,
            RhoStrategy::NormInf => norm_inf(&self.m),
            RhoStrategy::ResidualBalancing if given > 0.0 => given,
            RhoStrategy::ResidualBalancing => norm_inf(&self.m),
        }
        .max(f64::EPSILON);
        let mut operator = self.admm_operator(rho)?;

        let mut xi = r.clone();
        for c in 0..self.number_of_contacts() {
            project_on_cone(&mut xi.as_mut_slice()[self.range(c)], self.mu[c]);
        }
        let mut dual = Vector::zeros(n);
        let mut velocity = Vector::zeros(n);
        let mut info = 1;
        let mut error = f64::INFINITY;
        let mut iterations = 0;
        while iterations < options.max_iterations() {
            iterations += 1;
            velocity.copy_from(&self.q);
            self.m.gemv(1.0, &xi, 1.0, &mut velocity);

            // r ← (M + ρI)⁻¹ (ρ(ξ − u) − q − s)
            let mut rhs = (&xi - &dual) * rho - &self.q;
            for c in 0..self.number_of_contacts() {
                let range = self.range(c);
                let start = range.start;
                rhs[start] -= self.mu[c] * self.tangent_norm(&velocity.as_slice()[range]);
            }
            operator.solve_in_place(&mut rhs)?;
            r.copy_from(&rhs);

            let previous = xi.clone();
            xi = &*r + &dual;
            for c in 0..self.number_of_contacts() {
                project_on_cone(&mut xi.as_mut_slice()[self.range(c)], self.mu[c]);
            }
            dual += &*r - &xi;

            (info, error) = self.compute_error(&xi, u, tol);
            if info == 0 {
                break;
            }
            if strategy == RhoStrategy::ResidualBalancing {
                let primal = (&*r - &xi).norm();
                let dual_residual = rho * (&xi - &previous).norm();
                let factor = if primal > BALANCING_RATIO * dual_residual {
                    2.0
                } else if dual_residual > BALANCING_RATIO * primal {
                    0.5
                } else {
                    1.0
                };
                if factor != 1.0 {
                    rho *= factor;
                    dual /= factor;
                    operator = self.admm_operator(rho)?;
                    trace!(iterations, rho, "ADMM penalty updated");
                }
            }
        }
        r.copy_from(&xi);
        options.record(iterations, error);
        Ok(info)
    }
}

/// Exact solve of one 2D contact: separation, sticking, then sliding in
/// either direction. `None` when no case is consistent.
fn solve_local_2d(w: &Matrix, q: &Vector, mu: f64) -> Option<Vector> {
    if q[0] >= 0.0 {
        return Some(Vector::zeros(2));
    }
    if let Some(stick) = w.clone().lu().solve(&(-q)) {
        if stick[0] > 0.0 && stick[1].abs() <= mu * stick[0] {
            return Some(stick);
        }
    }
    for sign in [1.0, -1.0] {
        let denominator = w[(0, 0)] - sign * mu * w[(0, 1)];
        if denominator <= 0.0 {
            continue;
        }
        let normal = -q[0] / denominator;
        let tangent = -sign * mu * normal;
        let slip = w[(1, 0)] * normal + w[(1, 1)] * tangent + q[1];
        if normal > 0.0 && sign * slip >= 0.0 {
            return Some(Vector::from_vec(vec![normal, tangent]));
        }
    }
    None
}

/// Projected fixed point on one contact, step 1/‖W‖∞.
fn local_projection(w: &Matrix, q: &Vector, mu: f64, r: &mut Vector, max_iterations: usize, tolerance: f64) {
    let bound = w.row_iter().map(|row| row.iter().map(|v| v.abs()).sum::<f64>()).fold(0.0, f64::max);
    let rho = 1.0 / bound.max(f64::EPSILON);
    for _ in 0..max_iterations {
        let mut velocity = w * &*r + q;
        let tangent = velocity.rows(1, velocity.len() - 1).norm();
        velocity[0] += mu * tangent;
        let mut next = &*r - velocity * rho;
        project_on_cone(next.as_mut_slice(), mu);
        let change = (&next - &*r).norm();
        r.copy_from(&next);
        if change <= tolerance {
            break;
        }
    }
}

/// Natural-map residual of one contact.
fn local_error(w: &Matrix, q: &Vector, mu: f64, r: &Vector) -> f64 {
    let u = w * r + q;
    let slip = mu * u.rows(1, u.len() - 1).norm();
    let mut local = r - &u;
    local[0] -= slip;
    project_on_cone(local.as_mut_slice(), mu);
    (r - local).norm()
}

/// Alart–Curnier function of one contact and an element of its generalized
/// Jacobian with respect to r:
///
/// ```text
/// F_n = r_n − max(0, r_n − ρ_n·u_n)
/// F_t = r_t − Π_{B(μ·r_n⁺)}(r_t − ρ_t·u_t)
/// ```
fn alart_curnier(w: &Matrix, q: &Vector, mu: f64, r: &Vector, rho_n: f64, rho_t: f64) -> (Vector, Matrix) {
    let d = r.len();
    let u = w * r + q;
    let mut f = Vector::zeros(d);
    let mut jacobian = Matrix::zeros(d, d);

    if r[0] - rho_n * u[0] > 0.0 {
        f[0] = rho_n * u[0];
        for j in 0..d {
            jacobian[(0, j)] = rho_n * w[(0, j)];
        }
    } else {
        f[0] = r[0];
        jacobian[(0, 0)] = 1.0;
    }

    let b = Vector::from_iterator(d - 1, (1..d).map(|k| r[k] - rho_t * u[k]));
    let norm_b = b.norm();
    let radius = mu * r[0].max(0.0);
    if norm_b <= radius {
        for k in 1..d {
            f[k] = rho_t * u[k];
            for j in 0..d {
                jacobian[(k, j)] = rho_t * w[(k, j)];
            }
        }
        return (f, jacobian);
    }

    let direction = &b / norm_b;
    // ∂b/∂r = [0 | I] − ρ_t·W_t
    let mut db = Matrix::from_fn(d - 1, d, |k, j| -rho_t * w[(k + 1, j)]);
    for k in 0..d - 1 {
        db[(k, k + 1)] += 1.0;
    }
    let dp_db = (Matrix::identity(d - 1, d - 1) - &direction * direction.transpose()) * (radius / norm_b);
    let mut dp = dp_db * db;
    if r[0] > 0.0 {
        for k in 0..d - 1 {
            dp[(k, 0)] += mu * direction[k];
        }
    }
    for k in 1..d {
        f[k] = r[k] - radius * direction[k - 1];
        for j in 0..d {
            let identity = if j == k { 1.0 } else { 0.0 };
            jacobian[(k, j)] = identity - dp[(k - 1, j)];
        }
    }
    (f, jacobian)
}

/// Damped nonsmooth Newton on the Alart–Curnier function of one contact.
///
/// Falls back to [`local_projection`] from the initial reaction when the
/// Newton iterate ends with a larger natural-map residual than it started.
fn local_newton(w: &Matrix, q: &Vector, mu: f64, r: &mut Vector, max_iterations: usize, tolerance: f64) {
    let d = r.len();
    let start = r.clone();
    let start_error = local_error(w, q, mu, &start);
    let rho_n = 1.0 / w[(0, 0)].max(f64::EPSILON);
    let rho_t = 1.0 / (1..d).map(|k| w[(k, k)]).fold(f64::EPSILON, f64::max);

    for _ in 0..max_iterations {
        let (f, jacobian) = alart_curnier(w, q, mu, r, rho_n, rho_t);
        let norm = f.norm();
        if norm <= tolerance {
            break;
        }
        let Some(step) = jacobian.lu().solve(&(-&f)) else {
            break;
        };
        let mut t = 1.0;
        let mut candidate = &*r + &step;
        for _ in 0..LINE_SEARCH_STEPS {
            let (trial, _) = alart_curnier(w, q, mu, &candidate, rho_n, rho_t);
            if trial.norm() <= (1.0 - ARMIJO * t) * norm {
                break;
            }
            t *= 0.5;
            candidate = &*r + &step * t;
        }
        r.copy_from(&candidate);
    }

    let error = local_error(w, q, mu, r);
    if !error.is_finite() || error > start_error.max(tolerance) {
        trace!(error, start_error, "local Newton rejected, projecting");
        r.copy_from(&start);
        local_projection(w, q, mu, r, max_iterations, tolerance);
    }
}

impl NonSmoothProblem for FrictionContactProblem {
    fn name(&self) -> &'static str {
        "FrictionContact"
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
            SolverId::FcNsgs => self.nsgs(z, w, options),
            SolverId::FcFixedPointProjection => self.fixed_point_projection(z, w, options),
            SolverId::FcAdmm => self.admm(z, w, options)?,
            other => return Err(unknown_solver("FrictionContact", other)),
        };
        debug!(
            solver = options.solver_id.name(),
            dimension = self.dimension,
            contacts = self.number_of_contacts(),
            info,
            iterations = options.iterations_done(),
            residual = options.residual(),
            "friction contact solved"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerics::InternalErrorStrategy;
    use approx::assert_relative_eq;

    fn single(dimension: usize, q: &[f64], mu: f64) -> FrictionContactProblem {
        FrictionContactProblem::new(
            dimension,
            NsMatrix::Dense(Matrix::identity(dimension, dimension)),
            Vector::from_row_slice(q),
            vec![mu],
        )
        .unwrap()
    }

    fn run(problem: &FrictionContactProblem, options: &mut SolverOptions) -> (i32, Vector, Vector) {
        let mut r = Vector::zeros(problem.size());
        let mut u = Vector::zeros(problem.size());
        let info = problem.solve(&mut r, &mut u, options).unwrap();
        (info, r, u)
    }

    #[test]
    fn test_cone_projection() {
        let mut inside = [1.0, 0.2];
        project_on_cone(&mut inside, 0.5);
        assert_eq!(inside, [1.0, 0.2]);

        let mut polar = [-1.0, 0.1];
        project_on_cone(&mut polar, 0.5);
        assert_eq!(polar, [0.0, 0.0]);

        let mut outside = [0.0, 0.0, 2.0];
        project_on_cone(&mut outside, 1.0);
        assert_relative_eq!(outside[0], 1.0, epsilon = 1e-15);
        assert_relative_eq!(outside[2], 1.0, epsilon = 1e-15);
    }

    #[test]
    fn test_2d_separation_stick_and_slide() {
        let mut options = SolverOptions::new(SolverId::FcNsgs);

        let (info, r, _) = run(&single(2, &[0.5, 1.0], 0.5), &mut options);
        assert_eq!(info, 0);
        assert_eq!(r.norm(), 0.0);

        let (info, r, u) = run(&single(2, &[-1.0, 0.3], 0.5), &mut options);
        assert_eq!(info, 0);
        assert_relative_eq!(r[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(r[1], -0.3, epsilon = 1e-12);
        assert!(u.norm() < 1e-12);

        // Sliding: reaction on the cone edge, opposing the slip
        let (info, r, u) = run(&single(2, &[-1.0, 1.0], 0.5), &mut options);
        assert_eq!(info, 0);
        assert_relative_eq!(r[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(r[1], -0.5, epsilon = 1e-12);
        assert_relative_eq!(u[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_3d_stick_and_slide() {
        for id in [SolverId::FcNsgs, SolverId::FcFixedPointProjection, SolverId::FcAdmm] {
            let mut options = SolverOptions::new(id);
            let (info, r, _) = run(&single(3, &[-1.0, 0.3, 0.4], 0.6), &mut options);
            assert_eq!(info, 0, "{}", id.name());
            assert_relative_eq!(r[0], 1.0, epsilon = 1e-6);
            assert_relative_eq!(r[1], -0.3, epsilon = 1e-6);
            assert_relative_eq!(r[2], -0.4, epsilon = 1e-6);

            let (info, r, _) = run(&single(3, &[-1.0, 3.0, 4.0], 0.5), &mut options);
            assert_eq!(info, 0, "{}", id.name());
            assert_relative_eq!(r[0], 1.0, epsilon = 1e-6);
            assert_relative_eq!(r[1], -0.3, epsilon = 1e-6);
            assert_relative_eq!(r[2], -0.4, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_coupled_contacts_solvers_agree() {
        let m = Matrix::from_row_slice(
            4,
            4,
            &[2.0, 0.5, 0.3, 0.1, 0.5, 1.5, 0.2, 0.0, 0.3, 0.2, 2.5, 0.4, 0.1, 0.0, 0.4, 1.2],
        );
        let problem = FrictionContactProblem::new(2, NsMatrix::Dense(m), Vector::from_row_slice(&[-1.0, 0.8, -0.5, -0.1]), vec![0.3, 0.5]).unwrap();
        let expected = [0.516440108, -0.154932033, 0.152085511, -0.010398513];
        let solvers = [
            SolverOptions::new(SolverId::FcNsgs),
            SolverOptions::new(SolverId::FcFixedPointProjection),
            SolverOptions::new(SolverId::FcAdmm),
            SolverOptions::new(SolverId::FcAdmm).with_rho_strategy(RhoStrategy::NormInf),
            SolverOptions::new(SolverId::FcAdmm).with_rho_strategy(RhoStrategy::ResidualBalancing),
        ];
        for mut options in solvers {
            let (info, r, _) = run(&problem, &mut options);
            assert_eq!(info, 0, "{} {:?}", options.solver_id.name(), options.rho_strategy());
            assert!(options.residual() <= options.tolerance());
            for (ri, ei) in r.iter().zip(expected) {
                assert_relative_eq!(*ri, ei, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_sparse_admm_matches_dense() {
        let mut triplets = TripletMatrix::new(3, 3);
        triplets.add(0, 0, 2.0);
        triplets.add(1, 1, 1.0);
        triplets.add(2, 2, 1.0);
        triplets.add(0, 1, 0.2);
        triplets.add(1, 0, 0.2);
        let sparse = NsMatrix::Sparse(triplets.to_csr());
        let dense = NsMatrix::Dense(sparse.to_dense());
        let q = Vector::from_row_slice(&[-1.0, 0.5, -0.2]);
        let a = FrictionContactProblem::new(3, sparse, q.clone(), vec![0.4]).unwrap();
        let b = FrictionContactProblem::new(3, dense, q, vec![0.4]).unwrap();
        let (ia, ra, _) = run(&a, &mut SolverOptions::new(SolverId::FcAdmm));
        let (ib, rb, _) = run(&b, &mut SolverOptions::new(SolverId::FcAdmm));
        assert_eq!((ia, ib), (0, 0));
        assert_relative_eq!((ra - rb).norm(), 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_local_newton_single_contact() {
        let w = Matrix::from_row_slice(3, 3, &[2.0, 0.3, 0.1, 0.3, 1.5, 0.2, 0.1, 0.2, 1.2]);
        let q = Vector::from_row_slice(&[-1.0, 0.5, -0.7]);
        let mut r = Vector::zeros(3);
        local_newton(&w, &q, 0.3, &mut r, 100, 1e-14);
        // sliding: on the cone boundary
        assert_relative_eq!(r[0], 0.510383313633, epsilon = 1e-10);
        assert_relative_eq!(r[1], -0.106039650129, epsilon = 1e-10);
        assert_relative_eq!(r[2], 0.110452677721, epsilon = 1e-10);
        assert!(local_error(&w, &q, 0.3, &r) < 1e-12);

        let identity = Matrix::identity(3, 3);
        let mut r = Vector::zeros(3);
        local_newton(&identity, &Vector::from_row_slice(&[-1.0, 0.3, 0.4]), 0.6, &mut r, 100, 1e-14);
        assert!((r - Vector::from_row_slice(&[1.0, -0.3, -0.4])).norm() < 1e-12);

        let mut r = Vector::from_row_slice(&[0.2, 0.1, 0.0]);
        local_newton(&identity, &Vector::from_row_slice(&[0.5, 1.0, 1.0]), 0.5, &mut r, 100, 1e-14);
        assert!(r.norm() < 1e-12);
    }

    #[test]
    fn test_nsgs_local_solvers_agree_in_3d() {
        let m = Matrix::from_row_slice(
            6,
            6,
            &[
                2.0, 0.3, 0.1, 0.4, 0.1, 0.0, //
                0.3, 1.5, 0.2, 0.0, 0.2, 0.1, //
                0.1, 0.2, 1.2, 0.1, 0.0, 0.3, //
                0.4, 0.0, 0.1, 2.5, 0.2, 0.1, //
                0.1, 0.2, 0.0, 0.2, 1.3, 0.2, //
                0.0, 0.1, 0.3, 0.1, 0.2, 1.1,
            ],
        );
        let q = Vector::from_row_slice(&[-1.0, 0.5, -0.7, -0.6, 0.05, 0.02]);
        let problem = FrictionContactProblem::new(3, NsMatrix::Dense(m), q, vec![0.3, 0.8]).unwrap();
        let expected = [0.479990179, -0.097732433, 0.105752177, 0.166927067, -0.080066702, -0.038756160];
        let nsgs = SolverOptions::new(SolverId::FcNsgs);
        let variants = [
            nsgs.clone(),
            nsgs.clone().with_local_solver(LocalSolver::AlartCurnierNewton),
            nsgs.clone()
                .with_local_solver(LocalSolver::AlartCurnierNewton)
                .with_internal_error_strategy(InternalErrorStrategy::Adaptive),
            nsgs.with_internal_error_strategy(InternalErrorStrategy::AdaptiveNContact),
        ];
        for mut options in variants {
            let (info, r, _) = run(&problem, &mut options);
            assert_eq!(info, 0, "{:?} {:?}", options.local_solver(), options.internal_error_strategy());
            for (ri, ei) in r.iter().zip(expected) {
                assert_relative_eq!(*ri, ei, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let m = NsMatrix::Dense(Matrix::identity(4, 4));
        assert!(FrictionContactProblem::new(4, m.clone(), Vector::zeros(4), vec![0.1]).is_err());
        assert!(FrictionContactProblem::new(2, m.clone(), Vector::zeros(4), vec![0.1]).is_err());
        assert!(FrictionContactProblem::new(2, m, Vector::zeros(4), vec![0.1, -1.0]).is_err());
        let lcp_options = &mut SolverOptions::new(SolverId::LcpLemke);
        let problem = single(2, &[-1.0, 0.0], 0.1);
        assert!(problem.solve(&mut Vector::zeros(2), &mut Vector::zeros(2), lcp_options).is_err());
    }
}
