//! Algebraic non-smooth problems and their solvers.
//!
//! Each problem is a plain data struct (matrix, vector, problem-specific
//! scalars). Solving takes an initial guess `z`, fills `w`, and returns an
//! integer status:
//!
//! - `0`: converged, the error measure is below `dparam[DPARAM_TOL]`
//! - non-zero: not converged; `z`/`w` hold the last iterate
//!
//! Non-convergence is never an `Err`. Errors are reserved for configuration
//! problems (sizes, a solver id that does not belong to the problem class).
//!
//! # Solver options
//!
//! [`SolverOptions`] carries integer and real parameter arrays with fixed
//! indices:
//!
//! | Index                   | Meaning                                      |
//! |-------------------------|----------------------------------------------|
//! | `iparam[0]`             | maximum number of iterations                 |
//! | `iparam[1]`             | iterations done (output)                     |
//! | `iparam[2]`             | local solver iterations (friction NSGS)      |
//! | `iparam[3]`             | ρ strategy (ADMM, see [`RhoStrategy`])       |
//! | `iparam[4]`             | friction local solver ([`LocalSolver`])      |
//! | `iparam[5]`             | local tolerance rule ([`InternalErrorStrategy`]) |
//! | `dparam[0]`             | tolerance on the error measure               |
//! | `dparam[1]`             | error reached (output)                       |
//! | `dparam[2]`             | local solver tolerance                       |
//! | `dparam[3]`             | initial ρ (ADMM); ≤ 0 picks one from the matrix |
//! | `dparam[4]`             | global/local error ratio (adaptive local tolerance) |

pub mod avi;
pub mod fc;
pub mod lcp;
pub mod mcp;
pub mod mlcp;
pub mod relay;

pub use avi::AffineVariationalInequality;
pub use fc::FrictionContactProblem;
pub use lcp::{lcp_compute_error, LinearComplementarityProblem};
pub use mcp::MixedComplementarityProblem;
pub use mlcp::MixedLinearComplementarityProblem;
pub use relay::RelayProblem;

use crate::error::{Error, Result};
use crate::types::Vector;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const IPARAM_MAX_ITER: usize = 0;
pub const IPARAM_ITER_DONE: usize = 1;
pub const IPARAM_LOCAL_MAX_ITER: usize = 2;
pub const IPARAM_RHO_STRATEGY: usize = 3;
pub const IPARAM_LOCAL_SOLVER: usize = 4;
pub const IPARAM_INTERNAL_ERROR_STRATEGY: usize = 5;

pub const DPARAM_TOL: usize = 0;
pub const DPARAM_RESIDU: usize = 1;
pub const DPARAM_LOCAL_TOL: usize = 2;
pub const DPARAM_RHO: usize = 3;
pub const DPARAM_INTERNAL_ERROR_RATIO: usize = 4;

const PARAM_SIZE: usize = 8;

/// Solver identifiers. The numeric ids are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SolverId {
    LcpLemke,
    LcpPgs,
    LcpEnumerative,
    LcpConvexQp,
    MlcpPgs,
    MlcpEnumerative,
    MlcpNewtonFb,
    RelayPgs,
    AviEnumerative,
    FcNsgs,
    FcFixedPointProjection,
    FcAdmm,
    McpNewtonFb,
}

impl SolverId {
    pub const ALL: [SolverId; 13] = [
        SolverId::LcpLemke,
        SolverId::LcpPgs,
        SolverId::LcpEnumerative,
        SolverId::LcpConvexQp,
        SolverId::MlcpPgs,
        SolverId::MlcpEnumerative,
        SolverId::MlcpNewtonFb,
        SolverId::RelayPgs,
        SolverId::AviEnumerative,
        SolverId::FcNsgs,
        SolverId::FcFixedPointProjection,
        SolverId::FcAdmm,
        SolverId::McpNewtonFb,
    ];

    pub fn id(self) -> i32 {
        match self {
            SolverId::LcpLemke => 200,
            SolverId::LcpPgs => 201,
            SolverId::LcpEnumerative => 202,
            SolverId::LcpConvexQp => 203,
            SolverId::MlcpPgs => 301,
            SolverId::MlcpEnumerative => 302,
            SolverId::MlcpNewtonFb => 303,
            SolverId::RelayPgs => 401,
            SolverId::AviEnumerative => 501,
            SolverId::FcNsgs => 600,
            SolverId::FcFixedPointProjection => 601,
            SolverId::FcAdmm => 602,
            SolverId::McpNewtonFb => 700,
        }
    }

    /// Look a solver up by numeric id.
    pub fn from_id(id: i32) -> Option<SolverId> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            SolverId::LcpLemke => "LCP_LEMKE",
            SolverId::LcpPgs => "LCP_PGS",
            SolverId::LcpEnumerative => "LCP_ENUM",
            SolverId::LcpConvexQp => "LCP_CONVEXQP_PG",
            SolverId::MlcpPgs => "MLCP_PGS",
            SolverId::MlcpEnumerative => "MLCP_ENUM",
            SolverId::MlcpNewtonFb => "MLCP_NEWTON_FB",
            SolverId::RelayPgs => "RELAY_PGS",
            SolverId::AviEnumerative => "AVI_ENUM",
            SolverId::FcNsgs => "FC_NSGS",
            SolverId::FcFixedPointProjection => "FC_FPP",
            SolverId::FcAdmm => "FC_ADMM",
            SolverId::McpNewtonFb => "MCP_NEWTON_FB",
        }
    }

    fn defaults(self) -> (i32, f64) {
        match self {
            SolverId::LcpLemke | SolverId::LcpEnumerative | SolverId::MlcpEnumerative | SolverId::AviEnumerative => (10_000, 1e-10),
            SolverId::MlcpNewtonFb | SolverId::McpNewtonFb => (100, 1e-10),
            _ => (10_000, 1e-8),
        }
    }
}

/// ADMM penalty update rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RhoStrategy {
    #[default]
    Constant,
    /// ρ = ‖M‖∞, kept constant.
    NormInf,
    /// Double or halve ρ to keep primal and dual residuals within a factor 10.
    ResidualBalancing,
}

impl RhoStrategy {
    fn from_iparam(value: i32) -> RhoStrategy {
        match value {
            1 => RhoStrategy::NormInf,
            2 => RhoStrategy::ResidualBalancing,
            _ => RhoStrategy::Constant,
        }
    }

    fn to_iparam(self) -> i32 {
        match self {
            RhoStrategy::Constant => 0,
            RhoStrategy::NormInf => 1,
            RhoStrategy::ResidualBalancing => 2,
        }
    }
}

/// Single-contact solver used inside friction NSGS when no closed form applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LocalSolver {
    /// Projected fixed point on the friction cone.
    #[default]
    Projection,
    /// Damped nonsmooth Newton on the Alart–Curnier function, with the
    /// projection as fallback.
    AlartCurnierNewton,
}

impl LocalSolver {
    fn from_iparam(value: i32) -> LocalSolver {
        match value {
            1 => LocalSolver::AlartCurnierNewton,
            _ => LocalSolver::Projection,
        }
    }

    fn to_iparam(self) -> i32 {
        match self {
            LocalSolver::Projection => 0,
            LocalSolver::AlartCurnierNewton => 1,
        }
    }
}

/// How the local tolerance follows the global error between NSGS sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum InternalErrorStrategy {
    /// Keep `dparam[DPARAM_LOCAL_TOL]`.
    #[default]
    Given,
    /// max(error / ratio, tol / contacts).
    Adaptive,
    /// error / (ratio · contacts).
    AdaptiveNContact,
}

impl InternalErrorStrategy {
    fn from_iparam(value: i32) -> InternalErrorStrategy {
        match value {
            1 => InternalErrorStrategy::Adaptive,
            2 => InternalErrorStrategy::AdaptiveNContact,
            _ => InternalErrorStrategy::Given,
        }
    }

    fn to_iparam(self) -> i32 {
        match self {
            InternalErrorStrategy::Given => 0,
            InternalErrorStrategy::Adaptive => 1,
            InternalErrorStrategy::AdaptiveNContact => 2,
        }
    }
}

/// Solver id plus its parameter arrays.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SolverOptions {
    pub solver_id: SolverId,
    pub iparam: Vec<i32>,
    pub dparam: Vec<f64>,
}

impl SolverOptions {
    pub fn new(solver_id: SolverId) -> Self {
        let (max_iter, tol) = solver_id.defaults();
        let mut iparam = vec![0; PARAM_SIZE];
        let mut dparam = vec![0.0; PARAM_SIZE];
        iparam[IPARAM_MAX_ITER] = max_iter;
        iparam[IPARAM_LOCAL_MAX_ITER] = 100;
        dparam[DPARAM_TOL] = tol;
        dparam[DPARAM_LOCAL_TOL] = tol * 1e-2;
        dparam[DPARAM_INTERNAL_ERROR_RATIO] = 10.0;
        Self {
            solver_id,
            iparam,
            dparam,
        }
    }

    /// Options for a numeric solver id.
    pub fn from_id(id: i32) -> Result<Self> {
        SolverId::from_id(id)
            .map(Self::new)
            .ok_or(Error::UnknownSolver { problem: "numerics", id })
    }

    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.iparam[IPARAM_MAX_ITER] = i32::try_from(max_iter).unwrap_or(i32::MAX);
        self
    }

    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.dparam[DPARAM_TOL] = tol;
        self
    }

    pub fn with_rho_strategy(mut self, strategy: RhoStrategy) -> Self {
        self.iparam[IPARAM_RHO_STRATEGY] = strategy.to_iparam();
        self
    }

    pub fn with_rho(mut self, rho: f64) -> Self {
        self.dparam[DPARAM_RHO] = rho;
        self
    }

    pub fn with_local_solver(mut self, solver: LocalSolver) -> Self {
        self.iparam[IPARAM_LOCAL_SOLVER] = solver.to_iparam();
        self
    }

    pub fn with_internal_error_strategy(mut self, strategy: InternalErrorStrategy) -> Self {
        self.iparam[IPARAM_INTERNAL_ERROR_STRATEGY] = strategy.to_iparam();
        self
    }

    pub fn max_iterations(&self) -> usize {
        usize::try_from(self.iparam[IPARAM_MAX_ITER]).unwrap_or(0)
    }

    pub fn tolerance(&self) -> f64 {
        self.dparam[DPARAM_TOL]
    }

    pub fn local_max_iterations(&self) -> usize {
        usize::try_from(self.iparam[IPARAM_LOCAL_MAX_ITER]).unwrap_or(0).max(1)
    }

    pub fn local_tolerance(&self) -> f64 {
        self.dparam[DPARAM_LOCAL_TOL]
    }

    pub fn local_solver(&self) -> LocalSolver {
        LocalSolver::from_iparam(self.iparam[IPARAM_LOCAL_SOLVER])
    }

    pub fn internal_error_strategy(&self) -> InternalErrorStrategy {
        InternalErrorStrategy::from_iparam(self.iparam[IPARAM_INTERNAL_ERROR_STRATEGY])
    }

    /// Local tolerance for the next sweep once the global error is `error`.
    pub fn internal_tolerance(&self, error: f64, contacts: usize) -> f64 {
        let ratio = self.dparam[DPARAM_INTERNAL_ERROR_RATIO].max(1.0);
        let contacts = contacts.max(1) as f64;
        if !error.is_finite() {
            return self.local_tolerance();
        }
        match self.internal_error_strategy() {
            InternalErrorStrategy::Given => self.local_tolerance(),
            InternalErrorStrategy::Adaptive => (error / ratio).max(self.tolerance() / contacts),
            InternalErrorStrategy::AdaptiveNContact => error / (ratio * contacts),
        }
    }

    pub fn rho_strategy(&self) -> RhoStrategy {
        RhoStrategy::from_iparam(self.iparam[IPARAM_RHO_STRATEGY])
    }

    /// Iterations done by the last solve.
    pub fn iterations_done(&self) -> usize {
        usize::try_from(self.iparam[IPARAM_ITER_DONE]).unwrap_or(0)
    }

    /// Error measure reached by the last solve.
    pub fn residual(&self) -> f64 {
        self.dparam[DPARAM_RESIDU]
    }

    pub(crate) fn record(&mut self, iterations: usize, residual: f64) {
        self.iparam[IPARAM_ITER_DONE] = i32::try_from(iterations).unwrap_or(i32::MAX);
        self.dparam[DPARAM_RESIDU] = residual;
    }

    fn check_arrays(&self) -> Result<()> {
        if self.iparam.len() < PARAM_SIZE || self.dparam.len() < PARAM_SIZE {
            return Err(Error::size("solver options parameter arrays", PARAM_SIZE, self.iparam.len().min(self.dparam.len())));
        }
        Ok(())
    }
}

/// Common interface of the algebraic problem classes.
pub trait NonSmoothProblem {
    /// Problem class name for diagnostics.
    fn name(&self) -> &'static str;

    /// Number of unknowns.
    fn size(&self) -> usize;

    /// Solve from the initial guess in `z`; returns the info code.
    fn solve(&self, z: &mut Vector, w: &mut Vector, options: &mut SolverOptions) -> Result<i32>;
}

/// Validate the solution arrays and options shared by every solver.
pub(crate) fn check_solve_args(problem: &dyn NonSmoothProblem, z: &Vector, w: &mut Vector, options: &SolverOptions) -> Result<()> {
    options.check_arrays()?;
    let n = problem.size();
    if z.len() != n {
        return Err(Error::size(format!("{} unknown z", problem.name()), n, z.len()));
    }
    if w.len() != n {
        *w = Vector::zeros(n);
    }
    Ok(())
}

pub(crate) fn unknown_solver(problem: &'static str, id: SolverId) -> Error {
    Error::UnknownSolver { problem, id: id.id() }
}

/// ‖q‖ normalization used by every error measure.
pub(crate) fn normalize(error: f64, q: &Vector) -> f64 {
    let norm_q = q.norm();
    if norm_q > f64::EPSILON {
        error / norm_q
    } else {
        error
    }
}

/// Largest absolute row sum, an upper bound of the spectral radius.
pub(crate) fn norm_inf(m: &crate::sparse::NsMatrix) -> f64 {
    (0..m.nrows())
        .map(|i| (0..m.ncols()).map(|j| m.get(i, j).abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_round_trip() {
        for id in SolverId::ALL {
            assert_eq!(SolverId::from_id(id.id()), Some(id));
        }
        assert!(matches!(SolverOptions::from_id(-3), Err(Error::UnknownSolver { id: -3, .. })));
    }

    #[test]
    fn test_options_layout() {
        let options = SolverOptions::new(SolverId::LcpPgs)
            .with_max_iterations(50)
            .with_tolerance(1e-6)
            .with_rho_strategy(RhoStrategy::ResidualBalancing);
        assert_eq!(options.iparam[IPARAM_MAX_ITER], 50);
        assert_eq!(options.dparam[DPARAM_TOL], 1e-6);
        assert_eq!(options.rho_strategy(), RhoStrategy::ResidualBalancing);
        assert_eq!(options.iterations_done(), 0);
    }

    #[test]
    fn test_internal_tolerance_follows_error() {
        let given = SolverOptions::new(SolverId::FcNsgs).with_tolerance(1e-8);
        assert_eq!(given.internal_tolerance(1e-2, 4), 1e-10);

        let adaptive = given.clone().with_internal_error_strategy(InternalErrorStrategy::Adaptive);
        assert_eq!(adaptive.iparam[IPARAM_INTERNAL_ERROR_STRATEGY], 1);
        assert_eq!(adaptive.internal_tolerance(1e-2, 4), 1e-3);
        // floor at tol / contacts
        assert_eq!(adaptive.internal_tolerance(1e-9, 4), 2.5e-9);
        assert_eq!(adaptive.internal_tolerance(f64::INFINITY, 4), 1e-10);

        let per_contact = given.with_internal_error_strategy(InternalErrorStrategy::AdaptiveNContact);
        assert_eq!(per_contact.internal_tolerance(4e-2, 4), 1e-3);
    }
}
