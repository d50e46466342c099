//! One-step non-smooth problems.
//!
//! A [`OneStepNSProblem`] is rebuilt at every call from the interactions of
//! one index set: the block matrix and vector are assembled from the
//! integrator workspaces ([`assembly`]), handed to the matching algebraic
//! solver of [`crate::numerics`], and the solution is written back as λ and
//! y of the contributing interactions. Interactions outside the index set
//! get λ = 0.

mod assembly;

pub use assembly::Restitution;

use crate::error::{Error, Result};
use crate::nslaw::NonSmoothLaw;
use crate::numerics::{
    AffineVariationalInequality, FrictionContactProblem, LinearComplementarityProblem, MixedLinearComplementarityProblem,
    NonSmoothProblem, RelayProblem, SolverId, SolverOptions,
};
use crate::sparse::{MatrixStorage, NsMatrix};
use crate::topology::Topology;
use crate::types::{InteractionId, Matrix, Vector};
use assembly::{Assembled, AssemblyOptions};
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Algebraic problem class solved by a [`OneStepNSProblem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ProblemKind {
    Lcp,
    /// Equality interactions first, then complementarity interactions.
    Mlcp,
    Relay,
    Avi,
    FrictionContact { dimension: usize },
    /// Pure equality constraints, solved directly.
    Equality,
}

impl ProblemKind {
    pub fn name(self) -> &'static str {
        match self {
            ProblemKind::Lcp => "LCP",
            ProblemKind::Mlcp => "MLCP",
            ProblemKind::Relay => "Relay",
            ProblemKind::Avi => "AVI",
            ProblemKind::FrictionContact { .. } => "FrictionContact",
            ProblemKind::Equality => "Equality",
        }
    }

    fn accepts_solver(self, id: SolverId) -> bool {
        match self {
            ProblemKind::Lcp => matches!(
                id,
                SolverId::LcpLemke | SolverId::LcpPgs | SolverId::LcpEnumerative | SolverId::LcpConvexQp
            ),
            ProblemKind::Mlcp => matches!(id, SolverId::MlcpPgs | SolverId::MlcpEnumerative | SolverId::MlcpNewtonFb),
            ProblemKind::Relay => id == SolverId::RelayPgs,
            ProblemKind::Avi => id == SolverId::AviEnumerative,
            ProblemKind::FrictionContact { .. } => {
                matches!(id, SolverId::FcNsgs | SolverId::FcFixedPointProjection | SolverId::FcAdmm)
            }
            ProblemKind::Equality => true,
        }
    }

    fn accepts_law(self, law: &NonSmoothLaw) -> bool {
        match self {
            ProblemKind::Lcp => law.is_complementarity(),
            ProblemKind::Mlcp => law.is_complementarity() || matches!(law, NonSmoothLaw::Equality { .. }),
            ProblemKind::Relay => matches!(law, NonSmoothLaw::Relay { .. }),
            ProblemKind::Avi => matches!(law, NonSmoothLaw::NormalCone { .. }),
            ProblemKind::FrictionContact { dimension } => {
                matches!(law, NonSmoothLaw::NewtonImpactFriction { dimension: d, .. } if *d == dimension)
            }
            ProblemKind::Equality => matches!(law, NonSmoothLaw::Equality { .. }),
        }
    }
}

/// Outcome of the last [`OneStepNSProblem::compute`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SolveReport {
    /// Number of unknowns of the assembled problem.
    pub size: usize,
    pub info: i32,
    pub iterations: usize,
    pub residual: f64,
}

#[derive(Debug, Clone)]
pub struct OneStepNSProblem {
    kind: ProblemKind,
    options: SolverOptions,
    storage: MatrixStorage,
    index_set: usize,
    input_level: usize,
    output_level: usize,
    restitution: Restitution,
    stored_free_output: bool,
    last: SolveReport,
}

impl OneStepNSProblem {
    /// Problem of `kind` solved with `options`; the solver must belong to the class.
    pub fn new(kind: ProblemKind, options: SolverOptions) -> Result<Self> {
        if let ProblemKind::FrictionContact { dimension } = kind {
            if dimension != 2 && dimension != 3 {
                return Err(Error::InvalidConfiguration(format!(
                    "friction contact dimension must be 2 or 3, got {}",
                    dimension
                )));
            }
        }
        if !kind.accepts_solver(options.solver_id) {
            return Err(Error::UnknownSolver {
                problem: kind.name(),
                id: options.solver_id.id(),
            });
        }
        Ok(Self {
            kind,
            options,
            storage: MatrixStorage::Dense,
            index_set: 1,
            input_level: 1,
            output_level: 1,
            restitution: Restitution::None,
            stored_free_output: false,
            last: SolveReport::default(),
        })
    }

    pub fn lcp(solver: SolverId) -> Result<Self> {
        Self::new(ProblemKind::Lcp, SolverOptions::new(solver))
    }

    pub fn mlcp(solver: SolverId) -> Result<Self> {
        Self::new(ProblemKind::Mlcp, SolverOptions::new(solver))
    }

    pub fn relay() -> Result<Self> {
        Self::new(ProblemKind::Relay, SolverOptions::new(SolverId::RelayPgs))
    }

    pub fn avi() -> Result<Self> {
        Self::new(ProblemKind::Avi, SolverOptions::new(SolverId::AviEnumerative))
    }

    pub fn friction_contact(dimension: usize, solver: SolverId) -> Result<Self> {
        Self::new(ProblemKind::FrictionContact { dimension }, SolverOptions::new(solver))
    }

    pub fn equality() -> Result<Self> {
        Self::new(ProblemKind::Equality, SolverOptions::new(SolverId::MlcpEnumerative))
    }

    pub fn with_storage(mut self, storage: MatrixStorage) -> Self {
        self.storage = storage;
        self
    }

    pub fn kind(&self) -> ProblemKind {
        self.kind
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut SolverOptions {
        &mut self.options
    }

    pub fn storage(&self) -> MatrixStorage {
        self.storage
    }

    /// Index set the problem is posed on.
    pub fn index_set_level(&self) -> usize {
        self.index_set
    }

    pub fn input_level(&self) -> usize {
        self.input_level
    }

    pub fn output_level(&self) -> usize {
        self.output_level
    }

    pub fn last_report(&self) -> SolveReport {
        self.last
    }

    /// Bind the problem to an index set and to the y/λ levels it reads and writes.
    pub(crate) fn set_levels(&mut self, index_set: usize, input_level: usize, output_level: usize) {
        self.index_set = index_set;
        self.input_level = input_level;
        self.output_level = output_level;
    }

    pub(crate) fn set_restitution(&mut self, restitution: Restitution) {
        self.restitution = restitution;
    }

    /// Take the free part of q from the outputs at the output level, as
    /// computed by the caller before [`OneStepNSProblem::compute`].
    pub(crate) fn set_stored_free_output(&mut self, stored: bool) {
        self.stored_free_output = stored;
    }

    /// Active interactions in problem order (equalities first for MLCP).
    fn active_interactions(&self, topology: &Topology) -> Result<(Vec<InteractionId>, usize)> {
        let mut equalities = Vec::new();
        let mut others = Vec::new();
        for id in topology.index_set(self.index_set) {
            let interaction = topology.interaction(id)?;
            let law = interaction.nslaw();
            if !self.kind.accepts_law(law) {
                return Err(Error::InvalidConfiguration(format!(
                    "{}: {} law cannot be solved by a {} problem",
                    id,
                    law.kind(),
                    self.kind.name()
                )));
            }
            match law {
                NonSmoothLaw::Equality { size } => equalities.push((id, *size)),
                _ => others.push(id),
            }
        }
        let n_equalities = equalities.iter().map(|(_, size)| size).sum();
        let mut ordered: Vec<InteractionId> = equalities.into_iter().map(|(id, _)| id).collect();
        ordered.extend(others);
        Ok((ordered, n_equalities))
    }

    /// Assemble and solve over the current index set; returns the solver info.
    ///
    /// λ and y of the active interactions hold the last iterate whatever the
    /// info; the caller decides what non-convergence means.
    pub(crate) fn compute(&mut self, topology: &mut Topology, time: f64) -> Result<i32> {
        let (active, n_equalities) = self.active_interactions(topology)?;
        if active.is_empty() {
            self.reset_inactive(topology, &active)?;
            self.last = SolveReport::default();
            return Ok(0);
        }

        let options = AssemblyOptions {
            level: self.input_level,
            storage: self.storage,
            restitution: self.restitution,
            stored_free_output: self.stored_free_output.then_some(self.output_level),
        };
        let assembled = assembly::assemble(topology, &active, time, &options)?;
        let n = assembled.q.len();
        let mut z = Vector::zeros(n);
        for block in &assembled.blocks {
            z.rows_mut(block.offset, block.size)
                .copy_from(topology.interaction(block.id)?.lambda(self.input_level));
        }
        let mut w = Vector::zeros(n);
        let info = self.solve(topology, &assembled, n_equalities, &mut z, &mut w)?;

        for block in &assembled.blocks {
            let lambda = z.rows(block.offset, block.size).clone_owned();
            let y = w.rows(block.offset, block.size) - assembled.restitution.rows(block.offset, block.size);
            let interaction = topology.interaction_mut(block.id)?;
            interaction.set_lambda(self.input_level, lambda.as_slice());
            interaction.set_y(self.output_level, y.as_slice());
        }
        self.reset_inactive(topology, &active)?;
        self.last = SolveReport {
            size: n,
            info,
            iterations: self.options.iterations_done(),
            residual: self.options.residual(),
        };
        debug!(
            problem = self.kind.name(),
            time,
            size = n,
            info,
            iterations = self.last.iterations,
            residual = self.last.residual,
            "one-step non-smooth problem solved"
        );
        Ok(info)
    }

    fn reset_inactive(&self, topology: &mut Topology, active: &[InteractionId]) -> Result<()> {
        for id in topology.index_set(0) {
            if !active.contains(&id) {
                topology.interaction_mut(id)?.reset_lambda(self.input_level);
            }
        }
        Ok(())
    }

    fn solve(&mut self, topology: &Topology, assembled: &Assembled, n_equalities: usize, z: &mut Vector, w: &mut Vector) -> Result<i32> {
        let m = assembled.matrix.clone();
        let q = assembled.q.clone();
        match self.kind {
            ProblemKind::Lcp => LinearComplementarityProblem::new(m, q)?.solve(z, w, &mut self.options),
            ProblemKind::Mlcp => MixedLinearComplementarityProblem::new(m, q, n_equalities)?.solve(z, w, &mut self.options),
            ProblemKind::Relay => {
                let mut lb = Vec::with_capacity(q.len());
                let mut ub = Vec::with_capacity(q.len());
                for block in &assembled.blocks {
                    if let NonSmoothLaw::Relay { lb: l, ub: u } = topology.interaction(block.id)?.nslaw() {
                        lb.extend(l.iter());
                        ub.extend(u.iter());
                    }
                }
                RelayProblem::new(m, q, Vector::from_vec(lb), Vector::from_vec(ub))?.solve(z, w, &mut self.options)
            }
            ProblemKind::Avi => {
                let mut facets = Vec::new();
                for block in &assembled.blocks {
                    if let NonSmoothLaw::NormalCone { h, k } = topology.interaction(block.id)?.nslaw() {
                        facets.push((block.offset, h, k));
                    }
                }
                let rows: usize = facets.iter().map(|(_, h, _)| h.nrows()).sum();
                let mut h_global = Matrix::zeros(rows, q.len());
                let mut k_global = Vector::zeros(rows);
                let mut row = 0;
                for (offset, h, k) in facets {
                    h_global.view_mut((row, offset), (h.nrows(), h.ncols())).copy_from(h);
                    k_global.rows_mut(row, k.len()).copy_from(k);
                    row += h.nrows();
                }
                AffineVariationalInequality::new(m, q, h_global, k_global)?.solve(z, w, &mut self.options)
            }
            ProblemKind::FrictionContact { dimension } => {
                let mut mu = Vec::with_capacity(assembled.blocks.len());
                for block in &assembled.blocks {
                    if let NonSmoothLaw::NewtonImpactFriction { mu: c, .. } = topology.interaction(block.id)?.nslaw() {
                        mu.push(*c);
                    }
                }
                FrictionContactProblem::new(dimension, m, q, mu)?.solve(z, w, &mut self.options)
            }
            ProblemKind::Equality => {
                let dense = match m {
                    NsMatrix::Dense(m) => m,
                    sparse => sparse.to_dense(),
                };
                let solution = dense
                    .lu()
                    .solve(&(-&q))
                    .ok_or_else(|| Error::SingularMatrix("equality problem matrix".into()))?;
                z.copy_from(&solution);
                w.fill(0.0);
                self.options.record(1, 0.0);
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds::{LagrangianLinearTiDs, MassMatrix};
    use crate::interaction::Interaction;
    use crate::osi::{MoreauJean, OneStepIntegrator};
    use crate::relation::LagrangianLinearR;
    use crate::types::DsId;
    use approx::assert_relative_eq;

    fn body(topo: &mut Topology, v: f64) -> DsId {
        let ds = topo.insert_dynamical_system(
            LagrangianLinearTiDs::new(Vector::zeros(1), Vector::from_element(1, v), MassMatrix::Dense(Matrix::identity(1, 1))).unwrap(),
        );
        let osi: OneStepIntegrator = MoreauJean::new(1.0).unwrap().into();
        let node = topo.node_mut(ds).unwrap();
        osi.initialize_ds(&mut node.ds, &mut node.workspace, 0.0, 0.1).unwrap();
        osi.begin_step(&mut node.ds, &mut node.workspace, 0.0).unwrap();
        osi.compute_free_state(&mut node.ds, &mut node.workspace, 0.0, 0.1).unwrap();
        ds
    }

    fn contact(law: NonSmoothLaw) -> Interaction {
        Interaction::new(LagrangianLinearR::new(Matrix::identity(1, 1)), law).unwrap()
    }

    #[test]
    fn test_solver_must_match_kind() {
        assert!(matches!(
            OneStepNSProblem::new(ProblemKind::Lcp, SolverOptions::new(SolverId::FcNsgs)),
            Err(Error::UnknownSolver { problem: "LCP", id: 600 })
        ));
        assert!(OneStepNSProblem::friction_contact(4, SolverId::FcNsgs).is_err());
    }

    #[test]
    fn test_lcp_writes_back_lambda_and_y() {
        let mut topo = Topology::new();
        let ds = body(&mut topo, -2.0);
        let id = topo.link(contact(NonSmoothLaw::newton_impact(1, 0.0).unwrap()), ds, None).unwrap();
        topo.insert_in_index_set(1, id);
        let mut problem = OneStepNSProblem::lcp(SolverId::LcpLemke).unwrap();
        assert_eq!(problem.compute(&mut topo, 0.0).unwrap(), 0);
        let inter = topo.interaction(id).unwrap();
        // plastic impact: impulse 2 stops the body
        assert_relative_eq!(inter.lambda(1)[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(inter.y(1)[0], 0.0, epsilon = 1e-12);
        assert_eq!(problem.last_report().size, 1);
    }

    #[test]
    fn test_inactive_interactions_are_released() {
        let mut topo = Topology::new();
        let ds = body(&mut topo, -2.0);
        let id = topo.link(contact(NonSmoothLaw::complementarity(1)), ds, None).unwrap();
        topo.interaction_mut(id).unwrap().set_lambda(1, &[5.0]);
        let mut problem = OneStepNSProblem::lcp(SolverId::LcpPgs).unwrap();
        assert_eq!(problem.compute(&mut topo, 0.0).unwrap(), 0);
        assert_eq!(topo.interaction(id).unwrap().lambda(1)[0], 0.0);
        assert_eq!(problem.last_report().size, 0);
    }

    #[test]
    fn test_failed_solve_keeps_inactive_lambda() {
        let mut topo = Topology::new();
        let ds = body(&mut topo, -2.0);
        let idle = topo.link(contact(NonSmoothLaw::Equality { size: 1 }), ds, None).unwrap();
        topo.interaction_mut(idle).unwrap().set_lambda(1, &[5.0]);
        let detached = Interaction::new(LagrangianLinearR::new(Matrix::zeros(1, 1)), NonSmoothLaw::Equality { size: 1 }).unwrap();
        let singular = topo.link(detached, ds, None).unwrap();
        topo.insert_in_index_set(1, singular);

        let mut problem = OneStepNSProblem::equality().unwrap();
        assert!(matches!(problem.compute(&mut topo, 0.0), Err(Error::SingularMatrix(_))));
        assert_eq!(topo.interaction(idle).unwrap().lambda(1)[0], 5.0);
    }

    #[test]
    fn test_law_outside_problem_class_is_rejected() {
        let mut topo = Topology::new();
        let ds = body(&mut topo, -2.0);
        let law = NonSmoothLaw::relay(Vector::from_element(1, -1.0), Vector::from_element(1, 1.0)).unwrap();
        let id = topo.link(contact(law), ds, None).unwrap();
        topo.insert_in_index_set(1, id);
        let mut problem = OneStepNSProblem::lcp(SolverId::LcpLemke).unwrap();
        assert!(matches!(problem.compute(&mut topo, 0.0), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_relay_problem_saturates() {
        let mut topo = Topology::new();
        let ds = body(&mut topo, -2.0);
        let law = NonSmoothLaw::relay(Vector::from_element(1, -1.0), Vector::from_element(1, 1.0)).unwrap();
        let id = topo.link(contact(law), ds, None).unwrap();
        topo.insert_in_index_set(1, id);
        let mut problem = OneStepNSProblem::relay().unwrap();
        assert_eq!(problem.compute(&mut topo, 0.0).unwrap(), 0);
        // velocity −2 cannot be cancelled by |λ| ≤ 1
        let inter = topo.interaction(id).unwrap();
        assert_relative_eq!(inter.lambda(1)[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(inter.y(1)[0], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_equality_problem() {
        let mut topo = Topology::new();
        let ds = body(&mut topo, 3.0);
        let id = topo.link(contact(NonSmoothLaw::Equality { size: 1 }), ds, None).unwrap();
        topo.insert_in_index_set(1, id);
        let mut problem = OneStepNSProblem::equality().unwrap();
        assert_eq!(problem.compute(&mut topo, 0.0).unwrap(), 0);
        assert_relative_eq!(topo.interaction(id).unwrap().lambda(1)[0], -3.0, epsilon = 1e-12);
    }
}
