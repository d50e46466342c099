//! Event-capturing time stepping on a fixed grid.
//!
//! Every step solves one non-smooth problem ([`TIME_STEPPING_PROBLEM`]) over
//! the index set of the integrators (level 0 for Euler–Moreau, level 1 for
//! Moreau–Jean). Impacts and stick/slip transitions are resolved implicitly
//! inside the step; no event location is attempted.
//!
//! When a system or relation is nonlinear the step becomes a Newton loop:
//! free state, non-smooth solve and state update are repeated around the
//! last iterate until ‖Δx‖∞ ≤ tol·max(1, ‖x‖∞).

use super::{Simulation, SimulationCore, TIME_STEPPING_PROBLEM};
use crate::config::{NonConvergencePolicy, SimulationConfig};
use crate::ds::DynamicalSystem;
use crate::error::{Error, Result};
use crate::nslaw::NonSmoothLaw;
use crate::numerics::SolverId;
use crate::osi::OneStepIntegrator;
use crate::osnsp::{OneStepNSProblem, Restitution};
use crate::relation::Relation;
use crate::topology::Topology;
use crate::types::{DsId, InteractionId, Vector};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct TimeStepping {
    core: SimulationCore,
    /// Index set the non-smooth problem is posed on.
    level: usize,
    index_sets_ready: bool,
}

impl TimeStepping {
    /// Time stepping over `[t0, t_final]` with step `h` and default configuration.
    pub fn new(topology: Topology, t0: f64, t_final: f64, h: f64) -> Result<Self> {
        Self::with_config(topology, t0, t_final, h, SimulationConfig::default())
    }

    pub fn with_config(topology: Topology, t0: f64, t_final: f64, h: f64, config: SimulationConfig) -> Result<Self> {
        Ok(Self {
            core: SimulationCore::new(topology, t0, t_final, h, config)?,
            level: 0,
            index_sets_ready: false,
        })
    }

    /// Bind an integrator to `systems`.
    pub fn insert_integrator(&mut self, osi: impl Into<OneStepIntegrator>, systems: &[DsId]) -> Result<usize> {
        self.core.insert_integrator(osi.into(), systems)
    }

    /// Use `problem` for the step instead of the one chosen from the laws.
    pub fn insert_problem(&mut self, problem: OneStepNSProblem) -> Option<OneStepNSProblem> {
        self.core.insert_problem(TIME_STEPPING_PROBLEM, problem)
    }

    pub fn problem(&self) -> Result<&OneStepNSProblem> {
        self.core.problem(TIME_STEPPING_PROBLEM)
    }

    /// Free state of every system; returns the largest free residual norm.
    pub fn compute_residu(&mut self) -> Result<f64> {
        let t_k = self.core.events.starting_time();
        let h = self.core.events.time_step();
        let mut worst: f64 = 0.0;
        for ds in self.core.topology.ds_ids() {
            let osi = self.core.integrator_of(ds)?;
            let node = self.core.topology.node_mut(ds)?;
            worst = worst.max(osi.compute_free_state(&mut node.ds, &mut node.workspace, t_k, h)?);
        }
        Ok(worst)
    }

    /// Reclassify the interactions of index set 0 into the problem's index set.
    ///
    /// With static levels only the first call classifies; interactions linked
    /// later are classified once, when the change log is processed.
    pub fn update_index_sets(&mut self) -> Result<()> {
        if self.level == 0 || (self.core.config.static_levels && self.index_sets_ready) {
            return Ok(());
        }
        let ids = self.core.topology.index_set(0);
        self.classify(&ids)?;
        self.index_sets_ready = true;
        Ok(())
    }

    fn classify(&mut self, ids: &[InteractionId]) -> Result<()> {
        if self.level == 0 {
            return Ok(());
        }
        let h = self.core.events.time_step();
        let tolerance = self.core.config.tolerance;
        let policy = self.core.config.boundary_policy;
        for &id in ids {
            let osi = self.core.interaction_integrator(id)?;
            let active = osi.is_active(self.core.topology.interaction(id)?, h, tolerance, policy);
            if active {
                self.core.topology.insert_in_index_set(self.level, id);
            } else {
                self.core.topology.remove_from_index_set(self.level, id);
            }
        }
        Ok(())
    }

    /// Solve the step problem at the end of the current step.
    pub fn compute_one_step_ns_problem(&mut self) -> Result<i32> {
        let t1 = self.core.events.next_time();
        self.core.compute_problem(TIME_STEPPING_PROBLEM, t1)
    }

    /// Scatter λ into the systems, advance their state and recompute the outputs.
    pub fn update(&mut self) -> Result<()> {
        let t1 = self.core.events.next_time();
        let h = self.core.events.time_step();
        let level = self.core.problem(TIME_STEPPING_PROBLEM)?.input_level();
        self.core.update_input(level, t1)?;
        for ds in self.core.topology.ds_ids() {
            let osi = self.core.integrator_of(ds)?;
            let node = self.core.topology.node_mut(ds)?;
            osi.update_state(&mut node.ds, &node.workspace, h)?;
        }
        self.core.update_outputs(t1)
    }

    fn needs_newton(&self) -> bool {
        let topology = &self.core.topology;
        let nonlinear_ds = topology.systems.values().any(|node| {
            matches!(
                node.ds,
                DynamicalSystem::FirstOrderNonLinear(_) | DynamicalSystem::Lagrangian(_)
            )
        });
        let nonlinear_relation = topology.interactions.values().any(|inter| {
            matches!(
                inter.relation(),
                Relation::FirstOrderNonLinear(_) | Relation::LagrangianScleronomous(_) | Relation::LagrangianRheonomous(_)
            )
        });
        nonlinear_ds || nonlinear_relation
    }

    fn states(&self) -> Vec<Vector> {
        self.core.topology.systems.values().map(|node| node.ds.x()).collect()
    }
}

/// Problem matching the laws of the topology.
fn default_problem(topology: &Topology) -> Result<OneStepNSProblem> {
    let laws: Vec<&NonSmoothLaw> = topology.interactions.values().map(|i| i.nslaw()).collect();
    if laws.is_empty() {
        return OneStepNSProblem::lcp(SolverId::LcpLemke);
    }
    if laws.iter().all(|law| matches!(law, NonSmoothLaw::NormalCone { .. })) {
        return OneStepNSProblem::avi();
    }
    if laws.iter().all(|law| matches!(law, NonSmoothLaw::Relay { .. })) {
        return OneStepNSProblem::relay();
    }
    if let Some(NonSmoothLaw::NewtonImpactFriction { dimension, .. }) = laws.first() {
        let dimension = *dimension;
        if laws
            .iter()
            .all(|law| matches!(law, NonSmoothLaw::NewtonImpactFriction { dimension: d, .. } if *d == dimension))
        {
            return OneStepNSProblem::friction_contact(dimension, SolverId::FcNsgs);
        }
    }
    if laws.iter().any(|law| matches!(law, NonSmoothLaw::Equality { .. })) {
        return OneStepNSProblem::mlcp(SolverId::MlcpEnumerative);
    }
    OneStepNSProblem::lcp(SolverId::LcpLemke)
}

impl Simulation for TimeStepping {
    fn core(&self) -> &SimulationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SimulationCore {
        &mut self.core
    }

    fn initialize(&mut self) -> Result<()> {
        if self.core.initialized {
            warn!("time-stepping simulation initialized twice");
            return Ok(());
        }
        let used = self.core.used_integrators()?;
        if let Some(osi) = used.iter().find(|osi| !osi.is_time_stepping()) {
            return Err(Error::InvalidConfiguration(format!("{} cannot drive a time-stepping simulation", osi.kind())));
        }
        let mut levels: Vec<usize> = used.iter().map(OneStepIntegrator::index_set_level).collect();
        levels.sort_unstable();
        levels.dedup();
        if levels.len() > 1 {
            return Err(Error::InvalidConfiguration(
                "integrators working on different index sets cannot share a time-stepping problem".into(),
            ));
        }
        self.core.process_change_log()?;

        let osi = used.first().copied();
        self.level = osi.map_or(0, |osi| osi.index_set_level());
        let input_level = osi.map_or(0, |osi| osi.levels().min_input);
        self.core.topology.ensure_index_sets(self.level + 1);
        if !self.core.problems.contains_key(&TIME_STEPPING_PROBLEM) {
            let problem = default_problem(&self.core.topology)?;
            self.core.insert_problem(TIME_STEPPING_PROBLEM, problem);
        }
        let problem = self.core.problem_mut(TIME_STEPPING_PROBLEM)?;
        problem.set_levels(self.level, input_level, input_level);
        if self.level > 0 {
            problem.set_restitution(Restitution::PreviousStep);
        }
        self.core.initialized = true;
        self.update_index_sets()?;
        info!(
            systems = self.core.topology.number_of_ds(),
            interactions = self.core.topology.number_of_interactions(),
            index_set = self.level,
            t0 = self.core.events.starting_time(),
            t_final = self.core.events.final_time(),
            h = self.core.events.discretisation_step(),
            "time-stepping simulation initialized"
        );
        Ok(())
    }

    fn compute_one_step(&mut self) -> Result<i32> {
        if !self.core.initialized {
            return Err(Error::InvalidConfiguration("simulation is not initialized".into()));
        }
        if self.core.pending_changes() > 0 {
            let added = self.core.process_change_log()?;
            if self.core.config.static_levels && self.index_sets_ready {
                self.classify(&added)?;
            }
        }
        let t_k = self.core.events.starting_time();
        let t1 = self.core.events.next_time();
        for ds in self.core.topology.ds_ids() {
            let osi = self.core.integrator_of(ds)?;
            let node = self.core.topology.node_mut(ds)?;
            node.ds.reset_all_non_smooth_parts();
            osi.begin_step(&mut node.ds, &mut node.workspace, t_k)?;
        }

        let newton = self.core.config.newton;
        let iterations = if self.needs_newton() { newton.max_iterations } else { 1 };
        let mut converged = iterations == 1;
        let mut info = 0;
        let mut increment = 0.0;
        for iteration in 0..iterations {
            let previous = self.states();
            let residual = self.compute_residu()?;
            if iteration == 0 {
                self.update_index_sets()?;
            }
            info = self.compute_one_step_ns_problem()?;
            self.update()?;
            if iterations == 1 {
                break;
            }
            let current = self.states();
            let (mut dx, mut size) = (0.0_f64, 0.0_f64);
            for (x, x_prev) in current.iter().zip(&previous) {
                dx = dx.max((x - x_prev).amax());
                size = size.max(x.amax());
            }
            increment = dx;
            debug!(iteration, residual, increment, "Newton iteration");
            if dx <= newton.tolerance * size.max(1.0) {
                converged = true;
                break;
            }
        }
        if !converged {
            self.core.report.newton_failures += 1;
            match self.core.config.non_convergence {
                NonConvergencePolicy::Warn => warn!(time = t1, increment, "Newton loop did not converge"),
                NonConvergencePolicy::Abort => {
                    return Err(Error::NonConvergence {
                        problem: TIME_STEPPING_PROBLEM,
                        time: t1,
                        info: info.max(1),
                        residual: increment,
                    })
                }
            }
            info = info.max(1);
        }
        debug!(
            time = t1,
            active = self.core.topology.index_set(self.level).len(),
            info,
            "time step computed"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds::{FirstOrderLinearDs, LagrangianLinearTiDs, MassMatrix};
    use crate::interaction::Interaction;
    use crate::osi::{EulerMoreau, ExplicitRk4, MoreauJean};
    use crate::relation::LagrangianLinearR;
    use crate::types::Matrix;
    use approx::assert_relative_eq;

    fn ball(height: f64, velocity: f64, e: f64) -> (Topology, DsId) {
        let mut topo = Topology::new();
        let ds = topo.insert_dynamical_system(
            LagrangianLinearTiDs::new(
                Vector::from_element(1, height),
                Vector::from_element(1, velocity),
                MassMatrix::Dense(Matrix::identity(1, 1)),
            )
            .unwrap()
            .with_f_ext(Vector::from_element(1, -10.0))
            .unwrap(),
        );
        let contact = Interaction::new(
            LagrangianLinearR::new(Matrix::identity(1, 1)),
            NonSmoothLaw::newton_impact(1, e).unwrap(),
        )
        .unwrap();
        topo.link(contact, ds, None).unwrap();
        (topo, ds)
    }

    #[test]
    fn test_free_fall_without_contact() {
        let (topo, ds) = ball(100.0, 0.0, 0.5);
        let mut sim = TimeStepping::new(topo, 0.0, 1.0, 0.01).unwrap();
        sim.insert_integrator(MoreauJean::new(0.5).unwrap(), &[ds]).unwrap();
        let report = sim.run().unwrap();
        assert_eq!(report.steps, 100);
        let state = sim.topology().ds(ds).unwrap().lagrangian_state().unwrap();
        // θ = 1/2 is exact for constant force
        assert_relative_eq!(state.q()[0], 95.0, epsilon = 1e-9);
        assert_relative_eq!(state.v()[0], -10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_plastic_impact_stops_the_ball() {
        let (topo, ds) = ball(0.0, -1.0, 0.0);
        let mut sim = TimeStepping::new(topo, 0.0, 0.1, 0.01).unwrap();
        sim.insert_integrator(MoreauJean::new(0.5).unwrap(), &[ds]).unwrap();
        sim.initialize().unwrap();
        assert_eq!(sim.problem().unwrap().kind(), crate::osnsp::ProblemKind::Lcp);
        assert_eq!(sim.compute_one_step().unwrap(), 0);
        sim.next_step().unwrap();
        let v = sim.topology().ds(ds).unwrap().lagrangian_state().unwrap().v()[0];
        assert_relative_eq!(v, 0.0, epsilon = 1e-12);
        // the ball rests on the ground afterwards
        sim.run().unwrap();
        let q = sim.topology().ds(ds).unwrap().lagrangian_state().unwrap().q()[0];
        assert!(q > -1e-2 && q <= 0.0);
    }

    #[test]
    fn test_static_levels_classify_contacts_linked_later() {
        let mut topo = Topology::new();
        let ds = topo.insert_dynamical_system(
            LagrangianLinearTiDs::new(Vector::zeros(1), Vector::zeros(1), MassMatrix::Dense(Matrix::identity(1, 1)))
                .unwrap()
                .with_f_ext(Vector::from_element(1, -10.0))
                .unwrap(),
        );
        let config = SimulationConfig::default().with_static_levels(true);
        let mut sim = TimeStepping::with_config(topo, 0.0, 1.0, 0.01, config).unwrap();
        sim.insert_integrator(MoreauJean::new(0.5).unwrap(), &[ds]).unwrap();
        sim.initialize().unwrap();
        sim.compute_one_step().unwrap();
        sim.next_step().unwrap();
        assert_relative_eq!(sim.topology().ds(ds).unwrap().lagrangian_state().unwrap().v()[0], -0.1, epsilon = 1e-12);

        let ground = Interaction::new(LagrangianLinearR::new(Matrix::identity(1, 1)), NonSmoothLaw::newton_impact(1, 0.0).unwrap()).unwrap();
        let id = sim.topology_mut().link(ground, ds, None).unwrap();
        assert_eq!(sim.compute_one_step().unwrap(), 0);
        sim.next_step().unwrap();
        assert_eq!(sim.topology().index_set(1), vec![id]);
        assert_relative_eq!(sim.topology().ds(ds).unwrap().lagrangian_state().unwrap().v()[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rk4_is_rejected() {
        let (topo, ds) = ball(1.0, 0.0, 0.5);
        let mut sim = TimeStepping::new(topo, 0.0, 1.0, 0.01).unwrap();
        sim.insert_integrator(ExplicitRk4::default(), &[ds]).unwrap();
        assert!(matches!(sim.initialize(), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_unbound_system_is_reported() {
        let (topo, _) = ball(1.0, 0.0, 0.5);
        let mut sim = TimeStepping::new(topo, 0.0, 1.0, 0.01).unwrap();
        assert!(matches!(sim.initialize(), Err(Error::MissingData(_))));
    }

    #[test]
    fn test_double_binding_is_rejected() {
        let (topo, ds) = ball(1.0, 0.0, 0.5);
        let mut sim = TimeStepping::new(topo, 0.0, 1.0, 0.01).unwrap();
        sim.insert_integrator(MoreauJean::default(), &[ds]).unwrap();
        assert!(sim.insert_integrator(MoreauJean::default(), &[ds]).is_err());
    }

    #[test]
    fn test_first_order_decay_without_interactions() {
        let mut topo = Topology::new();
        let ds = topo.insert_dynamical_system(
            FirstOrderLinearDs::time_invariant(Vector::from_element(1, 1.0), Matrix::from_element(1, 1, -1.0), None).unwrap(),
        );
        let mut sim = TimeStepping::new(topo, 0.0, 1.0, 0.1).unwrap();
        sim.insert_integrator(EulerMoreau::new(1.0).unwrap(), &[ds]).unwrap();
        sim.run().unwrap();
        // implicit Euler: x = (1/1.1)^10
        let x = sim.topology().ds(ds).unwrap().x()[0];
        assert_relative_eq!(x, (1.0_f64 / 1.1).powi(10), epsilon = 1e-12);
    }
}
