//! Event-driven integration of Lagrangian systems with unilateral contacts.
//!
//! Smooth phases are integrated with [`ExplicitRk4`]; the contact forces of
//! persistent contacts come from an acceleration-level LCP
//! ([`ACCELERATION_PROBLEM`]) solved at the start of every RK4 substep and
//! held constant over it. When a gap closes, the crossing is located by
//! bisection and a non-smooth event is scheduled there; the impact LCP
//! ([`IMPACT_PROBLEM`], Newton restitution on ẏ) is solved at the start of
//! the following step.
//!
//! Index sets:
//!
//! ```text
//! I0  every interaction
//! I1  closed contacts, y₀ ≤ tol
//! I2  closed contacts that stay in contact, y₀ ≤ tol and ẏ ≤ vtol
//! ```

use super::{Simulation, SimulationCore, ACCELERATION_PROBLEM, IMPACT_PROBLEM};
use crate::config::SimulationConfig;
use crate::error::{Error, Result};
use crate::nslaw::NonSmoothLaw;
use crate::numerics::SolverId;
use crate::osi::{ExplicitRk4, OneStepIntegrator};
use crate::osnsp::{OneStepNSProblem, Restitution};
use crate::relation::Relation;
use crate::topology::Topology;
use crate::types::{DsId, InteractionId, Vector};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct EventDriven {
    core: SimulationCore,
}

impl EventDriven {
    /// Event-driven simulation over `[t0, t_final]`; `h` is the output grid.
    pub fn new(topology: Topology, t0: f64, t_final: f64, h: f64) -> Result<Self> {
        Self::with_config(topology, t0, t_final, h, SimulationConfig::default())
    }

    pub fn with_config(topology: Topology, t0: f64, t_final: f64, h: f64, config: SimulationConfig) -> Result<Self> {
        Ok(Self {
            core: SimulationCore::new(topology, t0, t_final, h, config)?,
        })
    }

    pub fn insert_integrator(&mut self, osi: impl Into<OneStepIntegrator>, systems: &[DsId]) -> Result<usize> {
        self.core.insert_integrator(osi.into(), systems)
    }

    /// Replace the velocity-level impact problem.
    pub fn set_impact_problem(&mut self, problem: OneStepNSProblem) {
        self.core.insert_problem(IMPACT_PROBLEM, problem);
    }

    /// Replace the acceleration-level problem.
    pub fn set_acceleration_problem(&mut self, problem: OneStepNSProblem) {
        self.core.insert_problem(ACCELERATION_PROBLEM, problem);
    }

    pub fn impact_problem(&self) -> Result<&OneStepNSProblem> {
        self.core.problem(IMPACT_PROBLEM)
    }

    pub fn acceleration_problem(&self) -> Result<&OneStepNSProblem> {
        self.core.problem(ACCELERATION_PROBLEM)
    }

    /// Close the contacts with y₀ ≤ tol, apply the impact law to those
    /// approaching, and sort the closed contacts into I2 or out of I1.
    ///
    /// Returns the info code of the impact solve (0 without impact).
    pub fn resolve_contacts(&mut self, time: f64) -> Result<i32> {
        let tolerance = self.core.config.tolerance;
        let policy = self.core.config.boundary_policy;
        let vtol = self.core.config.event_driven.velocity_tolerance;
        for id in self.core.topology.index_set(0) {
            if policy.accepts(min_row(self.core.topology.interaction(id)?.y(0)), tolerance) {
                self.core.topology.insert_in_index_set(1, id);
            }
        }

        let mut approaching = false;
        for id in self.core.topology.index_set(1) {
            approaching |= min_row(self.core.topology.interaction(id)?.y(1)) < -vtol;
        }
        let mut info = 0;
        if approaching {
            for ds in self.core.topology.ds_ids() {
                let node = self.core.topology.node_mut(ds)?;
                let velocity = node.ds.require_lagrangian_mut()?.v().clone();
                node.workspace.free = velocity;
                node.ds.reset_non_smooth_part(1);
            }
            info = self.core.compute_problem(IMPACT_PROBLEM, time)?;
            self.core.update_input(1, time)?;
            for ds in self.core.topology.ds_ids() {
                self.core.topology.ds_mut(ds)?.compute_post_impact_velocity(time)?;
            }
            self.core.update_outputs(time)?;
            self.core.report.impacts += 1;
            debug!(time, contacts = self.core.topology.index_set(1).len(), info, "impact");
        }

        for id in self.core.topology.index_set(1) {
            if min_row(self.core.topology.interaction(id)?.y(1)) > vtol {
                self.core.topology.remove_from_index_set(1, id);
                self.core.topology.remove_from_index_set(2, id);
            } else {
                self.core.topology.insert_in_index_set(2, id);
            }
        }
        Ok(info)
    }

    /// Contact forces of I2 at `time`: p[2] and the accelerations are updated.
    pub fn solve_acceleration(&mut self, time: f64) -> Result<i32> {
        for ds in self.core.topology.ds_ids() {
            let system = self.core.topology.ds_mut(ds)?;
            system.reset_non_smooth_part(2);
            system.compute_rhs(time)?;
        }
        for id in self.core.topology.index_set(2) {
            self.core.topology.update_output(id, time, 2, 2)?;
        }
        let info = self.core.compute_problem(ACCELERATION_PROBLEM, time)?;
        self.core.update_input(2, time)?;
        for ds in self.core.topology.ds_ids() {
            self.core.topology.ds_mut(ds)?.compute_rhs(time)?;
        }
        Ok(info)
    }

    fn rk4_of(&self, ds: DsId) -> Result<ExplicitRk4> {
        match self.core.integrator_of(ds)? {
            OneStepIntegrator::ExplicitRk4(rk4) => Ok(rk4),
            other => Err(Error::InvalidConfiguration(format!(
                "{} cannot drive an event-driven simulation",
                other.kind()
            ))),
        }
    }

    /// M factorization in each system's workspace, for the contact problems.
    fn refresh_mass_workspaces(&mut self, time: f64) -> Result<()> {
        for ds in self.core.topology.ds_ids() {
            let node = self.core.topology.node_mut(ds)?;
            if node.workspace.frozen && node.workspace.iteration_matrix.is_some() {
                continue;
            }
            let state = node.ds.require_lagrangian_mut()?;
            state.update_mass_factorization(time)?;
            let constant = state.has_constant_mass();
            let factorization = state
                .mass()
                .ok_or_else(|| Error::MissingData(format!("{}: mass matrix is not set", ds)))?
                .factorize()?;
            node.workspace.iteration_matrix = Some(factorization);
            node.workspace.frozen = constant;
            node.workspace.scale = 1.0;
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<(DsId, Vector)> {
        self.core.topology.systems.iter().map(|(id, node)| (*id, node.ds.x())).collect()
    }

    fn restore(&mut self, snapshot: &[(DsId, Vector)]) -> Result<()> {
        for (ds, x) in snapshot {
            self.core.topology.ds_mut(*ds)?.set_x(x)?;
        }
        Ok(())
    }

    /// One RK4 step of length `h` for every system, then the outputs at `t + h`.
    fn advance(&mut self, t: f64, h: f64) -> Result<()> {
        for ds in self.core.topology.ds_ids() {
            let rk4 = self.rk4_of(ds)?;
            rk4.step(self.core.topology.ds_mut(ds)?, t, h)?;
        }
        self.core.update_outputs(t + h)
    }

    /// True when one of `candidates` has penetrated and is still moving in.
    fn crossing(&self, candidates: &[InteractionId]) -> Result<bool> {
        for id in candidates {
            let interaction = self.core.topology.interaction(*id)?;
            let y0 = interaction.y(0);
            let y1 = interaction.y(1);
            if (0..interaction.size()).any(|row| y0[row] < 0.0 && y1[row] < 0.0) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Bisect the first crossing inside `[t, t + dt]` and leave the state there.
    fn locate_root(&mut self, snapshot: &[(DsId, Vector)], candidates: &[InteractionId], t: f64, dt: f64) -> Result<f64> {
        let options = self.core.config.event_driven;
        let (mut lo, mut hi) = (0.0, dt);
        let mut iterations = 0;
        while hi - lo > options.root_tolerance && iterations < options.max_root_iterations {
            let mid = 0.5 * (lo + hi);
            self.restore(snapshot)?;
            self.advance(t, mid)?;
            if self.crossing(candidates)? {
                hi = mid;
            } else {
                lo = mid;
            }
            iterations += 1;
        }
        if hi - lo > options.root_tolerance {
            warn!(t, width = hi - lo, "contact time not located within tolerance");
        }
        self.restore(snapshot)?;
        self.advance(t, hi)?;
        debug!(time = t + hi, iterations, "contact located");
        Ok(t + hi)
    }

    /// Drop the contacts that opened during the last substep.
    fn lift_off(&mut self) -> Result<()> {
        let tolerance = self.core.config.tolerance;
        let policy = self.core.config.boundary_policy;
        for id in self.core.topology.index_set(1) {
            if !policy.accepts(min_row(self.core.topology.interaction(id)?.y(0)), tolerance) {
                self.core.topology.remove_from_index_set(1, id);
                self.core.topology.remove_from_index_set(2, id);
                debug!(%id, "contact opened");
            }
        }
        Ok(())
    }
}

fn min_row(y: &Vector) -> f64 {
    y.iter().copied().fold(f64::INFINITY, f64::min)
}

impl Simulation for EventDriven {
    fn core(&self) -> &SimulationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SimulationCore {
        &mut self.core
    }

    fn initialize(&mut self) -> Result<()> {
        if self.core.initialized {
            warn!("event-driven simulation initialized twice");
            return Ok(());
        }
        for osi in self.core.used_integrators()? {
            if osi.is_time_stepping() {
                return Err(Error::InvalidConfiguration(format!(
                    "{} cannot drive an event-driven simulation",
                    osi.kind()
                )));
            }
        }
        for (id, node) in &self.core.topology.systems {
            if !node.ds.is_lagrangian() {
                return Err(Error::InvalidConfiguration(format!(
                    "{}: event-driven simulations need Lagrangian systems, got {}",
                    id,
                    node.ds.kind()
                )));
            }
        }
        for (id, interaction) in &self.core.topology.interactions {
            let lagrangian = matches!(
                interaction.relation(),
                Relation::LagrangianLinear(_) | Relation::LagrangianScleronomous(_) | Relation::LagrangianRheonomous(_)
            );
            let unilateral = matches!(
                interaction.nslaw(),
                NonSmoothLaw::NewtonImpact { .. } | NonSmoothLaw::ComplementarityCondition { .. }
            );
            if !lagrangian || !unilateral {
                return Err(Error::InvalidConfiguration(format!(
                    "{}: event-driven simulations handle unilateral contacts on Lagrangian relations, got {} with {}",
                    id,
                    interaction.relation().kind(),
                    interaction.nslaw().kind()
                )));
            }
        }

        self.core.process_change_log()?;
        self.core.topology.ensure_index_sets(3);
        if !self.core.problems.contains_key(&IMPACT_PROBLEM) {
            self.core.insert_problem(IMPACT_PROBLEM, OneStepNSProblem::lcp(SolverId::LcpLemke)?);
        }
        if !self.core.problems.contains_key(&ACCELERATION_PROBLEM) {
            self.core.insert_problem(ACCELERATION_PROBLEM, OneStepNSProblem::lcp(SolverId::LcpLemke)?);
        }
        let impact = self.core.problem_mut(IMPACT_PROBLEM)?;
        impact.set_levels(1, 1, 1);
        impact.set_restitution(Restitution::Current);
        let acceleration = self.core.problem_mut(ACCELERATION_PROBLEM)?;
        acceleration.set_levels(2, 2, 2);
        acceleration.set_stored_free_output(true);

        let t0 = self.core.events.starting_time();
        self.refresh_mass_workspaces(t0)?;
        self.core.update_outputs(t0)?;
        self.core.initialized = true;
        info!(
            systems = self.core.topology.number_of_ds(),
            interactions = self.core.topology.number_of_interactions(),
            t0,
            t_final = self.core.events.final_time(),
            "event-driven simulation initialized"
        );
        Ok(())
    }

    fn compute_one_step(&mut self) -> Result<i32> {
        if !self.core.initialized {
            return Err(Error::InvalidConfiguration("simulation is not initialized".into()));
        }
        if self.core.pending_changes() > 0 {
            self.core.process_change_log()?;
        }
        let t0 = self.core.events.starting_time();
        let t_end = self.core.events.next_time();
        self.refresh_mass_workspaces(t0)?;
        self.core.update_outputs(t0)?;
        let mut info = self.resolve_contacts(t0)?;

        let mut substeps = 1;
        for ds in self.core.topology.ds_ids() {
            substeps = substeps.max(self.rk4_of(ds)?.substeps(t_end - t0));
        }
        let dt = (t_end - t0) / substeps as f64;
        for k in 0..substeps {
            let t = t0 + k as f64 * dt;
            info = info.max(self.solve_acceleration(t)?);
            let snapshot = self.snapshot();
            self.advance(t, dt)?;
            let candidates: Vec<InteractionId> = self
                .core
                .topology
                .index_set(0)
                .into_iter()
                .filter(|id| !self.core.topology.is_in_index_set(1, *id))
                .collect();
            if self.crossing(&candidates)? {
                let root = self.locate_root(&snapshot, &candidates, t, dt)?;
                let earliest = t0 + 2.0 * self.core.events.tick();
                self.core.events.schedule_non_smooth_event(root.max(earliest))?;
                return Ok(info);
            }
            self.lift_off()?;
        }
        Ok(info)
    }
}
