//! Simulation drivers.
//!
//! A simulation owns a [`Topology`], an [`EventsManager`], the one-step
//! integrators bound to its systems and its one-step non-smooth problems.
//! Both drivers share [`SimulationCore`] for the bookkeeping around a step:
//! initialization of objects added to the topology, input/output
//! propagation, history and event processing.
//!
//! # Step contract
//!
//! ```text
//! compute_one_step:  free state → index sets → non-smooth solve → input / state / output
//! next_step:         history swap → advance events → sensors / actuators
//! ```
//!
//! A solver that does not converge is reported through the returned info
//! code and a warning, or as [`Error::NonConvergence`] under
//! [`NonConvergencePolicy::Abort`].

pub mod event_driven;
pub mod time_stepping;

pub use event_driven::EventDriven;
pub use time_stepping::TimeStepping;

use crate::config::{NonConvergencePolicy, SimulationConfig};
use crate::control::{Actuator, Sensor};
use crate::ds::DynamicalSystem;
use crate::error::{Error, Result};
use crate::events::{EventKind, EventsManager};
use crate::osi::OneStepIntegrator;
use crate::osnsp::OneStepNSProblem;
use crate::topology::{Change, Topology};
use crate::types::{DsId, InteractionId};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Id of the time-stepping non-smooth problem.
pub const TIME_STEPPING_PROBLEM: usize = 0;
/// Id of the event-driven impact (velocity-level) problem.
pub const IMPACT_PROBLEM: usize = 0;
/// Id of the event-driven acceleration-level problem.
pub const ACCELERATION_PROBLEM: usize = 1;

/// Counters accumulated over a run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunReport {
    /// Processed steps (calls to `next_step`).
    pub steps: u64,
    /// Non-smooth solves that returned a non-zero info.
    pub non_converged: u64,
    /// Time steps whose Newton loop hit its iteration limit.
    pub newton_failures: u64,
    /// Impact problems solved (event-driven only).
    pub impacts: u64,
    /// Time of the last processed event.
    pub time: f64,
}

/// Bookkeeping shared by the simulation drivers.
#[derive(Debug)]
pub struct SimulationCore {
    pub(crate) topology: Topology,
    pub(crate) events: EventsManager,
    pub(crate) integrators: Vec<OneStepIntegrator>,
    pub(crate) problems: BTreeMap<usize, OneStepNSProblem>,
    pub(crate) config: SimulationConfig,
    sensors: Vec<Box<dyn Sensor>>,
    actuators: Vec<Box<dyn Actuator>>,
    log_cursor: usize,
    pub(crate) initialized: bool,
    pub(crate) report: RunReport,
}

impl SimulationCore {
    pub(crate) fn new(topology: Topology, t0: f64, t_final: f64, h: f64, config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            topology,
            events: EventsManager::new(t0, t_final, h)?,
            integrators: Vec::new(),
            problems: BTreeMap::new(),
            config,
            sensors: Vec::new(),
            actuators: Vec::new(),
            log_cursor: 0,
            initialized: false,
            report: RunReport {
                time: t0,
                ..RunReport::default()
            },
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn events(&self) -> &EventsManager {
        &self.events
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn report(&self) -> RunReport {
        self.report
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn integrators(&self) -> &[OneStepIntegrator] {
        &self.integrators
    }

    /// Bind `osi` to `systems`; returns the integrator index.
    pub fn insert_integrator(&mut self, osi: OneStepIntegrator, systems: &[DsId]) -> Result<usize> {
        let index = self.integrators.len();
        for ds in systems {
            if let Some(previous) = self.topology.node(*ds)?.integrator {
                return Err(Error::InvalidConfiguration(format!(
                    "{} is already bound to integrator {}",
                    ds, previous
                )));
            }
        }
        for ds in systems {
            self.topology.node_mut(*ds)?.integrator = Some(index);
        }
        self.integrators.push(osi);
        Ok(index)
    }

    /// Register a problem under `id`, returning the one it replaces.
    pub fn insert_problem(&mut self, id: usize, problem: OneStepNSProblem) -> Option<OneStepNSProblem> {
        self.problems.insert(id, problem)
    }

    pub fn problem(&self, id: usize) -> Result<&OneStepNSProblem> {
        self.problems.get(&id).ok_or(Error::UnknownProblem(id))
    }

    pub fn problem_mut(&mut self, id: usize) -> Result<&mut OneStepNSProblem> {
        self.problems.get_mut(&id).ok_or(Error::UnknownProblem(id))
    }

    /// Register a sensor captured every `period`; returns its index.
    pub fn insert_sensor(&mut self, sensor: Box<dyn Sensor>, period: f64) -> Result<usize> {
        let index = self.sensors.len();
        self.events.insert_periodic(EventKind::Sensor(index), period)?;
        self.sensors.push(sensor);
        Ok(index)
    }

    /// Register an actuator applied every `period`; returns its index.
    pub fn insert_actuator(&mut self, mut actuator: Box<dyn Actuator>, period: f64) -> Result<usize> {
        let index = self.actuators.len();
        actuator.initialize(self.events.starting_time(), self.events.final_time(), period, &self.topology)?;
        self.events.insert_periodic(EventKind::Actuator(index), period)?;
        self.actuators.push(actuator);
        Ok(index)
    }

    pub fn sensor(&self, index: usize) -> Option<&dyn Sensor> {
        self.sensors.get(index).map(|s| s.as_ref())
    }

    pub fn actuator(&self, index: usize) -> Option<&dyn Actuator> {
        self.actuators.get(index).map(|a| a.as_ref())
    }

    /// Integrator bound to `ds`.
    pub(crate) fn integrator_of(&self, ds: DsId) -> Result<OneStepIntegrator> {
        let index = self
            .topology
            .node(ds)?
            .integrator
            .ok_or_else(|| Error::MissingData(format!("{} has no one-step integrator", ds)))?;
        self.integrators
            .get(index)
            .copied()
            .ok_or_else(|| Error::InvalidHandle(format!("integrator {}", index)))
    }

    /// Integrator of the first system linked by `id`.
    pub(crate) fn interaction_integrator(&self, id: InteractionId) -> Result<OneStepIntegrator> {
        let ds = self
            .topology
            .interaction(id)?
            .linked_ds()
            .first()
            .copied()
            .ok_or_else(|| Error::MissingData(format!("{} links no dynamical system", id)))?;
        self.integrator_of(ds)
    }

    /// Integrators bound to at least one system.
    pub(crate) fn used_integrators(&self) -> Result<Vec<OneStepIntegrator>> {
        let mut used = Vec::new();
        for ds in self.topology.ds_ids() {
            let osi = self.integrator_of(ds)?;
            if !used.contains(&osi) {
                used.push(osi);
            }
        }
        Ok(used)
    }

    /// Number of change log entries not yet consumed.
    pub fn pending_changes(&self) -> usize {
        self.topology.change_log().len().saturating_sub(self.log_cursor)
    }

    /// Initialize systems and interactions added since the last call.
    /// Initialize what was added to the topology since the last call; returns
    /// the new interactions.
    pub(crate) fn process_change_log(&mut self) -> Result<Vec<InteractionId>> {
        let time = self.events.starting_time();
        let h = self.events.discretisation_step();
        let changes: Vec<Change> = self.topology.change_log().get(self.log_cursor..).unwrap_or(&[]).to_vec();
        for change in &changes {
            if let Change::DsAdded(id) = change {
                if self.topology.node(*id).is_err() {
                    continue;
                }
                let osi = self.integrator_of(*id)?;
                let steps = self.config.steps_in_memory;
                let node = self.topology.node_mut(*id)?;
                osi.initialize_ds(&mut node.ds, &mut node.workspace, time, h)?;
                if steps == 0 {
                    warn!(%id, "zero-length state memory requested");
                }
                node.ds.init_memory(steps);
                debug!(%id, kind = node.ds.kind(), integrator = osi.kind(), "dynamical system initialized");
            }
        }
        let mut added = Vec::new();
        for change in &changes {
            if let Change::InteractionAdded(id) = change {
                if self.topology.interaction(*id).is_err() {
                    continue;
                }
                let linked = self.topology.interaction(*id)?.linked_ds().to_vec();
                let mut levels = None;
                for ds in &linked {
                    let osi_levels = self.integrator_of(*ds)?.levels();
                    levels = Some(match levels {
                        None => osi_levels,
                        Some(l) => osi_levels.union(&l),
                    });
                }
                let levels = levels.ok_or_else(|| Error::MissingData(format!("{} links no dynamical system", id)))?;
                self.topology.ensure_index_sets(levels.number_of_index_sets());
                let Topology {
                    systems, interactions, ..
                } = &mut self.topology;
                let states: Vec<&DynamicalSystem> = linked
                    .iter()
                    .map(|ds| {
                        systems
                            .get(ds)
                            .map(|node| &node.ds)
                            .ok_or_else(|| Error::InvalidHandle(ds.to_string()))
                    })
                    .collect::<Result<_>>()?;
                let interaction = interactions
                    .get_mut(id)
                    .ok_or_else(|| Error::InvalidHandle(id.to_string()))?;
                interaction.initialize(*id, time, levels, &states)?;
                debug!(%id, law = interaction.nslaw().kind(), "interaction initialized");
                added.push(*id);
            }
        }
        self.log_cursor += changes.len();
        Ok(added)
    }

    /// Drop the consumed part of the topology change log.
    pub fn clear_change_log(&mut self) {
        self.topology.clear_change_log(self.log_cursor);
        self.log_cursor = 0;
    }

    /// Solve problem `id` and apply the non-convergence policy.
    pub(crate) fn compute_problem(&mut self, id: usize, time: f64) -> Result<i32> {
        let problem = self.problems.get_mut(&id).ok_or(Error::UnknownProblem(id))?;
        let info = problem.compute(&mut self.topology, time)?;
        if info != 0 {
            let report = problem.last_report();
            self.report.non_converged += 1;
            match self.config.non_convergence {
                NonConvergencePolicy::Warn => warn!(
                    problem = id,
                    time,
                    info,
                    iterations = report.iterations,
                    residual = report.residual,
                    "non-smooth problem did not converge"
                ),
                NonConvergencePolicy::Abort => {
                    return Err(Error::NonConvergence {
                        problem: id,
                        time,
                        info,
                        residual: report.residual,
                    })
                }
            }
        }
        Ok(info)
    }

    /// Reset input `level` of every system and scatter the λ of every interaction into it.
    pub(crate) fn update_input(&mut self, level: usize, time: f64) -> Result<()> {
        for ds in self.topology.ds_ids() {
            self.topology.ds_mut(ds)?.reset_non_smooth_part(level);
        }
        for id in self.topology.index_set(0) {
            let state = self.topology.linked_state(id)?;
            let input = self.topology.interaction_mut(id)?.compute_input(time, level, &state)?;
            self.topology.scatter_input(id, level, &input)?;
        }
        Ok(())
    }

    /// Recompute y at every level each interaction carries.
    pub(crate) fn update_outputs(&mut self, time: f64) -> Result<()> {
        for id in self.topology.index_set(0) {
            let levels = self.topology.interaction(id)?.levels();
            self.topology.update_output(id, time, levels.min_output, levels.max_output)?;
        }
        Ok(())
    }

    /// End-of-step bookkeeping: history, events, sensors and actuators.
    pub(crate) fn next_step(&mut self) -> Result<()> {
        for ds in self.topology.ds_ids() {
            self.topology.ds_mut(ds)?.swap_in_memory();
        }
        for id in self.topology.interaction_ids() {
            self.topology.interaction_mut(id)?.swap_in_memory();
        }
        let fired = self.events.process_events();
        for event in &fired {
            match event.kind {
                EventKind::Sensor(i) => {
                    if let Some(sensor) = self.sensors.get_mut(i) {
                        sensor.capture(event.time, &self.topology)?;
                    }
                }
                EventKind::Actuator(i) => {
                    if let Some(actuator) = self.actuators.get_mut(i) {
                        actuator.actuate(event.time, &mut self.topology)?;
                    }
                }
                EventKind::TimeDiscretisation | EventKind::NonSmooth => {}
            }
        }
        self.report.steps += 1;
        self.report.time = self.events.starting_time();
        debug!(time = self.report.time, events = fired.len(), "step done");
        Ok(())
    }
}

/// Common driver interface of [`TimeStepping`] and [`EventDriven`].
pub trait Simulation {
    fn core(&self) -> &SimulationCore;

    fn core_mut(&mut self) -> &mut SimulationCore;

    /// Check the model and initialize every system, interaction and problem.
    fn initialize(&mut self) -> Result<()>;

    /// Integrate from the current event to the next one.
    ///
    /// Returns the largest info code of the non-smooth solves of the step.
    fn compute_one_step(&mut self) -> Result<i32>;

    fn next_step(&mut self) -> Result<()> {
        self.core_mut().next_step()
    }

    fn has_next_event(&self) -> bool {
        self.core().events.has_next_event()
    }

    fn starting_time(&self) -> f64 {
        self.core().events.starting_time()
    }

    fn next_time(&self) -> f64 {
        self.core().events.next_time()
    }

    fn topology(&self) -> &Topology {
        &self.core().topology
    }

    fn topology_mut(&mut self) -> &mut Topology {
        &mut self.core_mut().topology
    }

    /// Run to the final time, initializing first if needed.
    fn run(&mut self) -> Result<RunReport> {
        if !self.core().initialized {
            self.initialize()?;
        }
        while self.has_next_event() {
            self.compute_one_step()?;
            self.next_step()?;
        }
        let report = self.core().report();
        info!(
            steps = report.steps,
            non_converged = report.non_converged,
            newton_failures = report.newton_failures,
            impacts = report.impacts,
            time = report.time,
            "simulation finished"
        );
        Ok(report)
    }
}
