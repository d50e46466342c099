//! NSM Core - non-smooth mechanics
//!
//! Simulation of dynamical systems subject to unilateral constraints,
//! impacts, friction and set-valued laws:
//! - Algebraic solvers for LCP, MLCP, relay, AVI, MCP and friction-contact problems
//! - First-order and Lagrangian dynamical systems, linear and plugged relations
//! - Event-capturing time stepping (Euler–Moreau, Moreau–Jean) and
//!   event-driven integration (RK4 with impact and acceleration LCPs)
//! - Dense or sparse assembly of the one-step non-smooth problems
//!
//! # Architecture
//!
//! ```text
//! Topology  ── dynamical systems, interactions (relation + non-smooth law), index sets
//!    │
//! Simulation ── TimeStepping | EventDriven
//!    ├── OneStepIntegrator   free state, state update
//!    ├── OneStepNSProblem    assembly + numerics solver + λ/y write-back
//!    └── EventsManager       time grid, non-smooth events, sensors and actuators
//! ```
//!
//! - [`DynamicalSystem`]: closed set of system formulations
//! - [`Interaction`]: a [`Relation`] and a [`NonSmoothLaw`] linking one or two systems
//! - [`Simulation`]: the driver trait, with [`Simulation::run`] to the final time

pub mod batch;
pub mod config;
pub mod control;
pub mod ds;
pub mod error;
pub mod events;
pub mod interaction;
pub mod io;
pub mod linalg;
pub mod memory;
pub mod nslaw;
pub mod numerics;
pub mod osi;
pub mod osnsp;
pub mod plugin;
pub mod relation;
pub mod simulation;
pub mod sparse;
pub mod topology;
pub mod types;

pub use config::{BoundaryPolicy, NonConvergencePolicy, SimulationConfig};
pub use ds::DynamicalSystem;
pub use error::{Error, Result};
pub use interaction::Interaction;
pub use nslaw::NonSmoothLaw;
pub use numerics::{SolverId, SolverOptions};
pub use osi::OneStepIntegrator;
pub use osnsp::{OneStepNSProblem, ProblemKind};
pub use plugin::PluginRegistry;
pub use relation::Relation;
pub use simulation::{EventDriven, RunReport, Simulation, TimeStepping};
pub use topology::Topology;
pub use types::{DsId, InteractionId, Matrix, Vector};
