//! Dynamical systems.
//!
//! Every system has a state x, a right-hand side ẋ = rhs(x, t, z) + r, free
//! parameters z and, when used by an integrator, a bounded memory of past
//! states. The closed set of supported formulations is [`DynamicalSystem`]:
//!
//! | Variant                  | Equation                              |
//! |--------------------------|---------------------------------------|
//! | `FirstOrderLinear`       | ẋ = A(t)·x + b(t) + r                 |
//! | `FirstOrderNonLinear`    | ẋ = f(t, x, z) + r                    |
//! | `Lagrangian`             | M(q)·q̈ = f_ext − f_int − f_gyr + p    |
//! | `LagrangianLinearTi`     | M·q̈ + C·q̇ + K·q = f_ext(t) + p        |
//!
//! Relations see first-order systems through x and Lagrangian systems
//! through q (positions) and v (velocities).

pub mod first_order;
pub mod lagrangian;

pub use first_order::{FirstOrderLinearDs, FirstOrderNonLinearDs, FirstOrderState};
pub use lagrangian::{LagrangianDs, LagrangianLinearTiDs, LagrangianPlugins, LagrangianState, MassMatrix};

use crate::error::{Error, Result};
use crate::types::{all_finite, Matrix, Vector};
use std::fmt;

/// A dynamical system of one of the supported formulations.
pub enum DynamicalSystem {
    FirstOrderLinear(FirstOrderLinearDs),
    FirstOrderNonLinear(FirstOrderNonLinearDs),
    Lagrangian(LagrangianDs),
    LagrangianLinearTi(LagrangianLinearTiDs),
}

impl From<FirstOrderLinearDs> for DynamicalSystem {
    fn from(ds: FirstOrderLinearDs) -> Self {
        DynamicalSystem::FirstOrderLinear(ds)
    }
}

impl From<FirstOrderNonLinearDs> for DynamicalSystem {
    fn from(ds: FirstOrderNonLinearDs) -> Self {
        DynamicalSystem::FirstOrderNonLinear(ds)
    }
}

impl From<LagrangianDs> for DynamicalSystem {
    fn from(ds: LagrangianDs) -> Self {
        DynamicalSystem::Lagrangian(ds)
    }
}

impl From<LagrangianLinearTiDs> for DynamicalSystem {
    fn from(ds: LagrangianLinearTiDs) -> Self {
        DynamicalSystem::LagrangianLinearTi(ds)
    }
}

impl fmt::Debug for DynamicalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicalSystem")
            .field("kind", &self.kind())
            .field("dimension", &self.dimension())
            .finish()
    }
}

impl DynamicalSystem {
    /// Short name of the formulation.
    pub fn kind(&self) -> &'static str {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) if ds.is_time_invariant() => "FirstOrderLinearTI",
            DynamicalSystem::FirstOrderLinear(_) => "FirstOrderLinear",
            DynamicalSystem::FirstOrderNonLinear(_) => "FirstOrderNonLinear",
            DynamicalSystem::Lagrangian(_) => "Lagrangian",
            DynamicalSystem::LagrangianLinearTi(_) => "LagrangianLinearTI",
        }
    }

    pub fn is_lagrangian(&self) -> bool {
        matches!(self, DynamicalSystem::Lagrangian(_) | DynamicalSystem::LagrangianLinearTi(_))
    }

    /// True when the dynamics and iteration matrices never change.
    pub fn is_linear_time_invariant(&self) -> bool {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => ds.is_time_invariant(),
            DynamicalSystem::LagrangianLinearTi(ds) => ds.state.has_constant_mass(),
            _ => false,
        }
    }

    /// Size of the state x.
    pub fn dimension(&self) -> usize {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => ds.state.n,
            DynamicalSystem::FirstOrderNonLinear(ds) => ds.state.n,
            DynamicalSystem::Lagrangian(ds) => 2 * ds.state.ndof,
            DynamicalSystem::LagrangianLinearTi(ds) => 2 * ds.state.ndof,
        }
    }

    /// Size of the coordinates seen by relations: n for first-order
    /// systems, the number of degrees of freedom for Lagrangian ones.
    pub fn coordinate_size(&self) -> usize {
        match self.lagrangian_state() {
            Some(state) => state.ndof,
            None => self.dimension(),
        }
    }

    pub fn first_order_state(&self) -> Option<&FirstOrderState> {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => Some(&ds.state),
            DynamicalSystem::FirstOrderNonLinear(ds) => Some(&ds.state),
            _ => None,
        }
    }

    pub(crate) fn first_order_state_mut(&mut self) -> Option<&mut FirstOrderState> {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => Some(&mut ds.state),
            DynamicalSystem::FirstOrderNonLinear(ds) => Some(&mut ds.state),
            _ => None,
        }
    }

    pub fn lagrangian_state(&self) -> Option<&LagrangianState> {
        match self {
            DynamicalSystem::Lagrangian(ds) => Some(&ds.state),
            DynamicalSystem::LagrangianLinearTi(ds) => Some(&ds.state),
            _ => None,
        }
    }

    pub(crate) fn lagrangian_state_mut(&mut self) -> Option<&mut LagrangianState> {
        match self {
            DynamicalSystem::Lagrangian(ds) => Some(&mut ds.state),
            DynamicalSystem::LagrangianLinearTi(ds) => Some(&mut ds.state),
            _ => None,
        }
    }

    pub(crate) fn require_lagrangian_mut(&mut self) -> Result<&mut LagrangianState> {
        let kind = self.kind();
        self.lagrangian_state_mut()
            .ok_or_else(|| Error::InvalidConfiguration(format!("{} system where a Lagrangian system is required", kind)))
    }

    /// Current state x (x = [q; v] for Lagrangian systems).
    pub fn x(&self) -> Vector {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => ds.state.x.clone(),
            DynamicalSystem::FirstOrderNonLinear(ds) => ds.state.x.clone(),
            DynamicalSystem::Lagrangian(ds) => ds.state.x(),
            DynamicalSystem::LagrangianLinearTi(ds) => ds.state.x(),
        }
    }

    pub fn set_x(&mut self, x: &Vector) -> Result<()> {
        if x.len() != self.dimension() {
            return Err(Error::size("dynamical system state", self.dimension(), x.len()));
        }
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => ds.state.x.copy_from(x),
            DynamicalSystem::FirstOrderNonLinear(ds) => ds.state.x.copy_from(x),
            DynamicalSystem::Lagrangian(ds) => ds.state.set_x(x),
            DynamicalSystem::LagrangianLinearTi(ds) => ds.state.set_x(x),
        }
        Ok(())
    }

    /// Initial state, if known.
    pub fn x0(&self) -> Option<Vector> {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => ds.state.x0.clone(),
            DynamicalSystem::FirstOrderNonLinear(ds) => ds.state.x0.clone(),
            _ => {
                let state = self.lagrangian_state()?;
                let (q0, v0) = (state.q0.as_ref()?, state.v0.as_ref()?);
                let n = state.ndof;
                let mut x0 = Vector::zeros(2 * n);
                x0.rows_mut(0, n).copy_from(q0);
                x0.rows_mut(n, n).copy_from(v0);
                Some(x0)
            }
        }
    }

    /// Set the initial state and the current state to `x0`.
    pub fn set_x0(&mut self, x0: Vector) -> Result<()> {
        self.set_x(&x0)?;
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => ds.state.x0 = Some(x0),
            DynamicalSystem::FirstOrderNonLinear(ds) => ds.state.x0 = Some(x0),
            DynamicalSystem::Lagrangian(_) | DynamicalSystem::LagrangianLinearTi(_) => {
                if let Some(state) = self.lagrangian_state_mut() {
                    let n = state.ndof;
                    state.q0 = Some(x0.rows(0, n).into_owned());
                    state.v0 = Some(x0.rows(n, n).into_owned());
                }
            }
        }
        Ok(())
    }

    /// Constant term b of a first-order linear system.
    pub fn set_b(&mut self, b: Vector) -> Result<()> {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => ds.set_b(b),
            _ => Err(Error::InvalidConfiguration(format!("{} system has no b term", self.kind()))),
        }
    }

    pub fn z(&self) -> &Vector {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => &ds.state.z,
            DynamicalSystem::FirstOrderNonLinear(ds) => &ds.state.z,
            DynamicalSystem::Lagrangian(ds) => &ds.state.z,
            DynamicalSystem::LagrangianLinearTi(ds) => &ds.state.z,
        }
    }

    /// Replace the free parameters z (written by actuators).
    pub fn set_z(&mut self, z: Vector) {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => ds.state.z = z,
            DynamicalSystem::FirstOrderNonLinear(ds) => ds.state.z = z,
            DynamicalSystem::Lagrangian(ds) => ds.state.z = z,
            DynamicalSystem::LagrangianLinearTi(ds) => ds.state.z = z,
        }
    }

    /// Non-smooth input: r for first-order systems, p[level] for Lagrangian ones.
    pub fn input(&self, level: usize) -> &Vector {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => &ds.state.r,
            DynamicalSystem::FirstOrderNonLinear(ds) => &ds.state.r,
            DynamicalSystem::Lagrangian(ds) => &ds.state.p[level],
            DynamicalSystem::LagrangianLinearTi(ds) => &ds.state.p[level],
        }
    }

    pub(crate) fn input_mut(&mut self, level: usize) -> &mut Vector {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => &mut ds.state.r,
            DynamicalSystem::FirstOrderNonLinear(ds) => &mut ds.state.r,
            DynamicalSystem::Lagrangian(ds) => &mut ds.state.p[level],
            DynamicalSystem::LagrangianLinearTi(ds) => &mut ds.state.p[level],
        }
    }

    /// Allocate the right-hand side and its Jacobian and evaluate them once.
    ///
    /// Calling it again only re-evaluates. For Lagrangian systems this is
    /// where a missing or indefinite mass matrix is reported.
    pub fn init_rhs(&mut self, time: f64) -> Result<()> {
        if let Some(state) = self.lagrangian_state_mut() {
            state.update_mass_factorization(time)?;
        }
        self.compute_rhs(time)?;
        self.compute_jacobian_rhs_x(time)
    }

    /// Evaluate ẋ at the current state and time.
    pub fn compute_rhs(&mut self, time: f64) -> Result<()> {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => {
                let x = ds.state.x.clone();
                let f = ds.f(time, &x);
                ds.state.rhs = f + &ds.state.r;
            }
            DynamicalSystem::FirstOrderNonLinear(ds) => {
                let f = ds.f(time, &ds.state.x);
                ds.state.rhs = f + &ds.state.r;
            }
            DynamicalSystem::Lagrangian(ds) => {
                ds.state.forces = ds.forces(time, &ds.state.q, &ds.state.v);
                lagrangian_acceleration(&mut ds.state, time)?;
            }
            DynamicalSystem::LagrangianLinearTi(ds) => {
                ds.state.forces = ds.forces(time, &ds.state.q, &ds.state.v);
                lagrangian_acceleration(&mut ds.state, time)?;
            }
        }
        if !all_finite(&self.rhs()) {
            return Err(Error::NonFinite(format!("{} system right-hand side at t = {}", self.kind(), time)));
        }
        Ok(())
    }

    /// Last evaluated right-hand side ([v; q̈] for Lagrangian systems).
    pub fn rhs(&self) -> Vector {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => ds.state.rhs.clone(),
            DynamicalSystem::FirstOrderNonLinear(ds) => ds.state.rhs.clone(),
            _ => match self.lagrangian_state() {
                Some(state) => {
                    let n = state.ndof;
                    let mut rhs = Vector::zeros(2 * n);
                    rhs.rows_mut(0, n).copy_from(&state.v);
                    rhs.rows_mut(n, n).copy_from(&state.acceleration);
                    rhs
                }
                None => Vector::zeros(0),
            },
        }
    }

    /// Evaluate ∇ₓ rhs at the current state and time.
    pub fn compute_jacobian_rhs_x(&mut self, time: f64) -> Result<()> {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => {
                ds.update_plugins(time);
                ds.state.jacobian_rhs_x = Some(ds.a());
            }
            DynamicalSystem::FirstOrderNonLinear(ds) => {
                ds.state.jacobian_rhs_x = Some(ds.jacobian_f(time, &ds.state.x));
            }
            DynamicalSystem::Lagrangian(ds) => {
                let (dq, dv) = ds.forces_jacobians(time, &ds.state.q, &ds.state.v);
                ds.state.assemble_jacobian_rhs_x(dq, dv)?;
            }
            DynamicalSystem::LagrangianLinearTi(ds) => {
                let (dq, dv) = ds.forces_jacobians();
                ds.state.assemble_jacobian_rhs_x(dq, dv)?;
            }
        }
        Ok(())
    }

    pub fn jacobian_rhs_x(&self) -> Option<&Matrix> {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => ds.state.jacobian_rhs_x.as_ref(),
            DynamicalSystem::FirstOrderNonLinear(ds) => ds.state.jacobian_rhs_x.as_ref(),
            DynamicalSystem::Lagrangian(ds) => ds.state.jacobian_rhs_x.as_ref(),
            DynamicalSystem::LagrangianLinearTi(ds) => ds.state.jacobian_rhs_x.as_ref(),
        }
    }

    /// f(t, x) without non-smooth input, for first-order systems.
    pub(crate) fn first_order_f(&mut self, time: f64, x: &Vector) -> Result<Vector> {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => Ok(ds.f(time, x)),
            DynamicalSystem::FirstOrderNonLinear(ds) => Ok(ds.f(time, x)),
            _ => Err(Error::InvalidConfiguration(format!("{} system has no first-order vector field", self.kind()))),
        }
    }

    /// ∇ₓf(t, x), for first-order systems.
    pub(crate) fn first_order_jacobian(&mut self, time: f64, x: &Vector) -> Result<Matrix> {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => {
                ds.update_plugins(time);
                Ok(ds.a())
            }
            DynamicalSystem::FirstOrderNonLinear(ds) => Ok(ds.jacobian_f(time, x)),
            _ => Err(Error::InvalidConfiguration(format!("{} system has no first-order vector field", self.kind()))),
        }
    }

    /// F(t, q, v), for Lagrangian systems.
    pub(crate) fn lagrangian_forces(&self, time: f64, q: &Vector, v: &Vector) -> Result<Vector> {
        match self {
            DynamicalSystem::Lagrangian(ds) => Ok(ds.forces(time, q, v)),
            DynamicalSystem::LagrangianLinearTi(ds) => Ok(ds.forces(time, q, v)),
            _ => Err(Error::InvalidConfiguration(format!("{} system has no Lagrangian forces", self.kind()))),
        }
    }

    /// (∂F/∂q, ∂F/∂v), for Lagrangian systems.
    pub(crate) fn lagrangian_forces_jacobians(&self, time: f64, q: &Vector, v: &Vector) -> Result<(Matrix, Matrix)> {
        match self {
            DynamicalSystem::Lagrangian(ds) => Ok(ds.forces_jacobians(time, q, v)),
            DynamicalSystem::LagrangianLinearTi(ds) => Ok(ds.forces_jacobians()),
            _ => Err(Error::InvalidConfiguration(format!("{} system has no Lagrangian forces", self.kind()))),
        }
    }

    /// Zero every non-smooth input level.
    pub fn reset_all_non_smooth_parts(&mut self) {
        match self.lagrangian_state_mut() {
            Some(state) => state.p.iter_mut().for_each(|p| p.fill(0.0)),
            None => {
                if let Some(state) = self.first_order_state_mut() {
                    state.r.fill(0.0);
                }
            }
        }
    }

    /// Zero the non-smooth input at `level` (first-order systems have a single level).
    pub fn reset_non_smooth_part(&mut self, level: usize) {
        match self.lagrangian_state_mut() {
            Some(state) => {
                if let Some(p) = state.p.get_mut(level) {
                    p.fill(0.0);
                }
            }
            None => {
                if let Some(state) = self.first_order_state_mut() {
                    state.r.fill(0.0);
                }
            }
        }
    }

    /// Size the state memories to `steps` entries.
    pub fn init_memory(&mut self, steps: usize) {
        match self.lagrangian_state_mut() {
            Some(state) => state.init_memory(steps),
            None => {
                if let Some(state) = self.first_order_state_mut() {
                    state.init_memory(steps);
                }
            }
        }
    }

    /// Push the current state into memory.
    pub fn swap_in_memory(&mut self) {
        match self.lagrangian_state_mut() {
            Some(state) => state.swap_in_memory(),
            None => {
                if let Some(state) = self.first_order_state_mut() {
                    state.swap_in_memory();
                }
            }
        }
    }

    /// State `k` steps back (0 = end of the previous step).
    pub fn x_memory(&self, k: usize) -> Option<&Vector> {
        match self {
            DynamicalSystem::FirstOrderLinear(ds) => ds.state.x_memory.get(k),
            DynamicalSystem::FirstOrderNonLinear(ds) => ds.state.x_memory.get(k),
            DynamicalSystem::Lagrangian(ds) => ds.state.x_memory.get(k),
            DynamicalSystem::LagrangianLinearTi(ds) => ds.state.x_memory.get(k),
        }
    }

    /// Restore x from x0. Fails when x0 was never set.
    pub fn reset_to_initial_state(&mut self) -> Result<()> {
        match self.lagrangian_state_mut() {
            Some(state) => state.reset_to_initial_state(),
            None => match self.first_order_state_mut() {
                Some(state) => state.reset_to_initial_state(),
                None => Ok(()),
            },
        }
    }

    /// v⁺ = v⁻ + M⁻¹·p[1], for Lagrangian systems.
    pub fn compute_post_impact_velocity(&mut self, time: f64) -> Result<()> {
        self.require_lagrangian_mut()?.compute_post_impact_velocity(time)
    }
}

/// q̈ = M⁻¹(F + p[2])
fn lagrangian_acceleration(state: &mut LagrangianState, time: f64) -> Result<()> {
    state.update_mass_factorization(time)?;
    let mut acc = &state.forces + &state.p[2];
    state.solve_mass(&mut acc)?;
    state.acceleration = acc;
    Ok(())
}
