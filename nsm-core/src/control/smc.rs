//! Sliding-mode actuators.
//!
//! The implicit controllers keep a copy of the controlled model, stepped by
//! an internal [`TimeStepping`] at the actuation period. At each actuation
//! the internal state is reset to the measured state, one step is taken and
//! the set-valued part of the control is read back from the multiplier of
//! the internal interaction.
//!
//! ```text
//! LinearSmc:   σ = C·x,   u = u_eq + u_s,   u_s ∈ −α·sgn(σ_{k+1})   (relay)
//! Twisting:    u = G(λ₀ + βλ₁),  λ in a polyhedron                    (AVI)
//! ```

use super::Actuator;
use crate::ds::FirstOrderLinearDs;
use crate::error::{Error, Result};
use crate::interaction::Interaction;
use crate::linalg::Factorization;
use crate::nslaw::NonSmoothLaw;
use crate::numerics::{SolverId, SolverOptions};
use crate::osi::EulerMoreau;
use crate::osnsp::{OneStepNSProblem, ProblemKind};
use crate::relation::FirstOrderLinearR;
use crate::simulation::{Simulation, TimeStepping};
use crate::topology::Topology;
use crate::types::{DsId, InteractionId, Matrix, Vector};
use std::any::Any;
use tracing::{debug, warn};

/// Copy of the controlled model with its control interaction.
#[derive(Debug)]
struct InternalModel {
    simulation: TimeStepping,
    ds: DsId,
    control: InteractionId,
}

impl InternalModel {
    #[allow(clippy::too_many_arguments)]
    fn build(
        system: FirstOrderLinearDs,
        relation: FirstOrderLinearR,
        law: NonSmoothLaw,
        problem: OneStepNSProblem,
        theta: f64,
        t0: f64,
        t_final: f64,
        period: f64,
    ) -> Result<Self> {
        let mut topology = Topology::new();
        let ds = topology.insert_dynamical_system(system);
        let control = topology.link(Interaction::new(relation, law)?, ds, None)?;
        // one spare step so the last actuation at t_final still has a step to take
        let mut simulation = TimeStepping::new(topology, t0, t_final + period, period)?;
        simulation.insert_integrator(EulerMoreau::new(theta)?, &[ds])?;
        simulation.insert_problem(problem);
        simulation.initialize()?;
        Ok(Self {
            simulation,
            ds,
            control,
        })
    }

    /// Step from `x`; returns the multiplier of the control interaction.
    fn step(&mut self, x: &Vector) -> Result<Vector> {
        if !self.simulation.has_next_event() {
            return Err(Error::InvalidConfiguration(
                "internal controller model stepped past its final time".into(),
            ));
        }
        self.simulation.topology_mut().ds_mut(self.ds)?.set_x(x)?;
        let info = self.simulation.compute_one_step()?;
        self.simulation.next_step()?;
        if info != 0 {
            warn!(time = self.simulation.starting_time(), info, "controller problem did not converge");
        }
        Ok(self.simulation.topology().interaction(self.control)?.lambda(0).clone())
    }

    fn set_b(&mut self, b: Vector) -> Result<()> {
        self.simulation.topology_mut().ds_mut(self.ds)?.set_b(b)
    }

    fn topology(&self) -> &Topology {
        self.simulation.topology()
    }
}

fn measured_state(topology: &Topology, ds: DsId, n: usize) -> Result<Vector> {
    let x = topology.ds(ds)?.x();
    if x.len() != n {
        return Err(Error::size(format!("controlled state of {}", ds), n, x.len()));
    }
    Ok(x)
}

/// Implicit linear sliding-mode control of ẋ = A·x + B·u with surface σ = C·x.
///
/// The equivalent control u_eq keeps σ constant over a step of the θ-method;
/// the discontinuous part u_s is the multiplier of a relay of bounds ±α on
/// an internal copy of the model, which brings σ to zero in finite time.
#[derive(Debug)]
pub struct LinearSmc {
    measured: DsId,
    target: DsId,
    a: Matrix,
    b: Matrix,
    c: Matrix,
    saturation: Option<Matrix>,
    alpha: f64,
    theta: f64,
    precision: f64,
    equivalent_control: bool,
    gain: Option<Matrix>,
    model: Option<InternalModel>,
    ueq: Vector,
    us: Vector,
    actions: usize,
}

impl LinearSmc {
    /// Control from the state of `measured` into the parameters z of `target`.
    pub fn new(measured: DsId, target: DsId, a: Matrix, b: Matrix, c: Matrix) -> Result<Self> {
        let n = a.nrows();
        if a.ncols() != n {
            return Err(Error::size("sliding-mode control: A columns", n, a.ncols()));
        }
        if b.nrows() != n {
            return Err(Error::size("sliding-mode control: B rows", n, b.nrows()));
        }
        if c.ncols() != n {
            return Err(Error::size("sliding-mode control: C columns", n, c.ncols()));
        }
        if c.nrows() != b.ncols() {
            return Err(Error::size("sliding-mode control: surface dimension", b.ncols(), c.nrows()));
        }
        let m = c.nrows();
        Ok(Self {
            measured,
            target,
            a,
            b,
            c,
            saturation: None,
            alpha: 1.0,
            theta: 0.5,
            precision: 1e-8,
            equivalent_control: true,
            gain: None,
            model: None,
            ueq: Vector::zeros(m),
            us: Vector::zeros(m),
            actions: 0,
        })
    }

    /// Amplitude α of the discontinuous control.
    pub fn with_alpha(mut self, alpha: f64) -> Result<Self> {
        if alpha.is_nan() || alpha <= 0.0 {
            return Err(Error::InvalidConfiguration(format!("sliding-mode amplitude must be positive, got {}", alpha)));
        }
        self.alpha = alpha;
        Ok(self)
    }

    pub fn with_theta(mut self, theta: f64) -> Result<Self> {
        EulerMoreau::new(theta)?;
        self.theta = theta;
        Ok(self)
    }

    /// Feedthrough D of the relay, y = C·x + D·λ.
    pub fn with_saturation(mut self, d: Matrix) -> Result<Self> {
        let m = self.c.nrows();
        if d.nrows() != m || d.ncols() != m {
            return Err(Error::size("sliding-mode control: D", m, d.nrows().max(d.ncols())));
        }
        self.saturation = Some(d);
        Ok(self)
    }

    /// Tolerance of the relay solver.
    pub fn with_precision(mut self, precision: f64) -> Self {
        self.precision = precision;
        self
    }

    /// Drop u_eq; only the relay part is applied.
    pub fn without_equivalent_control(mut self) -> Self {
        self.equivalent_control = false;
        self
    }

    pub fn ueq(&self) -> &Vector {
        &self.ueq
    }

    pub fn us(&self) -> &Vector {
        &self.us
    }

    /// u = u_eq + u_s, as last written into the target.
    pub fn u(&self) -> Vector {
        &self.ueq + &self.us
    }

    pub fn actions(&self) -> usize {
        self.actions
    }

    /// σ = C·x for a state of the controlled system.
    pub fn surface(&self, x: &Vector) -> Vector {
        &self.c * x
    }

    /// −(C W⁻¹ B)⁻¹ C W⁻¹ A with W = I − hθA.
    fn equivalent_gain(&self, h: f64) -> Result<Matrix> {
        let n = self.a.nrows();
        let w = Factorization::lu(Matrix::identity(n, n) - &self.a * (h * self.theta))?;
        let mut w_a = self.a.clone();
        w.solve_matrix_in_place(&mut w_a)?;
        let mut w_b = self.b.clone();
        w.solve_matrix_in_place(&mut w_b)?;
        let mut gain = &self.c * w_a;
        Factorization::lu(&self.c * w_b)?.solve_matrix_in_place(&mut gain)?;
        Ok(-gain)
    }
}

impl Actuator for LinearSmc {
    fn initialize(&mut self, t0: f64, t_final: f64, period: f64, topology: &Topology) -> Result<()> {
        let n = self.a.nrows();
        let m = self.c.nrows();
        let x0 = measured_state(topology, self.measured, n)?;
        let system = FirstOrderLinearDs::time_invariant(x0, self.a.clone(), Some(Vector::zeros(n)))?;
        let mut relation = FirstOrderLinearR::new(self.c.clone(), self.b.clone())?;
        if let Some(d) = &self.saturation {
            relation = relation.with_d(d.clone())?;
        }
        let law = NonSmoothLaw::relay(Vector::from_element(m, -self.alpha), Vector::from_element(m, self.alpha))?;
        let problem = OneStepNSProblem::new(
            ProblemKind::Relay,
            SolverOptions::new(SolverId::RelayPgs).with_tolerance(self.precision),
        )?;
        self.gain = if self.equivalent_control {
            Some(self.equivalent_gain(period)?)
        } else {
            None
        };
        self.model = Some(InternalModel::build(system, relation, law, problem, self.theta, t0, t_final, period)?);
        debug!(states = n, surfaces = m, alpha = self.alpha, period, "sliding-mode controller initialized");
        Ok(())
    }

    fn actuate(&mut self, time: f64, topology: &mut Topology) -> Result<()> {
        let x = measured_state(topology, self.measured, self.a.nrows())?;
        let model = self
            .model
            .as_mut()
            .ok_or_else(|| Error::InvalidConfiguration("sliding-mode controller is not initialized".into()))?;
        if let Some(gain) = &self.gain {
            self.ueq = gain * &x;
            model.set_b(&self.b * &self.ueq)?;
        }
        self.us = model.step(&x)?;
        let u = &self.ueq + &self.us;
        let sigma = &self.c * &x;
        debug!(time, sigma = ?sigma.as_slice(), u = ?u.as_slice(), "sliding-mode control");
        topology.ds_mut(self.target)?.set_z(u);
        self.actions += 1;
        Ok(())
    }

    fn internal_topology(&self) -> Option<&Topology> {
        self.model.as_ref().map(InternalModel::topology)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn double_integrator() -> Matrix {
    Matrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0])
}

fn check_twisting_gains(gain: f64, beta: f64) -> Result<()> {
    if gain.is_nan() || gain <= 0.0 || !(0.0..1.0).contains(&beta) {
        return Err(Error::InvalidConfiguration(format!(
            "twisting needs G > 0 and β in [0, 1), got G = {}, β = {}",
            gain, beta
        )));
    }
    Ok(())
}

/// Implicit twisting control of a double integrator ẍ = u.
///
/// The control u = G(λ₀ + βλ₁) is taken from the solution of an AVI over
/// the polyhedron {λ : H·λ ≥ −1} with facets (1, 0), (−h/2, 1), (−1, 0)
/// and (h/2, −1), h being the actuation period.
#[derive(Debug)]
pub struct Twisting {
    measured: DsId,
    target: DsId,
    gain: f64,
    beta: f64,
    model: Option<InternalModel>,
    u: f64,
    actions: usize,
}

impl Twisting {
    pub fn new(measured: DsId, target: DsId, gain: f64, beta: f64) -> Result<Self> {
        check_twisting_gains(gain, beta)?;
        Ok(Self {
            measured,
            target,
            gain,
            beta,
            model: None,
            u: 0.0,
            actions: 0,
        })
    }

    pub fn u(&self) -> f64 {
        self.u
    }

    pub fn actions(&self) -> usize {
        self.actions
    }
}

impl Actuator for Twisting {
    fn initialize(&mut self, t0: f64, t_final: f64, period: f64, topology: &Topology) -> Result<()> {
        let x0 = measured_state(topology, self.measured, 2)?;
        let system = FirstOrderLinearDs::time_invariant(x0, double_integrator(), None)?;
        let b = Matrix::from_row_slice(2, 2, &[0.0, 0.0, self.gain, self.gain * self.beta]);
        let relation = FirstOrderLinearR::new(Matrix::identity(2, 2), b)?;
        let half = period / 2.0;
        let facets = Matrix::from_row_slice(4, 2, &[1.0, 0.0, -half, 1.0, -1.0, 0.0, half, -1.0]);
        let law = NonSmoothLaw::normal_cone(facets, Vector::from_element(4, -1.0))?;
        self.model = Some(InternalModel::build(system, relation, law, OneStepNSProblem::avi()?, 0.5, t0, t_final, period)?);
        Ok(())
    }

    fn actuate(&mut self, time: f64, topology: &mut Topology) -> Result<()> {
        let x = measured_state(topology, self.measured, 2)?;
        let model = self
            .model
            .as_mut()
            .ok_or_else(|| Error::InvalidConfiguration("twisting controller is not initialized".into()))?;
        let lambda = model.step(&x)?;
        self.u = self.gain * (lambda[0] + self.beta * lambda[1]);
        debug!(time, u = self.u, "twisting control");
        topology.ds_mut(self.target)?.set_z(Vector::from_element(1, self.u));
        self.actions += 1;
        Ok(())
    }

    fn internal_topology(&self) -> Option<&Topology> {
        self.model.as_ref().map(InternalModel::topology)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Explicit twisting: u = −G(sgn(x₀) + β·sgn(x₁)), with sgn(0) = 0.
#[derive(Debug, Clone)]
pub struct ExplicitTwisting {
    measured: DsId,
    target: DsId,
    gain: f64,
    beta: f64,
    u: f64,
    actions: usize,
}

impl ExplicitTwisting {
    pub fn new(measured: DsId, target: DsId, gain: f64, beta: f64) -> Result<Self> {
        check_twisting_gains(gain, beta)?;
        Ok(Self {
            measured,
            target,
            gain,
            beta,
            u: 0.0,
            actions: 0,
        })
    }

    pub fn control(&self, x: &Vector) -> f64 {
        -self.gain * (sign(x[0]) + self.beta * sign(x[1]))
    }

    pub fn u(&self) -> f64 {
        self.u
    }

    pub fn actions(&self) -> usize {
        self.actions
    }
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl Actuator for ExplicitTwisting {
    fn actuate(&mut self, _time: f64, topology: &mut Topology) -> Result<()> {
        let x = measured_state(topology, self.measured, 2)?;
        self.u = self.control(&x);
        topology.ds_mut(self.target)?.set_z(Vector::from_element(1, self.u));
        self.actions += 1;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
