//! Moreau–Jean time-stepping for Lagrangian systems.
//!
//! Velocity-level θ-method with impulses:
//!
//! ```text
//! M (v_{k+1} − v_k) = h[θ F_{k+1} + (1−θ) F_k] + p_{k+1}
//! q_{k+1} = q_k + h[θ v_{k+1} + (1−θ) v_k]
//! ```
//!
//! Newton form around the current velocity iterate v^α:
//!
//! ```text
//! W = M + hθ C + h²θ² K        C = −∂F/∂v, K = −∂F/∂q
//! v_free = v^α − W⁻¹ [M (v^α − v_k) − h(θ F(q^α, v^α) + (1−θ) F_k)]
//! v_{k+1} = v_free + W⁻¹ p_{k+1}
//! ```

use super::OsiWorkspace;
use crate::ds::{DynamicalSystem, MassMatrix};
use crate::error::{Error, Result};
use crate::linalg::Factorization;
use crate::types::Vector;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MoreauJean {
    pub theta: f64,
    /// Weight of the velocity in the activation prediction y + γ·h·ẏ.
    /// `None` uses 1/2.
    pub gamma: Option<f64>,
}

impl Default for MoreauJean {
    fn default() -> Self {
        Self { theta: 0.5, gamma: None }
    }
}

impl MoreauJean {
    pub fn new(theta: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&theta) {
            return Err(Error::InvalidConfiguration(format!("MoreauJean needs θ in [0, 1], got {}", theta)));
        }
        Ok(Self { theta, gamma: None })
    }

    pub fn with_gamma(mut self, gamma: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&gamma) {
            return Err(Error::InvalidConfiguration(format!("MoreauJean needs γ in [0, 1], got {}", gamma)));
        }
        self.gamma = Some(gamma);
        Ok(self)
    }

    pub(crate) fn prediction_weight(&self) -> f64 {
        self.gamma.unwrap_or(0.5)
    }

    fn positions(&self, q_k: &Vector, v_k: &Vector, v: &Vector, h: f64) -> Vector {
        q_k + (v * self.theta + v_k * (1.0 - self.theta)) * h
    }

    fn iteration_matrix(&self, ds: &mut DynamicalSystem, time: f64, q: &Vector, v: &Vector, h: f64) -> Result<Factorization> {
        let (dfdq, dfdv) = ds.lagrangian_forces_jacobians(time, q, v)?;
        let state = ds.require_lagrangian_mut()?;
        state.update_mass_factorization(time)?;
        let stiff = dfdq.iter().any(|v| *v != 0.0) || dfdv.iter().any(|v| *v != 0.0);
        match state.mass() {
            Some(MassMatrix::Sparse(m)) if !stiff => Factorization::sparse_cholesky(m),
            Some(mass) => {
                let w = mass.to_dense() - dfdv * (h * self.theta) - dfdq * (h * h * self.theta * self.theta);
                Factorization::lu(w)
            }
            None => Err(Error::MissingData("MoreauJean: mass matrix is not set".into())),
        }
    }

    pub(crate) fn initialize(&self, ds: &mut DynamicalSystem, ws: &mut OsiWorkspace, t0: f64, h: f64) -> Result<()> {
        if !ds.is_lagrangian() {
            return Err(Error::InvalidConfiguration(format!(
                "MoreauJean integrates Lagrangian systems, got a {} system",
                ds.kind()
            )));
        }
        ds.init_rhs(t0)?;
        let n = ds.coordinate_size();
        ws.free = Vector::zeros(n);
        ws.start = ds.x();
        ws.f_start = Vector::zeros(n);
        ws.scale = 1.0;
        if ds.is_linear_time_invariant() {
            let state = ds.require_lagrangian_mut()?;
            let (q, v) = (state.q().clone(), state.v().clone());
            ws.iteration_matrix = Some(self.iteration_matrix(ds, t0 + h, &q, &v, h)?);
            ws.frozen = true;
            ws.step = h;
        }
        Ok(())
    }

    pub(crate) fn begin_step(&self, ds: &mut DynamicalSystem, ws: &mut OsiWorkspace, t_k: f64) -> Result<()> {
        let state = ds.require_lagrangian_mut()?;
        let (q, v) = (state.q().clone(), state.v().clone());
        ws.f_start = ds.lagrangian_forces(t_k, &q, &v)?;
        ws.start = ds.x();
        Ok(())
    }

    fn split_start(ws: &OsiWorkspace) -> (Vector, Vector) {
        let n = ws.start.len() / 2;
        (ws.start.rows(0, n).into_owned(), ws.start.rows(n, n).into_owned())
    }

    pub(crate) fn compute_free_state(&self, ds: &mut DynamicalSystem, ws: &mut OsiWorkspace, t_k: f64, h: f64) -> Result<f64> {
        let t1 = t_k + h;
        let (q_k, v_k) = Self::split_start(ws);
        let v = ds.require_lagrangian_mut()?.v().clone();
        let q = self.positions(&q_k, &v_k, &v, h);

        if ws.is_stale(h) {
            ws.iteration_matrix = Some(self.iteration_matrix(ds, t1, &q, &v, h)?);
            ws.step = h;
        }
        let forces = ds.lagrangian_forces(t1, &q, &v)?;
        let state = ds.require_lagrangian_mut()?;
        state.update_mass_factorization(t1)?;
        let mass = state.mass_dense()?;

        let mut residu = &mass * (&v - &v_k) - (forces * self.theta + &ws.f_start * (1.0 - self.theta)) * h;
        let norm = residu.norm();
        ws.solve(&mut residu)?;
        ws.free = v - residu;
        ws.scale = 1.0;
        Ok(norm)
    }

    pub(crate) fn update_state(&self, ds: &mut DynamicalSystem, ws: &OsiWorkspace, h: f64) -> Result<()> {
        let (q_k, v_k) = Self::split_start(ws);
        let state = ds.require_lagrangian_mut()?;
        let mut dv = state.p(1).clone();
        ws.solve(&mut dv)?;
        let v = &ws.free + dv;
        let q = self.positions(&q_k, &v_k, &v, h);
        state.q.copy_from(&q);
        state.v.copy_from(&v);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds::LagrangianLinearTiDs;
    use crate::types::Matrix;
    use approx::assert_relative_eq;

    fn falling(q0: f64, v0: f64) -> DynamicalSystem {
        LagrangianLinearTiDs::new(Vector::from_element(1, q0), Vector::from_element(1, v0), MassMatrix::Dense(Matrix::identity(1, 1)))
            .unwrap()
            .with_f_ext(Vector::from_element(1, -10.0))
            .unwrap()
            .into()
    }

    #[test]
    fn test_free_flight_is_exact_for_constant_force() {
        let osi = MoreauJean::new(0.5).unwrap();
        let mut ds = falling(1.0, 0.0);
        let mut ws = OsiWorkspace::new();
        let h = 0.1;
        osi.initialize(&mut ds, &mut ws, 0.0, h).unwrap();
        osi.begin_step(&mut ds, &mut ws, 0.0).unwrap();
        osi.compute_free_state(&mut ds, &mut ws, 0.0, h).unwrap();
        assert_relative_eq!(ws.free[0], -1.0, epsilon = 1e-14);

        ds.reset_all_non_smooth_parts();
        osi.update_state(&mut ds, &ws, h).unwrap();
        let state = ds.lagrangian_state().unwrap();
        // q = q0 − g h²/2
        assert_relative_eq!(state.q()[0], 1.0 - 0.05, epsilon = 1e-14);
    }

    #[test]
    fn test_impulse_changes_velocity() {
        let osi = MoreauJean::new(1.0).unwrap();
        let mut ds = falling(0.0, -2.0);
        let mut ws = OsiWorkspace::new();
        osi.initialize(&mut ds, &mut ws, 0.0, 0.01).unwrap();
        osi.begin_step(&mut ds, &mut ws, 0.0).unwrap();
        osi.compute_free_state(&mut ds, &mut ws, 0.0, 0.01).unwrap();
        ds.input_mut(1)[0] = 2.1;
        osi.update_state(&mut ds, &ws, 0.01).unwrap();
        assert_relative_eq!(ds.lagrangian_state().unwrap().v()[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rejects_first_order_system() {
        use crate::ds::FirstOrderLinearDs;
        let osi = MoreauJean::default();
        let mut ds: DynamicalSystem =
            FirstOrderLinearDs::time_invariant(Vector::zeros(1), Matrix::zeros(1, 1), None).unwrap().into();
        let mut ws = OsiWorkspace::new();
        assert!(osi.initialize(&mut ds, &mut ws, 0.0, 0.1).is_err());
    }
}
