//! θ-method for first-order systems.
//!
//! ```text
//! x_{k+1} = x_k + h[θ f(t_{k+1}, x_{k+1}) + (1−θ) f(t_k, x_k)] + h[γ r_{k+1} + (1−γ) r_k]
//! ```
//!
//! Written in Newton form around the current iterate x^α:
//!
//! ```text
//! W = I − hθ ∇ₓf(t_{k+1}, x^α)
//! R_free = x^α − x_k − h[θ f(t_{k+1}, x^α) + (1−θ) f_k] − h(1−γ) r_k
//! x_free = x^α − W⁻¹ R_free,   x_{k+1} = x_free + hγ W⁻¹ r_{k+1}
//! ```
//!
//! For linear time-invariant systems W is factorized once, at initialization.

use super::OsiWorkspace;
use crate::ds::DynamicalSystem;
use crate::error::{Error, Result};
use crate::linalg::Factorization;
use crate::types::{Matrix, Vector};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EulerMoreau {
    pub theta: f64,
    pub gamma: f64,
}

impl Default for EulerMoreau {
    fn default() -> Self {
        Self { theta: 0.5, gamma: 1.0 }
    }
}

impl EulerMoreau {
    pub fn new(theta: f64) -> Result<Self> {
        Self::with_gamma(theta, 1.0)
    }

    pub fn with_gamma(theta: f64, gamma: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&theta) || !(0.0..=1.0).contains(&gamma) || gamma == 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "EulerMoreau needs θ in [0, 1] and γ in (0, 1], got θ = {}, γ = {}",
                theta, gamma
            )));
        }
        Ok(Self { theta, gamma })
    }

    fn iteration_matrix(&self, ds: &mut DynamicalSystem, time: f64, x: &Vector, h: f64) -> Result<Factorization> {
        let n = x.len();
        let jac = ds.first_order_jacobian(time, x)?;
        let w = Matrix::identity(n, n) - jac * (h * self.theta);
        Factorization::lu(w)
    }

    pub(crate) fn initialize(&self, ds: &mut DynamicalSystem, ws: &mut OsiWorkspace, t0: f64, h: f64) -> Result<()> {
        if ds.is_lagrangian() {
            return Err(Error::InvalidConfiguration(format!(
                "EulerMoreau integrates first-order systems, got a {} system",
                ds.kind()
            )));
        }
        ds.init_rhs(t0)?;
        let n = ds.dimension();
        ws.free = Vector::zeros(n);
        ws.start = ds.x();
        ws.f_start = Vector::zeros(n);
        ws.r_start = Vector::zeros(n);
        ws.scale = h * self.gamma;
        if ds.is_linear_time_invariant() {
            let x = ds.x();
            ws.iteration_matrix = Some(self.iteration_matrix(ds, t0 + h, &x, h)?);
            ws.frozen = true;
            ws.step = h;
        }
        Ok(())
    }

    pub(crate) fn begin_step(&self, ds: &mut DynamicalSystem, ws: &mut OsiWorkspace, t_k: f64) -> Result<()> {
        ws.start = ds.x();
        ws.f_start = ds.first_order_f(t_k, &ws.start)?;
        ws.r_start = ds.input(0).clone();
        Ok(())
    }

    pub(crate) fn compute_free_state(&self, ds: &mut DynamicalSystem, ws: &mut OsiWorkspace, t_k: f64, h: f64) -> Result<f64> {
        let t1 = t_k + h;
        let x = ds.x();
        if ws.is_stale(h) {
            ws.iteration_matrix = Some(self.iteration_matrix(ds, t1, &x, h)?);
            ws.step = h;
        }
        let f1 = ds.first_order_f(t1, &x)?;
        let mut residu = &x - &ws.start - (f1 * self.theta + &ws.f_start * (1.0 - self.theta)) * h;
        if self.gamma < 1.0 {
            residu -= &ws.r_start * (h * (1.0 - self.gamma));
        }
        let norm = residu.norm();
        ws.solve(&mut residu)?;
        ws.free = x - residu;
        ws.scale = h * self.gamma;
        Ok(norm)
    }

    pub(crate) fn update_state(&self, ds: &mut DynamicalSystem, ws: &OsiWorkspace) -> Result<()> {
        let mut dx = ds.input(0).clone();
        ws.solve(&mut dx)?;
        let x = &ws.free + dx * ws.scale;
        ds.set_x(&x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds::FirstOrderLinearDs;
    use approx::assert_relative_eq;

    #[test]
    fn test_free_state_matches_trapezoidal_rule() {
        // ẋ = −x, θ = 1/2: x1 = x0 (1 − h/2) / (1 + h/2)
        let mut ds: DynamicalSystem =
            FirstOrderLinearDs::time_invariant(Vector::from_element(1, 1.0), Matrix::from_element(1, 1, -1.0), None)
                .unwrap()
                .into();
        let osi = EulerMoreau::new(0.5).unwrap();
        let mut ws = OsiWorkspace::new();
        let h = 0.1;
        osi.initialize(&mut ds, &mut ws, 0.0, h).unwrap();
        osi.begin_step(&mut ds, &mut ws, 0.0).unwrap();
        osi.compute_free_state(&mut ds, &mut ws, 0.0, h).unwrap();
        assert_relative_eq!(ws.free[0], 0.95 / 1.05, epsilon = 1e-14);
    }

    #[test]
    fn test_input_enters_scaled_by_step() {
        let mut ds: DynamicalSystem =
            FirstOrderLinearDs::time_invariant(Vector::from_element(1, 0.0), Matrix::zeros(1, 1), None)
                .unwrap()
                .into();
        let osi = EulerMoreau::new(1.0).unwrap();
        let mut ws = OsiWorkspace::new();
        osi.initialize(&mut ds, &mut ws, 0.0, 0.5).unwrap();
        osi.begin_step(&mut ds, &mut ws, 0.0).unwrap();
        osi.compute_free_state(&mut ds, &mut ws, 0.0, 0.5).unwrap();
        ds.input_mut(0)[0] = 2.0;
        osi.update_state(&mut ds, &ws).unwrap();
        assert_relative_eq!(ds.x()[0], 1.0);
    }

    #[test]
    fn test_rejects_invalid_theta() {
        assert!(EulerMoreau::new(1.5).is_err());
        assert!(EulerMoreau::with_gamma(0.5, 0.0).is_err());
    }
}
