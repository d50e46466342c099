//! Classic fourth-order Runge–Kutta for the smooth phases of event-driven runs.
//!
//! The non-smooth input (r, or p[2] for Lagrangian systems) is held constant
//! over a step.

use crate::ds::DynamicalSystem;
use crate::error::{Error, Result};
use crate::types::Vector;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExplicitRk4 {
    /// Largest internal step; longer intervals are split evenly.
    pub max_substep: f64,
}

impl Default for ExplicitRk4 {
    fn default() -> Self {
        Self { max_substep: 1e-3 }
    }
}

impl ExplicitRk4 {
    pub fn new(max_substep: f64) -> Result<Self> {
        if max_substep <= 0.0 || !max_substep.is_finite() {
            return Err(Error::InvalidConfiguration(format!("RK4 substep must be positive, got {}", max_substep)));
        }
        Ok(Self { max_substep })
    }

    /// Number of even substeps covering an interval of length `dt`.
    pub fn substeps(&self, dt: f64) -> usize {
        ((dt / self.max_substep).ceil() as usize).max(1)
    }

    /// One RK4 step of length `h` from `t`.
    pub(crate) fn step(&self, ds: &mut DynamicalSystem, t: f64, h: f64) -> Result<()> {
        let x0 = ds.x();

        ds.compute_rhs(t)?;
        let k1 = ds.rhs();

        ds.set_x(&(&x0 + &k1 * (0.5 * h)))?;
        ds.compute_rhs(t + 0.5 * h)?;
        let k2 = ds.rhs();

        ds.set_x(&(&x0 + &k2 * (0.5 * h)))?;
        ds.compute_rhs(t + 0.5 * h)?;
        let k3 = ds.rhs();

        ds.set_x(&(&x0 + &k3 * h))?;
        ds.compute_rhs(t + h)?;
        let k4 = ds.rhs();

        let x1: Vector = x0 + (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0);
        ds.set_x(&x1)?;
        ds.compute_rhs(t + h)
    }
}
