//! One-step integrators.
//!
//! An integrator advances the dynamical systems bound to it over one step.
//! Time-stepping integrators work in two halves around the non-smooth solve:
//!
//! 1. [`OneStepIntegrator::compute_free_state`]: the state the system would
//!    reach with zero non-smooth input, and the factorized iteration matrix W.
//! 2. [`OneStepIntegrator::update_state`]: the final state once the input
//!    (r or p) produced by the solved multipliers has been scattered back.
//!
//! Between the two, the one-step non-smooth problem reads the free state,
//! W⁻¹ and the input scale from each system's [`OsiWorkspace`].

pub mod euler_moreau;
pub mod moreau_jean;
pub mod rk4;

pub use euler_moreau::EulerMoreau;
pub use moreau_jean::MoreauJean;
pub use rk4::ExplicitRk4;

use crate::config::BoundaryPolicy;
use crate::ds::DynamicalSystem;
use crate::error::{Error, Result};
use crate::interaction::Interaction;
use crate::linalg::Factorization;
use crate::nslaw::NonSmoothLaw;
use crate::types::{Levels, Vector};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Per-system integrator data kept between the two halves of a step.
#[derive(Debug)]
pub struct OsiWorkspace {
    pub(crate) iteration_matrix: Option<Factorization>,
    /// W does not depend on the state and is never refactorized.
    pub(crate) frozen: bool,
    /// Free state (x for first-order, v for Lagrangian systems).
    pub(crate) free: Vector,
    /// State at the beginning of the step.
    pub(crate) start: Vector,
    pub(crate) f_start: Vector,
    pub(crate) r_start: Vector,
    /// Factor applied to W⁻¹·r when the input enters the state.
    pub(crate) scale: f64,
    /// Step length W was computed for.
    pub(crate) step: f64,
}

impl Default for OsiWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl OsiWorkspace {
    pub fn new() -> Self {
        Self {
            iteration_matrix: None,
            frozen: false,
            free: Vector::zeros(0),
            start: Vector::zeros(0),
            f_start: Vector::zeros(0),
            r_start: Vector::zeros(0),
            scale: 1.0,
            step: 0.0,
        }
    }

    /// True when W must be recomputed for a step of length `h`.
    pub(crate) fn is_stale(&self, h: f64) -> bool {
        !self.frozen || self.iteration_matrix.is_none() || (self.step - h).abs() > f64::EPSILON * h.abs().max(1.0)
    }

    /// b ← W⁻¹·b
    pub(crate) fn solve(&self, b: &mut Vector) -> Result<()> {
        self.iteration_matrix
            .as_ref()
            .ok_or_else(|| Error::MissingData("iteration matrix was not computed".into()))?
            .solve_in_place(b)
    }

    pub fn free_state(&self) -> &Vector {
        &self.free
    }
}

/// The closed set of integrators.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OneStepIntegrator {
    EulerMoreau(EulerMoreau),
    MoreauJean(MoreauJean),
    ExplicitRk4(ExplicitRk4),
}

impl From<EulerMoreau> for OneStepIntegrator {
    fn from(osi: EulerMoreau) -> Self {
        OneStepIntegrator::EulerMoreau(osi)
    }
}

impl From<MoreauJean> for OneStepIntegrator {
    fn from(osi: MoreauJean) -> Self {
        OneStepIntegrator::MoreauJean(osi)
    }
}

impl From<ExplicitRk4> for OneStepIntegrator {
    fn from(osi: ExplicitRk4) -> Self {
        OneStepIntegrator::ExplicitRk4(osi)
    }
}

impl OneStepIntegrator {
    pub fn kind(&self) -> &'static str {
        match self {
            OneStepIntegrator::EulerMoreau(_) => "EulerMoreau",
            OneStepIntegrator::MoreauJean(_) => "MoreauJean",
            OneStepIntegrator::ExplicitRk4(_) => "ExplicitRk4",
        }
    }

    /// Output and input levels of the interactions handled by this integrator.
    pub fn levels(&self) -> Levels {
        match self {
            OneStepIntegrator::EulerMoreau(_) => Levels::new(0, 0, 0, 0),
            OneStepIntegrator::MoreauJean(_) => Levels::new(0, 1, 1, 1),
            OneStepIntegrator::ExplicitRk4(_) => Levels::new(0, 2, 1, 2),
        }
    }

    /// Index set the time-stepping non-smooth problem is posed on.
    pub fn index_set_level(&self) -> usize {
        match self {
            OneStepIntegrator::EulerMoreau(_) => 0,
            OneStepIntegrator::MoreauJean(_) | OneStepIntegrator::ExplicitRk4(_) => 1,
        }
    }

    /// True for the fixed-grid integrators usable with time stepping.
    pub fn is_time_stepping(&self) -> bool {
        !matches!(self, OneStepIntegrator::ExplicitRk4(_))
    }

    pub(crate) fn initialize_ds(&self, ds: &mut DynamicalSystem, ws: &mut OsiWorkspace, t0: f64, h: f64) -> Result<()> {
        match self {
            OneStepIntegrator::EulerMoreau(osi) => osi.initialize(ds, ws, t0, h),
            OneStepIntegrator::MoreauJean(osi) => osi.initialize(ds, ws, t0, h),
            OneStepIntegrator::ExplicitRk4(_) => {
                ds.init_rhs(t0)?;
                ws.scale = 1.0;
                Ok(())
            }
        }
    }

    /// Record the beginning-of-step state.
    pub(crate) fn begin_step(&self, ds: &mut DynamicalSystem, ws: &mut OsiWorkspace, t_k: f64) -> Result<()> {
        match self {
            OneStepIntegrator::EulerMoreau(osi) => osi.begin_step(ds, ws, t_k),
            OneStepIntegrator::MoreauJean(osi) => osi.begin_step(ds, ws, t_k),
            OneStepIntegrator::ExplicitRk4(_) => {
                ws.start = ds.x();
                Ok(())
            }
        }
    }

    /// Free state and iteration matrix; returns the norm of the free residual.
    pub(crate) fn compute_free_state(&self, ds: &mut DynamicalSystem, ws: &mut OsiWorkspace, t_k: f64, h: f64) -> Result<f64> {
        match self {
            OneStepIntegrator::EulerMoreau(osi) => osi.compute_free_state(ds, ws, t_k, h),
            OneStepIntegrator::MoreauJean(osi) => osi.compute_free_state(ds, ws, t_k, h),
            OneStepIntegrator::ExplicitRk4(_) => Err(Error::InvalidConfiguration(
                "ExplicitRk4 has no free state; use it with event-driven simulations".into(),
            )),
        }
    }

    /// Final state from the free state and the scattered non-smooth input.
    pub(crate) fn update_state(&self, ds: &mut DynamicalSystem, ws: &OsiWorkspace, h: f64) -> Result<()> {
        match self {
            OneStepIntegrator::EulerMoreau(osi) => osi.update_state(ds, ws),
            OneStepIntegrator::MoreauJean(osi) => osi.update_state(ds, ws, h),
            OneStepIntegrator::ExplicitRk4(_) => Err(Error::InvalidConfiguration(
                "ExplicitRk4 cannot apply a non-smooth input over a fixed step".into(),
            )),
        }
    }

    /// Activation test for the interaction-level index set (level 1).
    ///
    /// Moreau–Jean predicts the gap at the end of the step, y₀ + γ·h·y₁.
    /// Friction interactions are tested on their normal row only.
    pub(crate) fn is_active(&self, interaction: &Interaction, h: f64, tolerance: f64, policy: BoundaryPolicy) -> bool {
        let gap = |row: usize| -> f64 {
            let y0 = interaction.y(0)[row];
            match self {
                OneStepIntegrator::MoreauJean(osi) => y0 + osi.prediction_weight() * h * interaction.y(1)[row],
                _ => y0,
            }
        };
        let value = match interaction.nslaw() {
            NonSmoothLaw::NewtonImpactFriction { .. } => gap(0),
            _ => (0..interaction.size()).map(gap).fold(f64::INFINITY, f64::min),
        };
        policy.accepts(value, tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds::{LagrangianLinearTiDs, MassMatrix};
    use crate::relation::LagrangianLinearR;
    use crate::types::{InteractionId, Matrix};

    fn contact(height: f64, velocity: f64) -> Interaction {
        let ds: DynamicalSystem = LagrangianLinearTiDs::new(
            Vector::from_element(1, height),
            Vector::from_element(1, velocity),
            MassMatrix::Dense(Matrix::identity(1, 1)),
        )
        .unwrap()
        .into();
        let mut inter = Interaction::new(
            LagrangianLinearR::new(Matrix::identity(1, 1)),
            NonSmoothLaw::newton_impact(1, 0.8).unwrap(),
        )
        .unwrap();
        inter.initialize(InteractionId(0), 0.0, Levels::new(0, 1, 1, 1), &[&ds]).unwrap();
        inter
    }

    #[test]
    fn test_moreau_jean_predicts_gap() {
        let osi: OneStepIntegrator = MoreauJean::default().into();
        // 0.01 − 0.5·0.1·1 < 0
        assert!(osi.is_active(&contact(0.01, -1.0), 0.1, 1e-15, BoundaryPolicy::Closed));
        assert!(!osi.is_active(&contact(0.1, -1.0), 0.1, 1e-15, BoundaryPolicy::Closed));
    }

    #[test]
    fn test_boundary_policy_at_exact_contact() {
        let osi: OneStepIntegrator = MoreauJean::default().into();
        let resting = contact(0.0, 0.0);
        assert!(osi.is_active(&resting, 0.1, 0.0, BoundaryPolicy::Closed));
        assert!(!osi.is_active(&resting, 0.1, 0.0, BoundaryPolicy::Open));
    }

    #[test]
    fn test_levels() {
        let em: OneStepIntegrator = EulerMoreau::default().into();
        assert_eq!(em.index_set_level(), 0);
        assert_eq!(OneStepIntegrator::from(ExplicitRk4::default()).levels().number_of_index_sets(), 3);
        assert!(!OneStepIntegrator::from(ExplicitRk4::default()).is_time_stepping());
    }
}
