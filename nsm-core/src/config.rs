//! Simulation configuration.

use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How a value lying exactly on the index-set tolerance is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BoundaryPolicy {
    /// `value ≤ tol` is active.
    #[default]
    Closed,
    /// `value < tol` is active.
    Open,
}

impl BoundaryPolicy {
    /// Whether `value` is close enough to the boundary to count as active.
    pub fn accepts(self, value: f64, tolerance: f64) -> bool {
        match self {
            BoundaryPolicy::Closed => value <= tolerance,
            BoundaryPolicy::Open => value < tolerance,
        }
    }
}

/// What to do when a one-step non-smooth problem does not converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NonConvergencePolicy {
    /// Log a warning, keep the last iterate and report the info code.
    #[default]
    Warn,
    /// Return [`Error::NonConvergence`].
    Abort,
}

/// Newton loop used by time stepping when a system or relation is nonlinear.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NewtonOptions {
    pub max_iterations: usize,
    /// Stop when the free residual norm and ‖Δx‖ fall below this.
    pub tolerance: f64,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-10,
        }
    }
}

/// Options specific to event-driven simulations.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EventDrivenOptions {
    /// Width of the bracket left around a located contact time.
    pub root_tolerance: f64,
    /// Bisection steps before giving up on a bracket.
    pub max_root_iterations: usize,
    /// |ẏ| below this keeps a closed contact in the acceleration-level set.
    pub velocity_tolerance: f64,
}

impl Default for EventDrivenOptions {
    fn default() -> Self {
        Self {
            root_tolerance: 1e-10,
            max_root_iterations: 200,
            velocity_tolerance: 1e-8,
        }
    }
}

/// Configuration shared by every simulation kind.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimulationConfig {
    /// Index-set boundary tolerance.
    pub tolerance: f64,
    pub boundary_policy: BoundaryPolicy,
    /// Freeze index sets after initialization.
    pub static_levels: bool,
    pub non_convergence: NonConvergencePolicy,
    pub newton: NewtonOptions,
    /// History length of each dynamical system.
    pub steps_in_memory: usize,
    pub event_driven: EventDrivenOptions,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tolerance: 10.0 * f64::EPSILON,
            boundary_policy: BoundaryPolicy::Closed,
            static_levels: false,
            non_convergence: NonConvergencePolicy::Warn,
            newton: NewtonOptions::default(),
            steps_in_memory: 1,
            event_driven: EventDrivenOptions::default(),
        }
    }
}

impl SimulationConfig {
    /// Index-set boundary tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Tie-break for values sitting exactly on the tolerance.
    pub fn with_boundary_policy(mut self, policy: BoundaryPolicy) -> Self {
        self.boundary_policy = policy;
        self
    }

    /// Keep the index sets computed at initialization.
    pub fn with_static_levels(mut self, static_levels: bool) -> Self {
        self.static_levels = static_levels;
        self
    }

    /// Warn or abort on a non-converged one-step problem.
    pub fn with_non_convergence(mut self, policy: NonConvergencePolicy) -> Self {
        self.non_convergence = policy;
        self
    }

    pub fn with_newton(mut self, newton: NewtonOptions) -> Self {
        self.newton = newton;
        self
    }

    /// Number of past states kept by every dynamical system.
    pub fn with_steps_in_memory(mut self, steps: usize) -> Self {
        self.steps_in_memory = steps;
        self
    }

    pub fn with_event_driven(mut self, options: EventDrivenOptions) -> Self {
        self.event_driven = options;
        self
    }

    /// Reject tolerances and iteration limits no simulation can run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance >= 0.0 && self.tolerance.is_finite()) {
            return Err(Error::InvalidConfiguration(format!("index-set tolerance must be finite and non-negative, got {}", self.tolerance)));
        }
        if self.newton.max_iterations == 0 {
            return Err(Error::InvalidConfiguration("Newton loop needs at least one iteration".into()));
        }
        if self.newton.tolerance <= 0.0 || !self.newton.tolerance.is_finite() {
            return Err(Error::InvalidConfiguration(format!("Newton tolerance must be positive, got {}", self.newton.tolerance)));
        }
        let ed = &self.event_driven;
        if ed.root_tolerance <= 0.0 || ed.max_root_iterations == 0 || ed.velocity_tolerance < 0.0 {
            return Err(Error::InvalidConfiguration(format!("invalid event-driven options: {:?}", ed)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SimulationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.boundary_policy, BoundaryPolicy::Closed);
        assert!(config.tolerance > 0.0 && config.tolerance < 1e-14);
    }

    #[test]
    fn test_boundary_policy() {
        assert!(BoundaryPolicy::Closed.accepts(1e-3, 1e-3));
        assert!(!BoundaryPolicy::Open.accepts(1e-3, 1e-3));
        assert!(BoundaryPolicy::Open.accepts(0.0, 1e-3));
    }

    #[test]
    fn test_invalid_tolerance_rejected() {
        assert!(SimulationConfig::default().with_tolerance(-1.0).validate().is_err());
        assert!(SimulationConfig::default().with_tolerance(f64::NAN).validate().is_err());
        let newton = NewtonOptions {
            max_iterations: 0,
            tolerance: 1e-8,
        };
        assert!(SimulationConfig::default().with_newton(newton).validate().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_round_trip() {
        let config = SimulationConfig::default()
            .with_tolerance(1e-12)
            .with_static_levels(true)
            .with_non_convergence(NonConvergencePolicy::Abort);
        let json = serde_json::to_string(&config).unwrap();
        let back: SimulationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
