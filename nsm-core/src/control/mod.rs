//! Sensors and actuators triggered by their own periodic events.
//!
//! A simulation owns its sensors and actuators; each one is registered with
//! a period and receives the topology when its event fires. Sensors only
//! read. Actuators write the free parameters z of dynamical systems, which
//! reach the dynamics through plugins and relation terms that read z.
//!
//! Sliding-mode actuators ([`smc`]) compute their control by stepping an
//! internal simulation of the controlled model; [`ControlSimulation`]
//! drives a plant with its sensors and actuators and records the states.

pub mod simulation;
pub mod smc;

pub use simulation::ControlSimulation;
pub use smc::{ExplicitTwisting, LinearSmc, Twisting};

use crate::error::{Error, Result};
use crate::topology::Topology;
use crate::types::{DsId, Matrix, Vector};
use std::any::Any;
use std::fmt;

/// Read-only observer of the topology.
pub trait Sensor: fmt::Debug + Send {
    fn capture(&mut self, time: f64, topology: &Topology) -> Result<()>;

    /// Concrete sensor, to read its records back after a run.
    fn as_any(&self) -> &dyn Any;
}

/// Writes control inputs into the topology.
pub trait Actuator: fmt::Debug + Send {
    /// Called once on registration with the simulated interval and the
    /// actuation period.
    fn initialize(&mut self, _t0: f64, _t_final: f64, _period: f64, _topology: &Topology) -> Result<()> {
        Ok(())
    }

    fn actuate(&mut self, time: f64, topology: &mut Topology) -> Result<()>;

    /// Topology of the internal simulation, for controllers that run one.
    fn internal_topology(&self) -> Option<&Topology> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Records the state x of one dynamical system.
#[derive(Debug, Clone)]
pub struct StateSensor {
    ds: DsId,
    records: Vec<(f64, Vector)>,
}

impl StateSensor {
    pub fn new(ds: DsId) -> Self {
        Self { ds, records: Vec::new() }
    }

    pub fn ds(&self) -> DsId {
        self.ds
    }

    /// Captured (time, x) pairs in capture order.
    pub fn records(&self) -> &[(f64, Vector)] {
        &self.records
    }

    pub fn last(&self) -> Option<&(f64, Vector)> {
        self.records.last()
    }
}

impl Sensor for StateSensor {
    fn capture(&mut self, time: f64, topology: &Topology) -> Result<()> {
        let x = topology.ds(self.ds)?.x();
        self.records.push((time, x));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// z_target = −K·x_measured
#[derive(Debug, Clone)]
pub struct LinearStateFeedback {
    measured: DsId,
    target: DsId,
    gain: Matrix,
    actions: usize,
}

impl LinearStateFeedback {
    /// Feedback from the state of `measured` into the parameters of `target`.
    pub fn new(measured: DsId, target: DsId, gain: Matrix) -> Self {
        Self {
            measured,
            target,
            gain,
            actions: 0,
        }
    }

    pub fn gain(&self) -> &Matrix {
        &self.gain
    }

    /// Number of times the control was applied.
    pub fn actions(&self) -> usize {
        self.actions
    }
}

impl Actuator for LinearStateFeedback {
    fn actuate(&mut self, _time: f64, topology: &mut Topology) -> Result<()> {
        let x = topology.ds(self.measured)?.x();
        if self.gain.ncols() != x.len() {
            return Err(Error::size(format!("feedback gain columns for {}", self.measured), x.len(), self.gain.ncols()));
        }
        let z = -(&self.gain * x);
        topology.ds_mut(self.target)?.set_z(z);
        self.actions += 1;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds::FirstOrderLinearDs;
    use approx::assert_relative_eq;

    #[test]
    fn test_feedback_writes_parameters() {
        let mut topo = Topology::new();
        let ds = topo.insert_dynamical_system(
            FirstOrderLinearDs::time_invariant(Vector::from_row_slice(&[1.0, -2.0]), Matrix::zeros(2, 2), None).unwrap(),
        );
        let mut control = LinearStateFeedback::new(ds, ds, Matrix::from_row_slice(1, 2, &[3.0, 1.0]));
        control.actuate(0.0, &mut topo).unwrap();
        assert_relative_eq!(topo.ds(ds).unwrap().z()[0], -1.0);
        assert_eq!(control.actions(), 1);

        let mut sensor = StateSensor::new(ds);
        sensor.capture(0.5, &topo).unwrap();
        assert_eq!(sensor.last().unwrap().0, 0.5);
        assert_eq!(sensor.records()[0].1.as_slice(), &[1.0, -2.0]);
    }

    #[test]
    fn test_gain_shape_is_checked() {
        let mut topo = Topology::new();
        let ds = topo.insert_dynamical_system(
            FirstOrderLinearDs::time_invariant(Vector::zeros(2), Matrix::zeros(2, 2), None).unwrap(),
        );
        let mut control = LinearStateFeedback::new(ds, ds, Matrix::zeros(1, 3));
        assert!(matches!(control.actuate(0.0, &mut topo), Err(Error::SizeMismatch { .. })));
    }
}
