//! Closed-loop driver: a plant integrated with Euler–Moreau, its sensors
//! and actuators, and a record of the states at every step.

use super::{Actuator, Sensor};
use crate::ds::DynamicalSystem;
use crate::error::{Error, Result};
use crate::osi::EulerMoreau;
use crate::simulation::{RunReport, Simulation, TimeStepping};
use crate::topology::Topology;
use crate::types::{DsId, Matrix};
use tracing::info;

/// Simulation of a controlled plant over `[t0, t_final]` with step `h`.
#[derive(Debug)]
pub struct ControlSimulation {
    simulation: TimeStepping,
    theta: f64,
    h: f64,
    save_only_main: bool,
    actuators: Vec<usize>,
}

impl ControlSimulation {
    pub fn new(t0: f64, t_final: f64, h: f64) -> Result<Self> {
        Ok(Self {
            simulation: TimeStepping::new(Topology::new(), t0, t_final, h)?,
            theta: 0.5,
            h,
            save_only_main: false,
            actuators: Vec::new(),
        })
    }

    /// θ of the Euler–Moreau integrator bound to systems added afterwards.
    pub fn with_theta(mut self, theta: f64) -> Result<Self> {
        EulerMoreau::new(theta)?;
        self.theta = theta;
        Ok(self)
    }

    /// Record only the plant states, not the internal states of the controllers.
    pub fn set_save_only_main(&mut self, only_main: bool) {
        self.save_only_main = only_main;
    }

    pub fn add_dynamical_system(&mut self, ds: impl Into<DynamicalSystem>) -> Result<DsId> {
        let id = self.simulation.topology_mut().insert_dynamical_system(ds);
        self.simulation.insert_integrator(EulerMoreau::new(self.theta)?, &[id])?;
        Ok(id)
    }

    pub fn add_sensor(&mut self, sensor: Box<dyn Sensor>, period: f64) -> Result<usize> {
        self.check_period(period)?;
        self.simulation.core_mut().insert_sensor(sensor, period)
    }

    /// The actuator is initialized against the current topology, so the
    /// systems it measures must be added first.
    pub fn add_actuator(&mut self, actuator: Box<dyn Actuator>, period: f64) -> Result<usize> {
        self.check_period(period)?;
        let index = self.simulation.core_mut().insert_actuator(actuator, period)?;
        self.actuators.push(index);
        Ok(index)
    }

    fn check_period(&self, period: f64) -> Result<()> {
        if period < self.h * (1.0 - 1e-12) {
            return Err(Error::InvalidConfiguration(format!(
                "sampling period {} is shorter than the time step {}",
                period, self.h
            )));
        }
        Ok(())
    }

    pub fn simulation(&self) -> &TimeStepping {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut TimeStepping {
        &mut self.simulation
    }

    pub fn report(&self) -> RunReport {
        self.simulation.core().report()
    }

    /// Run to the final time. Each row of the result holds the time, the
    /// states of the plant systems in insertion order and, unless only the
    /// plant is saved, the internal states of the controllers.
    pub fn run(&mut self) -> Result<Matrix> {
        if !self.simulation.core().is_initialized() {
            self.simulation.initialize()?;
        }
        let mut data = Vec::new();
        let mut rows = 0;
        let mut columns = self.record(&mut data)?;
        rows += 1;
        while self.simulation.has_next_event() {
            self.simulation.compute_one_step()?;
            self.simulation.next_step()?;
            columns = self.record(&mut data)?;
            rows += 1;
        }
        info!(rows, columns, "control simulation finished");
        Ok(Matrix::from_row_slice(rows, columns, &data))
    }

    fn record(&self, data: &mut Vec<f64>) -> Result<usize> {
        let start = data.len();
        data.push(self.simulation.starting_time());
        append_states(self.simulation.topology(), data)?;
        if !self.save_only_main {
            for &index in &self.actuators {
                if let Some(topology) = self.simulation.core().actuator(index).and_then(|a| a.internal_topology()) {
                    append_states(topology, data)?;
                }
            }
        }
        Ok(data.len() - start)
    }
}

fn append_states(topology: &Topology, data: &mut Vec<f64>) -> Result<()> {
    for ds in topology.ds_ids() {
        data.extend(topology.ds(ds)?.x().iter());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{LinearStateFeedback, StateSensor};
    use crate::ds::FirstOrderLinearDs;
    use crate::types::Vector;
    use approx::assert_relative_eq;

    #[test]
    fn test_period_shorter_than_step_is_rejected() {
        let mut sim = ControlSimulation::new(0.0, 1.0, 0.1).unwrap();
        let ds = sim
            .add_dynamical_system(FirstOrderLinearDs::time_invariant(Vector::zeros(1), Matrix::zeros(1, 1), None).unwrap())
            .unwrap();
        assert!(sim.add_sensor(Box::new(StateSensor::new(ds)), 0.05).is_err());
        assert!(sim
            .add_actuator(Box::new(LinearStateFeedback::new(ds, ds, Matrix::zeros(1, 1))), 0.01)
            .is_err());
        assert!(sim.add_sensor(Box::new(StateSensor::new(ds)), 0.1).is_ok());
        assert!(ControlSimulation::new(0.0, 1.0, 0.1).unwrap().with_theta(2.0).is_err());
    }

    #[test]
    fn test_records_every_step() {
        // ẋ = −x with θ = 1: x_{k+1} = x_k / (1 + h)
        let mut sim = ControlSimulation::new(0.0, 0.5, 0.1).unwrap().with_theta(1.0).unwrap();
        sim.add_dynamical_system(
            FirstOrderLinearDs::time_invariant(Vector::from_element(1, 1.0), Matrix::from_element(1, 1, -1.0), None)
                .unwrap(),
        )
        .unwrap();
        let data = sim.run().unwrap();
        assert_eq!(data.shape(), (6, 2));
        assert_relative_eq!(data[(0, 1)], 1.0);
        assert_relative_eq!(data[(5, 0)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(data[(5, 1)], 1.1_f64.powi(-5), epsilon = 1e-12);
        assert_eq!(sim.report().steps, 5);
    }
}
