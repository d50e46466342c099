//! Sampled state feedback on ẋ = u, with u held in the free parameters z and
//! read by the plugged term b(t, x, z) = z.

use approx::assert_relative_eq;
use nsm_core::control::{LinearStateFeedback, StateSensor};
use nsm_core::ds::FirstOrderLinearDs;
use nsm_core::osi::EulerMoreau;
use nsm_core::{Matrix, PluginRegistry, Simulation, TimeStepping, Topology, Vector};

#[test]
fn test_feedback_drives_state_down() {
    let mut registry = PluginRegistry::new();
    registry.register_vector("control_input", |_t, _x, out, z| out[0] = z[0]);

    let mut topo = Topology::new();
    let ds = topo.insert_dynamical_system(
        FirstOrderLinearDs::plugged(Vector::from_element(1, 1.0), &registry, None, Some("control_input")).unwrap(),
    );
    topo.ds_mut(ds).unwrap().set_z(Vector::zeros(1));

    let h = 0.1;
    let mut sim = TimeStepping::new(topo, 0.0, 1.0, h).unwrap();
    sim.insert_integrator(EulerMoreau::new(1.0).unwrap(), &[ds]).unwrap();
    let sensor = sim.core_mut().insert_sensor(Box::new(StateSensor::new(ds)), h).unwrap();
    let actuator = sim
        .core_mut()
        .insert_actuator(Box::new(LinearStateFeedback::new(ds, ds, Matrix::from_element(1, 1, 1.0))), h)
        .unwrap();
    let report = sim.run().unwrap();
    assert_eq!(report.steps, 10);

    // u = 0 over the first step, then x_{k+1} = (1 − h)·x_k
    let x = sim.topology().ds(ds).unwrap().x()[0];
    assert_relative_eq!(x, 0.9_f64.powi(9), epsilon = 1e-12);

    let records = sim
        .core()
        .sensor(sensor)
        .and_then(|s| s.as_any().downcast_ref::<StateSensor>())
        .unwrap()
        .records();
    assert_eq!(records.len(), 10);
    assert_relative_eq!(records[0].0, 0.1, epsilon = 1e-12);
    assert_relative_eq!(records[0].1[0], 1.0, epsilon = 1e-12);
    assert_relative_eq!(records[1].1[0], 0.9, epsilon = 1e-12);
    assert_relative_eq!(records[2].1[0], 0.81, epsilon = 1e-12);

    let feedback = sim
        .core()
        .actuator(actuator)
        .and_then(|a| a.as_any().downcast_ref::<LinearStateFeedback>())
        .unwrap();
    assert_eq!(feedback.actions(), 10);
    assert_relative_eq!(sim.topology().ds(ds).unwrap().z()[0], -x, epsilon = 1e-12);
}
