//! Sliding-mode control of a double integrator ẋ₀ = x₁, ẋ₁ = u, with u held
//! in the free parameters z of the plant and read by the plugged term b.

use approx::assert_relative_eq;
use nsm_core::control::{ControlSimulation, LinearSmc, StateSensor, Twisting};
use nsm_core::ds::FirstOrderLinearDs;
use nsm_core::{DsId, DynamicalSystem, Matrix, PluginRegistry, Simulation, Vector};

fn plant(x0: [f64; 2]) -> DynamicalSystem {
    let mut registry = PluginRegistry::new();
    registry.register_matrix("double_integrator", |_t, _x, out, _z| out.copy_from_slice(&[0.0, 0.0, 1.0, 0.0]));
    registry.register_vector("control_input", |_t, _x, out, z| {
        out[0] = 0.0;
        out[1] = z[0];
    });
    let mut ds: DynamicalSystem = FirstOrderLinearDs::plugged(
        Vector::from_row_slice(&x0),
        &registry,
        Some("double_integrator"),
        Some("control_input"),
    )
    .unwrap()
    .into();
    ds.set_z(Vector::zeros(1));
    ds
}

fn smc_loop(t_final: f64, h: f64) -> (ControlSimulation, DsId, usize) {
    let mut sim = ControlSimulation::new(0.0, t_final, h).unwrap();
    let ds = sim.add_dynamical_system(plant([1.0, 0.0])).unwrap();
    let control = LinearSmc::new(
        ds,
        ds,
        Matrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0]),
        Matrix::from_row_slice(2, 1, &[0.0, 1.0]),
        Matrix::from_row_slice(1, 2, &[1.0, 1.0]),
    )
    .unwrap();
    let actuator = sim.add_actuator(Box::new(control), h).unwrap();
    (sim, ds, actuator)
}

#[test]
fn test_sliding_surface_reached_in_finite_time() {
    let h = 0.01;
    let (mut sim, _, actuator) = smc_loop(5.0, h);
    let data = sim.run().unwrap();
    // t, plant state, internal model state
    assert_eq!(data.shape(), (501, 5));

    let sigma = |row: usize| data[(row, 1)] + data[(row, 2)];
    // σ shrinks by about α·h per step from σ₀ = 1
    assert!(sigma(50) > 0.1, "σ(0.5) = {}", sigma(50));
    for row in 101..data.nrows() {
        assert!(sigma(row).abs() < 1e-9, "σ = {:e} at t = {}", sigma(row), data[(row, 0)]);
    }
    // on the surface x₁ = −x₀ and the state decays along it
    assert_relative_eq!(data[(500, 1)], 0.011660150782803786, epsilon = 1e-6);
    assert_relative_eq!(data[(500, 0)], 5.0, epsilon = 1e-9);

    let smc = sim
        .simulation()
        .core()
        .actuator(actuator)
        .and_then(|a| a.as_any().downcast_ref::<LinearSmc>())
        .unwrap();
    assert_eq!(smc.actions(), 500);
    assert!(smc.us()[0].abs() <= 1.0 + 1e-12);
    assert_relative_eq!(smc.u()[0], smc.ueq()[0] + smc.us()[0]);
}

#[test]
fn test_only_plant_states_saved_on_request() {
    let (mut sim, ds, _) = smc_loop(0.1, 0.01);
    sim.set_save_only_main(true);
    let sensor = sim.add_sensor(Box::new(StateSensor::new(ds)), 0.02).unwrap();
    let data = sim.run().unwrap();
    assert_eq!(data.shape(), (11, 3));
    let records = sim
        .simulation()
        .core()
        .sensor(sensor)
        .and_then(|s| s.as_any().downcast_ref::<StateSensor>())
        .unwrap()
        .records();
    assert_eq!(records.len(), 5);
    assert_relative_eq!(records[0].0, 0.02, epsilon = 1e-12);
}

#[test]
fn test_twisting_brings_state_to_origin() {
    let h = 0.1;
    let mut sim = ControlSimulation::new(0.0, 20.0, h).unwrap();
    let ds = sim.add_dynamical_system(plant([10.0, 10.0])).unwrap();
    let actuator = sim.add_actuator(Box::new(Twisting::new(ds, ds, 10.0, 0.3).unwrap()), h).unwrap();
    let data = sim.run().unwrap();
    assert_eq!(data.nrows(), 201);
    assert!(data[(40, 1)].abs() > 1e-3 || data[(40, 2)].abs() > 1e-3);
    for row in 80..data.nrows() {
        assert!(
            data[(row, 1)].abs() < 1e-6 && data[(row, 2)].abs() < 1e-6,
            "state ({}, {}) at t = {}",
            data[(row, 1)],
            data[(row, 2)],
            data[(row, 0)]
        );
    }
    let twisting = sim
        .simulation()
        .core()
        .actuator(actuator)
        .and_then(|a| a.as_any().downcast_ref::<Twisting>())
        .unwrap();
    assert_eq!(twisting.actions(), 200);
    assert!(twisting.u().abs() <= 10.0 * (1.0 + 0.3 * 1.05) + 1e-9);
}
