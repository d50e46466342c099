//! A unit-mass block resting on the floor, pushed sideways by a constant
//! force, with Coulomb friction μ = 0.5 and g = 10.

use approx::assert_relative_eq;
use nsm_core::ds::{LagrangianLinearTiDs, MassMatrix};
use nsm_core::osi::MoreauJean;
use nsm_core::relation::LagrangianLinearR;
use nsm_core::{DsId, Interaction, Matrix, NonSmoothLaw, ProblemKind, Simulation, TimeStepping, Topology, Vector};

const MU: f64 = 0.5;
const GRAVITY: f64 = 10.0;

/// Coordinates q = [x, z]; the contact rows are [normal, tangent].
fn block(push: f64) -> (TimeStepping, DsId) {
    let mut topo = Topology::new();
    let ds = topo.insert_dynamical_system(
        LagrangianLinearTiDs::new(Vector::zeros(2), Vector::zeros(2), MassMatrix::Dense(Matrix::identity(2, 2)))
            .unwrap()
            .with_f_ext(Vector::from_vec(vec![push, -GRAVITY]))
            .unwrap(),
    );
    let contact = Interaction::new(
        LagrangianLinearR::new(Matrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0])),
        NonSmoothLaw::newton_impact_friction(2, 0.0, 0.0, MU).unwrap(),
    )
    .unwrap();
    topo.link(contact, ds, None).unwrap();
    let mut sim = TimeStepping::new(topo, 0.0, 1.0, 0.01).unwrap();
    sim.insert_integrator(MoreauJean::new(0.5).unwrap(), &[ds]).unwrap();
    (sim, ds)
}

#[test]
fn test_block_sticks_below_threshold() {
    let (mut sim, ds) = block(2.0);
    sim.run().unwrap();
    assert_eq!(sim.problem().unwrap().kind(), ProblemKind::FrictionContact { dimension: 2 });
    let state = sim.topology().ds(ds).unwrap().lagrangian_state().unwrap();
    assert_relative_eq!(state.v()[0], 0.0, epsilon = 1e-6);
    assert_relative_eq!(state.v()[1], 0.0, epsilon = 1e-6);
    assert_relative_eq!(state.q()[0], 0.0, epsilon = 1e-6);
}

#[test]
fn test_block_slides_above_threshold() {
    let (mut sim, ds) = block(8.0);
    sim.run().unwrap();
    let state = sim.topology().ds(ds).unwrap().lagrangian_state().unwrap();
    // (F − μ·g)·t
    assert_relative_eq!(state.v()[0], 3.0, epsilon = 1e-6);
    assert_relative_eq!(state.v()[1], 0.0, epsilon = 1e-6);
    assert!(state.q()[1].abs() < 1e-6);
    let id = sim.topology().interaction_ids()[0];
    let impulse = sim.topology().interaction(id).unwrap().lambda(1);
    // normal percussion over one step, tangential one on the cone boundary
    assert_relative_eq!(impulse[0], GRAVITY * 0.01, epsilon = 1e-8);
    assert_relative_eq!(impulse[1], -MU * GRAVITY * 0.01, epsilon = 1e-8);
}
