//! A ball dropped from 1 m on a rigid floor, g = 10, with both drivers.

use approx::assert_relative_eq;
use nsm_core::ds::{LagrangianLinearTiDs, MassMatrix};
use nsm_core::events::EventKind;
use nsm_core::osi::{ExplicitRk4, MoreauJean};
use nsm_core::relation::LagrangianLinearR;
use nsm_core::{DsId, EventDriven, Interaction, Matrix, NonSmoothLaw, Simulation, TimeStepping, Topology, Vector};

const GRAVITY: f64 = 10.0;

fn ball(e: f64) -> (Topology, DsId) {
    let mut topo = Topology::new();
    let ds = topo.insert_dynamical_system(
        LagrangianLinearTiDs::new(
            Vector::from_element(1, 1.0),
            Vector::zeros(1),
            MassMatrix::Dense(Matrix::identity(1, 1)),
        )
        .unwrap()
        .with_f_ext(Vector::from_element(1, -GRAVITY))
        .unwrap(),
    );
    let floor = Interaction::new(LagrangianLinearR::new(Matrix::identity(1, 1)), NonSmoothLaw::newton_impact(1, e).unwrap()).unwrap();
    topo.link(floor, ds, None).unwrap();
    (topo, ds)
}

fn position_velocity(sim: &impl Simulation, ds: DsId) -> (f64, f64) {
    let state = sim.topology().ds(ds).unwrap().lagrangian_state().unwrap();
    (state.q()[0], state.v()[0])
}

#[test]
fn test_time_stepping_ball_bounces_and_loses_height() {
    let (topo, ds) = ball(0.9);
    let mut sim = TimeStepping::new(topo, 0.0, 3.0, 0.005).unwrap();
    sim.insert_integrator(MoreauJean::new(0.5).unwrap(), &[ds]).unwrap();
    sim.initialize().unwrap();

    let mut previous_v = 0.0;
    let mut bounces = 0;
    let mut apex_after_bounce: f64 = 0.0;
    while sim.has_next_event() {
        assert_eq!(sim.compute_one_step().unwrap(), 0);
        sim.next_step().unwrap();
        let (q, v) = position_velocity(&sim, ds);
        assert!(q > -0.05, "ball sank to {} at t = {}", q, sim.starting_time());
        if previous_v < 0.0 && v > 0.0 {
            bounces += 1;
        }
        if bounces > 0 {
            apex_after_bounce = apex_after_bounce.max(q);
        }
        previous_v = v;
    }
    assert!(bounces >= 2, "only {} bounces", bounces);
    assert!(apex_after_bounce > 0.5 && apex_after_bounce < 1.0, "apex {}", apex_after_bounce);
}

#[test]
fn test_event_driven_impact_time_and_restitution() {
    let (topo, ds) = ball(0.5);
    let mut sim = EventDriven::new(topo, 0.0, 1.0, 0.01).unwrap();
    sim.insert_integrator(ExplicitRk4::new(1e-3).unwrap(), &[ds]).unwrap();
    sim.initialize().unwrap();

    let mut contact = None;
    while sim.has_next_event() {
        sim.compute_one_step().unwrap();
        let located = sim.core().events().pending_kinds().contains(&EventKind::NonSmooth);
        let t = sim.next_time();
        sim.next_step().unwrap();
        if located {
            contact = Some(t);
            break;
        }
    }
    let expected = (2.0 / GRAVITY).sqrt();
    assert_relative_eq!(contact.unwrap(), expected, epsilon = 1e-8);
    let (q, v) = position_velocity(&sim, ds);
    assert!(q.abs() < 1e-8);
    assert_relative_eq!(v, -GRAVITY * expected, epsilon = 1e-6);

    sim.resolve_contacts(sim.starting_time()).unwrap();
    let (_, v) = position_velocity(&sim, ds);
    assert_relative_eq!(v, 0.5 * GRAVITY * expected, epsilon = 1e-6);

    // second contact at 2·t*, the third one lies past t = 1
    let report = sim.run().unwrap();
    assert_eq!(report.impacts, 2);
}

#[test]
fn test_event_driven_plastic_ball_comes_to_rest() {
    let (topo, ds) = ball(0.0);
    let mut sim = EventDriven::new(topo, 0.0, 1.0, 0.01).unwrap();
    sim.insert_integrator(ExplicitRk4::new(1e-3).unwrap(), &[ds]).unwrap();
    let report = sim.run().unwrap();
    assert_eq!(report.impacts, 1);
    let (q, v) = position_velocity(&sim, ds);
    assert!(q.abs() < 1e-8, "q = {}", q);
    assert!(v.abs() < 1e-8, "v = {}", v);
    let id = sim.topology().interaction_ids()[0];
    assert!(sim.topology().is_in_index_set(2, id));
    assert_relative_eq!(sim.topology().interaction(id).unwrap().lambda(2)[0], GRAVITY, epsilon = 1e-8);
}
