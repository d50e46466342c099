//! Simulation traces written to ASCII matrix files and read back.

use nsm_core::ds::{LagrangianLinearTiDs, MassMatrix};
use nsm_core::io::{read_ascii, write_ascii};
use nsm_core::osi::MoreauJean;
use nsm_core::relation::LagrangianLinearR;
use nsm_core::{Interaction, Matrix, NonSmoothLaw, Simulation, TimeStepping, Topology, Vector};
use std::path::PathBuf;

fn ball_trace() -> Matrix {
    let mut topo = Topology::new();
    let ds = topo.insert_dynamical_system(
        LagrangianLinearTiDs::new(Vector::from_element(1, 0.3), Vector::zeros(1), MassMatrix::Dense(Matrix::identity(1, 1)))
            .unwrap()
            .with_f_ext(Vector::from_element(1, -9.81))
            .unwrap(),
    );
    let floor = Interaction::new(LagrangianLinearR::new(Matrix::identity(1, 1)), NonSmoothLaw::newton_impact(1, 0.7).unwrap()).unwrap();
    let id = topo.link(floor, ds, None).unwrap();
    let mut sim = TimeStepping::new(topo, 0.0, 0.5, 0.01).unwrap();
    sim.insert_integrator(MoreauJean::default(), &[ds]).unwrap();
    sim.initialize().unwrap();

    let mut rows = Vec::new();
    while sim.has_next_event() {
        sim.compute_one_step().unwrap();
        sim.next_step().unwrap();
        let state = sim.topology().ds(ds).unwrap().lagrangian_state().unwrap();
        let lambda = sim.topology().interaction(id).unwrap().lambda(1)[0];
        rows.extend_from_slice(&[sim.starting_time(), state.q()[0], state.v()[0], lambda]);
    }
    Matrix::from_row_slice(rows.len() / 4, 4, &rows)
}

fn scratch(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("nsm-core-{}-{}.dat", name, std::process::id()))
}

#[test]
fn test_trace_round_trip() {
    let trace = ball_trace();
    assert_eq!(trace.shape(), (50, 4));
    for (name, with_dims) in [("dims", true), ("nodim", false)] {
        let path = scratch(name);
        write_ascii(&path, &trace, with_dims).unwrap();
        let back = read_ascii(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, trace, "{}", name);
    }
}

#[test]
fn test_missing_file_is_an_io_error() {
    let result = read_ascii(scratch("missing"));
    assert!(matches!(result, Err(nsm_core::Error::Io(_))));
}
