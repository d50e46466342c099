//! Block assembly of one-step non-smooth problems.
//!
//! For active interactions a, b and every system d they share:
//!
//! ```text
//! M_ab = Σ_d C_a[:, d] · (s_d W_d⁻¹) · B_b[d, :]   (+ D_a when a = b)
//! q_a  = Σ_d C_a[:, d] · (x_free,d + s_d W_d⁻¹ r_offset,d) + y_offset,a + e_a·ẏ⁻_a
//! ```
//!
//! W_d, s_d and x_free,d come from each system's integrator workspace.
//! Coupling blocks are computed in parallel with Rayon and collected in
//! interaction order, so the assembled matrix does not depend on thread
//! scheduling.

use crate::error::{Error, Result};
use crate::interaction::LEVELS;
use crate::nslaw::NonSmoothLaw;
use crate::sparse::{MatrixStorage, NsMatrix, TripletMatrix};
use crate::topology::Topology;
use crate::types::{DsId, InteractionId, Matrix, Vector};
use rayon::prelude::*;
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which pre-impact output enters the Newton restitution term of q.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Restitution {
    /// No restitution term.
    #[default]
    None,
    /// ẏ at the end of the previous step (time stepping).
    PreviousStep,
    /// Current ẏ, read before the impact (event-driven impacts).
    Current,
}

/// Rows of one interaction inside the assembled problem.
#[derive(Debug, Clone)]
pub(crate) struct InteractionBlock {
    pub id: InteractionId,
    pub offset: usize,
    pub size: usize,
    /// Linked systems with their column offset in the relation coordinates.
    coords: Vec<(DsId, usize, usize)>,
    output: Matrix,
    feedthrough: Option<Matrix>,
    input: Matrix,
}

#[derive(Debug)]
pub(crate) struct Assembled {
    pub matrix: NsMatrix,
    pub q: Vector,
    /// Restitution part of q, removed again when y is written back.
    pub restitution: Vector,
    pub blocks: Vec<InteractionBlock>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AssemblyOptions {
    /// λ level the relations are linearized at.
    pub level: usize,
    pub storage: MatrixStorage,
    pub restitution: Restitution,
    /// Read the free part of q from y at this level (computed by the caller)
    /// instead of C·x_free.
    pub stored_free_output: Option<usize>,
}

/// Assemble M and q over `active`.
pub(crate) fn assemble(topology: &mut Topology, active: &[InteractionId], time: f64, options: &AssemblyOptions) -> Result<Assembled> {
    let level = options.level;
    if level >= LEVELS || options.stored_free_output.is_some_and(|l| l >= LEVELS) {
        return Err(Error::InvalidConfiguration(format!("no input level {}", level)));
    }

    // Linearize every active relation, in problem order.
    let mut blocks = Vec::with_capacity(active.len());
    let mut offset = 0;
    let mut q = Vec::with_capacity(active.len());
    for id in active {
        let state = topology.linked_state(*id)?;
        let coords = topology.coordinate_offsets(*id)?;
        let interaction = topology.interaction_mut(*id)?;
        let size = interaction.size();
        let jac = interaction.update_jacobians(time, level, &state)?.clone();
        let stored = options.stored_free_output.map(|l| interaction.y(l).clone());
        let local_q = match stored {
            Some(y) => y,
            None => {
                let mut local_q = jac.output_offset.clone();
                for (ds, start, n) in &coords {
                    let ws = &topology.node(*ds)?.workspace;
                    if ws.free.len() != *n {
                        return Err(Error::MissingData(format!("{}: free state was not computed for {}", id, ds)));
                    }
                    let mut shifted = jac.input_offset.rows(*start, *n).into_owned();
                    let mut x = ws.free.clone();
                    if shifted.iter().any(|v| *v != 0.0) {
                        ws.solve(&mut shifted)?;
                        x += shifted * ws.scale;
                    }
                    local_q.gemv(1.0, &jac.output.columns(*start, *n), &x, 1.0);
                }
                local_q
            }
        };
        q.push(local_q);
        blocks.push(InteractionBlock {
            id: *id,
            offset,
            size,
            coords,
            output: jac.output,
            feedthrough: jac.feedthrough,
            input: jac.input,
        });
        offset += size;
    }
    let total = offset;

    // s_d W_d⁻¹ B_b[d, :] for every (b, d) pair
    let mut scaled_inputs: BTreeMap<(usize, DsId), Matrix> = BTreeMap::new();
    let mut users: BTreeMap<DsId, Vec<usize>> = BTreeMap::new();
    for (b, block) in blocks.iter().enumerate() {
        for (ds, start, n) in &block.coords {
            let ws = &topology.node(*ds)?.workspace;
            let mut g = block.input.rows(*start, *n).into_owned();
            ws.iteration_matrix
                .as_ref()
                .ok_or_else(|| Error::MissingData(format!("{}: iteration matrix was not computed", ds)))?
                .solve_matrix_in_place(&mut g)?;
            scaled_inputs.insert((b, *ds), g * ws.scale);
            users.entry(*ds).or_default().push(b);
        }
    }

    let rows: Vec<Vec<(usize, Matrix)>> = blocks
        .par_iter()
        .enumerate()
        .map(|(a, block)| {
            let mut row: BTreeMap<usize, Matrix> = BTreeMap::new();
            for (ds, start, n) in &block.coords {
                let c = block.output.columns(*start, *n);
                for b in users.get(ds).into_iter().flatten() {
                    let Some(g) = scaled_inputs.get(&(*b, *ds)) else {
                        continue;
                    };
                    let product = &c * g;
                    match row.get_mut(b) {
                        Some(acc) => *acc += product,
                        None => {
                            row.insert(*b, product);
                        }
                    }
                }
            }
            if let Some(d) = &block.feedthrough {
                match row.get_mut(&a) {
                    Some(acc) => *acc += d,
                    None => {
                        row.insert(a, d.clone());
                    }
                }
            }
            row.into_iter().collect()
        })
        .collect();

    let matrix = match options.storage {
        MatrixStorage::Dense => {
            let mut m = Matrix::zeros(total, total);
            for (block, row) in blocks.iter().zip(&rows) {
                for (b, value) in row {
                    m.view_mut((block.offset, blocks[*b].offset), (block.size, blocks[*b].size))
                        .copy_from(value);
                }
            }
            NsMatrix::Dense(m)
        }
        MatrixStorage::Sparse => {
            let nnz: usize = rows.iter().flatten().map(|(_, m)| m.len()).sum();
            let mut triplets = TripletMatrix::with_capacity(total, total, nnz);
            for (block, row) in blocks.iter().zip(&rows) {
                for (b, value) in row {
                    triplets.add_block(block.offset, blocks[*b].offset, value);
                }
            }
            NsMatrix::Sparse(triplets.to_csr())
        }
    };

    let mut q_global = Vector::zeros(total);
    let mut restitution_part = Vector::zeros(total);
    for (block, local) in blocks.iter().zip(&q) {
        q_global.rows_mut(block.offset, block.size).copy_from(local);
        if options.restitution != Restitution::None {
            let interaction = topology.interaction(block.id)?;
            let velocity = match options.restitution {
                Restitution::PreviousStep => interaction.y_old(1),
                _ => interaction.y(1),
            };
            match interaction.nslaw() {
                NonSmoothLaw::NewtonImpact { e, .. } => {
                    for i in 0..block.size {
                        restitution_part[block.offset + i] = e * velocity[i];
                    }
                }
                NonSmoothLaw::NewtonImpactFriction { en, .. } => {
                    restitution_part[block.offset] = en * velocity[0];
                }
                _ => {}
            }
        }
    }
    q_global += &restitution_part;

    Ok(Assembled {
        matrix,
        q: q_global,
        restitution: restitution_part,
        blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds::{LagrangianLinearTiDs, MassMatrix};
    use crate::interaction::Interaction;
    use crate::osi::{MoreauJean, OneStepIntegrator};
    use crate::relation::LagrangianLinearR;
    use approx::assert_relative_eq;

    fn options(level: usize) -> AssemblyOptions {
        AssemblyOptions {
            level,
            storage: MatrixStorage::Dense,
            restitution: Restitution::None,
            stored_free_output: None,
        }
    }

    /// Two free masses of mass 2: one on the ground contact, one coupled to it.
    fn setup() -> (Topology, InteractionId, InteractionId) {
        let mut topo = Topology::new();
        let body = |v: f64| {
            LagrangianLinearTiDs::new(Vector::zeros(1), Vector::from_element(1, v), MassMatrix::Dense(Matrix::from_element(1, 1, 2.0)))
                .unwrap()
        };
        let a = topo.insert_dynamical_system(body(-1.0));
        let b = topo.insert_dynamical_system(body(-3.0));
        let osi: OneStepIntegrator = MoreauJean::new(1.0).unwrap().into();
        for ds in [a, b] {
            let node = topo.node_mut(ds).unwrap();
            osi.initialize_ds(&mut node.ds, &mut node.workspace, 0.0, 0.1).unwrap();
            osi.begin_step(&mut node.ds, &mut node.workspace, 0.0).unwrap();
            osi.compute_free_state(&mut node.ds, &mut node.workspace, 0.0, 0.1).unwrap();
        }
        let ground = Interaction::new(LagrangianLinearR::new(Matrix::identity(1, 1)), NonSmoothLaw::newton_impact(1, 0.5).unwrap()).unwrap();
        let between = Interaction::new(
            LagrangianLinearR::new(Matrix::from_row_slice(1, 2, &[-1.0, 1.0])),
            NonSmoothLaw::newton_impact(1, 0.0).unwrap(),
        )
        .unwrap();
        let i0 = topo.link(ground, a, None).unwrap();
        let i1 = topo.link(between, a, Some(b)).unwrap();
        (topo, i0, i1)
    }

    #[test]
    fn test_delassus_blocks() {
        let (mut topo, i0, i1) = setup();
        let assembled = assemble(&mut topo, &[i0, i1], 0.0, &options(1)).unwrap();
        let m = assembled.matrix.to_dense();
        assert_relative_eq!(m[(0, 0)], 0.5);
        assert_relative_eq!(m[(0, 1)], -0.5);
        assert_relative_eq!(m[(1, 0)], -0.5);
        assert_relative_eq!(m[(1, 1)], 1.0);
        // free velocities v_a = −1, v_b = −3
        assert_relative_eq!(assembled.q[0], -1.0);
        assert_relative_eq!(assembled.q[1], -2.0);
        assert_eq!(assembled.blocks[1].offset, 1);
    }

    #[test]
    fn test_sparse_storage_matches_dense() {
        let (mut topo, i0, i1) = setup();
        let dense = assemble(&mut topo, &[i0, i1], 0.0, &options(1)).unwrap();
        let sparse = assemble(&mut topo, &[i0, i1], 0.0, &AssemblyOptions { storage: MatrixStorage::Sparse, ..options(1) }).unwrap();
        assert!(matches!(sparse.matrix, NsMatrix::Sparse(_)));
        assert_relative_eq!((dense.matrix.to_dense() - sparse.matrix.to_dense()).norm(), 0.0);
    }

    #[test]
    fn test_restitution_uses_current_velocity() {
        let (mut topo, i0, i1) = setup();
        for id in [i0, i1] {
            topo.update_output(id, 0.0, 0, 1).unwrap();
        }
        let assembled = assemble(&mut topo, &[i0, i1], 0.0, &AssemblyOptions { restitution: Restitution::Current, ..options(1) }).unwrap();
        // ground contact: e = 0.5 on ẏ = −1; coupling has e = 0
        assert_relative_eq!(assembled.restitution[0], -0.5);
        assert_relative_eq!(assembled.restitution[1], 0.0);
        assert_relative_eq!(assembled.q[0], -1.5);
    }

    #[test]
    fn test_missing_free_state_is_reported() {
        let mut topo = Topology::new();
        let ds = topo.insert_dynamical_system(
            LagrangianLinearTiDs::new(Vector::zeros(1), Vector::zeros(1), MassMatrix::Dense(Matrix::identity(1, 1))).unwrap(),
        );
        let inter = Interaction::new(LagrangianLinearR::new(Matrix::identity(1, 1)), NonSmoothLaw::complementarity(1)).unwrap();
        let id = topo.link(inter, ds, None).unwrap();
        assert!(matches!(
            assemble(&mut topo, &[id], 0.0, &options(1)),
            Err(Error::MissingData(_))
        ));
    }
}
