//! Interactions: a relation plus a non-smooth law, linking one or two
//! dynamical systems.
//!
//! An interaction stores y and λ for every derivative level (0, 1, 2) and
//! their values at the end of the previous step.

use crate::ds::DynamicalSystem;
use crate::error::{Error, Result};
use crate::nslaw::NonSmoothLaw;
use crate::relation::{LinkedState, Relation, RelationJacobians};
use crate::types::{all_finite, DsId, InteractionId, Levels, Vector};

/// Number of stored derivative levels.
pub const LEVELS: usize = 3;

pub struct Interaction {
    relation: Relation,
    nslaw: NonSmoothLaw,
    size: usize,
    levels: Levels,
    y: [Vector; LEVELS],
    lambda: [Vector; LEVELS],
    y_memory: [Vector; LEVELS],
    lambda_memory: [Vector; LEVELS],
    pub(crate) linked: Vec<DsId>,
    jacobians: Option<RelationJacobians>,
}

impl std::fmt::Debug for Interaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interaction")
            .field("relation", &self.relation.kind())
            .field("nslaw", &self.nslaw.kind())
            .field("size", &self.size)
            .field("linked", &self.linked)
            .finish()
    }
}

impl Interaction {
    /// Build an interaction; the law and relation sizes must agree.
    pub fn new(relation: impl Into<Relation>, nslaw: NonSmoothLaw) -> Result<Self> {
        let relation = relation.into();
        nslaw.validate()?;
        let size = nslaw.size();
        if relation.output_size() != size {
            return Err(Error::size(
                format!("{} output vs {} law", relation.kind(), nslaw.kind()),
                size,
                relation.output_size(),
            ));
        }
        let zeros = || [Vector::zeros(size), Vector::zeros(size), Vector::zeros(size)];
        Ok(Self {
            relation,
            nslaw,
            size,
            levels: Levels::new(0, 0, 0, 0),
            y: zeros(),
            lambda: zeros(),
            y_memory: zeros(),
            lambda_memory: zeros(),
            linked: Vec::new(),
            jacobians: None,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    pub fn nslaw(&self) -> &NonSmoothLaw {
        &self.nslaw
    }

    pub fn levels(&self) -> Levels {
        self.levels
    }

    /// Systems linked by this interaction, in relation order.
    pub fn linked_ds(&self) -> &[DsId] {
        &self.linked
    }

    pub fn y(&self, level: usize) -> &Vector {
        &self.y[level]
    }

    pub fn lambda(&self, level: usize) -> &Vector {
        &self.lambda[level]
    }

    /// y at `level` at the end of the previous step.
    pub fn y_old(&self, level: usize) -> &Vector {
        &self.y_memory[level]
    }

    pub fn lambda_old(&self, level: usize) -> &Vector {
        &self.lambda_memory[level]
    }

    pub(crate) fn set_lambda(&mut self, level: usize, lambda: &[f64]) {
        self.lambda[level].copy_from_slice(lambda);
    }

    pub(crate) fn set_y(&mut self, level: usize, y: &[f64]) {
        self.y[level].copy_from_slice(y);
    }

    pub fn jacobians(&self) -> Option<&RelationJacobians> {
        self.jacobians.as_ref()
    }

    /// Concatenate the states of the linked systems in relation order.
    pub(crate) fn gather(&self, systems: &[&DynamicalSystem]) -> Result<LinkedState> {
        let lagrangian = self.relation.is_lagrangian();
        let mut x = Vec::new();
        let mut v = Vec::new();
        let mut a = Vec::new();
        let mut z = Vec::new();
        for ds in systems {
            if ds.is_lagrangian() != lagrangian {
                return Err(Error::InvalidConfiguration(format!(
                    "{} linked to a {} system",
                    self.relation.kind(),
                    ds.kind()
                )));
            }
            match ds.lagrangian_state() {
                Some(state) => {
                    x.extend_from_slice(state.q().as_slice());
                    v.extend_from_slice(state.v().as_slice());
                    a.extend_from_slice(state.acceleration().as_slice());
                }
                None => x.extend_from_slice(ds.x().as_slice()),
            }
            z.extend_from_slice(ds.z().as_slice());
        }
        Ok(LinkedState {
            x: Vector::from_vec(x),
            v: lagrangian.then(|| Vector::from_vec(v)),
            acceleration: lagrangian.then(|| Vector::from_vec(a)),
            z: Vector::from_vec(z),
        })
    }

    /// Check sizes against the linked systems and compute the initial outputs.
    pub(crate) fn initialize(&mut self, id: InteractionId, time: f64, levels: Levels, systems: &[&DynamicalSystem]) -> Result<()> {
        self.levels = levels;
        let coordinates: usize = systems.iter().map(|ds| ds.coordinate_size()).sum();
        self.relation.check_coordinates(coordinates).map_err(|e| match e {
            Error::SizeMismatch { context, expected, found } => Error::SizeMismatch {
                context: format!("{}: {}", id, context),
                expected,
                found,
            },
            other => other,
        })?;
        let state = self.gather(systems)?;
        for level in levels.min_output..=levels.max_output {
            self.compute_output(time, level, &state)
                .map_err(|e| match e {
                    Error::NonFinite(msg) => Error::NonFinite(format!("{}: {}", id, msg)),
                    other => other,
                })?;
        }
        self.y_memory = self.y.clone();
        self.lambda_memory = self.lambda.clone();
        Ok(())
    }

    /// y[level] from the linked state.
    pub(crate) fn compute_output(&mut self, time: f64, level: usize, state: &LinkedState) -> Result<()> {
        let lambda = self.lambda[0].clone();
        let y = self.relation.compute_output(time, level, state, &lambda)?;
        if !all_finite(&y) {
            return Err(Error::NonFinite(format!("{} output at level {}, t = {}", self.relation.kind(), level, time)));
        }
        self.y[level] = y;
        Ok(())
    }

    /// Input produced by λ[level], over the concatenated coordinates.
    pub(crate) fn compute_input(&mut self, time: f64, level: usize, state: &LinkedState) -> Result<Vector> {
        let lambda = self.lambda[level].clone();
        self.relation.compute_input(time, state, &lambda)
    }

    /// Refresh the cached linearization around the current state and λ[level].
    pub(crate) fn update_jacobians(&mut self, time: f64, level: usize, state: &LinkedState) -> Result<&RelationJacobians> {
        if !self.relation.is_linear() || self.jacobians.is_none() {
            let lambda = self.lambda[level].clone();
            self.jacobians = Some(self.relation.jacobians(time, state, &lambda)?);
        }
        self.jacobians
            .as_ref()
            .ok_or_else(|| Error::MissingData("relation Jacobians".into()))
    }

    pub(crate) fn swap_in_memory(&mut self) {
        self.y_memory = self.y.clone();
        self.lambda_memory = self.lambda.clone();
    }

    pub(crate) fn reset_lambda(&mut self, level: usize) {
        self.lambda[level].fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds::{LagrangianLinearTiDs, MassMatrix};
    use crate::relation::{FirstOrderLinearR, LagrangianLinearR};
    use crate::types::Matrix;
    use approx::assert_relative_eq;

    fn ball(height: f64, velocity: f64) -> DynamicalSystem {
        let mass = MassMatrix::Dense(Matrix::identity(1, 1));
        LagrangianLinearTiDs::new(Vector::from_element(1, height), Vector::from_element(1, velocity), mass)
            .unwrap()
            .into()
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let relation = LagrangianLinearR::new(Matrix::zeros(2, 1));
        let result = Interaction::new(relation, NonSmoothLaw::complementarity(1));
        assert!(matches!(result, Err(Error::SizeMismatch { .. })));
    }

    #[test]
    fn test_initialize_computes_outputs() {
        let relation = LagrangianLinearR::new(Matrix::identity(1, 1))
            .with_b(Vector::from_element(1, -0.1))
            .unwrap();
        let mut inter = Interaction::new(relation, NonSmoothLaw::newton_impact(1, 0.9).unwrap()).unwrap();
        let ds = ball(1.0, -2.0);
        inter.initialize(InteractionId(0), 0.0, Levels::new(0, 1, 1, 1), &[&ds]).unwrap();
        assert_relative_eq!(inter.y(0)[0], 0.9);
        assert_relative_eq!(inter.y(1)[0], -2.0);
        assert_relative_eq!(inter.y_old(1)[0], -2.0);
    }

    #[test]
    fn test_relation_family_must_match_system() {
        let relation = FirstOrderLinearR::new(Matrix::identity(1, 1), Matrix::identity(1, 1)).unwrap();
        let mut inter = Interaction::new(relation, NonSmoothLaw::complementarity(1)).unwrap();
        let ds = ball(1.0, 0.0);
        let err = inter.initialize(InteractionId(3), 0.0, Levels::new(0, 0, 0, 0), &[&ds]);
        assert!(matches!(err, Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn test_wrong_coordinate_count_names_interaction() {
        let relation = LagrangianLinearR::new(Matrix::zeros(1, 2));
        let mut inter = Interaction::new(relation, NonSmoothLaw::complementarity(1)).unwrap();
        let ds = ball(1.0, 0.0);
        let err = inter
            .initialize(InteractionId(7), 0.0, Levels::new(0, 1, 1, 1), &[&ds])
            .unwrap_err();
        assert!(err.to_string().contains("interaction#7"));
    }
}
