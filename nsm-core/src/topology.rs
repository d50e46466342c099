//! Arena of dynamical systems and interactions, with index sets.
//!
//! Systems and interactions are addressed by [`DsId`] / [`InteractionId`]
//! handles allocated by the topology. Interactions store the ids of the
//! systems they link; the topology keeps the reverse adjacency so that both
//! directions are walked without owning references.
//!
//! Index set 0 always holds every interaction. Higher sets are recomputed by
//! the simulation from the current outputs.

use crate::ds::DynamicalSystem;
use crate::error::{Error, Result};
use crate::interaction::Interaction;
use crate::osi::OsiWorkspace;
use crate::relation::LinkedState;
use crate::types::{DsId, InteractionId, Vector};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A dynamical system with its integrator binding and integrator workspace.
#[derive(Debug)]
pub struct DsNode {
    pub ds: DynamicalSystem,
    pub(crate) integrator: Option<usize>,
    pub(crate) workspace: OsiWorkspace,
}

/// One entry of the topology change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    DsAdded(DsId),
    DsRemoved(DsId),
    InteractionAdded(InteractionId),
    InteractionRemoved(InteractionId),
}

#[derive(Debug, Default)]
pub struct Topology {
    next_ds: u32,
    next_interaction: u32,
    pub(crate) systems: BTreeMap<DsId, DsNode>,
    pub(crate) interactions: BTreeMap<InteractionId, Interaction>,
    ds_links: BTreeMap<DsId, BTreeSet<InteractionId>>,
    index_sets: Vec<BTreeSet<InteractionId>>,
    change_log: Vec<Change>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            index_sets: vec![BTreeSet::new()],
            ..Default::default()
        }
    }

    /// Add a dynamical system and return its handle.
    pub fn insert_dynamical_system(&mut self, ds: impl Into<DynamicalSystem>) -> DsId {
        let id = DsId(self.next_ds);
        self.next_ds += 1;
        self.systems.insert(
            id,
            DsNode {
                ds: ds.into(),
                integrator: None,
                workspace: OsiWorkspace::new(),
            },
        );
        self.ds_links.insert(id, BTreeSet::new());
        self.change_log.push(Change::DsAdded(id));
        debug!(%id, "dynamical system inserted");
        id
    }

    /// Remove a system that no interaction links anymore.
    pub fn remove_dynamical_system(&mut self, id: DsId) -> Result<DynamicalSystem> {
        if self.ds_links.get(&id).is_some_and(|links| !links.is_empty()) {
            return Err(Error::InvalidConfiguration(format!("{} is still linked by interactions", id)));
        }
        let node = self.systems.remove(&id).ok_or_else(|| Error::InvalidHandle(id.to_string()))?;
        self.ds_links.remove(&id);
        self.change_log.push(Change::DsRemoved(id));
        Ok(node.ds)
    }

    /// Link one or two systems through an interaction.
    pub fn link(&mut self, interaction: Interaction, ds1: DsId, ds2: Option<DsId>) -> Result<InteractionId> {
        let mut linked = vec![ds1];
        if let Some(ds2) = ds2 {
            if ds2 == ds1 {
                return Err(Error::InvalidConfiguration(format!("interaction links {} to itself", ds1)));
            }
            linked.push(ds2);
        }
        for ds in &linked {
            if !self.systems.contains_key(ds) {
                return Err(Error::InvalidHandle(ds.to_string()));
            }
        }

        let id = InteractionId(self.next_interaction);
        self.next_interaction += 1;
        let mut interaction = interaction;
        interaction.linked = linked.clone();
        for ds in linked {
            self.ds_links.entry(ds).or_default().insert(id);
        }
        self.interactions.insert(id, interaction);
        self.index_sets[0].insert(id);
        self.change_log.push(Change::InteractionAdded(id));
        debug!(%id, "interaction linked");
        Ok(id)
    }

    /// Remove an interaction from the graph and every index set.
    pub fn unlink(&mut self, id: InteractionId) -> Result<Interaction> {
        let interaction = self
            .interactions
            .remove(&id)
            .ok_or_else(|| Error::InvalidHandle(id.to_string()))?;
        for ds in &interaction.linked {
            if let Some(links) = self.ds_links.get_mut(ds) {
                links.remove(&id);
            }
        }
        for set in &mut self.index_sets {
            set.remove(&id);
        }
        self.change_log.push(Change::InteractionRemoved(id));
        Ok(interaction)
    }

    pub fn ds(&self, id: DsId) -> Result<&DynamicalSystem> {
        self.systems
            .get(&id)
            .map(|node| &node.ds)
            .ok_or_else(|| Error::InvalidHandle(id.to_string()))
    }

    pub fn ds_mut(&mut self, id: DsId) -> Result<&mut DynamicalSystem> {
        self.systems
            .get_mut(&id)
            .map(|node| &mut node.ds)
            .ok_or_else(|| Error::InvalidHandle(id.to_string()))
    }

    pub(crate) fn node(&self, id: DsId) -> Result<&DsNode> {
        self.systems.get(&id).ok_or_else(|| Error::InvalidHandle(id.to_string()))
    }

    pub(crate) fn node_mut(&mut self, id: DsId) -> Result<&mut DsNode> {
        self.systems.get_mut(&id).ok_or_else(|| Error::InvalidHandle(id.to_string()))
    }

    pub fn interaction(&self, id: InteractionId) -> Result<&Interaction> {
        self.interactions.get(&id).ok_or_else(|| Error::InvalidHandle(id.to_string()))
    }

    pub fn interaction_mut(&mut self, id: InteractionId) -> Result<&mut Interaction> {
        self.interactions.get_mut(&id).ok_or_else(|| Error::InvalidHandle(id.to_string()))
    }

    pub fn ds_ids(&self) -> Vec<DsId> {
        self.systems.keys().copied().collect()
    }

    pub fn interaction_ids(&self) -> Vec<InteractionId> {
        self.interactions.keys().copied().collect()
    }

    pub fn number_of_ds(&self) -> usize {
        self.systems.len()
    }

    pub fn number_of_interactions(&self) -> usize {
        self.interactions.len()
    }

    /// Interactions touching system `id`.
    pub fn interactions_of(&self, id: DsId) -> Vec<InteractionId> {
        self.ds_links
            .get(&id)
            .map(|links| links.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn number_of_index_sets(&self) -> usize {
        self.index_sets.len()
    }

    /// Interactions of index set `level` (empty when the level does not exist).
    pub fn index_set(&self, level: usize) -> Vec<InteractionId> {
        self.index_sets
            .get(level)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_in_index_set(&self, level: usize, id: InteractionId) -> bool {
        self.index_sets.get(level).is_some_and(|set| set.contains(&id))
    }

    /// Make sure index sets 0..count exist.
    pub(crate) fn ensure_index_sets(&mut self, count: usize) {
        while self.index_sets.len() < count.max(1) {
            self.index_sets.push(BTreeSet::new());
        }
    }

    pub(crate) fn insert_in_index_set(&mut self, level: usize, id: InteractionId) {
        if level > 0 {
            self.ensure_index_sets(level + 1);
            self.index_sets[level].insert(id);
        }
    }

    pub(crate) fn remove_from_index_set(&mut self, level: usize, id: InteractionId) {
        if level > 0 {
            if let Some(set) = self.index_sets.get_mut(level) {
                set.remove(&id);
            }
        }
    }

    /// Entries recorded since the topology was created or last cleared.
    pub fn change_log(&self) -> &[Change] {
        &self.change_log
    }

    /// Drop the first `upto` change log entries.
    pub(crate) fn clear_change_log(&mut self, upto: usize) {
        let upto = upto.min(self.change_log.len());
        self.change_log.drain(..upto);
    }

    /// Restart handle numbering from zero. Only allowed on an empty topology.
    pub fn reset_ids(&mut self) -> Result<()> {
        if !self.systems.is_empty() || !self.interactions.is_empty() {
            return Err(Error::InvalidConfiguration("cannot reset ids of a non-empty topology".into()));
        }
        self.next_ds = 0;
        self.next_interaction = 0;
        Ok(())
    }

    /// Concatenated state of the systems linked by `id`.
    pub(crate) fn linked_state(&self, id: InteractionId) -> Result<LinkedState> {
        let interaction = self.interaction(id)?;
        let systems = interaction
            .linked
            .iter()
            .map(|ds| self.ds(*ds))
            .collect::<Result<Vec<_>>>()?;
        interaction.gather(&systems)
    }

    /// Offsets of each linked system inside the interaction's concatenated coordinates.
    pub(crate) fn coordinate_offsets(&self, id: InteractionId) -> Result<Vec<(DsId, usize, usize)>> {
        let interaction = self.interaction(id)?;
        let mut offset = 0;
        let mut out = Vec::with_capacity(interaction.linked.len());
        for ds in &interaction.linked {
            let size = self.ds(*ds)?.coordinate_size();
            out.push((*ds, offset, size));
            offset += size;
        }
        Ok(out)
    }

    /// Add the concatenated `input` of interaction `id` into its systems' input at `level`.
    pub(crate) fn scatter_input(&mut self, id: InteractionId, level: usize, input: &Vector) -> Result<()> {
        for (ds, offset, size) in self.coordinate_offsets(id)? {
            let target = self.ds_mut(ds)?.input_mut(level);
            if target.len() != size {
                return Err(Error::size(format!("{} input at level {}", ds, level), size, target.len()));
            }
            *target += input.rows(offset, size);
        }
        Ok(())
    }

    /// Compute the outputs of `id` for levels `from..=to`.
    pub(crate) fn update_output(&mut self, id: InteractionId, time: f64, from: usize, to: usize) -> Result<()> {
        let state = self.linked_state(id)?;
        let interaction = self.interaction_mut(id)?;
        for level in from..=to {
            interaction.compute_output(time, level, &state).map_err(|e| match e {
                Error::NonFinite(msg) => Error::NonFinite(format!("{}: {}", id, msg)),
                other => other,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds::{LagrangianLinearTiDs, MassMatrix};
    use crate::nslaw::NonSmoothLaw;
    use crate::relation::LagrangianLinearR;
    use crate::types::Matrix;

    fn ball() -> LagrangianLinearTiDs {
        LagrangianLinearTiDs::new(Vector::from_element(1, 1.0), Vector::zeros(1), MassMatrix::Dense(Matrix::identity(1, 1)))
            .unwrap()
    }

    fn contact() -> Interaction {
        Interaction::new(LagrangianLinearR::new(Matrix::identity(1, 1)), NonSmoothLaw::newton_impact(1, 0.5).unwrap())
            .unwrap()
    }

    #[test]
    fn test_link_and_index_set_zero() {
        let mut topo = Topology::new();
        let ds = topo.insert_dynamical_system(ball());
        let inter = topo.link(contact(), ds, None).unwrap();
        assert_eq!(topo.index_set(0), vec![inter]);
        assert_eq!(topo.interactions_of(ds), vec![inter]);
        assert_eq!(
            topo.change_log(),
            &[Change::DsAdded(ds), Change::InteractionAdded(inter)]
        );
    }

    #[test]
    fn test_unlink_removes_from_all_sets() {
        let mut topo = Topology::new();
        let ds = topo.insert_dynamical_system(ball());
        let inter = topo.link(contact(), ds, None).unwrap();
        topo.insert_in_index_set(1, inter);
        assert!(topo.is_in_index_set(1, inter));

        topo.unlink(inter).unwrap();
        assert!(!topo.is_in_index_set(0, inter));
        assert!(!topo.is_in_index_set(1, inter));
        assert!(topo.interaction(inter).is_err());
    }

    #[test]
    fn test_link_unknown_ds_fails() {
        let mut topo = Topology::new();
        assert!(matches!(topo.link(contact(), DsId(42), None), Err(Error::InvalidHandle(_))));
    }

    #[test]
    fn test_remove_linked_ds_fails() {
        let mut topo = Topology::new();
        let ds = topo.insert_dynamical_system(ball());
        let inter = topo.link(contact(), ds, None).unwrap();
        assert!(topo.remove_dynamical_system(ds).is_err());
        topo.unlink(inter).unwrap();
        assert!(topo.remove_dynamical_system(ds).is_ok());
    }

    #[test]
    fn test_reset_ids_only_when_empty() {
        let mut topo = Topology::new();
        let ds = topo.insert_dynamical_system(ball());
        assert!(topo.reset_ids().is_err());
        topo.remove_dynamical_system(ds).unwrap();
        topo.reset_ids().unwrap();
        assert_eq!(topo.insert_dynamical_system(ball()), DsId(0));
    }

    #[test]
    fn test_scatter_input_splits_between_systems() {
        let mut topo = Topology::new();
        let a = topo.insert_dynamical_system(ball());
        let b = topo.insert_dynamical_system(ball());
        let relation = LagrangianLinearR::new(Matrix::from_row_slice(1, 2, &[1.0, -1.0]));
        let inter = topo
            .link(Interaction::new(relation, NonSmoothLaw::complementarity(1)).unwrap(), a, Some(b))
            .unwrap();
        topo.scatter_input(inter, 1, &Vector::from_vec(vec![2.0, -2.0])).unwrap();
        assert_eq!(topo.ds(a).unwrap().input(1)[0], 2.0);
        assert_eq!(topo.ds(b).unwrap().input(1)[0], -2.0);
    }

    #[test]
    fn test_change_log_clear() {
        let mut topo = Topology::new();
        topo.insert_dynamical_system(ball());
        let second = topo.insert_dynamical_system(ball());
        topo.clear_change_log(1);
        assert_eq!(topo.change_log(), &[Change::DsAdded(second)]);
    }
}
