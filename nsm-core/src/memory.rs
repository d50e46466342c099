//! Bounded history of state vectors.
//!
//! Dynamical systems push their current state here at the end of every step.
//! Index 0 is always the most recent entry.

use crate::types::Vector;
use std::collections::VecDeque;
use tracing::warn;

/// Ring buffer of previous vectors with a fixed capacity.
#[derive(Debug, Clone, Default)]
pub struct StateMemory {
    capacity: usize,
    size: usize,
    entries: VecDeque<Vector>,
}

impl StateMemory {
    /// Create a memory holding at most `capacity` vectors of length `size`.
    ///
    /// A zero capacity is accepted: the memory silently drops everything.
    pub fn new(capacity: usize, size: usize) -> Self {
        if capacity == 0 {
            warn!("state memory created with zero capacity, history will not be kept");
        }
        Self {
            capacity,
            size,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Push a copy of `v`, evicting the oldest entry when full.
    pub fn swap(&mut self, v: &Vector) {
        if self.capacity == 0 {
            return;
        }
        debug_assert_eq!(v.len(), self.size, "memory entry size mismatch");
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(v.clone());
    }

    /// Entry `k` steps back (0 = most recent).
    pub fn get(&self, k: usize) -> Option<&Vector> {
        self.entries.get(k)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Vector length of the entries.
    pub fn vector_size(&self) -> usize {
        self.size
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
