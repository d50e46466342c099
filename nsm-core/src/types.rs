//! Core data types shared across the simulation.
//!
//! This module defines:
//! - Vector/matrix aliases over nalgebra's dynamic types
//! - Stable handles for dynamical systems and interactions
//! - Output/input level ranges used by integrators and interactions

use nalgebra::{DMatrix, DVector};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Dense column vector.
pub type Vector = DVector<f64>;

/// Dense column-major matrix.
pub type Matrix = DMatrix<f64>;

/// Handle of a dynamical system inside a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DsId(pub u32);

/// Handle of an interaction inside a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InteractionId(pub u32);

impl fmt::Display for DsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ds#{}", self.0)
    }
}

impl fmt::Display for InteractionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interaction#{}", self.0)
    }
}

/// Derivative levels of y and λ an integrator works with.
///
/// Level 0 is position, 1 velocity (or impulse), 2 acceleration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Levels {
    pub min_output: usize,
    pub max_output: usize,
    pub min_input: usize,
    pub max_input: usize,
}

impl Levels {
    pub const fn new(min_output: usize, max_output: usize, min_input: usize, max_input: usize) -> Self {
        Self {
            min_output,
            max_output,
            min_input,
            max_input,
        }
    }

    /// Number of index sets needed to classify interactions at these levels.
    pub fn number_of_index_sets(&self) -> usize {
        self.max_output + 1
    }

    /// Smallest range covering both `self` and `other`.
    pub fn union(&self, other: &Levels) -> Levels {
        Levels {
            min_output: self.min_output.min(other.min_output),
            max_output: self.max_output.max(other.max_output),
            min_input: self.min_input.min(other.min_input),
            max_input: self.max_input.max(other.max_input),
        }
    }
}

/// True if every entry of the vector is finite.
pub fn all_finite(v: &Vector) -> bool {
    v.iter().all(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_union() {
        let a = Levels::new(0, 1, 1, 1);
        let b = Levels::new(0, 2, 1, 2);
        let u = a.union(&b);
        assert_eq!(u, Levels::new(0, 2, 1, 2));
        assert_eq!(u.number_of_index_sets(), 3);
    }

    #[test]
    fn test_handles_display() {
        assert_eq!(DsId(4).to_string(), "ds#4");
        assert_eq!(InteractionId(2).to_string(), "interaction#2");
    }

    #[test]
    fn test_all_finite() {
        assert!(all_finite(&Vector::from_vec(vec![1.0, -2.0])));
        assert!(!all_finite(&Vector::from_vec(vec![1.0, f64::NAN])));
    }
}
