//! Non-smooth laws relating an interaction's output y to its multiplier λ.

use crate::error::{Error, Result};
use crate::types::{Matrix, Vector};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The closed set of supported non-smooth laws.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NonSmoothLaw {
    /// 0 ≤ y ⊥ λ ≥ 0
    ComplementarityCondition { size: usize },
    /// y = 0, λ free
    Equality { size: usize },
    /// Newton impact: 0 ≤ ẏ⁺ + e·ẏ⁻ ⊥ λ ≥ 0
    NewtonImpact { size: usize, e: f64 },
    /// Newton impact in the normal direction plus Coulomb friction.
    /// `dimension` is 2 (one tangent) or 3 (two tangents).
    NewtonImpactFriction { dimension: usize, en: f64, et: f64, mu: f64 },
    /// −y ∈ N_[lb, ub](λ)
    Relay { lb: Vector, ub: Vector },
    /// −y ∈ N_K(λ), K = {λ : H·λ ≥ k}
    NormalCone { h: Matrix, k: Vector },
}

impl NonSmoothLaw {
    /// Complementarity law of the given size.
    pub fn complementarity(size: usize) -> Self {
        NonSmoothLaw::ComplementarityCondition { size }
    }

    /// Newton impact law with restitution coefficient `e`.
    pub fn newton_impact(size: usize, e: f64) -> Result<Self> {
        let law = NonSmoothLaw::NewtonImpact { size, e };
        law.validate()?;
        Ok(law)
    }

    /// Newton impact with Coulomb friction of coefficient `mu`.
    pub fn newton_impact_friction(dimension: usize, en: f64, et: f64, mu: f64) -> Result<Self> {
        let law = NonSmoothLaw::NewtonImpactFriction { dimension, en, et, mu };
        law.validate()?;
        Ok(law)
    }

    /// Relay law with bounds lb ≤ λ ≤ ub.
    pub fn relay(lb: Vector, ub: Vector) -> Result<Self> {
        let law = NonSmoothLaw::Relay { lb, ub };
        law.validate()?;
        Ok(law)
    }

    /// Normal cone law on the polyhedron {λ : H·λ ≥ k}.
    pub fn normal_cone(h: Matrix, k: Vector) -> Result<Self> {
        let law = NonSmoothLaw::NormalCone { h, k };
        law.validate()?;
        Ok(law)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NonSmoothLaw::ComplementarityCondition { .. } => "ComplementarityCondition",
            NonSmoothLaw::Equality { .. } => "Equality",
            NonSmoothLaw::NewtonImpact { .. } => "NewtonImpact",
            NonSmoothLaw::NewtonImpactFriction { .. } => "NewtonImpactFriction",
            NonSmoothLaw::Relay { .. } => "Relay",
            NonSmoothLaw::NormalCone { .. } => "NormalCone",
        }
    }

    /// Number of rows of λ constrained by the law.
    pub fn size(&self) -> usize {
        match self {
            NonSmoothLaw::ComplementarityCondition { size }
            | NonSmoothLaw::Equality { size }
            | NonSmoothLaw::NewtonImpact { size, .. } => *size,
            NonSmoothLaw::NewtonImpactFriction { dimension, .. } => *dimension,
            NonSmoothLaw::Relay { lb, .. } => lb.len(),
            NonSmoothLaw::NormalCone { h, .. } => h.ncols(),
        }
    }

    /// Restitution coefficient applied to the normal pre-step velocity.
    pub fn normal_restitution(&self) -> f64 {
        match self {
            NonSmoothLaw::NewtonImpact { e, .. } => *e,
            NonSmoothLaw::NewtonImpactFriction { en, .. } => *en,
            _ => 0.0,
        }
    }

    /// True for laws solved as complementarity rows (LCP / MLCP inequality part).
    pub fn is_complementarity(&self) -> bool {
        matches!(
            self,
            NonSmoothLaw::ComplementarityCondition { .. } | NonSmoothLaw::NewtonImpact { .. }
        )
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            NonSmoothLaw::ComplementarityCondition { size }
            | NonSmoothLaw::Equality { size } => {
                if *size == 0 {
                    return Err(Error::InvalidConfiguration(format!("{} law of size 0", self.kind())));
                }
            }
            NonSmoothLaw::NewtonImpact { size, e } => {
                if *size == 0 {
                    return Err(Error::InvalidConfiguration("NewtonImpact law of size 0".into()));
                }
                if !(0.0..=1.0).contains(e) {
                    return Err(Error::InvalidConfiguration(format!("restitution coefficient {} outside [0, 1]", e)));
                }
            }
            NonSmoothLaw::NewtonImpactFriction { dimension, en, et, mu } => {
                if *dimension != 2 && *dimension != 3 {
                    return Err(Error::InvalidConfiguration(format!(
                        "friction contact dimension must be 2 or 3, got {}",
                        dimension
                    )));
                }
                if !(0.0..=1.0).contains(en) || !(0.0..=1.0).contains(et) {
                    return Err(Error::InvalidConfiguration("restitution coefficients outside [0, 1]".into()));
                }
                if *mu < 0.0 || !mu.is_finite() {
                    return Err(Error::InvalidConfiguration(format!("friction coefficient {} is invalid", mu)));
                }
            }
            NonSmoothLaw::Relay { lb, ub } => {
                if lb.len() != ub.len() {
                    return Err(Error::size("relay law bounds", lb.len(), ub.len()));
                }
                if lb.iter().zip(ub.iter()).any(|(l, u)| l > u) {
                    return Err(Error::InvalidConfiguration("relay law with lb > ub".into()));
                }
            }
            NonSmoothLaw::NormalCone { h, k } => {
                if h.nrows() != k.len() {
                    return Err(Error::size("normal cone law: rows of H vs k", h.nrows(), k.len()));
                }
            }
        }
        Ok(())
    }
}
