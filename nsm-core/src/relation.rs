//! Relations: the output map y = h(x, λ, t, z) and input map r = g(λ, ...)
//! linking an interaction to the states of one or two dynamical systems.
//!
//! Integrators work with a linearization of the relation around the current
//! iterate ([`RelationJacobians`]):
//!
//! ```text
//! y ≈ C·x + D·λ + output_offset        (first-order, level 0)
//! ẏ ≈ H·v + output_offset              (Lagrangian, level 1)
//! r ≈ B·λ + input_offset               (B = Hᵀ for Lagrangian relations)
//! ```
//!
//! # Callback state layout
//!
//! | Relation               | state slice passed to callbacks |
//! |------------------------|---------------------------------|
//! | `FirstOrderNonLinear`  | `[x; λ]`                        |
//! | `LagrangianScleronomous` | `q`                           |
//! | `LagrangianRheonomous` | `q` (time is the first argument) |
//!
//! Matrix outputs are column-major.

use crate::error::{Error, Result};
use crate::plugin::{Callback, PluginRegistry};
use crate::types::{Matrix, Vector};

/// Concatenated state of the systems linked by one interaction.
#[derive(Debug, Clone)]
pub struct LinkedState {
    /// x for first-order systems, q for Lagrangian systems.
    pub x: Vector,
    /// Velocities (Lagrangian only).
    pub v: Option<Vector>,
    /// Accelerations (Lagrangian only).
    pub acceleration: Option<Vector>,
    pub z: Vector,
}

/// Linearization of a relation around the current iterate.
#[derive(Debug, Clone)]
pub struct RelationJacobians {
    /// ∂y/∂x (first-order) or H = ∂h/∂q (Lagrangian), `size × coordinates`.
    pub output: Matrix,
    /// ∂y/∂λ, first-order relations only.
    pub feedthrough: Option<Matrix>,
    /// ∂r/∂λ, `coordinates × size`.
    pub input: Matrix,
    pub output_offset: Vector,
    pub input_offset: Vector,
}

/// y = C·x + D·λ + F·z + e, r = B·λ
#[derive(Clone)]
pub struct FirstOrderLinearR {
    c: Matrix,
    d: Option<Matrix>,
    f: Option<Matrix>,
    e: Option<Vector>,
    b: Matrix,
    c_plugin: Option<Callback>,
    b_plugin: Option<Callback>,
}

impl FirstOrderLinearR {
    /// Time-invariant relation with output matrix C and input matrix B.
    pub fn new(c: Matrix, b: Matrix) -> Result<Self> {
        if b.ncols() != c.nrows() {
            return Err(Error::size("first-order linear relation: B columns vs C rows", c.nrows(), b.ncols()));
        }
        if b.nrows() != c.ncols() {
            return Err(Error::size("first-order linear relation: B rows vs C columns", c.ncols(), b.nrows()));
        }
        Ok(Self {
            c,
            d: None,
            f: None,
            e: None,
            b,
            c_plugin: None,
            b_plugin: None,
        })
    }

    /// Relation whose C(t) and/or B(t) are evaluated through callbacks.
    /// `c` and `b` give the sizes and the values used before the first update.
    pub fn plugged(c: Matrix, b: Matrix, registry: &PluginRegistry, c_name: Option<&str>, b_name: Option<&str>) -> Result<Self> {
        let mut relation = Self::new(c, b)?;
        relation.c_plugin = c_name.map(|name| registry.matrix(name)).transpose()?;
        relation.b_plugin = b_name.map(|name| registry.matrix(name)).transpose()?;
        Ok(relation)
    }

    pub fn with_d(mut self, d: Matrix) -> Result<Self> {
        let m = self.c.nrows();
        if d.nrows() != m || d.ncols() != m {
            return Err(Error::size("first-order linear relation: D", m, d.nrows().max(d.ncols())));
        }
        self.d = Some(d);
        Ok(self)
    }

    pub fn with_e(mut self, e: Vector) -> Result<Self> {
        if e.len() != self.c.nrows() {
            return Err(Error::size("first-order linear relation: e", self.c.nrows(), e.len()));
        }
        self.e = Some(e);
        Ok(self)
    }

    pub fn with_f(mut self, f: Matrix) -> Result<Self> {
        if f.nrows() != self.c.nrows() {
            return Err(Error::size("first-order linear relation: F rows", self.c.nrows(), f.nrows()));
        }
        self.f = Some(f);
        Ok(self)
    }

    fn update(&mut self, time: f64, state: &LinkedState) {
        if let Some(plugin) = &self.c_plugin {
            plugin(time, state.x.as_slice(), self.c.as_mut_slice(), state.z.as_slice());
        }
        if let Some(plugin) = &self.b_plugin {
            plugin(time, state.x.as_slice(), self.b.as_mut_slice(), state.z.as_slice());
        }
    }

    fn offset(&self, z: &Vector) -> Vector {
        let mut offset = self.e.clone().unwrap_or_else(|| Vector::zeros(self.c.nrows()));
        if let Some(f) = &self.f {
            if f.ncols() == z.len() {
                offset.gemv(1.0, f, z, 1.0);
            }
        }
        offset
    }
}

/// y = h(t, x, λ, z), r = g(t, λ, z), with optional analytic Jacobians.
#[derive(Clone)]
pub struct FirstOrderNonLinearR {
    size: usize,
    h: Callback,
    g: Callback,
    jacobian_h_x: Option<Callback>,
    jacobian_h_lambda: Option<Callback>,
    jacobian_g_lambda: Option<Callback>,
}

/// Callback names for a [`FirstOrderNonLinearR`].
#[derive(Debug, Clone, Default)]
pub struct NonLinearRelationPlugins<'a> {
    pub h: &'a str,
    pub g: &'a str,
    pub jacobian_h_x: Option<&'a str>,
    pub jacobian_h_lambda: Option<&'a str>,
    pub jacobian_g_lambda: Option<&'a str>,
}

impl FirstOrderNonLinearR {
    pub fn new(size: usize, registry: &PluginRegistry, plugins: &NonLinearRelationPlugins<'_>) -> Result<Self> {
        Ok(Self {
            size,
            h: registry.vector(plugins.h)?,
            g: registry.vector(plugins.g)?,
            jacobian_h_x: plugins.jacobian_h_x.map(|n| registry.matrix(n)).transpose()?,
            jacobian_h_lambda: plugins.jacobian_h_lambda.map(|n| registry.matrix(n)).transpose()?,
            jacobian_g_lambda: plugins.jacobian_g_lambda.map(|n| registry.matrix(n)).transpose()?,
        })
    }

    fn stacked(x: &Vector, lambda: &Vector) -> Vec<f64> {
        let mut s = Vec::with_capacity(x.len() + lambda.len());
        s.extend_from_slice(x.as_slice());
        s.extend_from_slice(lambda.as_slice());
        s
    }

    fn h(&self, time: f64, x: &Vector, lambda: &Vector, z: &Vector) -> Vector {
        let mut out = Vector::zeros(self.size);
        (self.h)(time, &Self::stacked(x, lambda), out.as_mut_slice(), z.as_slice());
        out
    }

    fn g(&self, time: f64, x: &Vector, lambda: &Vector, z: &Vector) -> Vector {
        let mut out = Vector::zeros(x.len());
        (self.g)(time, &Self::stacked(x, lambda), out.as_mut_slice(), z.as_slice());
        out
    }

    fn jacobian(
        &self,
        analytic: &Option<Callback>,
        rows: usize,
        cols: usize,
        eval: impl Fn(&Vector) -> Vector,
        at: &Vector,
        time: f64,
        stacked: &[f64],
        z: &Vector,
    ) -> Matrix {
        match analytic {
            Some(jac) => {
                let mut out = Matrix::zeros(rows, cols);
                jac(time, stacked, out.as_mut_slice(), z.as_slice());
                out
            }
            None => {
                let f0 = eval(at);
                let mut out = Matrix::zeros(rows, cols);
                let mut xp = at.clone();
                for j in 0..cols {
                    let step = f64::EPSILON.sqrt() * at[j].abs().max(1.0);
                    xp[j] = at[j] + step;
                    out.set_column(j, &((eval(&xp) - &f0) / step));
                    xp[j] = at[j];
                }
                out
            }
        }
    }
}

/// y = H·q + F·z + b, p = Hᵀ·λ
#[derive(Debug, Clone)]
pub struct LagrangianLinearR {
    h: Matrix,
    b: Option<Vector>,
    f: Option<Matrix>,
}

impl LagrangianLinearR {
    pub fn new(h: Matrix) -> Self {
        Self { h, b: None, f: None }
    }

    pub fn with_b(mut self, b: Vector) -> Result<Self> {
        if b.len() != self.h.nrows() {
            return Err(Error::size("Lagrangian linear relation: b", self.h.nrows(), b.len()));
        }
        self.b = Some(b);
        Ok(self)
    }

    pub fn with_f(mut self, f: Matrix) -> Result<Self> {
        if f.nrows() != self.h.nrows() {
            return Err(Error::size("Lagrangian linear relation: F rows", self.h.nrows(), f.nrows()));
        }
        self.f = Some(f);
        Ok(self)
    }

    pub fn h(&self) -> &Matrix {
        &self.h
    }
}

/// y = h(q, z), ẏ = G(q)·v, p = G(q)ᵀ·λ
#[derive(Clone)]
pub struct LagrangianScleronomousR {
    size: usize,
    h: Callback,
    jacobian: Callback,
    dot_jacobian: Option<Callback>,
}

impl LagrangianScleronomousR {
    pub fn new(size: usize, registry: &PluginRegistry, h: &str, jacobian: &str, dot_jacobian: Option<&str>) -> Result<Self> {
        Ok(Self {
            size,
            h: registry.vector(h)?,
            jacobian: registry.matrix(jacobian)?,
            dot_jacobian: dot_jacobian.map(|n| registry.matrix(n)).transpose()?,
        })
    }
}

/// y = h(q, t, z), ẏ = G(q, t)·v + ∂h/∂t, p = G(q, t)ᵀ·λ
#[derive(Clone)]
pub struct LagrangianRheonomousR {
    size: usize,
    h: Callback,
    jacobian: Callback,
    h_dot: Callback,
}

impl LagrangianRheonomousR {
    pub fn new(size: usize, registry: &PluginRegistry, h: &str, jacobian: &str, h_dot: &str) -> Result<Self> {
        Ok(Self {
            size,
            h: registry.vector(h)?,
            jacobian: registry.matrix(jacobian)?,
            h_dot: registry.vector(h_dot)?,
        })
    }
}

/// A relation of one of the supported families.
#[derive(Clone)]
pub enum Relation {
    FirstOrderLinear(FirstOrderLinearR),
    FirstOrderNonLinear(FirstOrderNonLinearR),
    LagrangianLinear(LagrangianLinearR),
    LagrangianScleronomous(LagrangianScleronomousR),
    LagrangianRheonomous(LagrangianRheonomousR),
}

impl From<FirstOrderLinearR> for Relation {
    fn from(r: FirstOrderLinearR) -> Self {
        Relation::FirstOrderLinear(r)
    }
}

impl From<FirstOrderNonLinearR> for Relation {
    fn from(r: FirstOrderNonLinearR) -> Self {
        Relation::FirstOrderNonLinear(r)
    }
}

impl From<LagrangianLinearR> for Relation {
    fn from(r: LagrangianLinearR) -> Self {
        Relation::LagrangianLinear(r)
    }
}

impl From<LagrangianScleronomousR> for Relation {
    fn from(r: LagrangianScleronomousR) -> Self {
        Relation::LagrangianScleronomous(r)
    }
}

impl From<LagrangianRheonomousR> for Relation {
    fn from(r: LagrangianRheonomousR) -> Self {
        Relation::LagrangianRheonomous(r)
    }
}

fn eval_q(f: &Callback, rows: usize, time: f64, q: &Vector, z: &Vector) -> Vector {
    let mut out = Vector::zeros(rows);
    f(time, q.as_slice(), out.as_mut_slice(), z.as_slice());
    out
}

fn eval_q_matrix(f: &Callback, rows: usize, cols: usize, time: f64, q: &Vector, z: &Vector) -> Matrix {
    let mut out = Matrix::zeros(rows, cols);
    f(time, q.as_slice(), out.as_mut_slice(), z.as_slice());
    out
}

fn velocities(state: &LinkedState) -> Result<&Vector> {
    state
        .v
        .as_ref()
        .ok_or_else(|| Error::InvalidConfiguration("Lagrangian relation linked to a system without velocities".into()))
}

impl Relation {
    pub fn kind(&self) -> &'static str {
        match self {
            Relation::FirstOrderLinear(_) => "FirstOrderLinearR",
            Relation::FirstOrderNonLinear(_) => "FirstOrderNonLinearR",
            Relation::LagrangianLinear(_) => "LagrangianLinearR",
            Relation::LagrangianScleronomous(_) => "LagrangianScleronomousR",
            Relation::LagrangianRheonomous(_) => "LagrangianRheonomousR",
        }
    }

    pub fn is_lagrangian(&self) -> bool {
        !matches!(self, Relation::FirstOrderLinear(_) | Relation::FirstOrderNonLinear(_))
    }

    /// True when the linearization never changes.
    pub fn is_linear(&self) -> bool {
        match self {
            Relation::FirstOrderLinear(r) => r.c_plugin.is_none() && r.b_plugin.is_none(),
            Relation::LagrangianLinear(_) => true,
            _ => false,
        }
    }

    /// Number of rows of y.
    pub fn output_size(&self) -> usize {
        match self {
            Relation::FirstOrderLinear(r) => r.c.nrows(),
            Relation::FirstOrderNonLinear(r) => r.size,
            Relation::LagrangianLinear(r) => r.h.nrows(),
            Relation::LagrangianScleronomous(r) => r.size,
            Relation::LagrangianRheonomous(r) => r.size,
        }
    }

    /// Check the relation against the total coordinate size of its systems.
    pub fn check_coordinates(&self, coordinates: usize) -> Result<()> {
        let found = match self {
            Relation::FirstOrderLinear(r) => r.c.ncols(),
            Relation::LagrangianLinear(r) => r.h.ncols(),
            _ => return Ok(()),
        };
        if found != coordinates {
            return Err(Error::size(format!("{} columns", self.kind()), coordinates, found));
        }
        Ok(())
    }

    /// Output y at derivative `level`, given the level-0 multiplier λ
    /// (used only by first-order feedthrough terms).
    pub fn compute_output(&mut self, time: f64, level: usize, state: &LinkedState, lambda: &Vector) -> Result<Vector> {
        let m = self.output_size();
        let y = match self {
            Relation::FirstOrderLinear(r) => {
                r.update(time, state);
                let mut y = r.offset(&state.z);
                y.gemv(1.0, &r.c, &state.x, 1.0);
                if let Some(d) = &r.d {
                    y.gemv(1.0, d, lambda, 1.0);
                }
                y
            }
            Relation::FirstOrderNonLinear(r) => r.h(time, &state.x, lambda, &state.z),
            Relation::LagrangianLinear(r) => match level {
                0 => {
                    let mut y = r.b.clone().unwrap_or_else(|| Vector::zeros(m));
                    if let Some(f) = &r.f {
                        if f.ncols() == state.z.len() {
                            y.gemv(1.0, f, &state.z, 1.0);
                        }
                    }
                    y.gemv(1.0, &r.h, &state.x, 1.0);
                    y
                }
                1 => &r.h * velocities(state)?,
                _ => match &state.acceleration {
                    Some(a) => &r.h * a,
                    None => Vector::zeros(m),
                },
            },
            Relation::LagrangianScleronomous(r) => {
                let n = state.x.len();
                match level {
                    0 => eval_q(&r.h, m, time, &state.x, &state.z),
                    1 => eval_q_matrix(&r.jacobian, m, n, time, &state.x, &state.z) * velocities(state)?,
                    _ => {
                        let g = eval_q_matrix(&r.jacobian, m, n, time, &state.x, &state.z);
                        let v = velocities(state)?;
                        let mut y = match &state.acceleration {
                            Some(a) => g * a,
                            None => Vector::zeros(m),
                        };
                        if let Some(dot) = &r.dot_jacobian {
                            y += eval_q_matrix(dot, m, n, time, &state.x, &state.z) * v;
                        }
                        y
                    }
                }
            }
            Relation::LagrangianRheonomous(r) => {
                let n = state.x.len();
                match level {
                    0 => eval_q(&r.h, m, time, &state.x, &state.z),
                    1 => {
                        eval_q_matrix(&r.jacobian, m, n, time, &state.x, &state.z) * velocities(state)?
                            + eval_q(&r.h_dot, m, time, &state.x, &state.z)
                    }
                    _ => match &state.acceleration {
                        Some(a) => eval_q_matrix(&r.jacobian, m, n, time, &state.x, &state.z) * a,
                        None => Vector::zeros(m),
                    },
                }
            }
        };
        if y.len() != m {
            return Err(Error::size(format!("{} output", self.kind()), m, y.len()));
        }
        Ok(y)
    }

    /// Linearization around (state, λ) at the level the integrators solve for:
    /// position level for first-order relations, velocity level for Lagrangian ones.
    pub fn jacobians(&mut self, time: f64, state: &LinkedState, lambda: &Vector) -> Result<RelationJacobians> {
        let m = self.output_size();
        let n = state.x.len();
        let jac = match self {
            Relation::FirstOrderLinear(r) => {
                r.update(time, state);
                RelationJacobians {
                    output: r.c.clone(),
                    feedthrough: r.d.clone(),
                    input: r.b.clone(),
                    output_offset: r.offset(&state.z),
                    input_offset: Vector::zeros(n),
                }
            }
            Relation::FirstOrderNonLinear(r) => {
                let stacked = FirstOrderNonLinearR::stacked(&state.x, lambda);
                let (x, z) = (&state.x, &state.z);
                let c = r.jacobian(&r.jacobian_h_x, m, n, |xx| r.h(time, xx, lambda, z), x, time, &stacked, z);
                let d = r.jacobian(&r.jacobian_h_lambda, m, m, |ll| r.h(time, x, ll, z), lambda, time, &stacked, z);
                let b = r.jacobian(&r.jacobian_g_lambda, n, m, |ll| r.g(time, x, ll, z), lambda, time, &stacked, z);
                let output_offset = r.h(time, x, lambda, z) - &c * x - &d * lambda;
                let input_offset = r.g(time, x, lambda, z) - &b * lambda;
                RelationJacobians {
                    output: c,
                    feedthrough: Some(d),
                    input: b,
                    output_offset,
                    input_offset,
                }
            }
            Relation::LagrangianLinear(r) => RelationJacobians {
                output: r.h.clone(),
                feedthrough: None,
                input: r.h.transpose(),
                output_offset: Vector::zeros(m),
                input_offset: Vector::zeros(n),
            },
            Relation::LagrangianScleronomous(r) => {
                let g = eval_q_matrix(&r.jacobian, m, n, time, &state.x, &state.z);
                RelationJacobians {
                    input: g.transpose(),
                    output: g,
                    feedthrough: None,
                    output_offset: Vector::zeros(m),
                    input_offset: Vector::zeros(n),
                }
            }
            Relation::LagrangianRheonomous(r) => {
                let g = eval_q_matrix(&r.jacobian, m, n, time, &state.x, &state.z);
                RelationJacobians {
                    input: g.transpose(),
                    output: g,
                    feedthrough: None,
                    output_offset: eval_q(&r.h_dot, m, time, &state.x, &state.z),
                    input_offset: Vector::zeros(n),
                }
            }
        };
        if jac.output.nrows() != m || jac.output.ncols() != n {
            return Err(Error::size(format!("{} output Jacobian columns", self.kind()), n, jac.output.ncols()));
        }
        Ok(jac)
    }

    /// Non-smooth input r (or p) produced by λ, over the concatenated coordinates.
    pub fn compute_input(&mut self, time: f64, state: &LinkedState, lambda: &Vector) -> Result<Vector> {
        let m = self.output_size();
        let n = state.x.len();
        let r = match self {
            Relation::FirstOrderLinear(r) => {
                r.update(time, state);
                &r.b * lambda
            }
            Relation::FirstOrderNonLinear(r) => r.g(time, &state.x, lambda, &state.z),
            Relation::LagrangianLinear(r) => r.h.tr_mul(lambda),
            Relation::LagrangianScleronomous(r) => {
                eval_q_matrix(&r.jacobian, m, n, time, &state.x, &state.z).tr_mul(lambda)
            }
            Relation::LagrangianRheonomous(r) => {
                eval_q_matrix(&r.jacobian, m, n, time, &state.x, &state.z).tr_mul(lambda)
            }
        };
        Ok(r)
    }
}
