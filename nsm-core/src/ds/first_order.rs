//! First-order dynamical systems: ẋ = f(x, t, z) + r.
//!
//! - [`FirstOrderLinearDs`]: f = A·x + b, with A and b constant (time-invariant)
//!   or supplied by registered callbacks.
//! - [`FirstOrderNonLinearDs`]: f and ∇ₓf supplied by callbacks. When no
//!   Jacobian callback is given, ∇ₓf is approximated by forward differences.

use crate::error::{Error, Result};
use crate::memory::StateMemory;
use crate::plugin::{Callback, PluginRegistry};
use crate::types::{Matrix, Vector};

/// State shared by all first-order systems.
#[derive(Debug, Clone)]
pub struct FirstOrderState {
    pub(crate) n: usize,
    pub(crate) x0: Option<Vector>,
    pub(crate) x: Vector,
    pub(crate) rhs: Vector,
    pub(crate) r: Vector,
    pub(crate) z: Vector,
    pub(crate) jacobian_rhs_x: Option<Matrix>,
    pub(crate) x_memory: StateMemory,
    pub(crate) r_memory: StateMemory,
}

impl FirstOrderState {
    fn new(x0: Vector) -> Self {
        let n = x0.len();
        Self {
            n,
            x: x0.clone(),
            x0: Some(x0),
            rhs: Vector::zeros(n),
            r: Vector::zeros(n),
            z: Vector::zeros(0),
            jacobian_rhs_x: None,
            x_memory: StateMemory::default(),
            r_memory: StateMemory::default(),
        }
    }

    fn with_dimension(n: usize) -> Self {
        Self {
            n,
            x0: None,
            x: Vector::zeros(n),
            rhs: Vector::zeros(n),
            r: Vector::zeros(n),
            z: Vector::zeros(0),
            jacobian_rhs_x: None,
            x_memory: StateMemory::default(),
            r_memory: StateMemory::default(),
        }
    }

    pub fn x(&self) -> &Vector {
        &self.x
    }

    pub fn r(&self) -> &Vector {
        &self.r
    }

    pub(crate) fn init_memory(&mut self, steps: usize) {
        if self.x_memory.capacity() == steps && self.x_memory.vector_size() == self.n {
            return;
        }
        self.x_memory = StateMemory::new(steps, self.n);
        self.r_memory = StateMemory::new(steps, self.n);
    }

    pub(crate) fn swap_in_memory(&mut self) {
        self.x_memory.swap(&self.x);
        self.r_memory.swap(&self.r);
    }

    pub(crate) fn reset_to_initial_state(&mut self) -> Result<()> {
        let x0 = self
            .x0
            .as_ref()
            .ok_or_else(|| Error::MissingData("first-order system: initial state x0 is not set".into()))?;
        self.x.copy_from(x0);
        Ok(())
    }
}

/// A term of the linear right-hand side: absent, constant or plugged.
#[derive(Clone)]
pub(crate) enum LinearTerm<T> {
    Absent,
    Constant(T),
    Plugged { function: Callback, value: T },
}

/// ẋ = A(t)·x + b(t) + r
#[derive(Clone)]
pub struct FirstOrderLinearDs {
    pub(crate) state: FirstOrderState,
    pub(crate) a: LinearTerm<Matrix>,
    pub(crate) b: LinearTerm<Vector>,
    time_invariant: bool,
}

impl FirstOrderLinearDs {
    /// Time-invariant system with constant A and optional constant b.
    pub fn time_invariant(x0: Vector, a: Matrix, b: Option<Vector>) -> Result<Self> {
        let n = x0.len();
        if a.nrows() != n || a.ncols() != n {
            return Err(Error::size("first-order linear system: A rows/cols", n, a.nrows().max(a.ncols())));
        }
        let b = match b {
            Some(b) if b.len() != n => return Err(Error::size("first-order linear system: b", n, b.len())),
            Some(b) => LinearTerm::Constant(b),
            None => LinearTerm::Absent,
        };
        Ok(Self {
            state: FirstOrderState::new(x0),
            a: LinearTerm::Constant(a),
            b,
            time_invariant: true,
        })
    }

    /// Time-varying system with A(t) and/or b(t) resolved from the registry.
    pub fn plugged(
        x0: Vector,
        registry: &PluginRegistry,
        a_name: Option<&str>,
        b_name: Option<&str>,
    ) -> Result<Self> {
        let n = x0.len();
        let a = match a_name {
            Some(name) => LinearTerm::Plugged {
                function: registry.matrix(name)?,
                value: Matrix::zeros(n, n),
            },
            None => LinearTerm::Absent,
        };
        let b = match b_name {
            Some(name) => LinearTerm::Plugged {
                function: registry.vector(name)?,
                value: Vector::zeros(n),
            },
            None => LinearTerm::Absent,
        };
        Ok(Self {
            state: FirstOrderState::new(x0),
            a,
            b,
            time_invariant: false,
        })
    }

    pub fn is_time_invariant(&self) -> bool {
        self.time_invariant
    }

    /// Current value of A (zero when absent).
    pub fn a(&self) -> Matrix {
        match &self.a {
            LinearTerm::Absent => Matrix::zeros(self.state.n, self.state.n),
            LinearTerm::Constant(a) | LinearTerm::Plugged { value: a, .. } => a.clone(),
        }
    }

    /// Replace the constant term b. A plugged b cannot be overwritten.
    pub fn set_b(&mut self, b: Vector) -> Result<()> {
        if b.len() != self.state.n {
            return Err(Error::size("first-order linear system: b", self.state.n, b.len()));
        }
        if matches!(self.b, LinearTerm::Plugged { .. }) {
            return Err(Error::InvalidConfiguration("b of this system is computed by a plugin".into()));
        }
        self.b = LinearTerm::Constant(b);
        Ok(())
    }

    pub(crate) fn update_plugins(&mut self, time: f64) {
        let n = self.state.n;
        let x = self.state.x.as_slice();
        let z = self.state.z.as_slice();
        if let LinearTerm::Plugged { function, value } = &mut self.a {
            debug_assert_eq!(value.len(), n * n);
            function(time, x, value.as_mut_slice(), z);
        }
        if let LinearTerm::Plugged { function, value } = &mut self.b {
            function(time, x, value.as_mut_slice(), z);
        }
    }

    /// f(t, x) = A·x + b, without the non-smooth input.
    pub(crate) fn f(&mut self, time: f64, x: &Vector) -> Vector {
        self.update_plugins(time);
        let mut f = Vector::zeros(self.state.n);
        match &self.a {
            LinearTerm::Absent => {}
            LinearTerm::Constant(a) | LinearTerm::Plugged { value: a, .. } => f.gemv(1.0, a, x, 0.0),
        }
        match &self.b {
            LinearTerm::Absent => {}
            LinearTerm::Constant(b) | LinearTerm::Plugged { value: b, .. } => f += b,
        }
        f
    }
}

/// ẋ = f(t, x, z) + r with user callbacks.
#[derive(Clone)]
pub struct FirstOrderNonLinearDs {
    pub(crate) state: FirstOrderState,
    f: Callback,
    jacobian_f: Option<Callback>,
}

impl FirstOrderNonLinearDs {
    pub fn new(x0: Vector, registry: &PluginRegistry, f_name: &str, jacobian_name: Option<&str>) -> Result<Self> {
        let jacobian_f = jacobian_name.map(|name| registry.matrix(name)).transpose()?;
        Ok(Self {
            state: FirstOrderState::new(x0),
            f: registry.vector(f_name)?,
            jacobian_f,
        })
    }

    /// System of dimension `n` whose initial state will be set later.
    pub fn with_dimension(n: usize, registry: &PluginRegistry, f_name: &str, jacobian_name: Option<&str>) -> Result<Self> {
        let jacobian_f = jacobian_name.map(|name| registry.matrix(name)).transpose()?;
        Ok(Self {
            state: FirstOrderState::with_dimension(n),
            f: registry.vector(f_name)?,
            jacobian_f,
        })
    }

    pub(crate) fn f(&self, time: f64, x: &Vector) -> Vector {
        let mut out = Vector::zeros(self.state.n);
        (self.f)(time, x.as_slice(), out.as_mut_slice(), self.state.z.as_slice());
        out
    }

    pub(crate) fn jacobian_f(&self, time: f64, x: &Vector) -> Matrix {
        let n = self.state.n;
        match &self.jacobian_f {
            Some(jac) => {
                let mut out = Matrix::zeros(n, n);
                jac(time, x.as_slice(), out.as_mut_slice(), self.state.z.as_slice());
                out
            }
            None => {
                // Forward differences, one column per state component
                let f0 = self.f(time, x);
                let mut out = Matrix::zeros(n, n);
                let mut xp = x.clone();
                for j in 0..n {
                    let step = f64::EPSILON.sqrt() * x[j].abs().max(1.0);
                    xp[j] = x[j] + step;
                    let fj = self.f(time, &xp);
                    out.set_column(j, &((fj - &f0) / step));
                    xp[j] = x[j];
                }
                out
            }
        }
    }

    pub fn has_analytic_jacobian(&self) -> bool {
        self.jacobian_f.is_some()
    }
}
