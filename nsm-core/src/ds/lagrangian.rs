//! Lagrangian (second-order) dynamical systems: M(q)·q̈ = F(t, q, q̇) + p.
//!
//! The state is x = [q; v]. Forces are F = f_ext − f_int − f_gyr.
//!
//! The mass matrix is factorized lazily. A constant mass is factorized once
//! for the life of the system; a mass supplied by a callback is recomputed and
//! refactorized on every request.

use crate::error::{Error, Result};
use crate::linalg::Factorization;
use crate::memory::StateMemory;
use crate::plugin::{Callback, PluginRegistry};
use crate::sparse::CsrMatrix;
use crate::types::{Matrix, Vector};
use tracing::debug;

/// Mass matrix storage.
#[derive(Debug, Clone)]
pub enum MassMatrix {
    Dense(Matrix),
    Sparse(CsrMatrix),
}

impl MassMatrix {
    pub fn nrows(&self) -> usize {
        match self {
            MassMatrix::Dense(m) => m.nrows(),
            MassMatrix::Sparse(m) => m.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            MassMatrix::Dense(m) => m.ncols(),
            MassMatrix::Sparse(m) => m.ncols(),
        }
    }

    pub fn to_dense(&self) -> Matrix {
        match self {
            MassMatrix::Dense(m) => m.clone(),
            MassMatrix::Sparse(m) => Matrix::from(m),
        }
    }

    pub(crate) fn factorize(&self) -> Result<Factorization> {
        match self {
            MassMatrix::Dense(m) => Factorization::cholesky(m.clone()),
            MassMatrix::Sparse(m) => Factorization::sparse_cholesky(m),
        }
    }
}

/// State shared by all Lagrangian systems.
pub struct LagrangianState {
    pub(crate) ndof: usize,
    pub(crate) q0: Option<Vector>,
    pub(crate) v0: Option<Vector>,
    pub(crate) q: Vector,
    pub(crate) v: Vector,
    pub(crate) acceleration: Vector,
    /// Non-smooth input at levels 0 (position), 1 (impulse) and 2 (force).
    pub(crate) p: [Vector; 3],
    pub(crate) z: Vector,
    pub(crate) forces: Vector,
    mass: Option<MassMatrix>,
    mass_plugin: Option<Callback>,
    mass_factorization: Option<Factorization>,
    factorization_count: usize,
    pub(crate) jacobian_rhs_x: Option<Matrix>,
    pub(crate) q_memory: StateMemory,
    pub(crate) v_memory: StateMemory,
    pub(crate) forces_memory: StateMemory,
    pub(crate) p_memory: [StateMemory; 3],
    pub(crate) x_memory: StateMemory,
}

impl std::fmt::Debug for LagrangianState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LagrangianState")
            .field("ndof", &self.ndof)
            .field("q", &self.q)
            .field("v", &self.v)
            .field("constant_mass", &self.has_constant_mass())
            .field("factorization_count", &self.factorization_count)
            .finish()
    }
}

impl LagrangianState {
    fn new(q0: Option<Vector>, v0: Option<Vector>, ndof: usize, mass: Option<MassMatrix>, mass_plugin: Option<Callback>) -> Result<Self> {
        if let Some(q0) = &q0 {
            if q0.len() != ndof {
                return Err(Error::size("Lagrangian system: q0", ndof, q0.len()));
            }
        }
        if let Some(v0) = &v0 {
            if v0.len() != ndof {
                return Err(Error::size("Lagrangian system: v0", ndof, v0.len()));
            }
        }
        if let Some(mass) = &mass {
            if mass.nrows() != ndof || mass.ncols() != ndof {
                return Err(Error::size("Lagrangian system: mass matrix", ndof, mass.nrows().max(mass.ncols())));
            }
        }
        Ok(Self {
            ndof,
            q: q0.clone().unwrap_or_else(|| Vector::zeros(ndof)),
            v: v0.clone().unwrap_or_else(|| Vector::zeros(ndof)),
            q0,
            v0,
            acceleration: Vector::zeros(ndof),
            p: [Vector::zeros(ndof), Vector::zeros(ndof), Vector::zeros(ndof)],
            z: Vector::zeros(0),
            forces: Vector::zeros(ndof),
            mass,
            mass_plugin,
            mass_factorization: None,
            factorization_count: 0,
            jacobian_rhs_x: None,
            q_memory: StateMemory::default(),
            v_memory: StateMemory::default(),
            forces_memory: StateMemory::default(),
            p_memory: Default::default(),
            x_memory: StateMemory::default(),
        })
    }

    pub fn ndof(&self) -> usize {
        self.ndof
    }

    pub fn q(&self) -> &Vector {
        &self.q
    }

    pub fn v(&self) -> &Vector {
        &self.v
    }

    pub fn acceleration(&self) -> &Vector {
        &self.acceleration
    }

    pub fn p(&self, level: usize) -> &Vector {
        &self.p[level]
    }

    pub fn forces(&self) -> &Vector {
        &self.forces
    }

    /// x = [q; v]
    pub fn x(&self) -> Vector {
        let mut x = Vector::zeros(2 * self.ndof);
        x.rows_mut(0, self.ndof).copy_from(&self.q);
        x.rows_mut(self.ndof, self.ndof).copy_from(&self.v);
        x
    }

    pub(crate) fn set_x(&mut self, x: &Vector) {
        self.q.copy_from(&x.rows(0, self.ndof));
        self.v.copy_from(&x.rows(self.ndof, self.ndof));
    }

    pub fn has_constant_mass(&self) -> bool {
        self.mass_plugin.is_none()
    }

    /// Number of times the mass matrix was factorized.
    pub fn factorization_count(&self) -> usize {
        self.factorization_count
    }

    /// Recompute M(q) from the callback, if any.
    pub(crate) fn compute_mass(&mut self, time: f64) {
        if let Some(plugin) = &self.mass_plugin {
            let n = self.ndof;
            let mut m = Matrix::zeros(n, n);
            plugin(time, self.q.as_slice(), m.as_mut_slice(), self.z.as_slice());
            self.mass = Some(MassMatrix::Dense(m));
            self.mass_factorization = None;
        }
    }

    /// Current mass matrix, dense copy.
    pub fn mass_dense(&self) -> Result<Matrix> {
        self.mass
            .as_ref()
            .map(MassMatrix::to_dense)
            .ok_or_else(|| Error::MissingData("Lagrangian system: mass matrix is not set".into()))
    }

    pub fn mass(&self) -> Option<&MassMatrix> {
        self.mass.as_ref()
    }

    /// Make sure the factorization of M(q) is current.
    pub(crate) fn update_mass_factorization(&mut self, time: f64) -> Result<()> {
        if self.has_constant_mass() && self.mass_factorization.is_some() {
            return Ok(());
        }
        self.compute_mass(time);
        let mass = self
            .mass
            .as_ref()
            .ok_or_else(|| Error::MissingData("Lagrangian system: mass matrix is not set".into()))?;
        self.mass_factorization = Some(mass.factorize()?);
        self.factorization_count += 1;
        debug!(count = self.factorization_count, "mass matrix factorized");
        Ok(())
    }

    /// b ← M⁻¹·b with the current factorization.
    pub(crate) fn solve_mass(&self, b: &mut Vector) -> Result<()> {
        self.mass_factorization
            .as_ref()
            .ok_or_else(|| Error::MissingData("Lagrangian system: mass matrix was not factorized".into()))?
            .solve_in_place(b)
    }

    /// B ← M⁻¹·B with the current factorization.
    pub(crate) fn solve_mass_matrix(&self, b: &mut Matrix) -> Result<()> {
        self.mass_factorization
            .as_ref()
            .ok_or_else(|| Error::MissingData("Lagrangian system: mass matrix was not factorized".into()))?
            .solve_matrix_in_place(b)
    }

    /// v ← v + M⁻¹·p[1]
    pub(crate) fn compute_post_impact_velocity(&mut self, time: f64) -> Result<()> {
        self.update_mass_factorization(time)?;
        let mut dv = self.p[1].clone();
        self.solve_mass(&mut dv)?;
        self.v += dv;
        Ok(())
    }

    pub(crate) fn init_memory(&mut self, steps: usize) {
        let n = self.ndof;
        if self.q_memory.capacity() == steps && self.q_memory.vector_size() == n {
            return;
        }
        self.q_memory = StateMemory::new(steps, n);
        self.v_memory = StateMemory::new(steps, n);
        self.forces_memory = StateMemory::new(steps, n);
        self.p_memory = [StateMemory::new(steps, n), StateMemory::new(steps, n), StateMemory::new(steps, n)];
        self.x_memory = StateMemory::new(steps, 2 * n);
    }

    pub(crate) fn swap_in_memory(&mut self) {
        self.q_memory.swap(&self.q);
        self.v_memory.swap(&self.v);
        self.forces_memory.swap(&self.forces);
        for (memory, p) in self.p_memory.iter_mut().zip(self.p.iter()) {
            memory.swap(p);
        }
        let x = self.x();
        self.x_memory.swap(&x);
    }

    pub(crate) fn reset_to_initial_state(&mut self) -> Result<()> {
        match (&self.q0, &self.v0) {
            (Some(q0), Some(v0)) => {
                self.q.copy_from(q0);
                self.v.copy_from(v0);
                Ok(())
            }
            _ => Err(Error::MissingData("Lagrangian system: initial state q0/v0 is not set".into())),
        }
    }

    /// Assemble ∇ₓ[v; M⁻¹F] from ∂F/∂q and ∂F/∂v.
    pub(crate) fn assemble_jacobian_rhs_x(&mut self, dfdq: Matrix, dfdv: Matrix) -> Result<()> {
        let n = self.ndof;
        let mut lower = Matrix::zeros(n, 2 * n);
        lower.columns_mut(0, n).copy_from(&dfdq);
        lower.columns_mut(n, n).copy_from(&dfdv);
        self.solve_mass_matrix(&mut lower)?;

        let jac = self.jacobian_rhs_x.get_or_insert_with(|| Matrix::zeros(2 * n, 2 * n));
        jac.fill(0.0);
        jac.view_mut((0, n), (n, n)).fill_with_identity();
        jac.view_mut((n, 0), (n, 2 * n)).copy_from(&lower);
        Ok(())
    }
}

/// External force: absent, constant, or a function of time.
///
/// The plugged form receives q as its state argument but must not depend on it.
#[derive(Clone)]
enum ExternalForce {
    Absent,
    Constant(Vector),
    Plugged(Callback),
}

impl ExternalForce {
    fn add_to(&self, time: f64, q: &Vector, z: &Vector, out: &mut Vector) {
        match self {
            ExternalForce::Absent => {}
            ExternalForce::Constant(f) => *out += f,
            ExternalForce::Plugged(f) => {
                let mut tmp = Vector::zeros(out.len());
                f(time, q.as_slice(), tmp.as_mut_slice(), z.as_slice());
                *out += tmp;
            }
        }
    }
}

/// Evaluate a callback over the stacked state [q; v].
fn eval_qv(f: &Callback, time: f64, q: &Vector, v: &Vector, z: &Vector) -> Vector {
    let n = q.len();
    let mut qv = Vec::with_capacity(2 * n);
    qv.extend_from_slice(q.as_slice());
    qv.extend_from_slice(v.as_slice());
    let mut out = Vector::zeros(n);
    f(time, &qv, out.as_mut_slice(), z.as_slice());
    out
}

fn eval_qv_matrix(f: &Callback, time: f64, q: &Vector, v: &Vector, z: &Vector) -> Matrix {
    let n = q.len();
    let mut qv = Vec::with_capacity(2 * n);
    qv.extend_from_slice(q.as_slice());
    qv.extend_from_slice(v.as_slice());
    let mut out = Matrix::zeros(n, n);
    f(time, &qv, out.as_mut_slice(), z.as_slice());
    out
}

/// Forward-difference Jacobian of `g` with respect to its argument.
fn finite_difference(g: impl Fn(&Vector) -> Vector, at: &Vector) -> Matrix {
    let g0 = g(at);
    let mut jac = Matrix::zeros(g0.len(), at.len());
    let mut xp = at.clone();
    for j in 0..at.len() {
        let step = f64::EPSILON.sqrt() * at[j].abs().max(1.0);
        xp[j] = at[j] + step;
        jac.set_column(j, &((g(&xp) - &g0) / step));
        xp[j] = at[j];
    }
    jac
}

/// A pair of Jacobian callbacks, with respect to q and to v.
#[derive(Clone)]
struct JacobianPair {
    q: Callback,
    v: Callback,
}

/// Callback names for a [`LagrangianDs`].
#[derive(Debug, Clone, Default)]
pub struct LagrangianPlugins<'a> {
    pub mass: Option<&'a str>,
    pub f_int: Option<&'a str>,
    pub f_ext: Option<&'a str>,
    pub f_gyr: Option<&'a str>,
    pub jacobian_f_int_q: Option<&'a str>,
    pub jacobian_f_int_v: Option<&'a str>,
    pub jacobian_f_gyr_q: Option<&'a str>,
    pub jacobian_f_gyr_v: Option<&'a str>,
}

/// General Lagrangian system with configuration-dependent mass and
/// callback-defined internal and gyroscopic forces.
pub struct LagrangianDs {
    pub(crate) state: LagrangianState,
    f_int: Option<Callback>,
    f_gyr: Option<Callback>,
    f_ext: ExternalForce,
    jacobian_f_int: Option<JacobianPair>,
    jacobian_f_gyr: Option<JacobianPair>,
}

impl LagrangianDs {
    /// System with a constant mass matrix and no plugged forces.
    pub fn new(q0: Vector, v0: Vector, mass: MassMatrix) -> Result<Self> {
        let ndof = q0.len();
        Ok(Self {
            state: LagrangianState::new(Some(q0), Some(v0), ndof, Some(mass), None)?,
            f_int: None,
            f_gyr: None,
            f_ext: ExternalForce::Absent,
            jacobian_f_int: None,
            jacobian_f_gyr: None,
        })
    }

    /// System whose mass and forces are resolved from the registry.
    pub fn with_plugins(
        q0: Vector,
        v0: Vector,
        mass: Option<MassMatrix>,
        registry: &PluginRegistry,
        plugins: &LagrangianPlugins<'_>,
    ) -> Result<Self> {
        let ndof = q0.len();
        let mass_plugin = plugins.mass.map(|name| registry.matrix(name)).transpose()?;
        if mass.is_none() && mass_plugin.is_none() {
            return Err(Error::MissingData("Lagrangian system: neither a mass matrix nor a mass plugin".into()));
        }
        let pair = |q: Option<&str>, v: Option<&str>| -> Result<Option<JacobianPair>> {
            match (q, v) {
                (Some(q), Some(v)) => Ok(Some(JacobianPair {
                    q: registry.matrix(q)?,
                    v: registry.matrix(v)?,
                })),
                (None, None) => Ok(None),
                _ => Err(Error::InvalidConfiguration(
                    "Lagrangian system: force Jacobians must be given for both q and v".into(),
                )),
            }
        };
        Ok(Self {
            state: LagrangianState::new(Some(q0), Some(v0), ndof, mass, mass_plugin)?,
            f_int: plugins.f_int.map(|name| registry.vector(name)).transpose()?,
            f_gyr: plugins.f_gyr.map(|name| registry.vector(name)).transpose()?,
            f_ext: match plugins.f_ext {
                Some(name) => ExternalForce::Plugged(registry.vector(name)?),
                None => ExternalForce::Absent,
            },
            jacobian_f_int: pair(plugins.jacobian_f_int_q, plugins.jacobian_f_int_v)?,
            jacobian_f_gyr: pair(plugins.jacobian_f_gyr_q, plugins.jacobian_f_gyr_v)?,
        })
    }

    /// Constant external force.
    pub fn set_f_ext(&mut self, f_ext: Vector) -> Result<()> {
        if f_ext.len() != self.state.ndof {
            return Err(Error::size("Lagrangian system: f_ext", self.state.ndof, f_ext.len()));
        }
        self.f_ext = ExternalForce::Constant(f_ext);
        Ok(())
    }

    /// F = f_ext − f_int − f_gyr evaluated at (q, v).
    pub(crate) fn forces(&self, time: f64, q: &Vector, v: &Vector) -> Vector {
        let z = &self.state.z;
        let mut f = Vector::zeros(self.state.ndof);
        self.f_ext.add_to(time, q, z, &mut f);
        if let Some(f_int) = &self.f_int {
            f -= eval_qv(f_int, time, q, v, z);
        }
        if let Some(f_gyr) = &self.f_gyr {
            f -= eval_qv(f_gyr, time, q, v, z);
        }
        f
    }

    /// (∂F/∂q, ∂F/∂v) at (q, v).
    pub(crate) fn forces_jacobians(&self, time: f64, q: &Vector, v: &Vector) -> (Matrix, Matrix) {
        let n = self.state.ndof;
        let z = &self.state.z;
        let mut dq = Matrix::zeros(n, n);
        let mut dv = Matrix::zeros(n, n);
        for (force, jac) in [(&self.f_int, &self.jacobian_f_int), (&self.f_gyr, &self.jacobian_f_gyr)] {
            match (force, jac) {
                (_, Some(pair)) => {
                    dq -= eval_qv_matrix(&pair.q, time, q, v, z);
                    dv -= eval_qv_matrix(&pair.v, time, q, v, z);
                }
                (Some(f), None) => {
                    dq -= finite_difference(|qq| eval_qv(f, time, qq, v, z), q);
                    dv -= finite_difference(|vv| eval_qv(f, time, q, vv, z), v);
                }
                (None, None) => {}
            }
        }
        // f_ext is a function of time only
        (dq, dv)
    }
}

/// Linear time-invariant Lagrangian system: M·q̈ + C·q̇ + K·q = f_ext(t) + p.
pub struct LagrangianLinearTiDs {
    pub(crate) state: LagrangianState,
    stiffness: Option<Matrix>,
    damping: Option<Matrix>,
    f_ext: ExternalForce,
}

impl LagrangianLinearTiDs {
    pub fn new(q0: Vector, v0: Vector, mass: MassMatrix) -> Result<Self> {
        let ndof = q0.len();
        Ok(Self {
            state: LagrangianState::new(Some(q0), Some(v0), ndof, Some(mass), None)?,
            stiffness: None,
            damping: None,
            f_ext: ExternalForce::Absent,
        })
    }

    pub fn with_stiffness(mut self, k: Matrix) -> Result<Self> {
        let n = self.state.ndof;
        if k.nrows() != n || k.ncols() != n {
            return Err(Error::size("Lagrangian linear system: K", n, k.nrows().max(k.ncols())));
        }
        self.stiffness = Some(k);
        Ok(self)
    }

    pub fn with_damping(mut self, c: Matrix) -> Result<Self> {
        let n = self.state.ndof;
        if c.nrows() != n || c.ncols() != n {
            return Err(Error::size("Lagrangian linear system: C", n, c.nrows().max(c.ncols())));
        }
        self.damping = Some(c);
        Ok(self)
    }

    pub fn with_f_ext(mut self, f_ext: Vector) -> Result<Self> {
        if f_ext.len() != self.state.ndof {
            return Err(Error::size("Lagrangian linear system: f_ext", self.state.ndof, f_ext.len()));
        }
        self.f_ext = ExternalForce::Constant(f_ext);
        Ok(self)
    }

    /// Time-dependent external force resolved from the registry.
    pub fn with_f_ext_plugin(mut self, registry: &PluginRegistry, name: &str) -> Result<Self> {
        self.f_ext = ExternalForce::Plugged(registry.vector(name)?);
        Ok(self)
    }

    pub fn stiffness(&self) -> Option<&Matrix> {
        self.stiffness.as_ref()
    }

    pub fn damping(&self) -> Option<&Matrix> {
        self.damping.as_ref()
    }

    pub(crate) fn forces(&self, time: f64, q: &Vector, v: &Vector) -> Vector {
        let mut f = Vector::zeros(self.state.ndof);
        self.f_ext.add_to(time, q, &self.state.z, &mut f);
        if let Some(k) = &self.stiffness {
            f.gemv(-1.0, k, q, 1.0);
        }
        if let Some(c) = &self.damping {
            f.gemv(-1.0, c, v, 1.0);
        }
        f
    }

    pub(crate) fn forces_jacobians(&self) -> (Matrix, Matrix) {
        let n = self.state.ndof;
        let dq = self.stiffness.as_ref().map_or_else(|| Matrix::zeros(n, n), |k| -k);
        let dv = self.damping.as_ref().map_or_else(|| Matrix::zeros(n, n), |c| -c);
        (dq, dv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn diag_mass(values: &[f64]) -> MassMatrix {
        MassMatrix::Dense(Matrix::from_diagonal(&Vector::from_row_slice(values)))
    }

    #[test]
    fn test_constant_mass_factorized_once() {
        let mut ds = LagrangianDs::new(Vector::zeros(2), Vector::zeros(2), diag_mass(&[2.0, 4.0])).unwrap();
        for _ in 0..5 {
            ds.state.update_mass_factorization(0.0).unwrap();
        }
        assert_eq!(ds.state.factorization_count(), 1);

        let mut b = Vector::from_vec(vec![2.0, 2.0]);
        ds.state.solve_mass(&mut b).unwrap();
        assert_relative_eq!(b[0], 1.0);
        assert_relative_eq!(b[1], 0.5);
    }

    #[test]
    fn test_plugged_mass_refactorized_every_time() {
        let mut registry = PluginRegistry::new();
        registry.register_matrix("mass", |_t, q, out, _z| {
            out[0] = 1.0 + q[0] * q[0];
        });
        let plugins = LagrangianPlugins {
            mass: Some("mass"),
            ..Default::default()
        };
        let mut ds = LagrangianDs::with_plugins(
            Vector::from_vec(vec![1.0]),
            Vector::zeros(1),
            None,
            &registry,
            &plugins,
        )
        .unwrap();
        for _ in 0..3 {
            ds.state.update_mass_factorization(0.0).unwrap();
        }
        assert_eq!(ds.state.factorization_count(), 3);
        assert_relative_eq!(ds.state.mass_dense().unwrap()[(0, 0)], 2.0);
    }

    #[test]
    fn test_missing_mass_is_error() {
        let registry = PluginRegistry::new();
        let result = LagrangianDs::with_plugins(
            Vector::zeros(1),
            Vector::zeros(1),
            None,
            &registry,
            &LagrangianPlugins::default(),
        );
        assert!(matches!(result, Err(Error::MissingData(_))));
    }

    #[test]
    fn test_linear_ti_forces_and_jacobians() {
        let ds = LagrangianLinearTiDs::new(Vector::zeros(1), Vector::zeros(1), diag_mass(&[1.0]))
            .unwrap()
            .with_stiffness(Matrix::from_element(1, 1, 4.0))
            .unwrap()
            .with_damping(Matrix::from_element(1, 1, 0.5))
            .unwrap()
            .with_f_ext(Vector::from_element(1, -9.81))
            .unwrap();
        let f = ds.forces(0.0, &Vector::from_element(1, 2.0), &Vector::from_element(1, 2.0));
        assert_relative_eq!(f[0], -9.81 - 8.0 - 1.0);
        let (dq, dv) = ds.forces_jacobians();
        assert_relative_eq!(dq[(0, 0)], -4.0);
        assert_relative_eq!(dv[(0, 0)], -0.5);
    }

    #[test]
    fn test_finite_difference_internal_force_jacobian() {
        let mut registry = PluginRegistry::new();
        // f_int = q³ + 2·v
        registry.register_vector("fint", |_t, qv, out, _z| {
            out[0] = qv[0] * qv[0] * qv[0] + 2.0 * qv[1];
        });
        let plugins = LagrangianPlugins {
            f_int: Some("fint"),
            ..Default::default()
        };
        let ds = LagrangianDs::with_plugins(
            Vector::from_element(1, 1.0),
            Vector::zeros(1),
            Some(diag_mass(&[1.0])),
            &registry,
            &plugins,
        )
        .unwrap();
        let (dq, dv) = ds.forces_jacobians(0.0, &Vector::from_element(1, 2.0), &Vector::zeros(1));
        assert_relative_eq!(dq[(0, 0)], -12.0, epsilon = 1e-5);
        assert_relative_eq!(dv[(0, 0)], -2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_post_impact_velocity() {
        let mut ds = LagrangianDs::new(Vector::zeros(1), Vector::from_element(1, -3.0), diag_mass(&[2.0])).unwrap();
        ds.state.p[1][0] = 10.0;
        ds.state.compute_post_impact_velocity(0.0).unwrap();
        assert_relative_eq!(ds.state.v()[0], 2.0, epsilon = 1e-12);
    }
}
