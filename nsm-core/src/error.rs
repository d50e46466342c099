//! Error types for non-smooth simulation.
//!
//! Fatal configuration problems are returned as [`Error`]. Numerical
//! non-convergence of a one-step non-smooth problem is *not* an error: it is
//! reported as a non-zero `info` code, unless the caller asked the simulation
//! to abort on non-convergence.

use thiserror::Error;

/// Result type alias using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running a simulation.
#[derive(Error, Debug)]
pub enum Error {
    /// Inconsistent vector or matrix sizes.
    #[error("size mismatch in {context}: expected {expected}, got {found}")]
    SizeMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    /// Required data (mass matrix, initial state, ...) was never provided.
    #[error("missing data: {0}")]
    MissingData(String),

    /// Invalid model or simulation configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Solver id not supported by the problem class.
    #[error("unknown solver id {id} for {problem}")]
    UnknownSolver { problem: &'static str, id: i32 },

    /// No one-step non-smooth problem registered under this id.
    #[error("no one-step non-smooth problem with id {0}")]
    UnknownProblem(usize),

    /// Handle does not refer to a live object of the topology.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Callback name not found in the plugin registry.
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    /// A relation or dynamical system produced NaN or infinite values.
    #[error("non-finite value: {0}")]
    NonFinite(String),

    /// Matrix singularity or conditioning issues.
    #[error("singular matrix: {0}")]
    SingularMatrix(String),

    /// Non-smooth solver did not converge and the caller asked to abort.
    #[error("non-smooth problem {problem} did not converge at t = {time}: info = {info}, residual = {residual:e}")]
    NonConvergence {
        problem: usize,
        time: f64,
        info: i32,
        residual: f64,
    },

    /// Malformed ASCII matrix data.
    #[error("parse error: {0}")]
    Parse(String),

    /// I/O errors (matrix files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn size(context: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::SizeMismatch {
            context: context.into(),
            expected,
            found,
        }
    }

    /// Fatal errors abort the run; only [`Error::NonConvergence`] is the
    /// caller-requested escalation of a numerical failure.
    pub fn is_fatal_configuration(&self) -> bool {
        !matches!(self, Error::NonConvergence { .. } | Error::Io(_) | Error::Parse(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_mismatch_message_names_context() {
        let err = Error::size("interaction 3 output", 2, 3);
        let msg = err.to_string();
        assert!(msg.contains("interaction 3 output"));
        assert!(msg.contains("expected 2"));
        assert!(err.is_fatal_configuration());
    }

    #[test]
    fn test_non_convergence_is_not_configuration() {
        let err = Error::NonConvergence {
            problem: 0,
            time: 0.5,
            info: 1,
            residual: 1e-3,
        };
        assert!(!err.is_fatal_configuration());
    }
}
