use nalgebra::DMatrix;
use std::time::Duration;
use thiserror::Error;

/// Boxed error raised by a caller-supplied objective.
pub type ObjectiveError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by [`crate::Cmaes`] construction and runs.
#[derive(Error, Debug)]
pub enum CmaesError {
    /// Empty initial vector, or its length differs from what the objective expects.
    #[error("invalid problem dimension {actual} (objective expects {expected:?})")]
    InvalidDimension {
        expected: Option<usize>,
        actual: usize,
    },

    /// `tell` received candidates or fitness values whose count differs
    /// from the population size.
    #[error("expected {expected} evaluated candidates, got {candidates} candidates and {fitness_values} fitness values")]
    PopulationMismatch {
        expected: usize,
        candidates: usize,
        fitness_values: usize,
    },

    /// Population too small to select at least one parent.
    #[error("population size must be at least 2, got {0}")]
    InvalidPopulationSize(usize),

    /// Initial step size not strictly positive and finite.
    #[error("initial step size must be positive and finite, got {0}")]
    InvalidStepSize(f64),

    /// Eigendecomposition of the covariance matrix failed. Carries the
    /// symmetrized matrix that was being factorized.
    #[error("covariance eigendecomposition failed ({reason})")]
    DecompositionFailure {
        reason: &'static str,
        covariance: DMatrix<f64>,
    },

    /// The objective returned an error; the run was aborted.
    #[error("objective evaluation failed: {0}")]
    Objective(#[source] ObjectiveError),

    /// An evaluation exceeded the configured deadline under `TimeoutPolicy::Abort`.
    #[error("evaluation of candidate {index} took {elapsed:?}")]
    EvaluationTimeout { index: usize, elapsed: Duration },
}

impl CmaesError {
    /// Downcast an objective error to its concrete type.
    pub fn objective_error<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            CmaesError::Objective(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Errors raised by an [`crate::environment::Environment`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("action {action} out of range, must be in [0, {num_actions})")]
    InvalidAction { action: usize, num_actions: usize },
}
