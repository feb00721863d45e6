//! The evaluator seam: anything that maps a candidate vector to a fitness.

use std::convert::Infallible;

/// A black-box function to minimize. Lower values are better.
///
/// `evaluate` takes `&self` so a population can be evaluated from several
/// threads at once; stateful objectives keep their state behind interior
/// mutability.
pub trait Objective {
    type Error: std::error::Error + Send + Sync + 'static;

    fn evaluate(&self, x: &[f64]) -> Result<f64, Self::Error>;

    /// Evaluates candidate `x` with a seed the optimizer fixes per candidate
    /// (generation and index), independent of call order. Stochastic
    /// objectives override this to stay reproducible under parallel runs.
    fn evaluate_seeded(&self, x: &[f64], seed: u64) -> Result<f64, Self::Error> {
        let _ = seed;
        self.evaluate(x)
    }

    /// Input length the objective expects, if it knows it.
    fn dimension(&self) -> Option<usize> {
        None
    }
}

impl<F> Objective for F
where
    F: Fn(&[f64]) -> f64,
{
    type Error = Infallible;

    fn evaluate(&self, x: &[f64]) -> Result<f64, Infallible> {
        Ok(self(x))
    }
}

/// Objective built from a fallible closure.
pub struct TryFn<F> {
    f: F,
}

/// Wrap a closure returning `Result<f64, E>` as an [`Objective`].
pub fn try_fn<F, E>(f: F) -> TryFn<F>
where
    F: Fn(&[f64]) -> Result<f64, E>,
    E: std::error::Error + Send + Sync + 'static,
{
    TryFn { f }
}

impl<F, E> Objective for TryFn<F>
where
    F: Fn(&[f64]) -> Result<f64, E>,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    fn evaluate(&self, x: &[f64]) -> Result<f64, E> {
        (self.f)(x)
    }
}

/// An objective with a declared input length, checked when the optimizer is built.
pub struct WithDimension<O> {
    inner: O,
    dimension: usize,
}

impl<O: Objective> Objective for WithDimension<O> {
    type Error = O::Error;

    fn evaluate(&self, x: &[f64]) -> Result<f64, O::Error> {
        self.inner.evaluate(x)
    }

    fn evaluate_seeded(&self, x: &[f64], seed: u64) -> Result<f64, O::Error> {
        self.inner.evaluate_seeded(x, seed)
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }
}

pub trait ObjectiveExt: Objective + Sized {
    fn with_dimension(self, dimension: usize) -> WithDimension<Self> {
        WithDimension {
            inner: self,
            dimension,
        }
    }
}

impl<O: Objective> ObjectiveExt for O {}
