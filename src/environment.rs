//! Episodic environments and an [`Objective`] that scores policy parameters
//! by their discounted return.

use crate::error::EnvironmentError;
use crate::objective::Objective;
use rand::distributions::{Distribution, WeightedError, WeightedIndex};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Result of one environment transition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Step {
    pub observation: usize,
    pub reward: f64,
    pub terminal: bool,
}

/// A finite-horizon episodic simulator with discrete states and actions.
pub trait Environment {
    fn num_states(&self) -> usize;
    fn num_actions(&self) -> usize;
    /// Discount factor applied per step.
    fn gamma(&self) -> f64;
    /// Upper bound on steps per episode.
    fn horizon(&self) -> usize;
    /// Starts a new episode and returns the initial observation.
    fn reset(&mut self) -> usize;
    fn step(&mut self, action: usize) -> Result<Step, EnvironmentError>;
}

#[derive(Error, Debug)]
pub enum EpisodeError {
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error("policy produced unusable action probabilities: {0}")]
    Policy(#[from] WeightedError),
    #[error("policy expects {expected} parameters, got {actual}")]
    ParameterCount { expected: usize, actual: usize },
    #[error("observation {observation} is outside the {num_states} policy states")]
    ObservationOutOfRange { observation: usize, num_states: usize },
}

/// Softmax policy over a `num_states x num_actions` table of preferences,
/// stored row-major in the parameter vector.
pub struct TabularSoftmax<'a> {
    theta: &'a [f64],
    num_actions: usize,
}

impl<'a> TabularSoftmax<'a> {
    pub fn new(theta: &'a [f64], num_actions: usize) -> Self {
        Self { theta, num_actions }
    }

    /// Number of states covered by the parameter table.
    pub fn num_states(&self) -> usize {
        if self.num_actions == 0 {
            0
        } else {
            self.theta.len() / self.num_actions
        }
    }

    pub fn probabilities(&self, state: usize) -> Result<Vec<f64>, EpisodeError> {
        let n = self.num_actions;
        let row = state
            .checked_mul(n)
            .and_then(|start| start.checked_add(n).map(|end| start..end))
            .and_then(|range| self.theta.get(range))
            .ok_or(EpisodeError::ObservationOutOfRange {
                observation: state,
                num_states: self.num_states(),
            })?;
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = row.iter().map(|v| (v - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        Ok(exps.into_iter().map(|e| e / total).collect())
    }

    pub fn sample(&self, state: usize, rng: &mut ChaCha8Rng) -> Result<usize, EpisodeError> {
        let dist = WeightedIndex::new(self.probabilities(state)?)?;
        Ok(dist.sample(rng))
    }
}

/// Runs one episode and returns its discounted return.
pub fn run_episode<E: Environment>(
    env: &mut E,
    policy: &TabularSoftmax<'_>,
    rng: &mut ChaCha8Rng,
) -> Result<f64, EpisodeError> {
    let gamma = env.gamma();
    let mut state = env.reset();
    let mut discount = 1.0;
    let mut ret = 0.0;
    for _ in 0..env.horizon() {
        let action = policy.sample(state, rng)?;
        let step = env.step(action)?;
        ret += discount * step.reward;
        discount *= gamma;
        if step.terminal {
            break;
        }
        state = step.observation;
    }
    Ok(ret)
}

/// Scores a tabular softmax policy by the negated mean discounted return
/// over `episodes` episodes, so that minimizing it maximizes return.
///
/// Every call builds a fresh environment from `factory` with its own seed.
/// Inside the optimizer that seed mixes the base seed with the per-candidate
/// seed, so sequential and parallel runs see the same episodes. Direct
/// [`Objective::evaluate`] calls fall back to a call counter.
pub struct EpisodeObjective<F, E> {
    factory: F,
    episodes: usize,
    seed: u64,
    calls: AtomicU64,
    num_states: usize,
    num_actions: usize,
    _env: PhantomData<fn() -> E>,
}

impl<F, E> EpisodeObjective<F, E>
where
    F: Fn(u64) -> E,
    E: Environment,
{
    pub fn new(factory: F, episodes: usize, seed: u64) -> Self {
        let sample_env = factory(seed);
        Self {
            num_states: sample_env.num_states(),
            num_actions: sample_env.num_actions(),
            factory,
            episodes: episodes.max(1),
            seed,
            calls: AtomicU64::new(0),
            _env: PhantomData,
        }
    }

    /// Number of policy parameters this objective expects.
    pub fn parameter_count(&self) -> usize {
        self.num_states * self.num_actions
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn score(&self, theta: &[f64], seed: u64) -> Result<f64, EpisodeError> {
        if theta.len() != self.parameter_count() {
            return Err(EpisodeError::ParameterCount {
                expected: self.parameter_count(),
                actual: theta.len(),
            });
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut env = (self.factory)(seed);
        let policy = TabularSoftmax::new(theta, self.num_actions);
        let mut total = 0.0;
        for _ in 0..self.episodes {
            total += run_episode(&mut env, &policy, &mut rng)?;
        }
        Ok(-total / self.episodes as f64)
    }
}

impl<F, E> Objective for EpisodeObjective<F, E>
where
    F: Fn(u64) -> E,
    E: Environment,
{
    type Error = EpisodeError;

    fn evaluate(&self, theta: &[f64]) -> Result<f64, EpisodeError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let seed = self
            .seed
            .wrapping_add(call.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        self.score(theta, seed)
    }

    fn evaluate_seeded(&self, theta: &[f64], seed: u64) -> Result<f64, EpisodeError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.score(theta, self.seed ^ seed)
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.parameter_count())
    }
}
