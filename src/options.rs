use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of the default hyperparameters.
///
/// The two presets are the two value sets the reference program assigns
/// back to back; neither is privileged beyond `Hardcoded` being the default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Preset {
    /// lambda = 50, sigma0 = 0.6, stop_fitness = 1e-5, stop_eval = 50 * N.
    #[default]
    Hardcoded,
    /// lambda = 4 + floor(3 ln N), sigma0 = 0.3, stop_fitness = 1e-10, stop_eval = 50 * N^2.
    Theoretical,
}

impl Preset {
    pub fn population_size(self, n: usize) -> usize {
        match self {
            Preset::Hardcoded => 50,
            Preset::Theoretical => {
                let v = 4.0 + (3.0 * (n as f64).ln()).floor();
                v.max(2.0) as usize
            }
        }
    }

    pub fn initial_sigma(self) -> f64 {
        match self {
            Preset::Hardcoded => 0.6,
            Preset::Theoretical => 0.3,
        }
    }

    pub fn stop_fitness(self) -> f64 {
        match self {
            Preset::Hardcoded => 1e-5,
            Preset::Theoretical => 1e-10,
        }
    }

    pub fn stop_eval(self, n: usize) -> usize {
        match self {
            Preset::Hardcoded => 50 * n,
            Preset::Theoretical => 50 * n * n,
        }
    }
}

/// Where the search distribution starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum InitialMean {
    /// The initial vector passed to [`crate::Cmaes::new`].
    #[default]
    Given,
    /// Uniform draw in [0, 1)^N from the seeded generator. Only the length of
    /// the initial vector is used.
    UniformUnit,
}

/// What to do with an evaluation that outlives `evaluation_timeout`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Rank the candidate last and keep going.
    #[default]
    WorstFitness,
    /// Abort the run with [`crate::CmaesError::EvaluationTimeout`].
    Abort,
}

/// Shared flag a caller can set to stop a run at the next generation boundary.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run configuration. Unset overrides fall back to the chosen [`Preset`].
#[derive(Clone, Debug, Default)]
pub struct CmaesOptions {
    pub preset: Preset,
    pub population_size: Option<usize>,
    pub initial_sigma: Option<f64>,
    pub stop_fitness: Option<f64>,
    pub stop_eval: Option<usize>,
    pub initial_mean: InitialMean,
    pub seed: Option<u64>,
    pub verbose: bool,
    pub evaluation_timeout: Option<Duration>,
    pub timeout_policy: TimeoutPolicy,
    pub cancel_token: Option<CancelToken>,
}

impl CmaesOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(mut self, preset: Preset) -> Self {
        self.preset = preset;
        self
    }

    pub fn population_size(mut self, lambda: usize) -> Self {
        self.population_size = Some(lambda);
        self
    }

    pub fn initial_sigma(mut self, sigma: f64) -> Self {
        self.initial_sigma = Some(sigma);
        self
    }

    pub fn stop_fitness(mut self, fitness: f64) -> Self {
        self.stop_fitness = Some(fitness);
        self
    }

    pub fn stop_eval(mut self, evaluations: usize) -> Self {
        self.stop_eval = Some(evaluations);
        self
    }

    pub fn initial_mean(mut self, initial_mean: InitialMean) -> Self {
        self.initial_mean = initial_mean;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn evaluation_timeout(mut self, timeout: Duration, policy: TimeoutPolicy) -> Self {
        self.evaluation_timeout = Some(timeout);
        self.timeout_policy = policy;
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub(crate) fn resolved_population_size(&self, n: usize) -> usize {
        self.population_size
            .unwrap_or_else(|| self.preset.population_size(n))
    }

    pub(crate) fn resolved_sigma(&self) -> f64 {
        self.initial_sigma
            .unwrap_or_else(|| self.preset.initial_sigma())
    }

    pub(crate) fn resolved_stop_fitness(&self) -> f64 {
        self.stop_fitness
            .unwrap_or_else(|| self.preset.stop_fitness())
    }

    pub(crate) fn resolved_stop_eval(&self, n: usize) -> usize {
        self.stop_eval.unwrap_or_else(|| self.preset.stop_eval(n))
    }
}
