//! Covariance Matrix Adaptation Evolution Strategy (CMA-ES) for minimizing
//! black-box objectives, with an adapter for episodic policy search.
//!
//! ```no_run
//! use policy_cmaes::{Cmaes, CmaesOptions};
//!
//! let f = |x: &[f64]| 4.0 + x.iter().map(|v| v * v).sum::<f64>();
//! let mut es = Cmaes::new(vec![10.0, 20.0], f, CmaesOptions::new().seed(7)).unwrap();
//! let result = es.run().unwrap();
//! println!("{:?} -> {} ({:?})", result.best, result.fitness, result.termination);
//! ```

use nalgebra::linalg::SymmetricEigen;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub mod environment;
pub mod error;
pub mod functions;
pub mod objective;
pub mod options;

pub use crate::error::{CmaesError, EnvironmentError, ObjectiveError};
pub use crate::objective::{try_fn, Objective, ObjectiveExt};
pub use crate::options::{CancelToken, CmaesOptions, InitialMean, Preset, TimeoutPolicy};

/// Axis ratio max(D) / min(D) above which the distribution is considered degenerate.
const CONDITION_LIMIT: f64 = 1e7;
/// Floor applied to eigenvalues before inverting them.
const EIGENVALUE_FLOOR: f64 = 1e-20;
const MAX_EIGEN_ITERATIONS: usize = 10_000;
/// Evaluation seeds come from ChaCha streams above this bit; sampling uses
/// the streams below it.
const EVALUATION_STREAMS: u64 = 1 << 63;

/// Constants derived once from the problem dimension and population size.
#[derive(Clone, Debug)]
pub struct StrategyParameters {
    dimension: usize,
    lam: usize,
    mu: usize,
    weights: Vec<f64>,
    mueff: f64,
    cc: f64,
    cs: f64,
    c1: f64,
    cmu: f64,
    damps: f64,
    chi_n: f64,
    refresh_gap: f64,
}

impl StrategyParameters {
    pub fn new(n: usize, lam: usize) -> Result<Self, CmaesError> {
        if n == 0 {
            return Err(CmaesError::InvalidDimension {
                expected: None,
                actual: 0,
            });
        }
        if lam < 2 {
            return Err(CmaesError::InvalidPopulationSize(lam));
        }
        let n_f = n as f64;
        let mu = lam / 2;
        let num = (lam as f64) / 2.0 + 0.5;
        let mut weights: Vec<f64> = (1..=mu).map(|i| num.ln() - (i as f64).ln()).collect();
        let w_sum: f64 = weights.iter().sum();
        for w in &mut weights {
            *w /= w_sum;
        }
        let mueff = weights.iter().sum::<f64>().powi(2) / weights.iter().map(|w| w * w).sum::<f64>();
        let cc = (4.0 + mueff / n_f) / (n_f + 4.0 + 2.0 * mueff / n_f);
        let cs = (mueff + 2.0) / (n_f + mueff + 5.0);
        let c1 = 2.0 / ((n_f + 1.3).powi(2) + mueff);
        let cmu = {
            let up = 2.0 * (mueff - 2.0 + 1.0 / mueff);
            let down = (n_f + 2.0).powi(2) + mueff;
            (up / down).min(1.0 - c1)
        };
        let damps = 1.0 + 2.0 * (((mueff - 1.0) / (n_f + 1.0)).sqrt() - 1.0).max(0.0) + cs;
        let chi_n = n_f.sqrt() * (1.0 - 1.0 / (4.0 * n_f) + 1.0 / (21.0 * n_f * n_f));
        let refresh_gap = (lam as f64) / (c1 + cmu) / n_f / 10.0;
        Ok(Self {
            dimension: n,
            lam,
            mu,
            weights,
            mueff,
            cc,
            cs,
            c1,
            cmu,
            damps,
            chi_n,
            refresh_gap,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
    pub fn population_size(&self) -> usize {
        self.lam
    }
    pub fn parents(&self) -> usize {
        self.mu
    }
    /// Recombination weights, best rank first.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
    pub fn mueff(&self) -> f64 {
        self.mueff
    }
    pub fn cc(&self) -> f64 {
        self.cc
    }
    pub fn cs(&self) -> f64 {
        self.cs
    }
    pub fn c1(&self) -> f64 {
        self.c1
    }
    pub fn cmu(&self) -> f64 {
        self.cmu
    }
    pub fn damps(&self) -> f64 {
        self.damps
    }
    pub fn chi_n(&self) -> f64 {
        self.chi_n
    }
    /// Evaluations that must pass before the covariance is re-factorized.
    pub fn refresh_gap(&self) -> f64 {
        self.refresh_gap
    }

    /// Heaviside gate for the covariance path: false right after an
    /// unexpectedly long step-size path.
    fn hsig(&self, ps_norm: f64, evaluations: usize) -> bool {
        let factor = 1.0 - (1.0 - self.cs).powf(2.0 * (evaluations as f64) / (self.lam as f64));
        if factor <= 0.0 {
            return false;
        }
        ps_norm / factor.sqrt() / self.chi_n < 1.4 + 2.0 / (self.dimension as f64 + 1.0)
    }
}

/// Covariance matrix together with its cached eigen factors.
#[derive(Clone, Debug)]
struct FullCovariance {
    data: DMatrix<f64>,
    eigenbasis: DMatrix<f64>,
    axis_lengths: DVector<f64>,
    invsqrt: DMatrix<f64>,
}

impl FullCovariance {
    fn identity(n: usize) -> Self {
        Self {
            data: DMatrix::identity(n, n),
            eigenbasis: DMatrix::identity(n, n),
            axis_lengths: DVector::from_element(n, 1.0),
            invsqrt: DMatrix::identity(n, n),
        }
    }
    fn multiply_with(&mut self, factor: f64) {
        self.data *= factor;
    }
    fn addouter(&mut self, b: &DVector<f64>, factor: f64) {
        self.data.ger(factor, b, b, 1.0);
    }
    fn enforce_symmetry(&mut self) {
        self.data.fill_lower_triangle_with_upper_triangle();
    }
    fn update_eigensystem(&mut self) -> Result<(), CmaesError> {
        self.enforce_symmetry();
        if !self.data.iter().all(|v| v.is_finite()) {
            return Err(self.decomposition_failure("non-finite covariance entries"));
        }
        let se = SymmetricEigen::try_new(self.data.clone(), f64::EPSILON, MAX_EIGEN_ITERATIONS)
            .ok_or_else(|| self.decomposition_failure("eigen solver did not converge"))?;
        if !se.eigenvalues.iter().chain(se.eigenvectors.iter()).all(|v| v.is_finite()) {
            return Err(self.decomposition_failure("non-finite eigen factors"));
        }
        let axis_lengths = se.eigenvalues.map(|ev| ev.max(0.0).sqrt());
        let inv_axis = se.eigenvalues.map(|ev| 1.0 / ev.max(EIGENVALUE_FLOOR).sqrt());
        self.invsqrt = &se.eigenvectors * DMatrix::from_diagonal(&inv_axis) * se.eigenvectors.transpose();
        self.eigenbasis = se.eigenvectors;
        self.axis_lengths = axis_lengths;
        Ok(())
    }
    fn decomposition_failure(&self, reason: &'static str) -> CmaesError {
        CmaesError::DecompositionFailure {
            reason,
            covariance: self.data.clone(),
        }
    }
    fn axis_bounds(&self) -> (f64, f64) {
        self.axis_lengths
            .iter()
            .fold((f64::INFINITY, 0.0f64), |(lo, hi), &d| (lo.min(d), hi.max(d)))
    }
}

/// The evolving search distribution: mean, step size, covariance and paths.
#[derive(Clone, Debug)]
pub struct DistributionState {
    mean: DVector<f64>,
    sigma: f64,
    cov: FullCovariance,
    ps: DVector<f64>,
    pc: DVector<f64>,
    evals_since_refresh: usize,
}

impl DistributionState {
    fn new(mean: Vec<f64>, sigma: f64) -> Self {
        let n = mean.len();
        Self {
            mean: DVector::from_vec(mean),
            sigma,
            cov: FullCovariance::identity(n),
            ps: DVector::zeros(n),
            pc: DVector::zeros(n),
            evals_since_refresh: 0,
        }
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }
    pub fn sigma(&self) -> f64 {
        self.sigma
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.cov.data
    }
    /// C^(-1/2) as of the last eigen refresh.
    pub fn inv_sqrt_covariance(&self) -> &DMatrix<f64> {
        &self.cov.invsqrt
    }
    /// Square roots of the eigenvalues of C as of the last eigen refresh.
    pub fn axis_lengths(&self) -> &DVector<f64> {
        &self.cov.axis_lengths
    }
    pub fn step_size_path(&self) -> &DVector<f64> {
        &self.ps
    }
    pub fn covariance_path(&self) -> &DVector<f64> {
        &self.pc
    }
    /// max(D) / min(D); infinite once an axis has collapsed.
    pub fn axis_ratio(&self) -> f64 {
        let (lo, hi) = self.cov.axis_bounds();
        hi / lo
    }

    fn is_ill_conditioned(&self) -> bool {
        let (lo, hi) = self.cov.axis_bounds();
        hi > CONDITION_LIMIT * lo
    }

    /// x = mean + sigma * B (D * z), with z drawn from stream `index` of a
    /// generator keyed by `generation_seed`.
    fn sample_offspring(&self, generation_seed: u64, index: usize) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(generation_seed);
        rng.set_stream(index as u64);
        let z = DVector::<f64>::from_fn(self.mean.len(), |_, _| rng.sample(StandardNormal));
        let y = &self.cov.eigenbasis * z.component_mul(&self.cov.axis_lengths);
        (&self.mean + y * self.sigma).iter().copied().collect()
    }

    /// Moves the mean to `new_mean` and adapts paths, covariance and step
    /// size. `selected` holds the mu best candidates, best first.
    fn adapt(
        &mut self,
        params: &StrategyParameters,
        selected: &[DVector<f64>],
        new_mean: DVector<f64>,
        evaluations: usize,
    ) {
        let step = (&new_mean - &self.mean) / self.sigma;

        let csn = (params.cs * (2.0 - params.cs) * params.mueff).sqrt();
        self.ps = &self.ps * (1.0 - params.cs) + (&self.cov.invsqrt * &step) * csn;
        let ps_norm = self.ps.norm();
        let hsig = if params.hsig(ps_norm, evaluations) { 1.0 } else { 0.0 };

        let ccn = (params.cc * (2.0 - params.cc) * params.mueff).sqrt();
        self.pc = &self.pc * (1.0 - params.cc) + &step * (hsig * ccn);

        // (1 - c1 - cmu) C + c1 (1 - hsig) cc (2 - cc) C, then the rank-one
        // and rank-mu terms as outer products.
        let decay = 1.0 - params.c1 - params.cmu
            + params.c1 * (1.0 - hsig) * params.cc * (2.0 - params.cc);
        self.cov.multiply_with(decay);
        self.cov.addouter(&self.pc, params.c1);
        for (x, &w) in selected.iter().zip(params.weights.iter()) {
            let y = (x - &self.mean) / self.sigma;
            self.cov.addouter(&y, params.cmu * w);
        }

        self.sigma *= ((params.cs / params.damps) * (ps_norm / params.chi_n - 1.0)).exp();
        self.mean = new_mean;
    }

    /// Re-factorizes C if enough evaluations have passed since the last time.
    /// Returns whether a refresh happened.
    fn maybe_refresh(&mut self, params: &StrategyParameters) -> Result<bool, CmaesError> {
        if (self.evals_since_refresh as f64) <= params.refresh_gap {
            return Ok(false);
        }
        self.cov.update_eigensystem()?;
        self.evals_since_refresh = 0;
        Ok(true)
    }
}

/// Why a run stopped.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Termination {
    /// Best fitness of the generation reached the stop threshold.
    Converged { fitness: f64 },
    /// max(D) / min(D) exceeded 1e7.
    IllConditioned { axis_ratio: f64 },
    /// A [`CancelToken`] was set.
    Cancelled,
    /// Evaluation budget used up without meeting the threshold.
    BudgetExhausted { evaluations: usize },
}

/// Per-generation progress snapshot.
#[derive(Clone, Debug)]
pub struct GenerationReport {
    pub generation: usize,
    pub evaluations: usize,
    pub best_fitness: f64,
    pub sigma: f64,
    pub axis_ratio: f64,
}

/// Outcome of [`Cmaes::run`].
#[derive(Clone, Debug)]
pub struct RunResult {
    /// Best candidate of the terminating generation.
    pub best: Vec<f64>,
    pub fitness: f64,
    pub termination: Termination,
    pub generations: usize,
    pub evaluations: usize,
    pub mean: Vec<f64>,
    pub sigma: f64,
}

type ProgressHook = Box<dyn FnMut(&GenerationReport) + Send>;

/// A CMA-ES minimizer bound to one objective.
pub struct Cmaes<O> {
    objective: O,
    params: StrategyParameters,
    state: DistributionState,
    rng: StdRng,
    stop_fitness: f64,
    stop_eval: usize,
    verbose: bool,
    evaluation_timeout: Option<Duration>,
    timeout_policy: TimeoutPolicy,
    cancel: Option<CancelToken>,
    counteval: usize,
    generation: usize,
    last_best: Option<(Vec<f64>, f64)>,
    generation_seed: u64,
    on_generation: Option<ProgressHook>,
}

impl<O: Objective> Cmaes<O> {
    /// Validates dimensions and options; the objective is not called.
    pub fn new(initial: Vec<f64>, objective: O, options: CmaesOptions) -> Result<Self, CmaesError> {
        let n = initial.len();
        let expected = objective.dimension();
        if n == 0 || expected.is_some_and(|d| d != n) {
            return Err(CmaesError::InvalidDimension {
                expected,
                actual: n,
            });
        }
        let params = StrategyParameters::new(n, options.resolved_population_size(n))?;
        let sigma = options.resolved_sigma();
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(CmaesError::InvalidStepSize(sigma));
        }
        let mut rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mean = match options.initial_mean {
            InitialMean::Given => initial,
            InitialMean::UniformUnit => (0..n).map(|_| rng.gen::<f64>()).collect(),
        };
        debug!(
            dimension = n,
            lambda = params.lam,
            mu = params.mu,
            mueff = params.mueff,
            cs = params.cs,
            cc = params.cc,
            c1 = params.c1,
            cmu = params.cmu,
            damps = params.damps,
            "cmaes strategy parameters"
        );
        Ok(Self {
            objective,
            state: DistributionState::new(mean, sigma),
            rng,
            stop_fitness: options.resolved_stop_fitness(),
            stop_eval: options.resolved_stop_eval(n),
            verbose: options.verbose,
            evaluation_timeout: options.evaluation_timeout,
            timeout_policy: options.timeout_policy,
            cancel: options.cancel_token,
            counteval: 0,
            generation: 0,
            last_best: None,
            generation_seed: 0,
            on_generation: None,
            params,
        })
    }

    /// Installs a callback invoked after every generation.
    pub fn on_generation(mut self, hook: impl FnMut(&GenerationReport) + Send + 'static) -> Self {
        self.on_generation = Some(Box::new(hook));
        self
    }

    pub fn parameters(&self) -> &StrategyParameters {
        &self.params
    }

    pub fn state(&self) -> &DistributionState {
        &self.state
    }

    pub fn evaluations(&self) -> usize {
        self.counteval
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Samples one population of λ candidates.
    pub fn ask(&mut self) -> Vec<Vec<f64>> {
        let generation_seed: u64 = self.rng.gen();
        self.generation_seed = generation_seed;
        (0..self.params.lam)
            .map(|k| self.state.sample_offspring(generation_seed, k))
            .collect()
    }

    /// Feeds back the fitness of a population from [`Cmaes::ask`] and
    /// performs selection, adaptation and the termination check. Returns the
    /// termination reason once a stopping condition holds.
    pub fn tell(
        &mut self,
        arx: Vec<Vec<f64>>,
        fitvals: Vec<f64>,
    ) -> Result<Option<Termination>, CmaesError> {
        let lam = self.params.lam;
        let n = self.params.dimension;
        if arx.len() != lam || fitvals.len() != lam {
            return Err(CmaesError::PopulationMismatch {
                expected: lam,
                candidates: arx.len(),
                fitness_values: fitvals.len(),
            });
        }
        if let Some(bad) = arx.iter().find(|x| x.len() != n) {
            return Err(CmaesError::InvalidDimension {
                expected: Some(n),
                actual: bad.len(),
            });
        }
        self.counteval += lam;
        self.generation += 1;
        self.state.evals_since_refresh += lam;

        let fitvals: Vec<f64> = fitvals
            .into_iter()
            .enumerate()
            .map(|(k, f)| {
                if f.is_finite() {
                    f
                } else {
                    warn!(candidate = k, value = f, "non-finite fitness ranked last");
                    f64::INFINITY
                }
            })
            .collect();
        let mut idx: Vec<usize> = (0..lam).collect();
        idx.sort_by(|&i, &j| fitvals[i].total_cmp(&fitvals[j]));

        let selected: Vec<DVector<f64>> = idx[..self.params.mu]
            .iter()
            .map(|&i| DVector::from_column_slice(&arx[i]))
            .collect();
        let mut new_mean = DVector::zeros(n);
        for (x, &w) in selected.iter().zip(self.params.weights.iter()) {
            new_mean.axpy(w, x, 1.0);
        }
        self.state
            .adapt(&self.params, &selected, new_mean, self.counteval);
        if self.state.maybe_refresh(&self.params)? {
            debug!(evaluations = self.counteval, "covariance eigensystem refreshed");
        }

        let best_fitness = fitvals[idx[0]];
        self.last_best = Some((arx[idx[0]].clone(), best_fitness));
        self.report(best_fitness);
        Ok(self.check_termination(best_fitness))
    }

    fn report(&mut self, best_fitness: f64) {
        let report = GenerationReport {
            generation: self.generation,
            evaluations: self.counteval,
            best_fitness,
            sigma: self.state.sigma,
            axis_ratio: self.state.axis_ratio(),
        };
        if self.verbose {
            info!(
                generation = report.generation,
                evaluations = report.evaluations,
                best_fitness = report.best_fitness,
                sigma = report.sigma,
                axis_ratio = report.axis_ratio,
                "generation complete"
            );
        }
        if let Some(hook) = self.on_generation.as_mut() {
            hook(&report);
        }
    }

    fn check_termination(&self, best_fitness: f64) -> Option<Termination> {
        if best_fitness <= self.stop_fitness {
            return Some(Termination::Converged {
                fitness: best_fitness,
            });
        }
        if self.state.is_ill_conditioned() {
            return Some(Termination::IllConditioned {
                axis_ratio: self.state.axis_ratio(),
            });
        }
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Some(Termination::Cancelled);
        }
        if self.counteval >= self.stop_eval {
            return Some(Termination::BudgetExhausted {
                evaluations: self.counteval,
            });
        }
        None
    }

    /// Runs generations until termination, evaluating candidates on the
    /// calling thread in index order.
    pub fn run(&mut self) -> Result<RunResult, CmaesError> {
        loop {
            let arx = self.ask();
            let fitvals = arx
                .iter()
                .enumerate()
                .map(|(k, x)| self.evaluate_candidate(k, x))
                .collect::<Result<Vec<f64>, CmaesError>>()?;
            if let Some(termination) = self.tell(arx, fitvals)? {
                return Ok(self.finish(termination));
            }
        }
    }

    fn evaluate_candidate(&self, index: usize, x: &[f64]) -> Result<f64, CmaesError> {
        evaluate_candidate(
            &self.objective,
            self.evaluation_timeout,
            self.timeout_policy,
            candidate_seed(self.generation_seed, index),
            index,
            x,
        )
    }

    fn finish(&self, termination: Termination) -> RunResult {
        let (best, fitness) = self
            .last_best
            .clone()
            .unwrap_or_else(|| (self.state.mean.iter().copied().collect(), f64::INFINITY));
        info!(
            ?termination,
            generations = self.generation,
            evaluations = self.counteval,
            fitness,
            "cmaes run finished"
        );
        RunResult {
            best,
            fitness,
            termination,
            generations: self.generation,
            evaluations: self.counteval,
            mean: self.state.mean.iter().copied().collect(),
            sigma: self.state.sigma,
        }
    }
}

impl<O: Objective + Sync> Cmaes<O> {
    /// Like [`Cmaes::run`], but evaluates each population on the rayon pool.
    /// Results are collected by candidate index and every candidate gets the
    /// same evaluation seed as in [`Cmaes::run`], so a seeded run matches the
    /// sequential one.
    pub fn run_parallel(&mut self) -> Result<RunResult, CmaesError> {
        loop {
            let arx = self.ask();
            let objective = &self.objective;
            let timeout = self.evaluation_timeout;
            let policy = self.timeout_policy;
            let generation_seed = self.generation_seed;
            let fitvals = arx
                .par_iter()
                .enumerate()
                .map(|(k, x)| {
                    let seed = candidate_seed(generation_seed, k);
                    evaluate_candidate(objective, timeout, policy, seed, k, x)
                })
                .collect::<Result<Vec<f64>, CmaesError>>()?;
            if let Some(termination) = self.tell(arx, fitvals)? {
                return Ok(self.finish(termination));
            }
        }
    }
}

/// Seed handed to [`Objective::evaluate_seeded`] for candidate `index`.
fn candidate_seed(generation_seed: u64, index: usize) -> u64 {
    let mut rng = ChaCha8Rng::seed_from_u64(generation_seed);
    rng.set_stream(EVALUATION_STREAMS | index as u64);
    rng.gen()
}

fn evaluate_candidate<O: Objective>(
    objective: &O,
    timeout: Option<Duration>,
    policy: TimeoutPolicy,
    seed: u64,
    index: usize,
    x: &[f64],
) -> Result<f64, CmaesError> {
    let start = Instant::now();
    let f = objective
        .evaluate_seeded(x, seed)
        .map_err(|e| CmaesError::Objective(Box::new(e)))?;
    if let Some(limit) = timeout {
        let elapsed = start.elapsed();
        if elapsed > limit {
            return match policy {
                TimeoutPolicy::Abort => Err(CmaesError::EvaluationTimeout { index, elapsed }),
                TimeoutPolicy::WorstFitness => {
                    warn!(candidate = index, ?elapsed, "evaluation exceeded deadline");
                    Ok(f64::INFINITY)
                }
            };
        }
    }
    Ok(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere(x: &[f64]) -> f64 {
        x.iter().map(|v| v * v).sum()
    }

    fn assert_symmetric(c: &DMatrix<f64>) {
        let asym = (c - c.transpose()).amax();
        assert!(asym < 1e-12, "covariance not symmetric: {asym}");
    }

    #[test]
    fn weights_sum_to_one_and_decrease() {
        for n in 1..=40 {
            for lam in [2, 3, 7, 10, 50, 51] {
                let p = StrategyParameters::new(n, lam).unwrap();
                let sum: f64 = p.weights().iter().sum();
                assert!((sum - 1.0).abs() < 1e-9, "n={n} lam={lam} sum={sum}");
                assert!(p.weights().windows(2).all(|w| w[0] >= w[1]));
                assert!(p.weights().iter().all(|&w| w > 0.0));
                assert_eq!(p.weights().len(), lam / 2);
            }
        }
    }

    #[test]
    fn learning_rates_are_in_range() {
        for n in 1..=100 {
            let p = StrategyParameters::new(n, 50).unwrap();
            for (name, rate) in [("c1", p.c1()), ("cmu", p.cmu()), ("cs", p.cs()), ("cc", p.cc())] {
                assert!(rate > 0.0 && rate < 1.0, "{name}={rate} at n={n}");
            }
            assert!(p.c1() + p.cmu() <= 1.0 + 1e-15);
            assert!(p.damps() >= 1.0);
        }
    }

    #[test]
    fn zero_dimension_and_tiny_population_are_rejected() {
        assert!(matches!(
            StrategyParameters::new(0, 10),
            Err(CmaesError::InvalidDimension { actual: 0, .. })
        ));
        assert!(matches!(
            StrategyParameters::new(3, 1),
            Err(CmaesError::InvalidPopulationSize(1))
        ));
    }

    #[test]
    fn chi_n_matches_expected_norm_approximation() {
        let p = StrategyParameters::new(2, 50).unwrap();
        let expected = 2f64.sqrt() * (1.0 - 1.0 / 8.0 + 1.0 / 84.0);
        assert!((p.chi_n() - expected).abs() < 1e-12);
    }

    #[test]
    fn hsig_suppresses_long_paths() {
        let p = StrategyParameters::new(4, 10).unwrap();
        assert!(p.hsig(0.5, 100));
        assert!(!p.hsig(50.0, 100));
    }

    #[test]
    fn covariance_stays_symmetric_and_sigma_positive() {
        let mut es = Cmaes::new(
            vec![0.8; 5],
            sphere,
            CmaesOptions::new().preset(Preset::Theoretical).seed(11).stop_eval(100_000),
        )
        .unwrap();
        for _ in 0..60 {
            let arx = es.ask();
            let fit: Vec<f64> = arx.iter().map(|x| sphere(x)).collect();
            if es.tell(arx, fit).unwrap().is_some() {
                break;
            }
            assert_symmetric(es.state().covariance());
            assert!(es.state().sigma() > 0.0);
        }
    }

    #[test]
    fn refreshed_inverse_square_root_whitens_covariance() {
        let mut es = Cmaes::new(
            vec![1.0, -2.0, 0.5],
            |x: &[f64]| x[0] * x[0] + 100.0 * x[1] * x[1] + 10.0 * x[2] * x[2],
            CmaesOptions::new().seed(5).stop_eval(1_000_000),
        )
        .unwrap();
        for _ in 0..5 {
            let arx = es.ask();
            let fit: Vec<f64> = arx
                .iter()
                .map(|x| x[0] * x[0] + 100.0 * x[1] * x[1] + 10.0 * x[2] * x[2])
                .collect();
            es.tell(arx, fit).unwrap();
        }
        // Force a factorization of the current C.
        es.state.cov.update_eigensystem().unwrap();
        let c = es.state().covariance();
        let w = es.state().inv_sqrt_covariance();
        let whitened = w * c * w;
        let err = (whitened - DMatrix::<f64>::identity(3, 3)).amax();
        assert!(err < 1e-8, "C^-1/2 C C^-1/2 deviates from I by {err}");
    }

    #[test]
    fn non_finite_covariance_is_a_decomposition_failure() {
        let mut cov = FullCovariance::identity(2);
        cov.data[(0, 1)] = f64::NAN;
        match cov.update_eigensystem() {
            Err(CmaesError::DecompositionFailure { covariance, .. }) => {
                assert_eq!(covariance.nrows(), 2);
            }
            other => panic!("expected decomposition failure, got {other:?}"),
        }
    }

    #[test]
    fn ties_keep_generation_order() {
        let mut es = Cmaes::new(vec![0.0; 2], |_: &[f64]| 1.0, CmaesOptions::new().seed(3)).unwrap();
        let arx = es.ask();
        let fit = vec![1.0; arx.len()];
        let first = arx[0].clone();
        es.tell(arx, fit).unwrap();
        assert_eq!(es.last_best.as_ref().unwrap().0, first);
    }

    #[test]
    fn non_finite_fitness_is_ranked_last() {
        let mut es = Cmaes::new(vec![0.0; 2], sphere, CmaesOptions::new().seed(9)).unwrap();
        let arx = es.ask();
        let mut fit: Vec<f64> = arx.iter().map(|x| sphere(x)).collect();
        fit[0] = f64::NAN;
        fit[1] = f64::NEG_INFINITY;
        let expected_best = fit[2..]
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min);
        es.tell(arx, fit).unwrap();
        assert_eq!(es.last_best.as_ref().unwrap().1, expected_best);
    }

    #[test]
    fn tell_rejects_wrong_batch_size() {
        let mut es = Cmaes::new(vec![0.0; 2], sphere, CmaesOptions::new().seed(1)).unwrap();
        let mut arx = es.ask();
        arx.pop();
        let fit = vec![0.0; arx.len()];
        assert!(matches!(
            es.tell(arx, fit),
            Err(CmaesError::PopulationMismatch { expected: 50, candidates: 49, fitness_values: 49 })
        ));
    }

    #[test]
    fn population_mismatch_reports_both_lengths() {
        let mut es = Cmaes::new(vec![0.0; 2], sphere, CmaesOptions::new().seed(1)).unwrap();
        let arx = es.ask();
        let fit = vec![0.0; 7];
        match es.tell(arx, fit) {
            Err(CmaesError::PopulationMismatch {
                expected,
                candidates,
                fitness_values,
            }) => assert_eq!((expected, candidates, fitness_values), (50, 50, 7)),
            other => panic!("expected a population mismatch, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_candidate_aborts_tell_with_covariance_snapshot() {
        let mut es = Cmaes::new(vec![0.5, -0.5], sphere, CmaesOptions::new().seed(2)).unwrap();
        let mut arx = es.ask();
        arx[0][0] = f64::NAN;
        let fit: Vec<f64> = (0..arx.len()).map(|k| if k == 0 { 0.0 } else { 1.0 }).collect();
        match es.tell(arx, fit) {
            Err(CmaesError::DecompositionFailure { covariance, .. }) => {
                assert_eq!(covariance.shape(), (2, 2));
                assert!(covariance.iter().any(|v| !v.is_finite()));
            }
            other => panic!("expected a decomposition failure, got {other:?}"),
        }
    }

    #[test]
    fn candidate_seeds_depend_only_on_generation_and_index() {
        assert_eq!(candidate_seed(77, 3), candidate_seed(77, 3));
        assert_ne!(candidate_seed(77, 3), candidate_seed(77, 4));
        assert_ne!(candidate_seed(77, 3), candidate_seed(78, 3));
    }
}
