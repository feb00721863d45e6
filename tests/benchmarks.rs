use policy_cmaes::functions::{elli, rosenbrock, sphere, tablet};
use policy_cmaes::{Cmaes, CmaesOptions, Preset, Termination};
use std::time::Instant;

fn run_seeded(
    x0: Vec<f64>,
    sigma: f64,
    stop_eval: usize,
    stop_fitness: f64,
    seed: u64,
    objective: fn(&[f64]) -> f64,
) -> (f64, Termination) {
    let options = CmaesOptions::new()
        .preset(Preset::Theoretical)
        .initial_sigma(sigma)
        .stop_eval(stop_eval)
        .stop_fitness(stop_fitness)
        .seed(seed);
    let mut es = Cmaes::new(x0, objective, options).unwrap();
    let result = es.run().unwrap();
    (result.fitness, result.termination)
}

#[test]
fn sphere_reaches_near_zero() {
    let (fbest, termination) = run_seeded(vec![0.8; 6], 0.4, 20_000, 1e-10, 42, sphere);
    assert!(
        matches!(termination, Termination::Converged { .. }),
        "sphere stopped with {termination:?}"
    );
    assert!(fbest <= 1e-10, "sphere optimum not reached: {fbest}");
}

#[test]
fn sphere_converges_with_hardcoded_population() {
    let options = CmaesOptions::new()
        .seed(42)
        .stop_eval(50_000)
        .stop_fitness(1e-10);
    let mut es = Cmaes::new(vec![3.0; 4], sphere, options).unwrap();
    let result = es.run().unwrap();
    assert!(result.fitness <= 1e-10, "sphere optimum not reached: {}", result.fitness);
}

#[test]
fn rosenbrock_2d_reaches_minimum() {
    let (fbest, _) = run_seeded(vec![-1.2, 1.0], 0.5, 20_000, 1e-10, 42, rosenbrock);
    assert!(fbest < 1e-4, "rosenbrock optimum not reached: {fbest}");
}

#[test]
fn ellipsoid_high_condition() {
    let start = Instant::now();
    let (fbest, termination) = run_seeded(vec![0.6; 10], 0.3, 80_000, 1e-10, 4242, elli);
    assert!(fbest < 1e-4, "ill-conditioned ellipsoid not solved: {fbest} ({termination:?})");
    assert!(
        start.elapsed().as_millis() < 40_000,
        "ellipsoid timing regression"
    );
}

#[test]
fn tablet_learns_scaled_axis() {
    let (fbest, _) = run_seeded(vec![0.5; 5], 0.3, 40_000, 1e-10, 7, tablet);
    assert!(fbest < 1e-4, "tablet optimum not reached: {fbest}");
}
