//! Standard test objectives.

pub fn sphere(x: &[f64]) -> f64 {
    x.iter().map(|v| v * v).sum()
}

/// Sphere lifted by 4; minimum 4 at the origin.
pub fn shifted_sphere(x: &[f64]) -> f64 {
    4.0 + sphere(x)
}

/// Ellipsoid with axis ratio 1e3 (condition number 1e6).
pub fn elli(x: &[f64]) -> f64 {
    let n = x.len();
    if n < 2 {
        return sphere(x);
    }
    let n_m1 = (n - 1) as f64;
    x.iter()
        .enumerate()
        .map(|(i, xi)| 1e3_f64.powf(2.0 * (i as f64) / n_m1) * xi * xi)
        .sum()
}

/// Sphere with the first axis scaled by 1e3.
pub fn tablet(x: &[f64]) -> f64 {
    match x.first() {
        Some(x0) => sphere(x) + (1e6 - 1.0) * x0 * x0,
        None => 0.0,
    }
}

/// Rosenbrock's valley; minimum 0 at (1, ..., 1).
pub fn rosenbrock(x: &[f64]) -> f64 {
    x.windows(2)
        .map(|w| 100.0 * (w[0] * w[0] - w[1]).powi(2) + (w[0] - 1.0).powi(2))
        .sum()
}
