#![allow(dead_code)]

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ramsem::{ParamKind, ParameterTable, RamSpec, SyntaxOptions};

pub const TWO_FACTOR: &str = "
f1 =~ x1 + x2 + x3
f2 =~ x4 + l*x5 + l*x6
f2 ~ f1
x1 ~~ x4
";

pub fn names(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

pub fn observed_names() -> Vec<String> {
    names(&["x1", "x2", "x3", "x4", "x5", "x6"])
}

pub fn two_factor_table(meanstructure: bool) -> ParameterTable {
    let options = SyntaxOptions {
        meanstructure,
        ..SyntaxOptions::default()
    };
    let model = if meanstructure {
        format!("{TWO_FACTOR}\nf1 ~ 1")
    } else {
        TWO_FACTOR.to_string()
    };
    let mut table =
        ParameterTable::from_syntax(&model, &observed_names(), &options).expect("syntax");
    table.sort_vars().expect("sort");
    table
}

/// A parameter vector with positive variances and small covariances.
pub fn random_theta(spec: &RamSpec, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    spec.param_kinds()
        .iter()
        .map(|kind| match kind {
            ParamKind::Covariance => rng.gen_range(0.02..0.1),
            ParamKind::VarianceObserved | ParamKind::VarianceLatent => rng.gen_range(0.5..1.0),
            ParamKind::Mean => rng.gen_range(-1.0..1.0),
            ParamKind::Loading | ParamKind::Regression => rng.gen_range(0.4..1.2),
        })
        .collect()
}

/// Two-factor data with unit-variance uniform innovations, rows are observations.
pub fn sample_data(n: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut unit = move || rng.gen_range(-1.0..1.0) * 3f64.sqrt();
    let loadings = [1.0, 0.8, 1.2, 1.0, 0.9, 0.9];
    let means = [0.5, 1.0, -0.3, 0.0, 0.2, 0.8];
    let mut data = Array2::<f64>::zeros((n, 6));
    for r in 0..n {
        let f1 = 0.3 + unit();
        let f2 = 0.6 * f1 + 0.8 * unit();
        for j in 0..6 {
            let factor = if j < 3 { f1 } else { f2 };
            data[(r, j)] = means[j] + loadings[j] * factor + 0.5 * unit();
        }
    }
    data
}

/// Central differences of `f` at `theta`.
pub fn fd_gradient<F: FnMut(&[f64]) -> f64>(theta: &[f64], mut f: F) -> Vec<f64> {
    let h = 1e-5;
    (0..theta.len())
        .map(|i| {
            let mut plus = theta.to_vec();
            let mut minus = theta.to_vec();
            plus[i] += h;
            minus[i] -= h;
            (f(&plus) - f(&minus)) / (2.0 * h)
        })
        .collect()
}

pub fn assert_close(actual: f64, expected: f64, tol: f64, what: &str) {
    let scale = expected.abs().max(1.0);
    assert!(
        (actual - expected).abs() <= tol * scale,
        "{what}: {actual} vs {expected}"
    );
}
