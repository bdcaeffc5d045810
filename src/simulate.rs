//! Multivariate normal draws from model-implied moments.

use anyhow::{Context, Result, bail};
use ndarray::{Array1, Array2};
use ndarray_linalg::{Cholesky, Eigh, UPLO};
use polars::prelude::DataFrame;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use ramsem::Sem;
use tracing::{debug, warn};

use crate::data::frame_from_matrix;

/// A factor `L` with `L Lᵀ = sigma`. Falls back to the eigen decomposition with negative
/// eigenvalues clipped when `sigma` is not positive definite.
fn covariance_factor(sigma: &Array2<f64>) -> Result<Array2<f64>> {
    match sigma.cholesky(UPLO::Lower) {
        Ok(chol) => Ok(chol),
        Err(_) => {
            warn!("covariance is not positive definite; sampling from its clipped eigenbasis");
            let (eigvals, eigvecs) = sigma.eigh(UPLO::Lower).context("eigh")?;
            let sqrt_vals = eigvals.mapv(|v| {
                if v.is_finite() && v > 0.0 {
                    v.sqrt()
                } else {
                    0.0
                }
            });
            Ok(eigvecs.dot(&Array2::from_diag(&sqrt_vals)))
        }
    }
}

/// `n` rows drawn from `N(mu, sigma)`; a missing `mu` means zero.
pub fn mvn_sample(
    sigma: &Array2<f64>,
    mu: Option<&Array1<f64>>,
    n: usize,
    seed: u64,
) -> Result<Array2<f64>> {
    let k = sigma.nrows();
    if sigma.ncols() != k {
        bail!("covariance must be square, got {:?}", sigma.dim());
    }
    if let Some(mu) = mu
        && mu.len() != k
    {
        bail!("mean has length {} for a {k}x{k} covariance", mu.len());
    }
    let factor = covariance_factor(sigma)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Array2::<f64>::zeros((n, k));
    let mut z = Array1::<f64>::zeros(k);
    for mut row in out.rows_mut() {
        for zi in z.iter_mut() {
            *zi = StandardNormal.sample(&mut rng);
        }
        row.assign(&factor.dot(&z));
        if let Some(mu) = mu {
            row += mu;
        }
    }
    debug!("drew {n} observations of {k} variables (seed {seed})");
    Ok(out)
}

/// Sets each cell to `NaN` with probability `rate`, never emptying a whole row.
pub fn punch_missing(data: &mut Array2<f64>, rate: f64, seed: u64) -> Result<usize> {
    if !(0.0..1.0).contains(&rate) {
        bail!("missingness rate must lie in [0, 1), got {rate}");
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut punched = 0;
    for mut row in data.rows_mut() {
        let k = row.len();
        let keep = rng.gen_range(0..k.max(1));
        for (j, cell) in row.iter_mut().enumerate() {
            if j != keep && rng.gen_bool(rate) {
                *cell = f64::NAN;
                punched += 1;
            }
        }
    }
    Ok(punched)
}

/// Draws `n` observations from the moments `model` implies at `theta`, one column per
/// observed variable.
pub fn simulate_from_model(model: &mut Sem, theta: &[f64], n: usize, seed: u64) -> Result<DataFrame> {
    let (sigma, mu) = model
        .implied_moments(theta)
        .context("implied moments for simulation")?;
    let data = mvn_sample(&sigma, mu.as_ref(), n, seed)?;
    let names = model.spec().observed().to_vec();
    frame_from_matrix(&names, &data)
}
