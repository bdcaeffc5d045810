//! Parallel fits from jittered start values. Every run owns a clone of the model, so no
//! workspace is shared between threads.

use anyhow::{Context, Result, anyhow};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use ramsem::{OptimizerOptions, SemFit, SemObjective, fit};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::logging::report_fit;

#[derive(Debug, Clone)]
pub struct MultiStartOptions {
    /// Total number of runs, the model's own start vector included.
    pub n_starts: usize,
    /// Log-scale spread for positive starts, absolute spread otherwise.
    pub jitter: f64,
    pub seed: u64,
    /// Worker threads; `None` uses the global rayon pool.
    pub cores: Option<usize>,
    pub optimizer: OptimizerOptions,
}

impl Default for MultiStartOptions {
    fn default() -> Self {
        MultiStartOptions {
            n_starts: 8,
            jitter: 0.5,
            seed: 1,
            cores: None,
            optimizer: OptimizerOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiStartFit<M> {
    pub best: SemFit<M>,
    /// Minimum reached by each run, in start order.
    pub minima: Vec<f64>,
    pub n_converged: usize,
}

/// Runs `f` inside a dedicated pool of `cores` threads, or directly when `cores` is `None`.
pub fn run_in_pool<T, F>(cores: Option<usize>, f: F) -> Result<T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    match cores {
        Some(cores) => {
            let pool = ThreadPoolBuilder::new()
                .num_threads(cores)
                .build()
                .context("build multi-start thread pool")?;
            Ok(pool.install(f))
        }
        None => Ok(f()),
    }
}

/// Caps the requested thread count at the number of tasks.
pub fn resolve_threads(cores: Option<usize>, tasks: usize) -> Option<usize> {
    let cores = cores?;
    let capped = cores.min(tasks.max(1));
    if cores > capped {
        warn!("{cores} cores requested for {tasks} starts; using {capped}");
    }
    Some(capped)
}

/// The first error wins; otherwise all values in order.
pub fn collect_results<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    results.into_iter().collect()
}

/// `n_starts` start vectors: the base vector followed by seeded perturbations clamped to the
/// bounds.
pub fn jittered_starts(
    base: &[f64],
    lower: &[f64],
    upper: &[f64],
    options: &MultiStartOptions,
) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut starts = Vec::with_capacity(options.n_starts);
    if options.n_starts > 0 {
        starts.push(base.to_vec());
    }
    for _ in 1..options.n_starts {
        let start = base
            .iter()
            .enumerate()
            .map(|(i, &s)| {
                let z: f64 = StandardNormal.sample(&mut rng);
                let value = if s > 0.0 {
                    s * (options.jitter * z).exp()
                } else {
                    s + options.jitter * z
                };
                if lower[i] <= upper[i] {
                    value.clamp(lower[i], upper[i])
                } else {
                    value
                }
            })
            .collect();
        starts.push(start);
    }
    starts
}

/// Fits `model` from every start in parallel and keeps the lowest finite minimum.
pub fn multistart<M>(model: &M, options: &MultiStartOptions) -> Result<MultiStartFit<M>>
where
    M: SemObjective + Clone,
{
    let base = options
        .optimizer
        .start
        .clone()
        .unwrap_or_else(|| model.start_values().to_vec());
    let starts = jittered_starts(&base, model.lower_bounds(), model.upper_bounds(), options);
    let threads = resolve_threads(options.cores, starts.len());
    info!(
        "multi-start: {} runs over {} parameters",
        starts.len(),
        model.n_params()
    );

    let run = || {
        starts
            .par_iter()
            .enumerate()
            .map(|(i, start)| {
                let opts = OptimizerOptions {
                    start: Some(start.clone()),
                    ..options.optimizer.clone()
                };
                let result =
                    fit(model.clone(), &opts).with_context(|| format!("multi-start run {i}"))?;
                report_fit(
                    &format!("run {i}"),
                    result.minimum(),
                    result.converged(),
                    &result.diagnostics().status,
                );
                Ok(result)
            })
            .collect::<Vec<Result<SemFit<M>>>>()
    };
    let fits = collect_results(run_in_pool(threads, run)?)?;

    let minima: Vec<f64> = fits.iter().map(SemFit::minimum).collect();
    let n_converged = fits.iter().filter(|f| f.converged()).count();
    let best = fits
        .into_iter()
        .filter(|f| f.minimum().is_finite())
        .min_by(|a, b| a.minimum().total_cmp(&b.minimum()))
        .ok_or_else(|| anyhow!("no multi-start run reached a finite objective"))?;
    info!(
        "multi-start: best F = {:.6}, {n_converged}/{} converged",
        best.minimum(),
        minima.len()
    );
    Ok(MultiStartFit {
        best,
        minima,
        n_converged,
    })
}
