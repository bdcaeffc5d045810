use anyhow::{Context, Result, bail};
use ndarray::Array1;
use polars::prelude::*;
use ramsem::{
    Estimator, FitMeasures, HessianMethod, ModelOptions, OptimizerOptions, ParameterTable, Sem,
    SemFit, SemObjective, SemObserved, SyntaxOptions, fit, fit_measures, standard_errors,
};
use tracing::{info, warn};

use crate::data::{observed_covariance, observed_missing};
use crate::logging::report_fit;
use crate::multistart::{MultiStartOptions, multistart};
use crate::tables::{estimates_frame, fit_measures_frame};

/// Everything needed to go from model syntax and data to estimates.
#[derive(Debug, Clone)]
pub struct SemRequest {
    pub model: String,
    pub syntax: SyntaxOptions,
    pub estimator: Estimator,
    pub model_options: ModelOptions,
    pub optimizer: OptimizerOptions,
    pub hessian: HessianMethod,
    /// Replaces the single optimization by a parallel multi-start.
    pub multistart: Option<MultiStartOptions>,
}

impl SemRequest {
    pub fn new(model: &str) -> Self {
        SemRequest {
            model: model.to_string(),
            syntax: SyntaxOptions::default(),
            estimator: Estimator::default(),
            model_options: ModelOptions::default(),
            optimizer: OptimizerOptions::default(),
            hessian: HessianMethod::default(),
            multistart: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SemOutput {
    /// The parameter table with estimates and standard errors written back.
    pub table: ParameterTable,
    pub fit: SemFit<Sem>,
    pub standard_errors: Array1<f64>,
    pub measures: FitMeasures,
    /// One row per table row, see [`estimates_frame`].
    pub results: DataFrame,
    pub modelfit: DataFrame,
}

/// Fits the request to raw data. Every column of `df` is a candidate observed variable, the
/// syntax decides which ones the model uses.
pub fn fit_frame(request: &SemRequest, df: &DataFrame) -> Result<SemOutput> {
    let candidates: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    let table = ParameterTable::from_syntax(&request.model, &candidates, &syntax_options(request))
        .context("build parameter table from syntax")?;
    let used = table.observed_vars().to_vec();
    let observed: SemObserved = match request.estimator {
        Estimator::Fiml => observed_missing(df, &used)?.into(),
        Estimator::Ml | Estimator::Wls => observed_covariance(df, &used)?.into(),
    };
    fit_table(request, table, observed)
}

/// Fits the request to precomputed observed data.
pub fn fit_observed(request: &SemRequest, observed: SemObserved) -> Result<SemOutput> {
    let table =
        ParameterTable::from_syntax(&request.model, observed.names(), &syntax_options(request))
            .context("build parameter table from syntax")?;
    fit_table(request, table, observed)
}

fn syntax_options(request: &SemRequest) -> SyntaxOptions {
    // full-information fits always carry a mean structure
    SyntaxOptions {
        meanstructure: request.syntax.meanstructure || request.estimator == Estimator::Fiml,
        ..request.syntax.clone()
    }
}

/// Fits an already built parameter table.
pub fn fit_table(
    request: &SemRequest,
    table: ParameterTable,
    observed: SemObserved,
) -> Result<SemOutput> {
    let model = Sem::new(table, observed, request.estimator, &request.model_options)
        .context("build model")?;
    info!(
        "{:?} model: {} parameters, {} observations",
        request.estimator,
        model.n_params(),
        model.n_obs()
    );

    let result = match request.multistart.as_ref() {
        Some(ms) => {
            let ms = MultiStartOptions {
                optimizer: request.optimizer.clone(),
                ..ms.clone()
            };
            multistart(&model, &ms)?.best
        }
        None => fit(model, &request.optimizer).context("optimize")?,
    };
    report_fit(
        "fit",
        result.minimum(),
        result.converged(),
        &result.diagnostics().status,
    );
    if !result.minimum().is_finite() {
        bail!("optimization ended at an inadmissible point");
    }

    let se = match standard_errors(&result, request.hessian) {
        Ok(se) => se,
        Err(e) => {
            warn!("standard errors unavailable: {e}");
            Array1::from_elem(result.model().n_params(), f64::NAN)
        }
    };
    let measures = fit_measures(&result).context("fit measures")?;

    let mut table = result.model().table().clone();
    table
        .update_estimate(result.param_labels(), result.solution())
        .context("write back estimates")?;
    table
        .update_standard_errors(result.param_labels(), &se.to_vec())
        .context("write back standard errors")?;

    let results = estimates_frame(&table)?;
    let modelfit = fit_measures_frame(&measures)?;
    Ok(SemOutput {
        table,
        fit: result,
        standard_errors: se,
        measures,
        results,
        modelfit,
    })
}
