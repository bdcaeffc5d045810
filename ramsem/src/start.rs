use crate::error::{Result, SemError};
use crate::specification::{ParamKind, RamSpec};

/// Per-kind defaults for parameters without a start value in the table.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleStarts {
    pub loadings: f64,
    pub regressions: f64,
    pub variances_observed: f64,
    pub variances_latent: f64,
    pub covariances: f64,
    pub means: f64,
}

impl Default for SimpleStarts {
    fn default() -> Self {
        SimpleStarts {
            loadings: 0.5,
            regressions: 0.0,
            variances_observed: 1.0,
            variances_latent: 0.05,
            covariances: 0.0,
            means: 0.0,
        }
    }
}

impl SimpleStarts {
    fn value(&self, kind: ParamKind) -> f64 {
        match kind {
            ParamKind::Loading => self.loadings,
            ParamKind::Regression => self.regressions,
            ParamKind::VarianceObserved => self.variances_observed,
            ParamKind::VarianceLatent => self.variances_latent,
            ParamKind::Covariance => self.covariances,
            ParamKind::Mean => self.means,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartValues {
    /// Table start values where present, per-kind defaults elsewhere.
    Simple(SimpleStarts),
    /// Table start values only; parameters without one fall back to the default starts.
    Table,
    /// Explicit vector in parameter order.
    Values(Vec<f64>),
}

impl Default for StartValues {
    fn default() -> Self {
        StartValues::Simple(SimpleStarts::default())
    }
}

impl StartValues {
    pub fn resolve(&self, spec: &RamSpec) -> Result<Vec<f64>> {
        let defaults = SimpleStarts::default();
        let per_kind = match self {
            StartValues::Simple(starts) => starts,
            StartValues::Table => &defaults,
            StartValues::Values(values) => {
                if values.len() != spec.n_params() {
                    return Err(SemError::DimensionMismatch(format!(
                        "{} start values for {} parameters",
                        values.len(),
                        spec.n_params()
                    )));
                }
                return Ok(values.clone());
            }
        };
        let starts = spec
            .table_start()
            .iter()
            .zip(spec.param_kinds())
            .zip(spec.lower_bounds().iter().zip(spec.upper_bounds()))
            .map(|((start, kind), (&lo, &hi))| {
                let value = start.unwrap_or_else(|| per_kind.value(*kind));
                if lo <= hi { value.clamp(lo, hi) } else { value }
            })
            .collect();
        Ok(starts)
    }
}
