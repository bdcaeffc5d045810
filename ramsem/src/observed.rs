//! Observed moments consumed by the loss functions. Everything here is computed once, before
//! optimization starts.

use std::collections::HashMap;

use ndarray::{Array1, Array2, Axis};
use tracing::debug;

use crate::error::{Result, SemError};

fn column_index(names: &[String], order: &[String]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    order
        .iter()
        .map(|name| {
            index
                .get(name.as_str())
                .copied()
                .ok_or_else(|| SemError::UnknownVariable(name.clone()))
        })
        .collect()
}

/// Sample covariance matrix, optional mean vector and sample size.
#[derive(Debug, Clone, PartialEq)]
pub struct SemObservedCovariance {
    names: Vec<String>,
    cov: Array2<f64>,
    mean: Option<Array1<f64>>,
    n_obs: usize,
}

impl SemObservedCovariance {
    pub fn new(
        names: Vec<String>,
        cov: Array2<f64>,
        mean: Option<Array1<f64>>,
        n_obs: usize,
    ) -> Result<Self> {
        let p = names.len();
        if cov.dim() != (p, p) {
            return Err(SemError::DimensionMismatch(format!(
                "covariance is {:?} for {p} variables",
                cov.dim()
            )));
        }
        if let Some(mean) = mean.as_ref()
            && mean.len() != p
        {
            return Err(SemError::DimensionMismatch(format!(
                "mean has length {} for {p} variables",
                mean.len()
            )));
        }
        Ok(SemObservedCovariance {
            names,
            cov,
            mean,
            n_obs,
        })
    }

    /// Moments of complete data (rows are observations), covariance with divisor `n - 1`.
    pub fn from_data(names: Vec<String>, data: &Array2<f64>) -> Result<Self> {
        let n = data.nrows();
        if n < 2 {
            return Err(SemError::DimensionMismatch(format!(
                "need at least two observations, got {n}"
            )));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(SemError::InvalidSpecification(
                "complete-data moments require finite values; use SemObservedMissing".to_string(),
            ));
        }
        let mean = data
            .mean_axis(Axis(0))
            .ok_or_else(|| SemError::DimensionMismatch("empty data".to_string()))?;
        let centered = data - &mean;
        let cov = centered.t().dot(&centered) / (n as f64 - 1.0);
        Self::new(names, cov, Some(mean), n)
    }

    /// Restricts and reorders the moments to `order`.
    pub fn select(&self, order: &[String]) -> Result<Self> {
        let idx = column_index(&self.names, order)?;
        Ok(SemObservedCovariance {
            names: order.to_vec(),
            cov: self.cov.select(Axis(0), &idx).select(Axis(1), &idx),
            mean: self.mean.as_ref().map(|m| m.select(Axis(0), &idx)),
            n_obs: self.n_obs,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn cov(&self) -> &Array2<f64> {
        &self.cov
    }

    pub fn mean(&self) -> Option<&Array1<f64>> {
        self.mean.as_ref()
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn n_vars(&self) -> usize {
        self.names.len()
    }
}

/// Rows sharing the same set of observed variables.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingPattern {
    /// Positions of the observed variables within the full variable list.
    pub observed: Vec<usize>,
    pub rows: Vec<usize>,
    pub mean: Array1<f64>,
    /// Covariance of the observed block with divisor `n`.
    pub cov: Array2<f64>,
}

impl MissingPattern {
    pub fn n(&self) -> usize {
        self.rows.len()
    }
}

/// Raw data with `NaN` marking missing values, grouped into missingness patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct SemObservedMissing {
    names: Vec<String>,
    data: Array2<f64>,
    patterns: Vec<MissingPattern>,
    n_obs: usize,
}

impl SemObservedMissing {
    /// Rows without any observed value are dropped. Patterns appear in order of their first row.
    pub fn new(names: Vec<String>, data: Array2<f64>) -> Result<Self> {
        if data.ncols() != names.len() {
            return Err(SemError::DimensionMismatch(format!(
                "data has {} columns for {} variables",
                data.ncols(),
                names.len()
            )));
        }
        let mut keys: Vec<Vec<bool>> = Vec::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut dropped = 0usize;
        for (r, row) in data.axis_iter(Axis(0)).enumerate() {
            let mask: Vec<bool> = row.iter().map(|v| v.is_finite()).collect();
            if !mask.iter().any(|&m| m) {
                dropped += 1;
                continue;
            }
            match keys.iter().position(|k| *k == mask) {
                Some(g) => groups[g].push(r),
                None => {
                    keys.push(mask);
                    groups.push(vec![r]);
                }
            }
        }
        if dropped > 0 {
            debug!("dropped {dropped} rows without observed values");
        }

        let patterns: Vec<MissingPattern> = keys
            .iter()
            .zip(groups)
            .map(|(mask, rows)| pattern_moments(&data, mask, rows))
            .collect();
        let n_obs = patterns.iter().map(MissingPattern::n).sum();
        if n_obs == 0 {
            return Err(SemError::DimensionMismatch(
                "no rows with observed values".to_string(),
            ));
        }
        debug!(
            "missing data: {} rows, {} patterns",
            n_obs,
            patterns.len()
        );
        Ok(SemObservedMissing {
            names,
            data,
            patterns,
            n_obs,
        })
    }

    /// Restricts and reorders the columns to `order`, regrouping the patterns.
    pub fn select(&self, order: &[String]) -> Result<Self> {
        let idx = column_index(&self.names, order)?;
        Self::new(order.to_vec(), self.data.select(Axis(1), &idx))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn patterns(&self) -> &[MissingPattern] {
        &self.patterns
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn n_vars(&self) -> usize {
        self.names.len()
    }
}

fn pattern_moments(data: &Array2<f64>, mask: &[bool], rows: Vec<usize>) -> MissingPattern {
    let observed: Vec<usize> = (0..mask.len()).filter(|&j| mask[j]).collect();
    let block = data.select(Axis(0), &rows).select(Axis(1), &observed);
    let n = rows.len() as f64;
    let mean = block.sum_axis(Axis(0)) / n;
    let centered = &block - &mean;
    let cov = centered.t().dot(&centered) / n;
    MissingPattern {
        observed,
        rows,
        mean,
        cov,
    }
}

/// Either kind of observed data a model can be fitted to.
#[derive(Debug, Clone, PartialEq)]
pub enum SemObserved {
    Covariance(SemObservedCovariance),
    Missing(SemObservedMissing),
}

impl SemObserved {
    pub fn names(&self) -> &[String] {
        match self {
            SemObserved::Covariance(obs) => obs.names(),
            SemObserved::Missing(obs) => obs.names(),
        }
    }

    pub fn n_obs(&self) -> usize {
        match self {
            SemObserved::Covariance(obs) => obs.n_obs(),
            SemObserved::Missing(obs) => obs.n_obs(),
        }
    }

    pub fn select(&self, order: &[String]) -> Result<Self> {
        Ok(match self {
            SemObserved::Covariance(obs) => SemObserved::Covariance(obs.select(order)?),
            SemObserved::Missing(obs) => SemObserved::Missing(obs.select(order)?),
        })
    }
}

impl From<SemObservedCovariance> for SemObserved {
    fn from(obs: SemObservedCovariance) -> Self {
        SemObserved::Covariance(obs)
    }
}

impl From<SemObservedMissing> for SemObserved {
    fn from(obs: SemObservedMissing) -> Self {
        SemObserved::Missing(obs)
    }
}
