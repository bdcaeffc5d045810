//! Discrepancy functions between observed and model-implied moments.
//!
//! Every term evaluates against an already updated [`RamImplied`] workspace; the model owning
//! the workspace decides which derivative order to compute and sums the terms.

use std::fmt;

use ndarray::{Array1, Array2};
use tracing::{trace, warn};

use crate::error::{Result, SemError};
use crate::implied::{Order, RamImplied};
use crate::linalg::{LN_2PI, block_diag, normal_weight, spd_logdet_inverse, trace_product, vech};
use crate::observed::{MissingPattern, SemObservedCovariance, SemObservedMissing};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    Ml,
    Wls,
    Fiml,
    Ridge,
}

/// Objective value with optional gradient and hessian over the full parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct LossValue {
    pub objective: f64,
    pub gradient: Option<Array1<f64>>,
    pub hessian: Option<Array2<f64>>,
}

impl LossValue {
    pub fn zero(n_params: usize, order: Order) -> Self {
        LossValue {
            objective: 0.0,
            gradient: (order >= Order::Gradient).then(|| Array1::zeros(n_params)),
            hessian: (order >= Order::Hessian).then(|| Array2::zeros((n_params, n_params))),
        }
    }

    /// Value reported where the implied moments are not admissible: an infinite objective, a
    /// zero gradient and an undefined hessian.
    pub fn infeasible(n_params: usize, order: Order) -> Self {
        LossValue {
            objective: f64::INFINITY,
            gradient: (order >= Order::Gradient).then(|| Array1::zeros(n_params)),
            hessian: (order >= Order::Hessian)
                .then(|| Array2::from_elem((n_params, n_params), f64::NAN)),
        }
    }

    pub fn is_feasible(&self) -> bool {
        self.objective.is_finite()
    }

    /// Adds `weight * other`, with `other` indexed through `map` into this value's parameters.
    pub fn add_mapped(&mut self, other: &LossValue, weight: f64, map: &[usize]) {
        self.objective += weight * other.objective;
        if let (Some(g), Some(og)) = (self.gradient.as_mut(), other.gradient.as_ref()) {
            for (local, &global) in map.iter().enumerate() {
                g[global] += weight * og[local];
            }
        }
        if let (Some(h), Some(oh)) = (self.hessian.as_mut(), other.hessian.as_ref()) {
            for (lk, &gk) in map.iter().enumerate() {
                for (ll, &gl) in map.iter().enumerate() {
                    h[(gk, gl)] += weight * oh[(lk, ll)];
                }
            }
        }
    }

    pub fn add(&mut self, other: &LossValue) {
        let n = match (self.gradient.as_ref(), self.hessian.as_ref()) {
            (Some(g), _) => g.len(),
            (None, Some(h)) => h.nrows(),
            (None, None) => 0,
        };
        let identity: Vec<usize> = (0..n).collect();
        self.add_mapped(other, 1.0, &identity);
    }
}

pub trait LossTerm: fmt::Debug + Send + Sync {
    fn kind(&self) -> LossKind;

    /// Highest derivative order available analytically.
    fn max_order(&self) -> Order;

    fn evaluate(&self, theta: &[f64], implied: &RamImplied, order: Order) -> LossValue;

    fn clone_boxed(&self) -> Box<dyn LossTerm>;
}

impl Clone for Box<dyn LossTerm> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Implied moments restricted to a subset of the observed variables.
struct Block<'a> {
    implied: &'a RamImplied,
    idx: Option<&'a [usize]>,
}

impl Block<'_> {
    fn matrix(&self, m: &Array2<f64>) -> Array2<f64> {
        match self.idx {
            Some(idx) => m
                .select(ndarray::Axis(0), idx)
                .select(ndarray::Axis(1), idx),
            None => m.clone(),
        }
    }

    fn vector(&self, v: &Array1<f64>) -> Array1<f64> {
        match self.idx {
            Some(idx) => v.select(ndarray::Axis(0), idx),
            None => v.clone(),
        }
    }

    fn sigma(&self) -> Array2<f64> {
        self.matrix(self.implied.sigma())
    }

    fn mu(&self) -> Option<Array1<f64>> {
        self.implied.mu().map(|m| self.vector(m))
    }

    fn dsigma(&self, k: usize) -> Array2<f64> {
        self.matrix(&self.implied.dsigma()[k])
    }

    fn dmu(&self, k: usize) -> Option<Array1<f64>> {
        self.implied
            .dmu()
            .map(|d| self.vector(&d.column(k).to_owned()))
    }

    fn d2sigma(&self, k: usize, l: usize) -> Array2<f64> {
        self.matrix(self.implied.d2sigma(k, l))
    }

    fn d2mu(&self, k: usize, l: usize) -> Option<Array1<f64>> {
        self.implied.d2mu(k, l).map(|d| self.vector(d))
    }
}

/// `log|Σ| + tr(SΣ⁻¹) + (x̄ - μ)ᵀΣ⁻¹(x̄ - μ)` and its derivatives for one block, or `None` when
/// Σ is not positive definite. The mean part is used only when both `xbar` and μ exist.
fn gaussian_discrepancy(
    block: &Block<'_>,
    s: &Array2<f64>,
    xbar: Option<&Array1<f64>>,
    order: Order,
) -> Option<LossValue> {
    let q = block.implied.n_params();
    let sigma = block.sigma();
    let (logdet, v) = spd_logdet_inverse(&sigma)?;
    let mu = xbar.and(block.mu());
    let d = match (xbar, mu.as_ref()) {
        (Some(x), Some(m)) => Some(x - m),
        _ => None,
    };
    let vd = d.as_ref().map(|d| v.dot(d));

    let mut objective = logdet + trace_product(&s.view(), &v.view());
    if let (Some(d), Some(vd)) = (d.as_ref(), vd.as_ref()) {
        objective += d.dot(vd);
    }
    let mut value = LossValue {
        objective,
        gradient: None,
        hessian: None,
    };
    if order == Order::Objective {
        return Some(value);
    }

    let vs = v.dot(s);
    let w = &v - &vs.dot(&v);
    let dsig: Vec<Array2<f64>> = (0..q).map(|k| block.dsigma(k)).collect();
    let dmu: Vec<Option<Array1<f64>>> = (0..q)
        .map(|k| if d.is_some() { block.dmu(k) } else { None })
        .collect();
    let svd: Vec<Option<Array1<f64>>> = dsig
        .iter()
        .map(|sk| vd.as_ref().map(|vd| sk.dot(vd)))
        .collect();

    let mut gradient = Array1::<f64>::zeros(q);
    for k in 0..q {
        let mut g = trace_product(&w.view(), &dsig[k].view());
        if let (Some(vd), Some(mk), Some(sk_vd)) = (vd.as_ref(), dmu[k].as_ref(), svd[k].as_ref())
        {
            g -= 2.0 * mk.dot(vd) + vd.dot(sk_vd);
        }
        gradient[k] = g;
    }
    value.gradient = Some(gradient);
    if order == Order::Gradient {
        return Some(value);
    }

    let vsk: Vec<Array2<f64>> = dsig.iter().map(|sk| v.dot(sk)).collect();
    let vsk_vs: Vec<Array2<f64>> = vsk.iter().map(|m| m.dot(&vs)).collect();
    let vmu: Vec<Option<Array1<f64>>> = dmu
        .iter()
        .map(|mk| mk.as_ref().map(|mk| v.dot(mk)))
        .collect();
    let v_svd: Vec<Option<Array1<f64>>> = svd
        .iter()
        .map(|x| x.as_ref().map(|x| v.dot(x)))
        .collect();

    let mut hessian = Array2::<f64>::zeros((q, q));
    for k in 0..q {
        for l in k..q {
            let d2 = block.d2sigma(k, l);
            let mut h = trace_product(&w.view(), &d2.view())
                - trace_product(&vsk[l].view(), &vsk[k].view())
                + 2.0 * trace_product(&vsk_vs[l].view(), &vsk[k].view());
            if let (Some(vd), Some(mk), Some(ml), Some(vmk), Some(vml)) = (
                vd.as_ref(),
                dmu[k].as_ref(),
                dmu[l].as_ref(),
                vmu[k].as_ref(),
                vmu[l].as_ref(),
            ) && let (Some(sk_vd), Some(sl_vd), Some(vsl_vd)) =
                (svd[k].as_ref(), svd[l].as_ref(), v_svd[l].as_ref())
            {
                let mkl = block.d2mu(k, l).unwrap_or_else(|| Array1::zeros(mk.len()));
                h += 2.0 * vmk.dot(ml) - 2.0 * mkl.dot(vd)
                    + 2.0 * vmk.dot(sl_vd)
                    + 2.0 * vml.dot(sk_vd)
                    + 2.0 * vsl_vd.dot(sk_vd)
                    - vd.dot(&d2.dot(vd));
            }
            hessian[(k, l)] = h;
            hessian[(l, k)] = h;
        }
    }
    value.hessian = Some(hessian);
    Some(value)
}

/// Normal-theory maximum likelihood against a sample covariance (and mean).
#[derive(Debug, Clone)]
pub struct SemMl {
    cov: Array2<f64>,
    mean: Option<Array1<f64>>,
    logdet_s: f64,
    n_obs: usize,
}

impl SemMl {
    /// `meanstructure` must match the model; a model with a mean structure needs observed means.
    pub fn new(observed: &SemObservedCovariance, meanstructure: bool) -> Result<Self> {
        let (logdet_s, _) = spd_logdet_inverse(observed.cov()).ok_or_else(|| {
            SemError::InvalidSpecification(
                "sample covariance is not positive definite".to_string(),
            )
        })?;
        let mean = if meanstructure {
            Some(observed.mean().cloned().ok_or_else(|| {
                SemError::InvalidSpecification(
                    "mean structure requires observed means".to_string(),
                )
            })?)
        } else {
            None
        };
        Ok(SemMl {
            cov: observed.cov().clone(),
            mean,
            logdet_s,
            n_obs: observed.n_obs(),
        })
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn logdet_s(&self) -> f64 {
        self.logdet_s
    }
}

impl LossTerm for SemMl {
    fn kind(&self) -> LossKind {
        LossKind::Ml
    }

    fn max_order(&self) -> Order {
        Order::Hessian
    }

    fn evaluate(&self, _theta: &[f64], implied: &RamImplied, order: Order) -> LossValue {
        let block = Block { implied, idx: None };
        match gaussian_discrepancy(&block, &self.cov, self.mean.as_ref(), order) {
            Some(mut value) => {
                value.objective -= self.logdet_s + self.cov.nrows() as f64;
                value
            }
            None => {
                trace!("ML: implied covariance is not positive definite");
                LossValue::infeasible(implied.n_params(), order)
            }
        }
    }

    fn clone_boxed(&self) -> Box<dyn LossTerm> {
        Box::new(self.clone())
    }
}

/// Weighted least squares on `[μ;] vech(Σ)`.
#[derive(Debug, Clone)]
pub struct SemWls {
    moments: Array1<f64>,
    weight: Array2<f64>,
    meanstructure: bool,
    n_obs: usize,
}

impl SemWls {
    /// Uses the normal-theory weight `½ D'(S⁻¹ ⊗ S⁻¹)D`, preceded by an `S⁻¹` block for the
    /// means when `meanstructure` is set.
    pub fn new(observed: &SemObservedCovariance, meanstructure: bool) -> Result<Self> {
        let (_, s_inv) = spd_logdet_inverse(observed.cov()).ok_or_else(|| {
            SemError::InvalidSpecification(
                "sample covariance is not positive definite".to_string(),
            )
        })?;
        let cov_weight = normal_weight(&s_inv);
        let weight = if meanstructure {
            block_diag(&s_inv, &cov_weight)
        } else {
            cov_weight
        };
        Self::with_weight(observed, weight, meanstructure)
    }

    pub fn with_weight(
        observed: &SemObservedCovariance,
        weight: Array2<f64>,
        meanstructure: bool,
    ) -> Result<Self> {
        let cov_part = vech(&observed.cov().view());
        let moments = if meanstructure {
            let mean = observed.mean().ok_or_else(|| {
                SemError::InvalidSpecification("mean structure requires observed means".to_string())
            })?;
            ndarray::concatenate![ndarray::Axis(0), mean.view(), cov_part.view()]
        } else {
            cov_part
        };
        if weight.dim() != (moments.len(), moments.len()) {
            return Err(SemError::DimensionMismatch(format!(
                "weight matrix is {:?} for {} moments",
                weight.dim(),
                moments.len()
            )));
        }
        Ok(SemWls {
            moments,
            weight,
            meanstructure,
            n_obs: observed.n_obs(),
        })
    }

    pub fn weight(&self) -> &Array2<f64> {
        &self.weight
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    fn stack(&self, sigma: &Array2<f64>, mu: Option<&Array1<f64>>) -> Array1<f64> {
        let cov_part = vech(&sigma.view());
        match (self.meanstructure, mu) {
            (true, Some(mu)) => ndarray::concatenate![ndarray::Axis(0), mu.view(), cov_part.view()],
            (true, None) => ndarray::concatenate![
                ndarray::Axis(0),
                Array1::<f64>::zeros(sigma.nrows()).view(),
                cov_part.view()
            ],
            (false, _) => cov_part,
        }
    }
}

impl LossTerm for SemWls {
    fn kind(&self) -> LossKind {
        LossKind::Wls
    }

    fn max_order(&self) -> Order {
        Order::Hessian
    }

    fn evaluate(&self, _theta: &[f64], implied: &RamImplied, order: Order) -> LossValue {
        let q = implied.n_params();
        let e = &self.moments - &self.stack(implied.sigma(), implied.mu());
        let we = self.weight.dot(&e);
        let mut value = LossValue {
            objective: e.dot(&we),
            gradient: None,
            hessian: None,
        };
        if order == Order::Objective {
            return value;
        }

        let dmu = implied.dmu();
        let columns: Vec<Array1<f64>> = (0..q)
            .map(|k| {
                let mk = dmu.map(|d| d.column(k).to_owned());
                self.stack(&implied.dsigma()[k], mk.as_ref())
            })
            .collect();
        value.gradient = Some(columns.iter().map(|ck| -2.0 * ck.dot(&we)).collect());
        if order == Order::Gradient {
            return value;
        }

        let wc: Vec<Array1<f64>> = columns.iter().map(|c| self.weight.dot(c)).collect();
        let mut hessian = Array2::<f64>::zeros((q, q));
        for k in 0..q {
            for l in k..q {
                let second = self.stack(implied.d2sigma(k, l), implied.d2mu(k, l));
                let h = 2.0 * columns[k].dot(&wc[l]) - 2.0 * second.dot(&we);
                hessian[(k, l)] = h;
                hessian[(l, k)] = h;
            }
        }
        value.hessian = Some(hessian);
        value
    }

    fn clone_boxed(&self) -> Box<dyn LossTerm> {
        Box::new(self.clone())
    }
}

/// Full-information maximum likelihood over missingness patterns, scaled by `1/N`.
#[derive(Debug, Clone)]
pub struct SemFiml {
    patterns: Vec<MissingPattern>,
    n_obs: usize,
}

impl SemFiml {
    pub fn new(observed: &SemObservedMissing, meanstructure: bool) -> Result<Self> {
        if !meanstructure {
            return Err(SemError::InvalidSpecification(
                "FIML requires a mean structure".to_string(),
            ));
        }
        Ok(SemFiml {
            patterns: observed.patterns().to_vec(),
            n_obs: observed.n_obs(),
        })
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn patterns(&self) -> &[MissingPattern] {
        &self.patterns
    }
}

impl LossTerm for SemFiml {
    fn kind(&self) -> LossKind {
        LossKind::Fiml
    }

    fn max_order(&self) -> Order {
        Order::Hessian
    }

    fn evaluate(&self, _theta: &[f64], implied: &RamImplied, order: Order) -> LossValue {
        let q = implied.n_params();
        if implied.mu().is_none() {
            return LossValue::infeasible(q, order);
        }
        let identity: Vec<usize> = (0..q).collect();
        let mut total = LossValue::zero(q, order);
        for pattern in &self.patterns {
            let block = Block {
                implied,
                idx: Some(&pattern.observed),
            };
            let Some(mut value) =
                gaussian_discrepancy(&block, &pattern.cov, Some(&pattern.mean), order)
            else {
                trace!("FIML: pattern covariance is not positive definite");
                return LossValue::infeasible(q, order);
            };
            value.objective += pattern.observed.len() as f64 * LN_2PI;
            total.add_mapped(&value, pattern.n() as f64 / self.n_obs as f64, &identity);
        }
        total
    }

    fn clone_boxed(&self) -> Box<dyn LossTerm> {
        Box::new(self.clone())
    }
}

/// `α Σ θᵢ²` over the selected parameter positions.
#[derive(Debug, Clone)]
pub struct Ridge {
    alpha: f64,
    which: Vec<usize>,
    n_params: usize,
}

impl Ridge {
    /// Fails when a position in `which` is not below `n_params`.
    pub fn new(alpha: f64, which: Vec<usize>, n_params: usize) -> Result<Self> {
        if let Some(&bad) = which.iter().find(|&&i| i >= n_params) {
            return Err(SemError::DimensionMismatch(format!(
                "ridge position {bad} for a model with {n_params} parameters"
            )));
        }
        Ok(Ridge {
            alpha,
            which,
            n_params,
        })
    }

    /// Penalizes the parameters named in `labels`.
    pub fn by_labels(alpha: f64, labels: &[&str], param_labels: &[String]) -> Result<Self> {
        let which = labels
            .iter()
            .map(|label| {
                param_labels
                    .iter()
                    .position(|p| p == label)
                    .ok_or_else(|| SemError::MissingParameter(label.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ridge::new(alpha, which, param_labels.len())
    }
}

impl LossTerm for Ridge {
    fn kind(&self) -> LossKind {
        LossKind::Ridge
    }

    fn max_order(&self) -> Order {
        Order::Hessian
    }

    fn evaluate(&self, theta: &[f64], _implied: &RamImplied, order: Order) -> LossValue {
        if theta.len() != self.n_params {
            warn!(
                "ridge built for {} parameters evaluated with {}",
                self.n_params,
                theta.len()
            );
            return LossValue::infeasible(theta.len(), order);
        }
        let mut value = LossValue::zero(theta.len(), order);
        for &i in &self.which {
            value.objective += self.alpha * theta[i] * theta[i];
            if let Some(g) = value.gradient.as_mut() {
                g[i] += 2.0 * self.alpha * theta[i];
            }
            if let Some(h) = value.hessian.as_mut() {
                h[(i, i)] += 2.0 * self.alpha;
            }
        }
        value
    }

    fn clone_boxed(&self) -> Box<dyn LossTerm> {
        Box::new(self.clone())
    }
}
