use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ndarray::{Array1, Array2};
use tracing::{debug, trace};

use crate::error::{Result, SemError};
use crate::implied::{Order, RamImplied};
use crate::linalg::{LN_2PI, spd_logdet_inverse, trace_product};
use crate::loss::{LossKind, LossTerm, LossValue, SemFiml, SemMl, SemWls};
use crate::observed::SemObserved;
use crate::partable::ParameterTable;
use crate::specification::RamSpec;
use crate::start::StartValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Estimator {
    #[default]
    Ml,
    Wls,
    Fiml,
}

#[derive(Debug, Clone)]
pub struct ModelOptions {
    /// Topologically sort the variables before building the RAM matrices. Cyclic models fail
    /// with [`SemError::CyclicModel`] when set.
    pub sort_variables: bool,
    pub start: StartValues,
}

impl Default for ModelOptions {
    fn default() -> Self {
        ModelOptions {
            sort_variables: true,
            start: StartValues::default(),
        }
    }
}

/// What the optimizer and the standard-error code need from a model.
pub trait SemObjective: fmt::Debug + Send + Sync {
    fn n_params(&self) -> usize;

    fn param_labels(&self) -> &[String];

    fn start_values(&self) -> &[f64];

    fn lower_bounds(&self) -> &[f64];

    fn upper_bounds(&self) -> &[f64];

    /// Objective plus derivatives up to `order` at `theta`. Inadmissible points yield an
    /// infinite objective rather than an error.
    fn evaluate(&mut self, theta: &[f64], order: Order) -> Result<LossValue>;

    /// Highest derivative order every loss term provides analytically.
    fn max_order(&self) -> Order;

    fn n_obs(&self) -> usize;

    /// Number of observed moments the model reproduces.
    fn n_moments(&self) -> usize;

    fn loss_kinds(&self) -> Vec<LossKind>;

    /// Multiplier turning the inverse hessian of the objective into a covariance matrix.
    fn se_scale(&self) -> f64;

    /// `-2 log L` at `theta` when the model is a likelihood model.
    fn minus2ll(&mut self, _theta: &[f64]) -> Result<Option<f64>> {
        Ok(None)
    }

    fn objective(&mut self, theta: &[f64]) -> Result<f64> {
        Ok(self.evaluate(theta, Order::Objective)?.objective)
    }

    /// Writes the gradient into `grad` and returns the objective.
    fn gradient(&mut self, theta: &[f64], grad: &mut [f64]) -> Result<f64> {
        let value = self.evaluate(theta, Order::Gradient)?;
        if let Some(g) = value.gradient.as_ref() {
            for (dst, src) in grad.iter_mut().zip(g.iter()) {
                *dst = *src;
            }
        }
        Ok(value.objective)
    }

    fn hessian(&mut self, theta: &[f64]) -> Result<Array2<f64>> {
        self.evaluate(theta, Order::Hessian)?
            .hessian
            .ok_or_else(|| SemError::NotImplemented("analytic hessian".to_string()))
    }

    fn has_gradient(&self) -> bool {
        self.max_order() >= Order::Gradient
    }

    fn has_hessian(&self) -> bool {
        self.max_order() >= Order::Hessian
    }
}

fn moment_count(p: usize, meanstructure: bool) -> usize {
    p * (p + 1) / 2 + if meanstructure { p } else { 0 }
}

/// Single-group model: one parameter table, one implied-moments workspace and a sum of loss
/// terms.
#[derive(Debug, Clone)]
pub struct Sem {
    table: ParameterTable,
    spec: Arc<RamSpec>,
    implied: RamImplied,
    observed: SemObserved,
    losses: Vec<Box<dyn LossTerm>>,
    start: Vec<f64>,
}

impl Sem {
    pub fn new(
        table: ParameterTable,
        observed: impl Into<SemObserved>,
        estimator: Estimator,
        options: &ModelOptions,
    ) -> Result<Self> {
        let (table, spec) = prepare(table, options)?;
        let observed = observed.into().select(spec.observed())?;
        let meanstructure = spec.has_meanstructure();
        let loss: Box<dyn LossTerm> = match (estimator, &observed) {
            (Estimator::Ml, SemObserved::Covariance(obs)) => Box::new(SemMl::new(obs, meanstructure)?),
            (Estimator::Wls, SemObserved::Covariance(obs)) => {
                Box::new(SemWls::new(obs, meanstructure)?)
            }
            (Estimator::Fiml, SemObserved::Missing(obs)) => {
                Box::new(SemFiml::new(obs, meanstructure)?)
            }
            (Estimator::Fiml, SemObserved::Covariance(_)) => {
                return Err(SemError::InvalidSpecification(
                    "FIML needs raw data with missingness patterns".to_string(),
                ));
            }
            (_, SemObserved::Missing(_)) => {
                return Err(SemError::InvalidSpecification(format!(
                    "{estimator:?} needs covariance data; use FIML for raw data with missing values"
                )));
            }
        };
        Self::with_losses(table, spec, observed, vec![loss], options)
    }

    /// Builds a model from prepared loss terms. `observed` must already follow the model's
    /// observed-variable order.
    pub fn from_parts(
        table: ParameterTable,
        observed: impl Into<SemObserved>,
        losses: Vec<Box<dyn LossTerm>>,
        options: &ModelOptions,
    ) -> Result<Self> {
        let (table, spec) = prepare(table, options)?;
        let observed = observed.into();
        if observed.names() != spec.observed() {
            return Err(SemError::DimensionMismatch(format!(
                "observed data {:?} does not follow model order {:?}",
                observed.names(),
                spec.observed()
            )));
        }
        Self::with_losses(table, spec, observed, losses, options)
    }

    fn with_losses(
        table: ParameterTable,
        spec: Arc<RamSpec>,
        observed: SemObserved,
        losses: Vec<Box<dyn LossTerm>>,
        options: &ModelOptions,
    ) -> Result<Self> {
        if losses.is_empty() {
            return Err(SemError::InvalidSpecification(
                "a model needs at least one loss term".to_string(),
            ));
        }
        let start = options.start.resolve(&spec)?;
        debug!(
            "model: {} parameters, {} observed, {} loss terms",
            spec.n_params(),
            spec.n_observed(),
            losses.len()
        );
        Ok(Sem {
            table,
            implied: RamImplied::new(Arc::clone(&spec)),
            spec,
            observed,
            losses,
            start,
        })
    }

    /// Adds a further term, e.g. a [`crate::loss::Ridge`] penalty.
    pub fn with_loss(mut self, term: Box<dyn LossTerm>) -> Self {
        self.losses.push(term);
        self
    }

    pub fn table(&self) -> &ParameterTable {
        &self.table
    }

    pub fn spec(&self) -> &RamSpec {
        &self.spec
    }

    pub fn implied(&self) -> &RamImplied {
        &self.implied
    }

    pub fn observed(&self) -> &SemObserved {
        &self.observed
    }

    pub fn losses(&self) -> &[Box<dyn LossTerm>] {
        &self.losses
    }

    /// Implied covariance and mean at `theta`.
    pub fn implied_moments(&mut self, theta: &[f64]) -> Result<(Array2<f64>, Option<Array1<f64>>)> {
        self.implied.update(theta, Order::Objective)?;
        Ok((self.implied.sigma().clone(), self.implied.mu().cloned()))
    }
}

fn prepare(mut table: ParameterTable, options: &ModelOptions) -> Result<(ParameterTable, Arc<RamSpec>)> {
    if options.sort_variables {
        table.sort_vars()?;
    }
    let spec = Arc::new(RamSpec::from_table(&table)?);
    Ok((table, spec))
}

impl SemObjective for Sem {
    fn n_params(&self) -> usize {
        self.spec.n_params()
    }

    fn param_labels(&self) -> &[String] {
        self.spec.param_labels()
    }

    fn start_values(&self) -> &[f64] {
        &self.start
    }

    fn lower_bounds(&self) -> &[f64] {
        self.spec.lower_bounds()
    }

    fn upper_bounds(&self) -> &[f64] {
        self.spec.upper_bounds()
    }

    fn evaluate(&mut self, theta: &[f64], order: Order) -> Result<LossValue> {
        let q = self.n_params();
        if order > self.max_order() {
            return Err(SemError::NotImplemented(format!(
                "{order:?} is not available analytically for every loss term"
            )));
        }
        match self.implied.update(theta, order) {
            Ok(()) => {}
            Err(SemError::SingularStructuralMatrix) => {
                trace!("I - A is singular at {:?}", theta);
                return Ok(LossValue::infeasible(q, order));
            }
            Err(e) => return Err(e),
        }
        let mut total = LossValue::zero(q, order);
        for term in &self.losses {
            let value = term.evaluate(theta, &self.implied, order);
            if !value.is_feasible() {
                return Ok(LossValue::infeasible(q, order));
            }
            total.add(&value);
        }
        Ok(total)
    }

    fn max_order(&self) -> Order {
        self.losses
            .iter()
            .map(|t| t.max_order())
            .min()
            .unwrap_or(Order::Objective)
    }

    fn n_obs(&self) -> usize {
        self.observed.n_obs()
    }

    fn n_moments(&self) -> usize {
        let meanstructure = self.spec.has_meanstructure()
            || matches!(self.observed, SemObserved::Missing(_));
        moment_count(self.spec.n_observed(), meanstructure)
    }

    fn loss_kinds(&self) -> Vec<LossKind> {
        self.losses.iter().map(|t| t.kind()).collect()
    }

    fn minus2ll(&mut self, theta: &[f64]) -> Result<Option<f64>> {
        let kinds = self.loss_kinds();
        if kinds.iter().all(|k| *k == LossKind::Fiml) {
            let f = self.objective(theta)?;
            return Ok(Some(self.n_obs() as f64 * f));
        }
        if !kinds.iter().all(|k| *k == LossKind::Ml) {
            return Ok(None);
        }
        let SemObserved::Covariance(obs) = &self.observed else {
            return Ok(None);
        };
        match self.implied.update(theta, Order::Objective) {
            Ok(()) => {}
            Err(SemError::SingularStructuralMatrix) => return Ok(Some(f64::INFINITY)),
            Err(e) => return Err(e),
        }
        let Some((logdet, v)) = spd_logdet_inverse(self.implied.sigma()) else {
            return Ok(Some(f64::INFINITY));
        };
        let n = obs.n_obs() as f64;
        let p = obs.n_vars() as f64;
        let mut per_obs =
            p * LN_2PI + logdet + (n - 1.0) / n * trace_product(&obs.cov().view(), &v.view());
        if let (Some(xbar), Some(mu)) = (obs.mean(), self.implied.mu()) {
            let d = xbar - mu;
            per_obs += d.dot(&v.dot(&d));
        }
        Ok(Some(n * per_obs))
    }

    fn se_scale(&self) -> f64 {
        let n = self.n_obs() as f64;
        if self.loss_kinds().contains(&LossKind::Fiml) {
            2.0 / n
        } else {
            2.0 / (n - 1.0)
        }
    }
}

/// Several groups sharing one parameter vector, the union of the groups' labels in order of
/// first appearance. The objective is the weighted sum of the group objectives.
#[derive(Debug, Clone)]
pub struct SemEnsemble {
    groups: Vec<Sem>,
    weights: Vec<f64>,
    labels: Vec<String>,
    maps: Vec<Vec<usize>>,
    start: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl SemEnsemble {
    /// Weights each group by its share of the total sample size.
    pub fn new(groups: Vec<Sem>) -> Result<Self> {
        let total: usize = groups.iter().map(|g| g.n_obs()).sum();
        let weights = groups
            .iter()
            .map(|g| g.n_obs() as f64 / total as f64)
            .collect();
        Self::with_weights(groups, weights)
    }

    pub fn with_weights(groups: Vec<Sem>, weights: Vec<f64>) -> Result<Self> {
        if groups.is_empty() {
            return Err(SemError::InvalidSpecification(
                "an ensemble needs at least one group".to_string(),
            ));
        }
        if weights.len() != groups.len() {
            return Err(SemError::DimensionMismatch(format!(
                "{} weights for {} groups",
                weights.len(),
                groups.len()
            )));
        }
        let mut labels: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut start = Vec::new();
        let mut lower = Vec::new();
        let mut upper = Vec::new();
        let mut maps = Vec::with_capacity(groups.len());
        for group in &groups {
            let mut map = Vec::with_capacity(group.n_params());
            for (k, label) in group.param_labels().iter().enumerate() {
                let global = match index.get(label) {
                    Some(&g) => {
                        lower[g] = f64::max(lower[g], group.lower_bounds()[k]);
                        upper[g] = f64::min(upper[g], group.upper_bounds()[k]);
                        g
                    }
                    None => {
                        let g = labels.len();
                        index.insert(label.clone(), g);
                        labels.push(label.clone());
                        start.push(group.start_values()[k]);
                        lower.push(group.lower_bounds()[k]);
                        upper.push(group.upper_bounds()[k]);
                        g
                    }
                };
                map.push(global);
            }
            maps.push(map);
        }
        debug!(
            "ensemble: {} groups, {} shared parameters",
            groups.len(),
            labels.len()
        );
        Ok(SemEnsemble {
            groups,
            weights,
            labels,
            maps,
            start,
            lower,
            upper,
        })
    }

    pub fn groups(&self) -> &[Sem] {
        &self.groups
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Positions of group `g`'s parameters in the shared vector.
    pub fn group_map(&self, g: usize) -> &[usize] {
        &self.maps[g]
    }

    /// The slice of `theta` belonging to group `g`.
    pub fn group_theta(&self, g: usize, theta: &[f64]) -> Vec<f64> {
        self.maps[g].iter().map(|&i| theta[i]).collect()
    }
}

impl SemObjective for SemEnsemble {
    fn n_params(&self) -> usize {
        self.labels.len()
    }

    fn param_labels(&self) -> &[String] {
        &self.labels
    }

    fn start_values(&self) -> &[f64] {
        &self.start
    }

    fn lower_bounds(&self) -> &[f64] {
        &self.lower
    }

    fn upper_bounds(&self) -> &[f64] {
        &self.upper
    }

    fn evaluate(&mut self, theta: &[f64], order: Order) -> Result<LossValue> {
        let q = self.n_params();
        if theta.len() != q {
            return Err(SemError::DimensionMismatch(format!(
                "parameter vector has length {}, ensemble has {q} parameters",
                theta.len()
            )));
        }
        let mut total = LossValue::zero(q, order);
        for g in 0..self.groups.len() {
            let local = self.group_theta(g, theta);
            let value = self.groups[g].evaluate(&local, order)?;
            if !value.is_feasible() {
                return Ok(LossValue::infeasible(q, order));
            }
            total.add_mapped(&value, self.weights[g], &self.maps[g]);
        }
        Ok(total)
    }

    fn max_order(&self) -> Order {
        self.groups
            .iter()
            .map(|g| g.max_order())
            .min()
            .unwrap_or(Order::Objective)
    }

    fn n_obs(&self) -> usize {
        self.groups.iter().map(|g| g.n_obs()).sum()
    }

    fn n_moments(&self) -> usize {
        self.groups.iter().map(|g| g.n_moments()).sum()
    }

    fn loss_kinds(&self) -> Vec<LossKind> {
        self.groups.iter().flat_map(|g| g.loss_kinds()).collect()
    }

    fn minus2ll(&mut self, theta: &[f64]) -> Result<Option<f64>> {
        let mut total = 0.0;
        for g in 0..self.groups.len() {
            let local = self.group_theta(g, theta);
            match self.groups[g].minus2ll(&local)? {
                Some(v) => total += v,
                None => return Ok(None),
            }
        }
        Ok(Some(total))
    }

    fn se_scale(&self) -> f64 {
        2.0 / self.n_obs() as f64
    }
}
