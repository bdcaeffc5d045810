use ndarray::{Array1, Array2};
use ndarray_linalg::Inverse;
use tracing::{debug, warn};

use crate::error::{Result, SemError};
use crate::fit::SemFit;
use crate::linalg::symmetrize;
use crate::model::SemObjective;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HessianMethod {
    #[default]
    Analytic,
    /// Central differences of the analytic (or numerical) gradient.
    FiniteDifference,
    Optimizer,
    Expected,
}

/// Hessian of the objective at the solution of `fit`.
pub fn hessian<M: SemObjective + Clone>(fit: &SemFit<M>, method: HessianMethod) -> Result<Array2<f64>> {
    let mut model = fit.model().clone();
    let theta = fit.solution();
    match method {
        HessianMethod::Analytic => model.hessian(theta),
        HessianMethod::FiniteDifference => finite_difference_hessian(&mut model, theta),
        HessianMethod::Optimizer => Err(SemError::NotImplemented(
            "hessian from the optimizer state".to_string(),
        )),
        HessianMethod::Expected => Err(SemError::NotImplemented(
            "expected information hessian".to_string(),
        )),
    }
}

/// `sqrt(diag(c · H⁻¹))` with the model's scale `c`. Negative variances give `NaN`.
pub fn standard_errors<M: SemObjective + Clone>(
    fit: &SemFit<M>,
    method: HessianMethod,
) -> Result<Array1<f64>> {
    let vcov = parameter_covariance(fit, method)?;
    Ok(vcov.diag().mapv(|v| {
        if v.is_finite() && v >= 0.0 {
            v.sqrt()
        } else {
            f64::NAN
        }
    }))
}

/// `c · H⁻¹`, the asymptotic covariance of the estimates.
pub fn parameter_covariance<M: SemObjective + Clone>(
    fit: &SemFit<M>,
    method: HessianMethod,
) -> Result<Array2<f64>> {
    let h = hessian(fit, method)?;
    if h.iter().any(|v| !v.is_finite()) {
        warn!("hessian at the solution is not finite");
        return Err(SemError::InvalidSpecification(
            "hessian at the solution is not finite".to_string(),
        ));
    }
    let scale = fit.model().se_scale();
    debug!("standard errors: {method:?} hessian, scale {scale}");
    let mut vcov = h.inv()? * scale;
    symmetrize(&mut vcov);
    Ok(vcov)
}

fn gradient_at<M: SemObjective>(model: &mut M, theta: &[f64]) -> Result<Vec<f64>> {
    let mut grad = vec![0.0; theta.len()];
    if model.has_gradient() {
        model.gradient(theta, &mut grad)?;
    } else {
        for i in 0..theta.len() {
            let eps = 1e-6 * theta[i].abs().max(1.0);
            let mut t_plus = theta.to_vec();
            let mut t_minus = theta.to_vec();
            t_plus[i] += eps;
            t_minus[i] -= eps;
            grad[i] = (model.objective(&t_plus)? - model.objective(&t_minus)?) / (2.0 * eps);
        }
    }
    Ok(grad)
}

fn finite_difference_hessian<M: SemObjective>(model: &mut M, theta: &[f64]) -> Result<Array2<f64>> {
    let q = theta.len();
    let mut h = Array2::<f64>::zeros((q, q));
    for j in 0..q {
        let eps = 1e-5 * theta[j].abs().max(1.0);
        let mut t_plus = theta.to_vec();
        let mut t_minus = theta.to_vec();
        t_plus[j] += eps;
        t_minus[j] -= eps;
        let plus = gradient_at(model, &t_plus)?;
        let minus = gradient_at(model, &t_minus)?;
        for i in 0..q {
            h[(i, j)] = (plus[i] - minus[i]) / (2.0 * eps);
        }
    }
    symmetrize(&mut h);
    Ok(h)
}
