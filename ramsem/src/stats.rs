use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::debug;

use crate::error::Result;
use crate::fit::SemFit;
use crate::loss::LossKind;
use crate::model::SemObjective;

/// Summary statistics of a fitted model.
#[derive(Debug, Clone, PartialEq)]
pub struct FitMeasures {
    pub minimum: f64,
    pub n_obs: usize,
    pub n_params: usize,
    pub df: i64,
    pub chisq: f64,
    pub p_chisq: f64,
    /// `NaN` unless every loss term is a likelihood.
    pub minus2ll: f64,
    pub aic: f64,
    pub bic: f64,
}

/// χ² is `(n - 1) F` for ML and WLS. FIML leaves χ² undefined since it needs a saturated model
/// fitted to the same incomplete data.
pub fn fit_measures<M: SemObjective + Clone>(fit: &SemFit<M>) -> Result<FitMeasures> {
    let mut model = fit.model().clone();
    let f = fit.minimum();
    let n = model.n_obs();
    let q = model.n_params();
    let df = model.n_moments() as i64 - q as i64;

    let chisq = if model.loss_kinds().contains(&LossKind::Fiml) {
        f64::NAN
    } else {
        (n as f64 - 1.0) * f
    };
    let minus2ll = model.minus2ll(fit.solution())?.unwrap_or(f64::NAN);
    debug!("stats: F={f}, n={n}, q={q}, df={df}, chisq={chisq}, -2LL={minus2ll}");

    let p_chisq = if df > 0 && chisq.is_finite() {
        match ChiSquared::new(df as f64) {
            Ok(chi) => 1.0 - chi.cdf(chisq),
            Err(_) => f64::NAN,
        }
    } else {
        f64::NAN
    };
    let aic = minus2ll + 2.0 * q as f64;
    let bic = minus2ll + (n as f64).ln() * q as f64;
    debug!("stats: p={p_chisq}, AIC={aic}, BIC={bic}");

    Ok(FitMeasures {
        minimum: f,
        n_obs: n,
        n_params: q,
        df,
        chisq,
        p_chisq,
        minus2ll,
        aic,
        bic,
    })
}
