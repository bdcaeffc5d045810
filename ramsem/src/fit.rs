use std::cell::{Cell, RefCell};

use nlopt::{Algorithm, FailState, Nlopt, SuccessState, Target, approximate_gradient};
use tracing::{debug, info, warn};

use crate::error::{Result, SemError};
use crate::model::SemObjective;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizerAlgorithm {
    #[default]
    Lbfgs,
    Slsqp,
    NelderMead,
}

impl OptimizerAlgorithm {
    fn nlopt(self) -> Algorithm {
        match self {
            OptimizerAlgorithm::Lbfgs => Algorithm::Lbfgs,
            OptimizerAlgorithm::Slsqp => Algorithm::Slsqp,
            OptimizerAlgorithm::NelderMead => Algorithm::Neldermead,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OptimizerAlgorithm::Lbfgs => "NLopt L-BFGS",
            OptimizerAlgorithm::Slsqp => "NLopt SLSQP",
            OptimizerAlgorithm::NelderMead => "NLopt Nelder-Mead",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerOptions {
    pub algorithm: OptimizerAlgorithm,
    pub ftol_rel: f64,
    pub xtol_rel: f64,
    pub maxeval: u32,
    /// Overrides the model's start values.
    pub start: Option<Vec<f64>>,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        OptimizerOptions {
            algorithm: OptimizerAlgorithm::Lbfgs,
            ftol_rel: 1e-12,
            xtol_rel: 1e-10,
            maxeval: 10_000,
            start: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerDiagnostics {
    pub algorithm: OptimizerAlgorithm,
    pub evaluations: usize,
    pub converged: bool,
    pub status: String,
}

/// Outcome of one optimization run. Never modified after creation.
#[derive(Debug, Clone)]
pub struct SemFit<M> {
    minimum: f64,
    solution: Vec<f64>,
    start: Vec<f64>,
    model: M,
    diagnostics: OptimizerDiagnostics,
}

impl<M: SemObjective> SemFit<M> {
    pub fn minimum(&self) -> f64 {
        self.minimum
    }

    pub fn solution(&self) -> &[f64] {
        &self.solution
    }

    pub fn start_values(&self) -> &[f64] {
        &self.start
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn diagnostics(&self) -> &OptimizerDiagnostics {
        &self.diagnostics
    }

    pub fn converged(&self) -> bool {
        self.diagnostics.converged
    }

    pub fn param_labels(&self) -> &[String] {
        self.model.param_labels()
    }
}

struct ObjData<M> {
    model: RefCell<M>,
    evals: Cell<usize>,
    error: RefCell<Option<SemError>>,
}

impl<M: SemObjective> ObjData<M> {
    fn objective(&self, theta: &[f64]) -> f64 {
        match self.model.borrow_mut().objective(theta) {
            Ok(f) => f,
            Err(e) => self.fail(e),
        }
    }

    fn gradient(&self, theta: &[f64], grad: &mut [f64]) -> f64 {
        match self.model.borrow_mut().gradient(theta, grad) {
            Ok(f) => f,
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, e: SemError) -> f64 {
        let mut slot = self.error.borrow_mut();
        if slot.is_none() {
            *slot = Some(e);
        }
        f64::INFINITY
    }
}

fn converged(state: SuccessState) -> bool {
    matches!(
        state,
        SuccessState::Success
            | SuccessState::FtolReached
            | SuccessState::XtolReached
            | SuccessState::StopValReached
    )
}

/// Minimizes the model objective with NLopt. The model is moved into the returned fit.
pub fn fit<M: SemObjective>(model: M, options: &OptimizerOptions) -> Result<SemFit<M>> {
    let n = model.n_params();
    let start = match options.start.as_ref() {
        Some(start) if start.len() != n => {
            return Err(SemError::DimensionMismatch(format!(
                "{} start values for {n} parameters",
                start.len()
            )));
        }
        Some(start) => start.clone(),
        None => model.start_values().to_vec(),
    };
    let lower = model.lower_bounds().to_vec();
    let upper = model.upper_bounds().to_vec();
    let analytic = model.has_gradient();
    info!(
        "fitting {n} parameters with {} ({} gradient)",
        options.algorithm.name(),
        if analytic { "analytic" } else { "numerical" }
    );

    let obj_data = ObjData {
        model: RefCell::new(model),
        evals: Cell::new(0),
        error: RefCell::new(None),
    };

    let obj = move |x: &[f64], grad: Option<&mut [f64]>, data: &mut ObjData<M>| -> f64 {
        data.evals.set(data.evals.get() + 1);
        match grad {
            Some(g) if analytic => data.gradient(x, g),
            Some(g) => {
                approximate_gradient(x, |x| data.objective(x), g);
                data.objective(x)
            }
            None => data.objective(x),
        }
    };

    let mut opt = Nlopt::new(
        options.algorithm.nlopt(),
        n,
        obj,
        Target::Minimize,
        obj_data,
    );
    let _ = opt.set_ftol_rel(options.ftol_rel);
    let _ = opt.set_xtol_rel(options.xtol_rel);
    let _ = opt.set_maxeval(options.maxeval);
    if lower.iter().any(|v| v.is_finite()) {
        let _ = opt.set_lower_bounds(&lower);
    }
    if upper.iter().any(|v| v.is_finite()) {
        let _ = opt.set_upper_bounds(&upper);
    }

    let mut theta = start.clone();
    let result = opt.optimize(&mut theta);
    let obj_data = opt.recover_user_data();
    if let Some(e) = obj_data.error.into_inner() {
        return Err(e);
    }
    let evaluations = obj_data.evals.get();
    let mut model = obj_data.model.into_inner();

    let (converged, status, reported) = match result {
        Ok((state, f)) => (converged(state), format!("{state:?}"), f),
        Err((FailState::InvalidArgs, _)) => {
            return Err(SemError::Optimizer(
                "NLopt rejected the arguments (start values outside bounds?)".to_string(),
            ));
        }
        Err((fail, f)) => (false, format!("{fail:?}"), f),
    };
    let minimum = model.objective(&theta)?;
    debug!("optimizer reported {reported}, objective at solution {minimum}");
    if converged {
        info!("converged after {evaluations} evaluations: F = {minimum:.6} ({status})");
    } else {
        warn!("optimizer did not converge after {evaluations} evaluations: {status}");
    }

    Ok(SemFit {
        minimum,
        solution: theta,
        start,
        model,
        diagnostics: OptimizerDiagnostics {
            algorithm: options.algorithm,
            evaluations,
            converged,
            status,
        },
    })
}
