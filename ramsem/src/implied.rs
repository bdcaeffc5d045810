//! Model-implied moments of a RAM specification.
//!
//! With `G = F(I - A)⁻¹` the implied moments are `Σ = G S Gᵀ` and `μ = G M`. Each free
//! parameter only ever fills the cells listed for it in the specification, so the first
//! derivatives are sums of outer products over those cells:
//!
//! ```text
//! ∂Σ/∂θk = Σ_{(i,j) ∈ A_k} (g_i h_jᵀ + h_j g_iᵀ) + Σ_{(i,j) ∈ S_k} g_i g_jᵀ,   H = (I - A)⁻¹ S Gᵀ
//! ∂μ/∂θk = Σ_{(i,j) ∈ A_k} g_i ((I - A)⁻¹ M)_j + Σ_{i ∈ M_k} g_i
//! ```
//!
//! where `g_i` is column `i` of G and `h_j` row `j` of H. The full inverse is only formed
//! when derivatives are requested or when A is not triangular.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use ndarray_linalg::{Diag, Inverse, SolveTriangular, UPLO};

use crate::error::{Result, SemError};
use crate::linalg::{add_outer, symmetrize};
use crate::specification::{ParamCells, RamSpec, Triangularity};

/// Highest derivative order an evaluation should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Order {
    Objective,
    Gradient,
    Hessian,
}

/// Workspace holding every buffer of one implied-moments evaluation. Buffers are overwritten
/// on each [`RamImplied::update`]; clones are fully independent.
#[derive(Debug, Clone)]
pub struct RamImplied {
    spec: Arc<RamSpec>,
    a: Array2<f64>,
    s: Array2<f64>,
    m: Option<Array1<f64>>,
    i_a: Array2<f64>,
    inv_ia: Array2<f64>,
    g: Array2<f64>,
    sigma: Array2<f64>,
    mu: Option<Array1<f64>>,
    dsigma: Vec<Array2<f64>>,
    dmu: Option<Array2<f64>>,
    d2sigma: Vec<Array2<f64>>,
    d2mu: Vec<Array1<f64>>,
}

impl RamImplied {
    pub fn new(spec: Arc<RamSpec>) -> Self {
        let n = spec.n_vars();
        let p = spec.n_observed();
        RamImplied {
            a: spec.a().clone(),
            s: spec.s().clone(),
            m: spec.m().cloned(),
            i_a: Array2::zeros((n, n)),
            inv_ia: Array2::zeros((n, n)),
            g: Array2::zeros((p, n)),
            sigma: Array2::zeros((p, p)),
            mu: spec.m().map(|_| Array1::zeros(p)),
            dsigma: Vec::new(),
            dmu: None,
            d2sigma: Vec::new(),
            d2mu: Vec::new(),
            spec,
        }
    }

    pub fn spec(&self) -> &RamSpec {
        &self.spec
    }

    pub fn n_params(&self) -> usize {
        self.spec.n_params()
    }

    /// Evaluates Σ and μ at `theta`, plus derivatives up to `order`.
    pub fn update(&mut self, theta: &[f64], order: Order) -> Result<()> {
        let spec = Arc::clone(&self.spec);
        if theta.len() != spec.n_params() {
            return Err(SemError::DimensionMismatch(format!(
                "parameter vector has length {}, model has {} parameters",
                theta.len(),
                spec.n_params()
            )));
        }
        self.fill(&spec, theta);

        let n = spec.n_vars();
        self.i_a = Array2::<f64>::eye(n) - &self.a;
        let triangularity = spec.triangularity();
        if order > Order::Objective || triangularity == Triangularity::Neither {
            self.inv_ia = structural_inverse(&self.i_a, triangularity)?;
            self.g = spec.f().dot(&self.inv_ia);
        } else {
            self.g = selected_inverse_triangular(&self.i_a, spec.f(), triangularity)?;
        }

        let mut sigma = self.g.dot(&self.s).dot(&self.g.t());
        symmetrize(&mut sigma);
        self.sigma = sigma;
        self.mu = self.m.as_ref().map(|m| self.g.dot(m));

        if order >= Order::Gradient {
            self.first_derivatives(&spec);
        }
        if order >= Order::Hessian {
            self.second_derivatives(&spec);
        }
        Ok(())
    }

    fn fill(&mut self, spec: &RamSpec, theta: &[f64]) {
        let n = spec.n_vars();
        for (k, cells) in spec.a_cells().iter() {
            for &pos in cells {
                self.a[(pos / n, pos % n)] = theta[k];
            }
        }
        for (k, cells) in spec.s_cells().iter() {
            for &pos in cells {
                self.s[(pos / n, pos % n)] = theta[k];
            }
        }
        if let Some(m) = self.m.as_mut() {
            for (k, cells) in spec.m_cells().iter() {
                for &pos in cells {
                    m[pos] = theta[k];
                }
            }
        }
    }

    fn first_derivatives(&mut self, spec: &RamSpec) {
        let n = spec.n_vars();
        let p = spec.n_observed();
        let q = spec.n_params();
        let h = self.inv_ia.dot(&self.s).dot(&self.g.t());
        let bm = self.m.as_ref().map(|m| self.inv_ia.dot(m));

        let mut dsigma = Vec::with_capacity(q);
        let mut dmu = self.m.as_ref().map(|_| Array2::<f64>::zeros((p, q)));
        for k in 0..q {
            let mut paths = Array2::<f64>::zeros((p, p));
            let mut mean = Array1::<f64>::zeros(p);
            for &pos in spec.a_cells().cells(k) {
                let (i, j) = (pos / n, pos % n);
                add_outer(&mut paths, self.g.column(i), h.row(j), 1.0);
                if let Some(bm) = bm.as_ref() {
                    mean.scaled_add(bm[j], &self.g.column(i));
                }
            }
            let mut d = &paths + &paths.t();
            for &pos in spec.s_cells().cells(k) {
                let (i, j) = (pos / n, pos % n);
                add_outer(&mut d, self.g.column(i), self.g.column(j), 1.0);
            }
            for &i in spec.m_cells().cells(k) {
                mean += &self.g.column(i);
            }
            if let Some(dmu) = dmu.as_mut() {
                dmu.column_mut(k).assign(&mean);
            }
            dsigma.push(d);
        }
        self.dsigma = dsigma;
        self.dmu = dmu;
    }

    /// Second derivatives from dense indicator matrices. With `B = (I - A)⁻¹`,
    /// `P = B S Bᵀ`, `Xk = B A_k` and `Yk = B S_k Bᵀ`:
    ///
    /// ```text
    /// ∂²Σ/∂θk∂θl = F (T + Tᵀ + U + Uᵀ) Fᵀ
    /// T = Xl Xk P + Xk (Xl P + Yl + P Xlᵀ),   U = Xl Yk
    /// ∂²μ/∂θk∂θl = F (Xl Xk B M + Xk Xl B M + Xk B M_l + Xl B M_k)
    /// ```
    fn second_derivatives(&mut self, spec: &RamSpec) {
        let n = spec.n_vars();
        let q = spec.n_params();
        let f = spec.f();
        let b = &self.inv_ia;
        let p_all = b.dot(&self.s).dot(&b.t());

        let x: Vec<Array2<f64>> = (0..q)
            .map(|k| b.dot(&indicator(spec.a_cells(), k, n)))
            .collect();
        let y: Vec<Array2<f64>> = (0..q)
            .map(|k| b.dot(&indicator(spec.s_cells(), k, n)).dot(&b.t()))
            .collect();
        let xp: Vec<Array2<f64>> = x.iter().map(|xk| xk.dot(&p_all)).collect();
        let p_deriv: Vec<Array2<f64>> = (0..q).map(|k| &xp[k] + &y[k] + &xp[k].t()).collect();

        let mut d2sigma = vec![Array2::<f64>::zeros((f.nrows(), f.nrows())); q * q];
        for k in 0..q {
            for l in k..q {
                let t = x[l].dot(&xp[k]) + x[k].dot(&p_deriv[l]);
                let u = x[l].dot(&y[k]);
                let inner = &t + &t.t() + &u + &u.t();
                let mut d = f.dot(&inner).dot(&f.t());
                symmetrize(&mut d);
                d2sigma[l * q + k] = d.clone();
                d2sigma[k * q + l] = d;
            }
        }
        self.d2sigma = d2sigma;

        self.d2mu = match self.m.as_ref() {
            Some(m) => {
                let bm = b.dot(m);
                let bmk: Vec<Array1<f64>> = (0..q)
                    .map(|k| {
                        let mut mk = Array1::<f64>::zeros(n);
                        for &i in spec.m_cells().cells(k) {
                            mk[i] = 1.0;
                        }
                        b.dot(&mk)
                    })
                    .collect();
                let xbm: Vec<Array1<f64>> = x.iter().map(|xk| xk.dot(&bm)).collect();
                let mut d2mu = vec![Array1::<f64>::zeros(f.nrows()); q * q];
                for k in 0..q {
                    for l in k..q {
                        let inner = x[l].dot(&xbm[k])
                            + x[k].dot(&xbm[l])
                            + x[k].dot(&bmk[l])
                            + x[l].dot(&bmk[k]);
                        let d = f.dot(&inner);
                        d2mu[l * q + k] = d.clone();
                        d2mu[k * q + l] = d;
                    }
                }
                d2mu
            }
            None => Vec::new(),
        };
    }

    pub fn sigma(&self) -> &Array2<f64> {
        &self.sigma
    }

    pub fn mu(&self) -> Option<&Array1<f64>> {
        self.mu.as_ref()
    }

    /// `∂Σ/∂θk`, valid after an update with at least [`Order::Gradient`].
    pub fn dsigma(&self) -> &[Array2<f64>] {
        &self.dsigma
    }

    /// `∂μ/∂θ` as a p×q matrix, one column per parameter.
    pub fn dmu(&self) -> Option<&Array2<f64>> {
        self.dmu.as_ref()
    }

    /// `∂²Σ/∂θk∂θl`, valid after an update with [`Order::Hessian`].
    pub fn d2sigma(&self, k: usize, l: usize) -> &Array2<f64> {
        &self.d2sigma[k * self.spec.n_params() + l]
    }

    pub fn d2mu(&self, k: usize, l: usize) -> Option<&Array1<f64>> {
        self.d2mu.get(k * self.spec.n_params() + l)
    }
}

fn indicator(cells: &ParamCells, k: usize, n: usize) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((n, n));
    for &pos in cells.cells(k) {
        out[(pos / n, pos % n)] = 1.0;
    }
    out
}

fn check_finite(matrix: Array2<f64>) -> Result<Array2<f64>> {
    if matrix.iter().all(|v| v.is_finite()) {
        Ok(matrix)
    } else {
        Err(SemError::SingularStructuralMatrix)
    }
}

/// `(I - A)⁻¹`, by triangular solve against the identity when A is triangular.
fn structural_inverse(i_a: &Array2<f64>, triangularity: Triangularity) -> Result<Array2<f64>> {
    let n = i_a.nrows();
    let eye = Array2::<f64>::eye(n);
    let inv = match triangularity {
        Triangularity::Lower => i_a.solve_triangular(UPLO::Lower, Diag::Unit, &eye),
        Triangularity::Upper => i_a.solve_triangular(UPLO::Upper, Diag::Unit, &eye),
        Triangularity::Neither => i_a.inv(),
    }
    .map_err(|_| SemError::SingularStructuralMatrix)?;
    check_finite(inv)
}

/// `F (I - A)⁻¹` for triangular A, solving `(I - A)ᵀ Xᵀ = Fᵀ` without forming the inverse.
fn selected_inverse_triangular(
    i_a: &Array2<f64>,
    f: &Array2<f64>,
    triangularity: Triangularity,
) -> Result<Array2<f64>> {
    let uplo = match triangularity {
        Triangularity::Lower => UPLO::Upper,
        Triangularity::Upper => UPLO::Lower,
        Triangularity::Neither => return Ok(f.dot(&structural_inverse(i_a, triangularity)?)),
    };
    let transposed = i_a.t().to_owned();
    let rhs = f.t().to_owned();
    let solved = transposed
        .solve_triangular(uplo, Diag::Unit, &rhs)
        .map_err(|_| SemError::SingularStructuralMatrix)?;
    check_finite(solved.reversed_axes())
}
