use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::{Cholesky, Inverse, UPLO};

pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Half-vectorization of the lower triangle, column by column.
pub fn vech(matrix: &ArrayView2<f64>) -> Array1<f64> {
    let n = matrix.nrows();
    let mut out = Vec::with_capacity(n * (n + 1) / 2);
    for j in 0..n {
        for i in j..n {
            out.push(matrix[(i, j)]);
        }
    }
    Array1::from_vec(out)
}

pub fn symmetrize(matrix: &mut Array2<f64>) {
    let n = matrix.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[(i, j)] + matrix[(j, i)]);
            matrix[(i, j)] = avg;
            matrix[(j, i)] = avg;
        }
    }
}

/// `tr(AB)` without forming the product.
pub fn trace_product(a: &ArrayView2<f64>, b: &ArrayView2<f64>) -> f64 {
    let mut sum = 0.0;
    for i in 0..a.nrows() {
        for j in 0..a.ncols() {
            sum += a[(i, j)] * b[(j, i)];
        }
    }
    sum
}

/// Adds `scale * x yᵀ` to `target`.
pub fn add_outer(target: &mut Array2<f64>, x: ArrayView1<f64>, y: ArrayView1<f64>, scale: f64) {
    for (r, &xr) in x.iter().enumerate() {
        if xr != 0.0 {
            target.row_mut(r).scaled_add(scale * xr, &y);
        }
    }
}

/// Log-determinant and inverse of a symmetric positive definite matrix, or `None` when the
/// Cholesky factorization fails or produces non-finite values.
pub fn spd_logdet_inverse(matrix: &Array2<f64>) -> Option<(f64, Array2<f64>)> {
    let chol = matrix.cholesky(UPLO::Lower).ok()?;
    let mut logdet = 0.0;
    for i in 0..chol.nrows() {
        let d = chol[(i, i)];
        if !(d.is_finite() && d > 0.0) {
            return None;
        }
        logdet += 2.0 * d.ln();
    }
    let mut inv = matrix.inv().ok()?;
    if !inv.iter().all(|v| v.is_finite()) {
        return None;
    }
    symmetrize(&mut inv);
    Some((logdet, inv))
}

pub fn kron(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let (m, n) = a.dim();
    let (p, q) = b.dim();
    let mut out = Array2::<f64>::zeros((m * p, n * q));
    for i in 0..m {
        for j in 0..n {
            let aij = a[(i, j)];
            for ii in 0..p {
                for jj in 0..q {
                    out[(i * p + ii, j * q + jj)] = aij * b[(ii, jj)];
                }
            }
        }
    }
    out
}

/// `D' X D` for the duplication matrix `D` of an n×n symmetric matrix, with `X` of size n²×n².
pub fn duplication_pre_post(x: &Array2<f64>) -> Array2<f64> {
    let n2 = x.nrows();
    let n = (n2 as f64).sqrt().round() as usize;
    let lower = vech_idx(n);
    let upper = vechru_idx(n);
    let pstar = lower.len();
    let diagonal: Vec<usize> = (0..pstar).filter(|&r| lower[r] == upper[r]).collect();

    let mut rows = Array2::<f64>::zeros((pstar, n2));
    for r in 0..pstar {
        for c in 0..n2 {
            rows[(r, c)] = x[(lower[r], c)] + x[(upper[r], c)];
        }
    }
    for &r in &diagonal {
        rows.row_mut(r).mapv_inplace(|v| 0.5 * v);
    }
    let mut out = Array2::<f64>::zeros((pstar, pstar));
    for r in 0..pstar {
        for c in 0..pstar {
            out[(r, c)] = rows[(r, lower[c])] + rows[(r, upper[c])];
        }
    }
    for &c in &diagonal {
        out.column_mut(c).mapv_inplace(|v| 0.5 * v);
    }
    out
}

/// Column-major positions of the lower triangle, in `vech` order.
fn vech_idx(n: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(n * (n + 1) / 2);
    for j in 0..n {
        for i in j..n {
            out.push(i + j * n);
        }
    }
    out
}

/// Column-major positions of the mirrored upper-triangle cells, in `vech` order.
fn vechru_idx(n: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(n * (n + 1) / 2);
    for j in 0..n {
        for i in j..n {
            out.push(j + i * n);
        }
    }
    out
}

/// `½ D'(S⁻¹ ⊗ S⁻¹)D`, the normal-theory weight for half-vectorized covariances.
pub fn normal_weight(s_inv: &Array2<f64>) -> Array2<f64> {
    let mut w = duplication_pre_post(&kron(s_inv, s_inv));
    w.mapv_inplace(|v| 0.5 * v);
    w
}

pub fn block_diag(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let n = a.nrows();
    let m = b.nrows();
    let mut out = Array2::<f64>::zeros((n + m, n + m));
    out.slice_mut(ndarray::s![..n, ..n]).assign(a);
    out.slice_mut(ndarray::s![n.., n..]).assign(b);
    out
}
