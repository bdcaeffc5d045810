//! RAM matrices built from a parameter table.
//!
//! A (n×n) holds directed paths with `A[to, from]`, S (n×n) holds symmetric (co)variances,
//! F (m×n) selects the observed variables and the optional M (n) holds intercepts. Free
//! parameters are not stored in the matrices; instead each parameter index owns the list of
//! flat row-major cell positions it fills on every evaluation.

use std::collections::{HashMap, HashSet};

use ndarray::{Array1, Array2};
use ndarray_linalg::Determinant;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{Result, SemError};
use crate::partable::{ParameterTable, Relation};

const TRIANGULARITY_SEED: u64 = 0x5e3_ba5e;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Triangularity {
    /// Strictly lower triangular A under the variable order.
    Lower,
    /// Strictly upper triangular A under the variable order.
    Upper,
    Neither,
}

/// What a free parameter represents, taken from the first row that carries its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Loading,
    Regression,
    VarianceObserved,
    VarianceLatent,
    Covariance,
    Mean,
}

/// Per-parameter cell lists stored as one arena: the cells of parameter `k` are
/// `positions[offsets[k]..offsets[k + 1]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamCells {
    offsets: Vec<usize>,
    positions: Vec<usize>,
}

impl ParamCells {
    fn from_lists(lists: Vec<Vec<usize>>) -> Self {
        let mut offsets = Vec::with_capacity(lists.len() + 1);
        let mut positions = Vec::new();
        offsets.push(0);
        for list in lists {
            positions.extend(list);
            offsets.push(positions.len());
        }
        ParamCells { offsets, positions }
    }

    pub fn n_params(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn cells(&self, k: usize) -> &[usize] {
        &self.positions[self.offsets[k]..self.offsets[k + 1]]
    }

    /// True when no parameter occupies any cell.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[usize])> + '_ {
        (0..self.n_params()).map(move |k| (k, self.cells(k)))
    }
}

#[derive(Debug, Clone)]
pub struct RamSpec {
    vars: Vec<String>,
    observed: Vec<String>,
    param_labels: Vec<String>,
    param_kinds: Vec<ParamKind>,
    table_start: Vec<Option<f64>>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    a: Array2<f64>,
    s: Array2<f64>,
    f: Array2<f64>,
    m: Option<Array1<f64>>,
    a_cells: ParamCells,
    s_cells: ParamCells,
    m_cells: ParamCells,
    triangularity: Triangularity,
}

impl RamSpec {
    /// Uses the table's sorted variable order when it has been computed, declaration order
    /// otherwise.
    pub fn from_table(table: &ParameterTable) -> Result<RamSpec> {
        let vars: Vec<String> = match table.sorted_vars() {
            Some(sorted) => sorted.to_vec(),
            None => table.variables(),
        };
        let n = vars.len();
        let index: HashMap<String, usize> = vars
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i))
            .collect();
        let lookup = |name: &str| {
            index
                .get(name)
                .copied()
                .ok_or_else(|| SemError::UnknownVariable(name.to_string()))
        };

        let observed = table.observed_vars().to_vec();
        let mut f = Array2::<f64>::zeros((observed.len(), n));
        for (row, name) in observed.iter().enumerate() {
            f[(row, lookup(name)?)] = 1.0;
        }

        let param_labels = table.param_labels();
        let q = param_labels.len();
        let label_index: HashMap<String, usize> = param_labels
            .iter()
            .enumerate()
            .map(|(k, l)| (l.clone(), k))
            .collect();

        let mut a = Array2::<f64>::zeros((n, n));
        let mut s = Array2::<f64>::zeros((n, n));
        let mut m = table.has_meanstructure().then(|| Array1::<f64>::zeros(n));
        let mut a_lists = vec![Vec::new(); q];
        let mut s_lists = vec![Vec::new(); q];
        let mut m_lists = vec![Vec::new(); q];
        let mut param_kinds: Vec<Option<ParamKind>> = vec![None; q];
        let mut table_start: Vec<Option<f64>> = vec![None; q];
        let mut lower = vec![f64::NEG_INFINITY; q];
        let mut upper = vec![f64::INFINITY; q];

        let mut taken_a = HashSet::new();
        let mut taken_s = HashSet::new();
        let mut taken_m = HashSet::new();
        let latent: HashSet<&str> = table.latent_vars().iter().map(String::as_str).collect();

        for row in table {
            let param = if row.free {
                let k = label_index[&row.label];
                if table_start[k].is_none() {
                    table_start[k] = row.start;
                }
                lower[k] = lower[k].max(row.lower);
                upper[k] = upper[k].min(row.upper);
                Some(k)
            } else {
                None
            };
            let duplicate = || {
                SemError::InvalidSpecification(format!(
                    "cell {} {} {} is specified more than once",
                    row.from, row.relation, row.to
                ))
            };

            match row.relation {
                Relation::Regression => {
                    let (r, c) = (lookup(&row.to)?, lookup(&row.from)?);
                    if !taken_a.insert(r * n + c) {
                        return Err(duplicate());
                    }
                    match param {
                        Some(k) => {
                            a_lists[k].push(r * n + c);
                            let kind = if latent.contains(row.from.as_str())
                                && !latent.contains(row.to.as_str())
                            {
                                ParamKind::Loading
                            } else {
                                ParamKind::Regression
                            };
                            param_kinds[k].get_or_insert(kind);
                        }
                        None => a[(r, c)] = row.value_fixed,
                    }
                }
                Relation::Covariance => {
                    let (i, j) = (lookup(&row.from)?, lookup(&row.to)?);
                    let mut cells = vec![i * n + j];
                    if i != j {
                        cells.push(j * n + i);
                    }
                    for &pos in &cells {
                        if !taken_s.insert(pos) {
                            return Err(duplicate());
                        }
                    }
                    match param {
                        Some(k) => {
                            s_lists[k].extend(cells);
                            let kind = if i != j {
                                ParamKind::Covariance
                            } else if latent.contains(row.from.as_str()) {
                                ParamKind::VarianceLatent
                            } else {
                                ParamKind::VarianceObserved
                            };
                            param_kinds[k].get_or_insert(kind);
                        }
                        None => {
                            s[(i, j)] = row.value_fixed;
                            s[(j, i)] = row.value_fixed;
                        }
                    }
                }
                Relation::Intercept => {
                    let i = lookup(&row.to)?;
                    if !taken_m.insert(i) {
                        return Err(duplicate());
                    }
                    match param {
                        Some(k) => {
                            m_lists[k].push(i);
                            param_kinds[k].get_or_insert(ParamKind::Mean);
                        }
                        None => {
                            if let Some(m) = m.as_mut() {
                                m[i] = row.value_fixed;
                            }
                        }
                    }
                }
            }
        }

        let a_cells = ParamCells::from_lists(a_lists);
        let triangularity = detect_triangularity(&a, &a_cells);
        debug!("RAM specification: n={n}, m={}, q={q}, A {:?}", observed.len(), triangularity);
        if triangularity == Triangularity::Neither {
            debug!(
                "A is not triangular; random-fill acyclicity hint: {}",
                acyclic_hint(&a, &a_cells)
            );
        }

        Ok(RamSpec {
            vars,
            observed,
            param_labels,
            param_kinds: param_kinds
                .into_iter()
                .map(|k| k.unwrap_or(ParamKind::Regression))
                .collect(),
            table_start,
            lower,
            upper,
            a,
            s,
            f,
            m,
            a_cells,
            s_cells: ParamCells::from_lists(s_lists),
            m_cells: ParamCells::from_lists(m_lists),
            triangularity,
        })
    }

    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    pub fn observed(&self) -> &[String] {
        &self.observed
    }

    pub fn param_labels(&self) -> &[String] {
        &self.param_labels
    }

    pub fn param_kinds(&self) -> &[ParamKind] {
        &self.param_kinds
    }

    pub fn table_start(&self) -> &[Option<f64>] {
        &self.table_start
    }

    pub fn lower_bounds(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper_bounds(&self) -> &[f64] {
        &self.upper
    }

    pub fn n_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn n_observed(&self) -> usize {
        self.observed.len()
    }

    pub fn n_params(&self) -> usize {
        self.param_labels.len()
    }

    pub fn has_meanstructure(&self) -> bool {
        self.m.is_some()
    }

    /// A with fixed values only; free cells are zero.
    pub fn a(&self) -> &Array2<f64> {
        &self.a
    }

    pub fn s(&self) -> &Array2<f64> {
        &self.s
    }

    pub fn f(&self) -> &Array2<f64> {
        &self.f
    }

    pub fn m(&self) -> Option<&Array1<f64>> {
        self.m.as_ref()
    }

    pub fn a_cells(&self) -> &ParamCells {
        &self.a_cells
    }

    pub fn s_cells(&self) -> &ParamCells {
        &self.s_cells
    }

    pub fn m_cells(&self) -> &ParamCells {
        &self.m_cells
    }

    pub fn triangularity(&self) -> Triangularity {
        self.triangularity
    }
}

fn random_fill(a: &Array2<f64>, cells: &ParamCells) -> Array2<f64> {
    let n = a.ncols();
    let mut rng = StdRng::seed_from_u64(TRIANGULARITY_SEED);
    let mut filled = a.clone();
    for (_, positions) in cells.iter() {
        let value: f64 = rng.gen_range(0.1..1.0);
        for &pos in positions {
            filled[(pos / n, pos % n)] = value;
        }
    }
    filled
}

/// Fills every free A cell with a random value and inspects the zero pattern. This is a
/// performance hint for the implied-moments engine.
pub fn detect_triangularity(a: &Array2<f64>, cells: &ParamCells) -> Triangularity {
    let filled = random_fill(a, cells);
    let n = filled.nrows();
    if (0..n).any(|i| filled[(i, i)] != 0.0) {
        return Triangularity::Neither;
    }
    let upper_zero = (0..n).all(|i| ((i + 1)..n).all(|j| filled[(i, j)] == 0.0));
    if upper_zero {
        return Triangularity::Lower;
    }
    let lower_zero = (0..n).all(|i| (0..i).all(|j| filled[(i, j)] == 0.0));
    if lower_zero {
        return Triangularity::Upper;
    }
    Triangularity::Neither
}

/// Advisory only: `det(I - A)` equals one for acyclic path structures under a random fill.
/// Never a substitute for [`ParameterTable::sort_vars`].
pub fn acyclic_hint(a: &Array2<f64>, cells: &ParamCells) -> bool {
    let filled = random_fill(a, cells);
    let ia = Array2::<f64>::eye(filled.nrows()) - &filled;
    match ia.det() {
        Ok(det) => (det - 1.0).abs() < 1e-8,
        Err(_) => false,
    }
}
