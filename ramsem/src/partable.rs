use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Index;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Result, SemError};

/// Label carried by every fixed row.
pub const CONST_LABEL: &str = "const";

/// Source endpoint of intercept rows.
pub const INTERCEPT_SOURCE: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    /// `from → to`: `to` is regressed on `from`.
    Regression,
    /// `from ↔ to`: (co)variance among residuals or exogenous variables.
    Covariance,
    /// `1 → to`: intercept or mean of `to`.
    Intercept,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Regression => "regression",
            Relation::Covariance => "covariance",
            Relation::Intercept => "intercept",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Relation::Regression => "→",
            Relation::Covariance => "↔",
            Relation::Intercept => "~1",
        };
        f.write_str(symbol)
    }
}

impl FromStr for Relation {
    type Err = SemError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regression" | "→" | "->" => Ok(Relation::Regression),
            "covariance" | "↔" | "<->" => Ok(Relation::Covariance),
            "intercept" | "~1" => Ok(Relation::Intercept),
            other => Err(SemError::InvalidSpecification(format!(
                "unknown relation '{other}'"
            ))),
        }
    }
}

/// Column of a parameter table that can be written back after fitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParColumn {
    Estimate,
    Start,
    StandardError,
}

#[derive(Debug, Clone)]
pub struct ParRow {
    pub from: String,
    pub to: String,
    pub relation: Relation,
    pub free: bool,
    pub value_fixed: f64,
    pub start: Option<f64>,
    pub estimate: f64,
    pub se: f64,
    pub label: String,
    pub lower: f64,
    pub upper: f64,
}

impl ParRow {
    pub fn free(from: &str, to: &str, relation: Relation) -> Self {
        ParRow {
            from: from.to_string(),
            to: to.to_string(),
            relation,
            free: true,
            value_fixed: 0.0,
            start: None,
            estimate: f64::NAN,
            se: f64::NAN,
            label: String::new(),
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    pub fn fixed(from: &str, to: &str, relation: Relation, value: f64) -> Self {
        ParRow {
            free: false,
            value_fixed: value,
            label: CONST_LABEL.to_string(),
            ..ParRow::free(from, to, relation)
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_start(mut self, start: f64) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    pub fn is_constant(&self) -> bool {
        !self.free
    }

    fn column(&self, column: ParColumn) -> f64 {
        match column {
            ParColumn::Estimate => self.estimate,
            ParColumn::Start => self.start.unwrap_or(f64::NAN),
            ParColumn::StandardError => self.se,
        }
    }

    fn set_column(&mut self, column: ParColumn, value: f64) {
        match column {
            ParColumn::Estimate => self.estimate = value,
            ParColumn::Start => self.start = Some(value),
            ParColumn::StandardError => self.se = value,
        }
    }

    fn matches_external(&self, ext: &ExternalParam) -> bool {
        match self.relation {
            Relation::Regression => {
                (ext.op == "=~" && ext.lhs == self.from && ext.rhs == self.to)
                    || (ext.op == "~" && ext.lhs == self.to && ext.rhs == self.from)
            }
            Relation::Covariance => {
                ext.op == "~~"
                    && ((ext.lhs == self.from && ext.rhs == self.to)
                        || (ext.lhs == self.to && ext.rhs == self.from))
            }
            Relation::Intercept => ext.op == "~1" && ext.lhs == self.to,
        }
    }
}

fn float_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

impl PartialEq for ParRow {
    fn eq(&self, other: &Self) -> bool {
        self.from == other.from
            && self.to == other.to
            && self.relation == other.relation
            && self.free == other.free
            && float_eq(self.value_fixed, other.value_fixed)
            && match (self.start, other.start) {
                (Some(a), Some(b)) => float_eq(a, b),
                (None, None) => true,
                _ => false,
            }
            && float_eq(self.estimate, other.estimate)
            && float_eq(self.se, other.se)
            && self.label == other.label
            && float_eq(self.lower, other.lower)
            && float_eq(self.upper, other.upper)
    }
}

/// One row of a solution produced elsewhere, in lavaan's `lhs op rhs` layout.
#[derive(Debug, Clone)]
pub struct ExternalParam {
    pub lhs: String,
    pub op: String,
    pub rhs: String,
    pub value: f64,
}

/// Column-oriented plain form of a parameter table. Missing starts are NaN.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParTableColumns {
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub relation: Vec<String>,
    pub free: Vec<bool>,
    pub value_fixed: Vec<f64>,
    pub start: Vec<f64>,
    pub estimate: Vec<f64>,
    pub se: Vec<f64>,
    pub label: Vec<String>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl ParTableColumns {
    pub fn len(&self) -> usize {
        self.from.len()
    }

    pub fn is_empty(&self) -> bool {
        self.from.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ParameterTable {
    observed: Vec<String>,
    latent: Vec<String>,
    rows: Vec<ParRow>,
    sorted_vars: Option<Vec<String>>,
    auto_labels: usize,
}

impl ParameterTable {
    pub fn new(observed: Vec<String>, latent: Vec<String>) -> Result<Self> {
        let mut seen = HashSet::new();
        for name in observed.iter().chain(latent.iter()) {
            if name == INTERCEPT_SOURCE || name.is_empty() {
                return Err(SemError::InvalidSpecification(format!(
                    "'{name}' cannot be used as a variable name"
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(SemError::InvalidSpecification(format!(
                    "variable '{name}' declared twice or as both observed and latent"
                )));
            }
        }
        Ok(ParameterTable {
            observed,
            latent,
            rows: Vec::new(),
            sorted_vars: None,
            auto_labels: 0,
        })
    }

    pub fn observed_vars(&self) -> &[String] {
        &self.observed
    }

    pub fn latent_vars(&self) -> &[String] {
        &self.latent
    }

    /// All variables in declaration order: latent first, then observed.
    pub fn variables(&self) -> Vec<String> {
        self.latent.iter().chain(self.observed.iter()).cloned().collect()
    }

    pub fn is_variable(&self, name: &str) -> bool {
        self.latent.iter().any(|v| v == name) || self.observed.iter().any(|v| v == name)
    }

    pub fn add_row(&mut self, mut row: ParRow) -> Result<usize> {
        if !self.is_variable(&row.to) {
            return Err(SemError::UnknownVariable(row.to));
        }
        match row.relation {
            Relation::Intercept => {
                if row.from.is_empty() {
                    row.from = INTERCEPT_SOURCE.to_string();
                }
                if row.from != INTERCEPT_SOURCE {
                    return Err(SemError::InvalidSpecification(format!(
                        "intercept row for '{}' must start at '{INTERCEPT_SOURCE}'",
                        row.to
                    )));
                }
            }
            Relation::Regression | Relation::Covariance => {
                if !self.is_variable(&row.from) {
                    return Err(SemError::UnknownVariable(row.from));
                }
            }
        }
        if !row.free {
            row.label = CONST_LABEL.to_string();
        } else if row.label == CONST_LABEL {
            return Err(SemError::InvalidSpecification(format!(
                "free row {} {} {} cannot use the label '{CONST_LABEL}'",
                row.from, row.relation, row.to
            )));
        } else if row.label.is_empty() {
            // skip labels already taken by rebuilt or hand-labelled rows
            row.label = loop {
                self.auto_labels += 1;
                let candidate = format!("θ_{}", self.auto_labels);
                if !self.rows.iter().any(|r| r.label == candidate) {
                    break candidate;
                }
            };
        }
        self.rows.push(row);
        self.sorted_vars = None;
        Ok(self.rows.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&ParRow> {
        self.rows.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ParRow> {
        self.rows.iter()
    }

    pub fn has_meanstructure(&self) -> bool {
        self.rows.iter().any(|r| r.relation == Relation::Intercept)
    }

    /// Unique labels of free rows in order of first appearance.
    pub fn param_labels(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .filter(|r| r.free && seen.insert(r.label.as_str()))
            .map(|r| r.label.clone())
            .collect()
    }

    pub fn n_params(&self) -> usize {
        self.param_labels().len()
    }

    pub fn sorted_vars(&self) -> Option<&[String]> {
        self.sorted_vars.as_deref()
    }

    /// Orders all variables so that every regression edge points forward.
    pub fn sort_vars(&mut self) -> Result<&[String]> {
        let sorted = match self.sorted_vars.take() {
            Some(sorted) => sorted,
            None => {
                let sorted = topological_order(&self.variables(), &self.rows)?;
                debug!("sorted variables: {:?}", sorted);
                sorted
            }
        };
        Ok(self.sorted_vars.insert(sorted).as_slice())
    }

    pub fn update_estimate(&mut self, labels: &[String], values: &[f64]) -> Result<()> {
        self.update_column(ParColumn::Estimate, labels, values)
    }

    pub fn update_start(&mut self, labels: &[String], values: &[f64]) -> Result<()> {
        self.update_column(ParColumn::Start, labels, values)
    }

    pub fn update_standard_errors(&mut self, labels: &[String], values: &[f64]) -> Result<()> {
        self.update_column(ParColumn::StandardError, labels, values)
    }

    /// Writes `values` into `column` at every row whose label matches. Fixed rows receive
    /// their fixed value, or zero for standard errors.
    pub fn update_column(
        &mut self,
        column: ParColumn,
        labels: &[String],
        values: &[f64],
    ) -> Result<()> {
        if labels.len() != values.len() {
            return Err(SemError::DimensionMismatch(format!(
                "{} labels but {} values",
                labels.len(),
                values.len()
            )));
        }
        let lookup: HashMap<&str, f64> = labels
            .iter()
            .map(String::as_str)
            .zip(values.iter().copied())
            .collect();
        if let Some(missing) = self
            .rows
            .iter()
            .find(|r| r.free && !lookup.contains_key(r.label.as_str()))
        {
            return Err(SemError::MissingParameter(missing.label.clone()));
        }
        for row in &mut self.rows {
            let value = if row.free {
                lookup[row.label.as_str()]
            } else {
                match column {
                    ParColumn::Estimate | ParColumn::Start => row.value_fixed,
                    ParColumn::StandardError => 0.0,
                }
            };
            row.set_column(column, value);
        }
        Ok(())
    }

    /// Reads `column` back out in the order of `labels`, taking the first row carrying each label.
    pub fn column_by_label(&self, column: ParColumn, labels: &[String]) -> Result<Vec<f64>> {
        labels
            .iter()
            .map(|label| {
                self.rows
                    .iter()
                    .find(|r| r.free && &r.label == label)
                    .map(|r| r.column(column))
                    .ok_or_else(|| SemError::MissingParameter(label.clone()))
            })
            .collect()
    }

    pub fn estimates_by_label(&self, labels: &[String]) -> Result<Vec<f64>> {
        self.column_by_label(ParColumn::Estimate, labels)
    }

    /// Fills `column` from an external solution, matching rows by structure rather than label.
    pub fn update_from_external(
        &mut self,
        column: ParColumn,
        external: &[ExternalParam],
    ) -> Result<()> {
        let mut values = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut hits = external.iter().filter(|ext| row.matches_external(ext));
            match (hits.next(), hits.next()) {
                (Some(ext), None) => values.push(ext.value),
                (first, _) => {
                    let found = match first {
                        None => 0,
                        Some(_) => external.iter().filter(|e| row.matches_external(e)).count(),
                    };
                    return Err(SemError::AmbiguousOrMissingExternalMatch {
                        from: row.from.clone(),
                        to: row.to.clone(),
                        relation: row.relation.to_string(),
                        found,
                    });
                }
            }
        }
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.set_column(column, value);
        }
        Ok(())
    }

    pub fn to_columns(&self) -> ParTableColumns {
        let mut cols = ParTableColumns::default();
        for row in &self.rows {
            cols.from.push(row.from.clone());
            cols.to.push(row.to.clone());
            cols.relation.push(row.relation.as_str().to_string());
            cols.free.push(row.free);
            cols.value_fixed.push(row.value_fixed);
            cols.start.push(row.start.unwrap_or(f64::NAN));
            cols.estimate.push(row.estimate);
            cols.se.push(row.se);
            cols.label.push(row.label.clone());
            cols.lower.push(row.lower);
            cols.upper.push(row.upper);
        }
        cols
    }

    pub fn from_columns(
        observed: Vec<String>,
        latent: Vec<String>,
        cols: &ParTableColumns,
    ) -> Result<Self> {
        let n = cols.len();
        let lengths = [
            cols.to.len(),
            cols.relation.len(),
            cols.free.len(),
            cols.value_fixed.len(),
            cols.start.len(),
            cols.estimate.len(),
            cols.se.len(),
            cols.label.len(),
            cols.lower.len(),
            cols.upper.len(),
        ];
        if lengths.iter().any(|&len| len != n) {
            return Err(SemError::DimensionMismatch(format!(
                "parameter table columns have unequal lengths: {n} vs {lengths:?}"
            )));
        }
        let mut table = ParameterTable::new(observed, latent)?;
        for i in 0..n {
            let relation: Relation = cols.relation[i].parse()?;
            let mut row = if cols.free[i] {
                ParRow::free(&cols.from[i], &cols.to[i], relation).with_label(&cols.label[i])
            } else {
                ParRow::fixed(&cols.from[i], &cols.to[i], relation, cols.value_fixed[i])
            };
            row.start = Some(cols.start[i]).filter(|v| !v.is_nan());
            row.estimate = cols.estimate[i];
            row.se = cols.se[i];
            row.lower = cols.lower[i];
            row.upper = cols.upper[i];
            table.add_row(row)?;
        }
        Ok(table)
    }
}

impl PartialEq for ParameterTable {
    fn eq(&self, other: &Self) -> bool {
        self.observed == other.observed && self.latent == other.latent && self.rows == other.rows
    }
}

impl Index<usize> for ParameterTable {
    type Output = ParRow;

    fn index(&self, idx: usize) -> &ParRow {
        &self.rows[idx]
    }
}

impl<'a> IntoIterator for &'a ParameterTable {
    type Item = &'a ParRow;
    type IntoIter = std::slice::Iter<'a, ParRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Repeatedly takes the earliest declared variable without remaining incoming regression
/// edges. Intercept rows never contribute edges.
fn topological_order(vars: &[String], rows: &[ParRow]) -> Result<Vec<String>> {
    let index: HashMap<&str, usize> = vars
        .iter()
        .enumerate()
        .map(|(i, v)| (v.as_str(), i))
        .collect();
    let n = vars.len();
    let mut incoming = vec![0usize; n];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
    for row in rows.iter().filter(|r| r.relation == Relation::Regression) {
        let (Some(&from), Some(&to)) = (index.get(row.from.as_str()), index.get(row.to.as_str()))
        else {
            continue;
        };
        outgoing[from].push(to);
        incoming[to] += 1;
    }

    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let Some(next) = (0..n).find(|&i| !placed[i] && incoming[i] == 0) else {
            let remaining = (0..n)
                .filter(|&i| !placed[i])
                .map(|i| vars[i].clone())
                .collect();
            return Err(SemError::CyclicModel(remaining));
        };
        placed[next] = true;
        for &to in &outgoing[next] {
            incoming[to] -= 1;
        }
        order.push(vars[next].clone());
    }
    Ok(order)
}
