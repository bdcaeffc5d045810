use std::collections::HashSet;

use crate::error::{Result, SemError};
use crate::parser::{BoundOp, CoefSpec, ModelSyntax, SyntaxOp, Term, parse_model};
use crate::partable::{ParRow, ParameterTable, Relation};

/// Defaults applied when expanding model syntax into a parameter table.
#[derive(Debug, Clone)]
pub struct SyntaxOptions {
    /// Fix latent variances to one instead of the first loading.
    pub std_lv: bool,
    /// Add free observed intercepts and latent means fixed at zero.
    pub meanstructure: bool,
    /// Add a free variance for every variable lacking one.
    pub auto_var: bool,
    /// Add free covariances among exogenous latent variables.
    pub auto_cov_lv: bool,
}

impl Default for SyntaxOptions {
    fn default() -> Self {
        SyntaxOptions {
            std_lv: false,
            meanstructure: false,
            auto_var: true,
            auto_cov_lv: true,
        }
    }
}

impl ParameterTable {
    /// Builds a table from model syntax. Only observed variables referenced by the model are
    /// kept, in the order given by `observed`.
    pub fn from_syntax(model: &str, observed: &[String], options: &SyntaxOptions) -> Result<Self> {
        let syntax = parse_model(model)?;
        table_from_syntax(&syntax, observed, options)
    }
}

pub fn table_from_syntax(
    syntax: &ModelSyntax,
    observed: &[String],
    options: &SyntaxOptions,
) -> Result<ParameterTable> {
    let obs_set: HashSet<&str> = observed.iter().map(String::as_str).collect();

    let mut latent: Vec<String> = Vec::new();
    for line in &syntax.lines {
        if line.op == SyntaxOp::Measure
            && !obs_set.contains(line.lhs.as_str())
            && !latent.contains(&line.lhs)
        {
            latent.push(line.lhs.clone());
        }
    }

    let mut used: HashSet<&str> = HashSet::new();
    for line in &syntax.lines {
        used.insert(line.lhs.as_str());
        for term in line.terms.iter().filter(|t| !t.is_intercept()) {
            used.insert(term.var.as_str());
        }
    }
    for name in &used {
        if !obs_set.contains(name) && !latent.iter().any(|l| l.as_str() == *name) {
            return Err(SemError::UnknownVariable(name.to_string()));
        }
    }
    let observed_used: Vec<String> = observed
        .iter()
        .filter(|name| used.contains(name.as_str()))
        .cloned()
        .collect();

    let mut rows: Vec<ParRow> = Vec::new();
    for line in &syntax.lines {
        match line.op {
            SyntaxOp::Measure => {
                for (i, term) in line.terms.iter().enumerate() {
                    if term.is_intercept() {
                        return Err(SemError::Syntax(format!(
                            "intercept term in measurement of {}",
                            line.lhs
                        )));
                    }
                    let coef = match &term.coef {
                        CoefSpec::None if i == 0 && !options.std_lv => CoefSpec::Fixed(1.0),
                        other => other.clone(),
                    };
                    rows.push(row_from_coef(&line.lhs, &term.var, Relation::Regression, &coef));
                }
            }
            SyntaxOp::Regress => {
                for term in &line.terms {
                    rows.push(regression_row(&line.lhs, term));
                }
            }
            SyntaxOp::Cov => {
                for term in &line.terms {
                    if term.is_intercept() {
                        return Err(SemError::Syntax(format!(
                            "intercept term in covariance of {}",
                            line.lhs
                        )));
                    }
                    rows.push(row_from_coef(&line.lhs, &term.var, Relation::Covariance, &term.coef));
                }
            }
        }
    }

    let all_vars: Vec<String> = latent.iter().chain(observed_used.iter()).cloned().collect();

    if options.auto_var {
        for name in &all_vars {
            let has_var = rows
                .iter()
                .any(|r| r.relation == Relation::Covariance && &r.from == name && &r.to == name);
            if !has_var {
                let row = if options.std_lv && latent.contains(name) {
                    ParRow::fixed(name, name, Relation::Covariance, 1.0)
                } else {
                    ParRow::free(name, name, Relation::Covariance)
                };
                rows.push(row);
            }
        }
    }

    if options.auto_cov_lv {
        let exogenous: Vec<&String> = latent
            .iter()
            .filter(|l| {
                !rows
                    .iter()
                    .any(|r| r.relation == Relation::Regression && &r.to == *l)
            })
            .collect();
        for i in 0..exogenous.len() {
            for j in (i + 1)..exogenous.len() {
                let (a, b) = (exogenous[i], exogenous[j]);
                let has_cov = rows.iter().any(|r| {
                    r.relation == Relation::Covariance
                        && ((&r.from == a && &r.to == b) || (&r.from == b && &r.to == a))
                });
                if !has_cov {
                    rows.push(ParRow::free(a, b, Relation::Covariance));
                }
            }
        }
    }

    if options.meanstructure {
        for name in &all_vars {
            let has_mean = rows
                .iter()
                .any(|r| r.relation == Relation::Intercept && &r.to == name);
            if !has_mean {
                let row = if latent.contains(name) {
                    ParRow::fixed("1", name, Relation::Intercept, 0.0)
                } else {
                    ParRow::free("1", name, Relation::Intercept)
                };
                rows.push(row);
            }
        }
    }

    for bound in &syntax.bounds {
        let mut hit = false;
        for row in rows.iter_mut().filter(|r| r.free && r.label == bound.target) {
            hit = true;
            match bound.op {
                BoundOp::Gt | BoundOp::Ge => row.lower = bound.value,
                BoundOp::Lt | BoundOp::Le => row.upper = bound.value,
                BoundOp::Eq => {
                    row.lower = bound.value;
                    row.upper = bound.value;
                }
            }
        }
        if !hit {
            return Err(SemError::MissingParameter(bound.target.clone()));
        }
    }

    let mut table = ParameterTable::new(observed_used, latent)?;
    for row in rows {
        table.add_row(row)?;
    }
    Ok(table)
}

fn regression_row(lhs: &str, term: &Term) -> ParRow {
    if term.is_intercept() {
        row_from_coef("1", lhs, Relation::Intercept, &term.coef)
    } else {
        row_from_coef(&term.var, lhs, Relation::Regression, &term.coef)
    }
}

fn row_from_coef(from: &str, to: &str, relation: Relation, coef: &CoefSpec) -> ParRow {
    match coef {
        CoefSpec::Fixed(v) => ParRow::fixed(from, to, relation, *v),
        CoefSpec::Label(label) => ParRow::free(from, to, relation).with_label(label),
        CoefSpec::Start(v) => ParRow::free(from, to, relation).with_start(*v),
        CoefSpec::Free | CoefSpec::None => ParRow::free(from, to, relation),
    }
}
