use anyhow::{Context, Result, bail};
use polars::prelude::*;
use ramsem::{ExternalParam, FitMeasures, ParTableColumns, ParameterTable, Relation};
use statrs::distribution::{ContinuousCDF, Normal};

const PARTABLE_COLUMNS: [&str; 11] = [
    "from",
    "to",
    "relation",
    "free",
    "value_fixed",
    "start",
    "estimate",
    "se",
    "label",
    "lower",
    "upper",
];

/// One row per parameter-table row, columns named after the table fields.
pub fn partable_to_frame(table: &ParameterTable) -> Result<DataFrame> {
    let cols = table.to_columns();
    let df = df!(
        "from" => cols.from,
        "to" => cols.to,
        "relation" => cols.relation,
        "free" => cols.free,
        "value_fixed" => cols.value_fixed,
        "start" => cols.start,
        "estimate" => cols.estimate,
        "se" => cols.se,
        "label" => cols.label,
        "lower" => cols.lower,
        "upper" => cols.upper,
    )?;
    Ok(df)
}

/// Inverse of [`partable_to_frame`]. Variable lists are not part of the frame.
pub fn partable_from_frame(
    df: &DataFrame,
    observed: Vec<String>,
    latent: Vec<String>,
) -> Result<ParameterTable> {
    for name in PARTABLE_COLUMNS {
        if df.column(name).is_err() {
            bail!("parameter table frame lacks column '{name}'");
        }
    }
    let cols = ParTableColumns {
        from: string_column(df, "from")?,
        to: string_column(df, "to")?,
        relation: string_column(df, "relation")?,
        free: bool_column(df, "free")?,
        value_fixed: f64_column(df, "value_fixed")?,
        start: f64_column(df, "start")?,
        estimate: f64_column(df, "estimate")?,
        se: f64_column(df, "se")?,
        label: string_column(df, "label")?,
        lower: f64_column(df, "lower")?,
        upper: f64_column(df, "upper")?,
    };
    ParameterTable::from_columns(observed, latent, &cols).context("rebuild parameter table")
}

/// Reads `lhs`, `op`, `rhs` and `est` columns of a lavaan-style estimate table.
pub fn external_from_frame(df: &DataFrame) -> Result<Vec<ExternalParam>> {
    let lhs = string_column(df, "lhs")?;
    let op = string_column(df, "op")?;
    let rhs = string_column(df, "rhs")?;
    let est = f64_column(df, "est")?;
    Ok(lhs
        .into_iter()
        .zip(op)
        .zip(rhs)
        .zip(est)
        .map(|(((lhs, op), rhs), value)| ExternalParam { lhs, op, rhs, value })
        .collect())
}

/// Two-sided normal p-value of `est / se`; `NaN` for fixed or degenerate rows.
fn z_to_pvalue(normal: &Normal, est: f64, se: f64) -> f64 {
    if !est.is_finite() || !se.is_finite() || se == 0.0 {
        return f64::NAN;
    }
    let z = (est / se).abs();
    let p = 2.0 * (1.0 - normal.cdf(z));
    if p == 0.0 { 5e-300 } else { p }
}

/// Estimates in lavaan notation: loadings of latent variables as `=~`, other regressions as
/// `~`, (co)variances as `~~` and intercepts as `~1`.
pub fn estimates_frame(table: &ParameterTable) -> Result<DataFrame> {
    let normal = Normal::new(0.0, 1.0).context("standard normal")?;
    let n = table.len();
    let mut lhs = Vec::with_capacity(n);
    let mut op = Vec::with_capacity(n);
    let mut rhs = Vec::with_capacity(n);
    let mut label = Vec::with_capacity(n);
    let mut free = Vec::with_capacity(n);
    let mut est = Vec::with_capacity(n);
    let mut se = Vec::with_capacity(n);
    let mut z = Vec::with_capacity(n);
    let mut p_value = Vec::with_capacity(n);
    for row in table {
        let (l, o, r) = match row.relation {
            Relation::Regression if table.latent_vars().contains(&row.from) => {
                (row.from.clone(), "=~", row.to.clone())
            }
            Relation::Regression => (row.to.clone(), "~", row.from.clone()),
            Relation::Covariance => (row.from.clone(), "~~", row.to.clone()),
            Relation::Intercept => (row.to.clone(), "~1", String::new()),
        };
        lhs.push(l);
        op.push(o.to_string());
        rhs.push(r);
        label.push(row.label.clone());
        free.push(row.free);
        est.push(row.estimate);
        let row_se = if row.free { row.se } else { f64::NAN };
        se.push(row_se);
        z.push(if row.free { row.estimate / row_se } else { f64::NAN });
        p_value.push(z_to_pvalue(&normal, row.estimate, row_se));
    }
    let df = df!(
        "lhs" => lhs,
        "op" => op,
        "rhs" => rhs,
        "label" => label,
        "free" => free,
        "est" => est,
        "se" => se,
        "z" => z,
        "p_value" => p_value,
    )?;
    Ok(df)
}

pub fn fit_measures_frame(measures: &FitMeasures) -> Result<DataFrame> {
    let df = df!(
        "minimum" => [measures.minimum],
        "n_obs" => [measures.n_obs as u64],
        "n_params" => [measures.n_params as u64],
        "df" => [measures.df],
        "chisq" => [measures.chisq],
        "p_chisq" => [measures.p_chisq],
        "minus2LL" => [measures.minus2ll],
        "AIC" => [measures.aic],
        "BIC" => [measures.bic],
    )?;
    Ok(df)
}

fn string_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let series = df
        .column(name)
        .with_context(|| format!("missing column {name}"))?
        .as_materialized_series()
        .cast(&DataType::String)?;
    Ok(series
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect())
}

fn f64_column(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let series = df
        .column(name)
        .with_context(|| format!("missing column {name}"))?
        .as_materialized_series()
        .cast(&DataType::Float64)?;
    Ok(series
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

fn bool_column(df: &DataFrame, name: &str) -> Result<Vec<bool>> {
    let series = df
        .column(name)
        .with_context(|| format!("missing column {name}"))?
        .as_materialized_series()
        .cast(&DataType::Boolean)?;
    Ok(series
        .bool()?
        .into_iter()
        .map(|v| v.unwrap_or(false))
        .collect())
}
