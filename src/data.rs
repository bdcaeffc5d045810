//! Turns polars frames into the observed-data types of the engine. Nulls become `NaN`, which
//! the missing-data path treats as unobserved.

use anyhow::{Context, Result, bail};
use ndarray::Array2;
use polars::prelude::*;
use ramsem::{SemObserved, SemObservedCovariance, SemObservedMissing};
use tracing::{debug, info};

/// Casts `cols` to `Float64` where needed, keeping the other columns untouched.
pub fn ensure_f64(mut df: DataFrame, cols: &[&str]) -> Result<DataFrame> {
    for col in cols {
        let column = df
            .column(col)
            .with_context(|| format!("missing column {col}"))?;
        let series = column.as_materialized_series();
        if series.dtype() != &DataType::Float64 {
            let mut casted = series
                .cast(&DataType::Float64)
                .with_context(|| format!("cast {col} to Float64"))?;
            casted.rename((*col).into());
            df.with_column(casted)?;
        }
    }
    Ok(df)
}

/// Rows are observations, columns follow `cols`.
pub fn numeric_matrix(df: &DataFrame, cols: &[String]) -> Result<Array2<f64>> {
    let names: Vec<&str> = cols.iter().map(String::as_str).collect();
    let df = ensure_f64(df.select(names.iter().copied())?, &names)?;
    let mut out = Array2::<f64>::from_elem((df.height(), cols.len()), f64::NAN);
    for (j, name) in names.iter().enumerate() {
        let values = df
            .column(name)?
            .as_materialized_series()
            .f64()
            .with_context(|| format!("{name} as f64"))?
            .clone();
        for (i, v) in values.into_iter().enumerate() {
            if let Some(v) = v {
                out[(i, j)] = v;
            }
        }
    }
    Ok(out)
}

/// Number of rows with at least one missing value among `cols`.
pub fn count_incomplete_rows(df: &DataFrame, cols: &[String]) -> Result<usize> {
    let data = numeric_matrix(df, cols)?;
    Ok(data
        .rows()
        .into_iter()
        .filter(|row| row.iter().any(|v| !v.is_finite()))
        .count())
}

pub fn observed_covariance(df: &DataFrame, cols: &[String]) -> Result<SemObservedCovariance> {
    let data = numeric_matrix(df, cols)?;
    let incomplete = data
        .rows()
        .into_iter()
        .filter(|row| row.iter().any(|v| !v.is_finite()))
        .count();
    if incomplete > 0 {
        bail!("{incomplete} rows have missing values; use full-information estimation");
    }
    debug!("complete data: {} rows, {} variables", data.nrows(), cols.len());
    SemObservedCovariance::from_data(cols.to_vec(), &data).context("observed moments")
}

pub fn observed_missing(df: &DataFrame, cols: &[String]) -> Result<SemObservedMissing> {
    let data = numeric_matrix(df, cols)?;
    let observed =
        SemObservedMissing::new(cols.to_vec(), data).context("missingness patterns")?;
    info!(
        "raw data: {} usable rows in {} missingness patterns",
        observed.n_obs(),
        observed.patterns().len()
    );
    Ok(observed)
}

/// Moments when the data are complete, missingness patterns otherwise.
pub fn observed_auto(df: &DataFrame, cols: &[String]) -> Result<SemObserved> {
    if count_incomplete_rows(df, cols)? == 0 {
        Ok(observed_covariance(df, cols)?.into())
    } else {
        Ok(observed_missing(df, cols)?.into())
    }
}

/// A frame with one `Float64` column per name, `NaN` cells become nulls.
pub fn frame_from_matrix(names: &[String], data: &Array2<f64>) -> Result<DataFrame> {
    if names.len() != data.ncols() {
        bail!("{} names for {} columns", names.len(), data.ncols());
    }
    let columns: Vec<Column> = names
        .iter()
        .zip(data.columns())
        .map(|(name, col)| {
            let values: Float64Chunked = col
                .iter()
                .map(|v| if v.is_nan() { None } else { Some(*v) })
                .collect();
            values.with_name(name.as_str().into()).into_series().into()
        })
        .collect();
    Ok(DataFrame::new(columns)?)
}
