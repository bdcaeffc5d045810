use ndarray::{Array2, arr1};
use polars::prelude::*;
use semfit::data::{count_incomplete_rows, frame_from_matrix, numeric_matrix, observed_auto};
use semfit::multistart::{MultiStartOptions, jittered_starts, multistart};
use semfit::ramsem::{
    Estimator, ExternalParam, ModelOptions, OptimizerOptions, ParColumn, ParameterTable, Relation,
    Sem, SemObjective, SemObserved, SyntaxOptions,
};
use semfit::simulate::{mvn_sample, punch_missing, simulate_from_model};
use semfit::tables::{
    estimates_frame, external_from_frame, fit_measures_frame, partable_from_frame,
    partable_to_frame,
};
use semfit::{SemRequest, fit_frame, fit_observed};

const CHAIN: &str = "eta =~ x1 + x2 + x3";

fn names(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

fn chain_sigma() -> Array2<f64> {
    let loadings = [1.0, 0.8, 1.2];
    let mut sigma = Array2::<f64>::zeros((3, 3));
    for i in 0..3 {
        for j in 0..3 {
            sigma[(i, j)] = 0.2 * loadings[i] * loadings[j];
        }
        sigma[(i, i)] += 0.1;
    }
    sigma
}

fn chain_frame(n: usize, seed: u64) -> DataFrame {
    let mu = arr1(&[1.0, 2.0, 3.0]);
    let data = mvn_sample(&chain_sigma(), Some(&mu), n, seed).expect("sample");
    frame_from_matrix(&names(&["x1", "x2", "x3"]), &data).expect("frame")
}

fn estimate(table: &ParameterTable, from: &str, to: &str) -> f64 {
    table
        .iter()
        .find(|r| r.from == from && r.to == to)
        .map(|r| r.estimate)
        .expect("row")
}

#[test]
fn parameter_table_frame_round_trip() {
    let mut table =
        ParameterTable::from_syntax(CHAIN, &names(&["x1", "x2", "x3"]), &SyntaxOptions::default())
            .expect("table");
    let labels = table.param_labels();
    let values: Vec<f64> = (0..labels.len()).map(|i| 0.1 * (i + 1) as f64).collect();
    table.update_estimate(&labels, &values).expect("estimates");

    let df = partable_to_frame(&table).expect("to frame");
    assert_eq!(df.height(), table.len());
    let back = partable_from_frame(
        &df,
        table.observed_vars().to_vec(),
        table.latent_vars().to_vec(),
    )
    .expect("from frame");
    assert_eq!(back, table);

    let broken = df.drop("label").expect("drop");
    assert!(partable_from_frame(&broken, names(&["x1"]), Vec::new()).is_err());
}

#[test]
fn external_estimates_fill_the_table() {
    let mut table =
        ParameterTable::from_syntax(CHAIN, &names(&["x1", "x2", "x3"]), &SyntaxOptions::default())
            .expect("table");
    let df = df!(
        "lhs" => ["eta", "eta", "eta", "eta", "x1", "x2", "x3"],
        "op" => ["=~", "=~", "=~", "~~", "~~", "~~", "~~"],
        "rhs" => ["x1", "x2", "x3", "eta", "x1", "x2", "x3"],
        "est" => [1.0, 0.8, 1.2, 0.2, 0.1, 0.1, 0.1],
    )
    .expect("df");
    let external: Vec<ExternalParam> = external_from_frame(&df).expect("external");
    assert_eq!(external.len(), 7);
    table
        .update_from_external(ParColumn::Estimate, &external)
        .expect("matched");
    assert_eq!(estimate(&table, "eta", "x3"), 1.2);

    let partial = df.head(Some(3));
    let partial = external_from_frame(&partial).expect("external");
    assert!(
        table
            .update_from_external(ParColumn::Estimate, &partial)
            .is_err()
    );
}

#[test]
fn nulls_become_missing_values() {
    let df = df!(
        "a" => [Some(1i64), None, Some(3), Some(4)],
        "b" => [Some(2.0), Some(1.0), None, Some(0.5)],
        "c" => ["u", "v", "w", "x"],
    )
    .expect("df");
    let cols = names(&["a", "b"]);
    let data = numeric_matrix(&df, &cols).expect("matrix");
    assert_eq!(data.dim(), (4, 2));
    assert_eq!(data[(0, 0)], 1.0);
    assert!(data[(1, 0)].is_nan());
    assert!(data[(2, 1)].is_nan());
    assert_eq!(count_incomplete_rows(&df, &cols).expect("count"), 2);
    assert!(matches!(
        observed_auto(&df, &cols).expect("observed"),
        SemObserved::Missing(_)
    ));
    let complete = df.slice(3, 1).vstack(&df.slice(0, 1)).expect("stack");
    assert!(matches!(
        observed_auto(&complete, &cols).expect("observed"),
        SemObserved::Covariance(_)
    ));
}

#[test]
fn fit_frame_recovers_chain_model() {
    semfit::logging::init_tracing(semfit::logging::DEFAULT_DIRECTIVE);
    let df = chain_frame(5000, 17);
    let request = SemRequest::new(CHAIN);
    let out = fit_frame(&request, &df).expect("fit");
    assert!(out.fit.minimum().is_finite());
    assert!((estimate(&out.table, "eta", "x2") - 0.8).abs() < 0.1);
    assert!((estimate(&out.table, "eta", "x3") - 1.2).abs() < 0.1);
    assert!((estimate(&out.table, "eta", "eta") - 0.2).abs() < 0.05);
    assert_eq!(out.measures.df, 0);
    assert!(out.standard_errors.iter().all(|s| s.is_finite() && *s > 0.0));

    assert_eq!(out.results.height(), out.table.len());
    let ops: Vec<String> = out
        .results
        .column("op")
        .expect("op")
        .as_materialized_series()
        .str()
        .expect("str")
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect();
    assert_eq!(ops.iter().filter(|o| *o == "=~").count(), 3);
    assert_eq!(out.modelfit.height(), 1);
    assert!(fit_measures_frame(&out.measures).expect("frame").column("AIC").is_ok());
}

#[test]
fn fiml_fit_on_incomplete_data() {
    let mu = arr1(&[1.0, 2.0, 3.0]);
    let mut data = mvn_sample(&chain_sigma(), Some(&mu), 3000, 23).expect("sample");
    let punched = punch_missing(&mut data, 0.15, 24).expect("punch");
    assert!(punched > 0);
    assert!(data.rows().into_iter().all(|r| r.iter().any(|v| v.is_finite())));
    let df = frame_from_matrix(&names(&["x1", "x2", "x3"]), &data).expect("frame");

    let ml = SemRequest::new(CHAIN);
    assert!(fit_frame(&ml, &df).is_err());

    let request = SemRequest {
        estimator: Estimator::Fiml,
        ..SemRequest::new(CHAIN)
    };
    let out = fit_frame(&request, &df).expect("fiml fit");
    assert!((estimate(&out.table, "eta", "x2") - 0.8).abs() < 0.1);
    let mean_x3 = out
        .table
        .iter()
        .find(|r| r.relation == Relation::Intercept && r.to == "x3")
        .map(|r| r.estimate)
        .expect("intercept");
    assert!((mean_x3 - 3.0).abs() < 0.1);
    assert!(out.measures.chisq.is_nan());
    assert!(out.measures.minus2ll.is_finite());
}

#[test]
fn multistart_keeps_the_best_run() {
    let df = chain_frame(1000, 31);
    let observed = observed_auto(&df, &names(&["x1", "x2", "x3"])).expect("observed");
    let table = ParameterTable::from_syntax(CHAIN, observed.names(), &SyntaxOptions::default())
        .expect("table");
    let model =
        Sem::new(table, observed.clone(), Estimator::Ml, &ModelOptions::default()).expect("model");

    let options = MultiStartOptions {
        n_starts: 4,
        cores: Some(2),
        ..MultiStartOptions::default()
    };
    let starts = jittered_starts(
        model.start_values(),
        model.lower_bounds(),
        model.upper_bounds(),
        &options,
    );
    assert_eq!(starts.len(), 4);
    assert_eq!(starts[0], model.start_values().to_vec());
    assert_ne!(starts[1], starts[0]);

    let result = multistart(&model, &options).expect("multistart");
    assert_eq!(result.minima.len(), 4);
    let lowest = result
        .minima
        .iter()
        .copied()
        .filter(|m| m.is_finite())
        .fold(f64::INFINITY, f64::min);
    assert_eq!(result.best.minimum(), lowest);

    let single = fit_observed(&SemRequest::new(CHAIN), observed).expect("single");
    assert!(result.best.minimum() <= single.fit.minimum() + 1e-8);
}

#[test]
fn simulated_data_follow_implied_moments() {
    let observed = names(&["x1", "x2", "x3"]);
    let options = SyntaxOptions {
        meanstructure: true,
        ..SyntaxOptions::default()
    };
    let table = ParameterTable::from_syntax(CHAIN, &observed, &options).expect("table");
    let df = chain_frame(50, 1);
    let obs = observed_auto(&df, &observed).expect("observed");
    let mut model = Sem::new(table, obs, Estimator::Ml, &ModelOptions::default()).expect("model");
    let theta: Vec<f64> = model.start_values().to_vec();
    let sim = simulate_from_model(&mut model, &theta, 20_000, 5).expect("simulate");
    assert_eq!(sim.width(), 3);
    let data = numeric_matrix(&sim, &observed).expect("matrix");
    let (sigma, _) = model.implied_moments(&theta).expect("moments");
    let mean = data.mean_axis(ndarray::Axis(0)).expect("mean");
    let centered = &data - &mean;
    let cov = centered.t().dot(&centered) / (data.nrows() as f64 - 1.0);
    for (a, b) in cov.iter().zip(sigma.iter()) {
        assert!((a - b).abs() < 0.05, "{a} vs {b}");
    }

    let out = fit_observed(
        &SemRequest {
            optimizer: OptimizerOptions::default(),
            ..SemRequest::new(CHAIN)
        },
        observed_auto(&sim, &observed).expect("observed"),
    )
    .expect("refit");
    assert!(estimates_frame(&out.table).expect("frame").height() > 0);
}
