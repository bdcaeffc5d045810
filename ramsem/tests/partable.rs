use ramsem::partable::CONST_LABEL;
use ramsem::{
    ExternalParam, ParColumn, ParRow, ParameterTable, Relation, SemError, SyntaxOptions,
};

fn names(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

/// x1 <- eta2 <- eta1 -> x2, eta2 -> x3, declared so that declaration order is not sorted.
fn mediation_table() -> ParameterTable {
    let mut table =
        ParameterTable::new(names(&["x1", "x2", "x3"]), names(&["eta2", "eta1"])).expect("table");
    table
        .add_row(ParRow::free("eta2", "x1", Relation::Regression))
        .expect("row");
    table
        .add_row(ParRow::free("eta1", "eta2", Relation::Regression))
        .expect("row");
    table
        .add_row(ParRow::fixed("eta1", "x2", Relation::Regression, 1.0))
        .expect("row");
    table
        .add_row(ParRow::free("eta2", "x3", Relation::Regression).with_label("b"))
        .expect("row");
    for v in ["x1", "x2", "x3", "eta1", "eta2"] {
        table
            .add_row(ParRow::free(v, v, Relation::Covariance))
            .expect("row");
    }
    table
}

#[test]
fn sort_vars_orders_every_edge_forward() {
    let mut table = mediation_table();
    assert!(table.sorted_vars().is_none());
    let sorted = table.sort_vars().expect("sort").to_vec();

    let mut all = table.variables();
    all.sort();
    let mut perm = sorted.clone();
    perm.sort();
    assert_eq!(all, perm);

    let pos = |name: &str| sorted.iter().position(|v| v == name).expect("present");
    for row in table.iter().filter(|r| r.relation == Relation::Regression) {
        assert!(pos(&row.from) < pos(&row.to), "{} -> {}", row.from, row.to);
    }
    assert_eq!(sorted[0], "eta1");
    assert_eq!(sorted[1], "eta2");

    let again = table.sort_vars().expect("sort again").to_vec();
    assert_eq!(sorted, again);
}

#[test]
fn add_row_invalidates_sorted_order() {
    let mut table = mediation_table();
    table.sort_vars().expect("sort");
    assert!(table.sorted_vars().is_some());
    table
        .add_row(ParRow::free("x1", "x2", Relation::Covariance))
        .expect("row");
    assert!(table.sorted_vars().is_none());
}

#[test]
fn cyclic_model_fails_to_sort() {
    let mut table = ParameterTable::new(names(&["a", "b"]), Vec::new()).expect("table");
    table
        .add_row(ParRow::free("a", "b", Relation::Regression))
        .expect("row");
    table
        .add_row(ParRow::free("b", "a", Relation::Regression))
        .expect("row");
    match table.sort_vars() {
        Err(SemError::CyclicModel(vars)) => assert_eq!(vars, names(&["a", "b"])),
        other => panic!("expected CyclicModel, got {other:?}"),
    }
}

#[test]
fn labels_and_constants() {
    let table = mediation_table();
    let labels = table.param_labels();
    assert_eq!(labels.len(), 8);
    assert_eq!(labels[0], "θ_1");
    assert!(labels.contains(&"b".to_string()));
    assert_eq!(table[2].label, CONST_LABEL);
    assert!(table[2].is_constant());
    assert_eq!(table.n_params(), 8);
}

#[test]
fn shared_labels_count_once() {
    let mut table = ParameterTable::new(names(&["x1", "x2"]), Vec::new()).expect("table");
    table
        .add_row(ParRow::free("x1", "x1", Relation::Covariance).with_label("v"))
        .expect("row");
    table
        .add_row(ParRow::free("x2", "x2", Relation::Covariance).with_label("v"))
        .expect("row");
    assert_eq!(table.param_labels(), names(&["v"]));
}

#[test]
fn rejects_bad_rows() {
    assert!(matches!(
        ParameterTable::new(names(&["x"]), names(&["x"])),
        Err(SemError::InvalidSpecification(_))
    ));
    let mut table = ParameterTable::new(names(&["x"]), Vec::new()).expect("table");
    assert!(matches!(
        table.add_row(ParRow::free("z", "x", Relation::Regression)),
        Err(SemError::UnknownVariable(_))
    ));
    assert!(matches!(
        table.add_row(ParRow::free("x", "x", Relation::Covariance).with_label(CONST_LABEL)),
        Err(SemError::InvalidSpecification(_))
    ));
    assert!(matches!(
        table.add_row(ParRow::free("x", "x", Relation::Intercept)),
        Err(SemError::InvalidSpecification(_))
    ));
    table
        .add_row(ParRow::free("1", "x", Relation::Intercept))
        .expect("intercept");
    assert!(table.has_meanstructure());
}

#[test]
fn estimate_write_back_round_trip() {
    let mut table = mediation_table();
    let labels = table.param_labels();
    let values: Vec<f64> = (0..labels.len()).map(|i| 0.1 * i as f64 + 0.25).collect();
    table.update_estimate(&labels, &values).expect("update");
    let back = table.estimates_by_label(&labels).expect("read back");
    assert_eq!(back, values);
    assert_eq!(table[2].estimate, 1.0);

    table
        .update_standard_errors(&labels, &values)
        .expect("update se");
    assert_eq!(table[2].se, 0.0);
    table.update_start(&labels, &values).expect("update start");
    assert_eq!(
        table.column_by_label(ParColumn::Start, &labels).expect("starts"),
        values
    );
}

#[test]
fn write_back_errors() {
    let mut table = mediation_table();
    let labels = table.param_labels();
    assert!(matches!(
        table.update_estimate(&labels, &[1.0]),
        Err(SemError::DimensionMismatch(_))
    ));
    let partial = labels[..labels.len() - 1].to_vec();
    let values = vec![0.0; partial.len()];
    assert!(matches!(
        table.update_estimate(&partial, &values),
        Err(SemError::MissingParameter(_))
    ));
    assert!(table.iter().all(|r| r.estimate.is_nan() || !r.free));
}

fn external(lhs: &str, op: &str, rhs: &str, value: f64) -> ExternalParam {
    ExternalParam {
        lhs: lhs.to_string(),
        op: op.to_string(),
        rhs: rhs.to_string(),
        value,
    }
}

#[test]
fn external_solution_matches_structurally() {
    let mut table = ParameterTable::new(names(&["x1", "x2"]), names(&["f"])).expect("table");
    table
        .add_row(ParRow::fixed("f", "x1", Relation::Regression, 1.0))
        .expect("row");
    table
        .add_row(ParRow::free("f", "x2", Relation::Regression))
        .expect("row");
    table
        .add_row(ParRow::free("x1", "x2", Relation::Covariance))
        .expect("row");
    table
        .add_row(ParRow::free("1", "x1", Relation::Intercept))
        .expect("row");

    let solution = vec![
        external("f", "=~", "x1", 1.0),
        external("f", "=~", "x2", 0.7),
        external("x2", "~~", "x1", 0.05),
        external("x1", "~1", "", 2.5),
    ];
    table
        .update_from_external(ParColumn::Estimate, &solution)
        .expect("match");
    let estimates: Vec<f64> = table.iter().map(|r| r.estimate).collect();
    assert_eq!(estimates, vec![1.0, 0.7, 0.05, 2.5]);

    let ambiguous = vec![
        external("f", "=~", "x1", 1.0),
        external("f", "=~", "x2", 0.7),
        external("x2", "~", "f", 0.7),
        external("x1", "~~", "x2", 0.05),
        external("x1", "~1", "", 2.5),
    ];
    match table.update_from_external(ParColumn::Estimate, &ambiguous) {
        Err(SemError::AmbiguousOrMissingExternalMatch { found, to, .. }) => {
            assert_eq!(found, 2);
            assert_eq!(to, "x2");
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }

    let missing = vec![external("f", "=~", "x1", 1.0)];
    assert!(matches!(
        table.update_from_external(ParColumn::Estimate, &missing),
        Err(SemError::AmbiguousOrMissingExternalMatch { found: 0, .. })
    ));
}

#[test]
fn columns_round_trip() {
    let table = mediation_table();
    let cols = table.to_columns();
    assert_eq!(cols.len(), table.len());
    let rebuilt = ParameterTable::from_columns(
        table.observed_vars().to_vec(),
        table.latent_vars().to_vec(),
        &cols,
    )
    .expect("rebuild");
    assert_eq!(rebuilt, table);
}

#[test]
fn rebuilt_table_gets_fresh_auto_labels() {
    let table = ParameterTable::from_syntax(
        "eta =~ x1 + x2 + x3",
        &names(&["x1", "x2", "x3"]),
        &SyntaxOptions::default(),
    )
    .expect("syntax");
    let mut rebuilt = ParameterTable::from_columns(
        table.observed_vars().to_vec(),
        table.latent_vars().to_vec(),
        &table.to_columns(),
    )
    .expect("rebuild");
    let before = rebuilt.n_params();
    assert_eq!(before, 6);
    rebuilt
        .add_row(ParRow::free("x1", "x2", Relation::Covariance))
        .expect("row");
    assert_eq!(rebuilt.n_params(), before + 1);
    let added = &rebuilt[rebuilt.len() - 1].label;
    assert_eq!(
        rebuilt.iter().filter(|r| &r.label == added).count(),
        1,
        "label {added} reused"
    );
}

#[test]
fn auto_labels_skip_hand_written_ones() {
    let mut table = ParameterTable::new(names(&["x1", "x2"]), Vec::new()).expect("table");
    table
        .add_row(ParRow::free("x1", "x1", Relation::Covariance).with_label("θ_1"))
        .expect("row");
    table
        .add_row(ParRow::free("x2", "x2", Relation::Covariance))
        .expect("row");
    assert_eq!(table[1].label, "θ_2");
    assert_eq!(table.n_params(), 2);
}
