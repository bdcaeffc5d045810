use ramsem::parser::{BoundOp, CoefSpec, SyntaxOp, parse_model};
use ramsem::{ParameterTable, Relation, SemError, SyntaxOptions};

fn names(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

#[test]
fn parse_model_smoke() {
    let model = "f1 =~ y1 + 0.5*y2 + lam*y3\n y3 ~ f1 # regression\n y1 ~~ start(0.2)*y2; y2 ~ 1";
    let syntax = parse_model(model).expect("parse model");
    assert_eq!(syntax.lines.len(), 4);
    assert_eq!(syntax.lines[0].op, SyntaxOp::Measure);
    assert_eq!(syntax.lines[0].terms[1].coef, CoefSpec::Fixed(0.5));
    assert_eq!(syntax.lines[0].terms[2].coef, CoefSpec::Label("lam".to_string()));
    assert_eq!(syntax.lines[2].terms[0].coef, CoefSpec::Start(0.2));
    assert!(syntax.lines[3].terms[0].is_intercept());
    assert!(syntax.bounds.is_empty());
}

#[test]
fn parse_bounds_and_rejects_definitions() {
    let syntax = parse_model("f =~ a*x1 + x2\na > 0.1\na <= 2").expect("parse");
    assert_eq!(syntax.bounds.len(), 2);
    assert_eq!(syntax.bounds[0].op, BoundOp::Gt);
    assert_eq!(syntax.bounds[1].value, 2.0);

    assert!(matches!(
        parse_model("f =~ x1\nab := a*b"),
        Err(SemError::Syntax(_))
    ));
    assert!(matches!(parse_model("f =~ + x1"), Err(SemError::Syntax(_))));
}

#[test]
fn one_factor_defaults() {
    let observed = names(&["x1", "x2", "x3", "unused"]);
    let table = ParameterTable::from_syntax("f =~ x1 + x2 + x3", &observed, &SyntaxOptions::default())
        .expect("table");
    assert_eq!(table.observed_vars(), &names(&["x1", "x2", "x3"])[..]);
    assert_eq!(table.latent_vars(), &names(&["f"])[..]);
    // two free loadings, three residual variances, one factor variance
    assert_eq!(table.n_params(), 6);
    let first = &table[0];
    assert_eq!(first.relation, Relation::Regression);
    assert!(!first.free);
    assert_eq!(first.value_fixed, 1.0);
    assert_eq!((first.from.as_str(), first.to.as_str()), ("f", "x1"));
}

#[test]
fn std_lv_fixes_factor_variance() {
    let observed = names(&["x1", "x2", "x3"]);
    let options = SyntaxOptions {
        std_lv: true,
        ..SyntaxOptions::default()
    };
    let table = ParameterTable::from_syntax("f =~ x1 + x2 + x3", &observed, &options).expect("table");
    assert_eq!(table.n_params(), 6);
    let var_f = table
        .iter()
        .find(|r| r.relation == Relation::Covariance && r.from == "f" && r.to == "f")
        .expect("factor variance");
    assert!(!var_f.free);
    assert_eq!(var_f.value_fixed, 1.0);
}

#[test]
fn exogenous_factors_covary_and_means_are_added() {
    let observed = names(&["a1", "a2", "b1", "b2"]);
    let options = SyntaxOptions {
        meanstructure: true,
        ..SyntaxOptions::default()
    };
    let table = ParameterTable::from_syntax("fa =~ a1 + a2\nfb =~ b1 + b2", &observed, &options)
        .expect("table");
    assert!(
        table
            .iter()
            .any(|r| r.relation == Relation::Covariance && r.from == "fa" && r.to == "fb" && r.free)
    );
    let intercepts: Vec<_> = table
        .iter()
        .filter(|r| r.relation == Relation::Intercept)
        .collect();
    assert_eq!(intercepts.len(), 6);
    assert!(
        intercepts
            .iter()
            .filter(|r| r.to.starts_with('f'))
            .all(|r| !r.free && r.value_fixed == 0.0)
    );
}

#[test]
fn labels_bounds_and_unknown_variables() {
    let observed = names(&["x1", "x2", "x3"]);
    let table = ParameterTable::from_syntax(
        "f =~ x1 + l*x2 + l*x3\nl > 0.05",
        &observed,
        &SyntaxOptions::default(),
    )
    .expect("table");
    let shared: Vec<_> = table.iter().filter(|r| r.label == "l").collect();
    assert_eq!(shared.len(), 2);
    assert!(shared.iter().all(|r| r.lower == 0.05));
    assert_eq!(table.n_params(), 5);

    assert!(matches!(
        ParameterTable::from_syntax("f =~ x1 + x9", &observed, &SyntaxOptions::default()),
        Err(SemError::UnknownVariable(_))
    ));
    assert!(matches!(
        ParameterTable::from_syntax("f =~ x1 + x2\nzz > 0", &observed, &SyntaxOptions::default()),
        Err(SemError::MissingParameter(_))
    ));
}
