mod common;

use ramsem::{
    Estimator, ModelOptions, Order, ParamKind, Ridge, Sem, SemError, SemObjective,
    SemObservedCovariance, SemObservedMissing,
};

use common::{assert_close, fd_gradient, observed_names, random_theta, sample_data, two_factor_table};

fn complete_moments() -> SemObservedCovariance {
    SemObservedCovariance::from_data(observed_names(), &sample_data(400, 1)).expect("moments")
}

fn incomplete_data() -> SemObservedMissing {
    let mut data = sample_data(300, 2);
    for r in 0..data.nrows() {
        match r % 5 {
            1 => data[(r, 0)] = f64::NAN,
            2 => {
                data[(r, 2)] = f64::NAN;
                data[(r, 5)] = f64::NAN;
            }
            3 => data[(r, 4)] = f64::NAN,
            _ => {}
        }
    }
    SemObservedMissing::new(observed_names(), data).expect("missing data")
}

fn ml_model(meanstructure: bool) -> Sem {
    Sem::new(
        two_factor_table(meanstructure),
        complete_moments(),
        Estimator::Ml,
        &ModelOptions::default(),
    )
    .expect("model")
}

fn check_gradient(model: &mut Sem, seed: u64) {
    let theta = random_theta(model.spec(), seed);
    let mut grad = vec![0.0; theta.len()];
    let f = model.gradient(&theta, &mut grad).expect("gradient");
    assert!(f.is_finite());
    let fd = fd_gradient(&theta, |x| model.objective(x).expect("objective"));
    for (k, (a, b)) in grad.iter().zip(fd.iter()).enumerate() {
        assert_close(*a, *b, 1e-6, &format!("gradient[{k}]"));
    }
}

fn check_hessian(model: &mut Sem, seed: u64) {
    let theta = random_theta(model.spec(), seed);
    let hessian = model.hessian(&theta).expect("hessian");
    let q = theta.len();
    for l in 0..q {
        let fd = fd_gradient(&theta, |x| {
            let mut g = vec![0.0; q];
            model.gradient(x, &mut g).expect("gradient");
            g[l]
        });
        for k in 0..q {
            assert_close(hessian[(l, k)], fd[k], 1e-5, &format!("hessian[{l},{k}]"));
        }
    }
}

#[test]
fn ml_gradient_matches_finite_differences() {
    check_gradient(&mut ml_model(false), 31);
}

#[test]
fn ml_gradient_with_means_matches_finite_differences() {
    check_gradient(&mut ml_model(true), 32);
}

#[test]
fn ml_hessian_matches_finite_differences() {
    check_hessian(&mut ml_model(false), 33);
    check_hessian(&mut ml_model(true), 34);
}

#[test]
fn wls_derivatives_match_finite_differences() {
    for meanstructure in [false, true] {
        let mut model = Sem::new(
            two_factor_table(meanstructure),
            complete_moments(),
            Estimator::Wls,
            &ModelOptions::default(),
        )
        .expect("model");
        check_gradient(&mut model, 41);
        check_hessian(&mut model, 42);
    }
}

#[test]
fn fiml_derivatives_match_finite_differences() {
    let observed = incomplete_data();
    assert_eq!(observed.patterns().len(), 4);
    assert_eq!(observed.n_obs(), 300);
    let mut model = Sem::new(
        two_factor_table(true),
        observed,
        Estimator::Fiml,
        &ModelOptions::default(),
    )
    .expect("model");
    check_gradient(&mut model, 51);
    check_hessian(&mut model, 52);
}

#[test]
fn fiml_needs_mean_structure_and_raw_data() {
    assert!(matches!(
        Sem::new(
            two_factor_table(false),
            incomplete_data(),
            Estimator::Fiml,
            &ModelOptions::default()
        ),
        Err(SemError::InvalidSpecification(_))
    ));
    assert!(matches!(
        Sem::new(
            two_factor_table(true),
            complete_moments(),
            Estimator::Fiml,
            &ModelOptions::default()
        ),
        Err(SemError::InvalidSpecification(_))
    ));
}

#[test]
fn fiml_equals_ml_likelihood_on_complete_data() {
    let data = sample_data(200, 9);
    let raw = SemObservedMissing::new(observed_names(), data.clone()).expect("raw");
    assert_eq!(raw.patterns().len(), 1);
    let moments = SemObservedCovariance::from_data(observed_names(), &data).expect("moments");
    let mut fiml = Sem::new(two_factor_table(true), raw, Estimator::Fiml, &ModelOptions::default())
        .expect("fiml");
    let mut ml = Sem::new(two_factor_table(true), moments, Estimator::Ml, &ModelOptions::default())
        .expect("ml");
    let theta = random_theta(ml.spec(), 10);
    let fiml_ll = fiml.minus2ll(&theta).expect("fiml").expect("likelihood");
    let ml_ll = ml.minus2ll(&theta).expect("ml").expect("likelihood");
    assert_close(fiml_ll, ml_ll, 1e-9, "-2LL");
}

#[test]
fn non_positive_definite_sigma_is_infeasible() {
    let mut model = ml_model(true);
    let mut theta = random_theta(model.spec(), 61);
    let var = model
        .spec()
        .param_kinds()
        .iter()
        .position(|k| *k == ParamKind::VarianceObserved)
        .expect("residual variance");
    theta[var] = -50.0;

    let value = model.evaluate(&theta, Order::Hessian).expect("evaluate");
    assert_eq!(value.objective, f64::INFINITY);
    assert!(value.gradient.expect("gradient").iter().all(|g| *g == 0.0));
    assert!(value.hessian.expect("hessian").iter().all(|h| h.is_nan()));

    let mut grad = vec![1.0; theta.len()];
    assert_eq!(model.gradient(&theta, &mut grad).expect("gradient"), f64::INFINITY);
    assert!(grad.iter().all(|g| *g == 0.0));
}

#[test]
fn ml_is_zero_at_saturated_fit() {
    // a saturated covariance model reproduces S exactly
    let moments = complete_moments();
    let names = observed_names();
    let mut table = ramsem::ParameterTable::new(names.clone(), Vec::new()).expect("table");
    let mut theta = Vec::new();
    for i in 0..names.len() {
        for j in 0..=i {
            table
                .add_row(ramsem::ParRow::free(&names[j], &names[i], ramsem::Relation::Covariance))
                .expect("row");
            theta.push(moments.cov()[(i, j)]);
        }
    }
    let mut model = Sem::new(table, moments, Estimator::Ml, &ModelOptions::default()).expect("model");
    assert!(model.objective(&theta).expect("objective").abs() < 1e-10);
}

#[test]
fn ridge_adds_penalty_and_gradient() {
    let base = ml_model(false);
    let labels = base.spec().param_labels().to_vec();
    let ridge = Ridge::by_labels(0.5, &["l"], &labels).expect("ridge");
    let mut penalized = base.clone().with_loss(Box::new(ridge));
    let mut plain = base;
    let theta = random_theta(plain.spec(), 71);
    let l = labels.iter().position(|x| x == "l").expect("label l");
    let diff = penalized.objective(&theta).expect("f") - plain.objective(&theta).expect("f");
    assert_close(diff, 0.5 * theta[l] * theta[l], 1e-12, "penalty");
    check_gradient(&mut penalized, 72);

    assert!(matches!(
        Ridge::by_labels(0.5, &["nope"], &labels),
        Err(SemError::MissingParameter(_))
    ));
}

#[test]
fn ridge_positions_must_fit_the_model() {
    let model = ml_model(false);
    let q = model.n_params();
    assert!(matches!(
        Ridge::new(0.5, vec![0, q], q),
        Err(SemError::DimensionMismatch(_))
    ));
    let ridge = Ridge::new(0.5, vec![0, q - 1], q).expect("ridge");
    let mut penalized = model.with_loss(Box::new(ridge));
    let theta = random_theta(penalized.spec(), 73);
    assert!(penalized.objective(&theta).expect("objective").is_finite());
}

#[test]
fn mismatched_parameter_vector_is_an_error() {
    let mut model = ml_model(false);
    assert!(matches!(
        model.objective(&[0.1, 0.2]),
        Err(SemError::DimensionMismatch(_))
    ));
}

#[test]
fn observed_order_follows_model() {
    let moments = complete_moments();
    let mut reversed: Vec<String> = observed_names();
    reversed.reverse();
    let shuffled = moments.select(&reversed).expect("select");
    let a = Sem::new(two_factor_table(false), moments, Estimator::Ml, &ModelOptions::default())
        .expect("model");
    let b = Sem::new(two_factor_table(false), shuffled, Estimator::Ml, &ModelOptions::default())
        .expect("model");
    let theta = random_theta(a.spec(), 81);
    let (mut a, mut b) = (a, b);
    assert_close(
        a.objective(&theta).expect("f"),
        b.objective(&theta).expect("f"),
        1e-12,
        "objective",
    );
    assert_eq!(a.implied_moments(&theta).expect("moments").0.dim(), (6, 6));
}
