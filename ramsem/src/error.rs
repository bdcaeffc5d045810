use thiserror::Error;

#[derive(Debug, Error)]
pub enum SemError {
    #[error("model is cyclic: no topological order for {0:?}")]
    CyclicModel(Vec<String>),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("structural matrix (I - A) is singular")]
    SingularStructuralMatrix,

    #[error("implied covariance matrix is not positive definite")]
    NonPositiveDefiniteImpliedCovariance,

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("external parameter match for {from} {relation} {to}: {found} candidates")]
    AmbiguousOrMissingExternalMatch {
        from: String,
        to: String,
        relation: String,
        found: usize,
    },

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("optimizer error: {0}")]
    Optimizer(String),

    #[error("linear algebra error: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}

pub type Result<T> = std::result::Result<T, SemError>;
