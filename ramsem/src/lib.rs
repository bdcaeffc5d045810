pub mod error;
pub mod fit;
pub mod implied;
mod linalg;
pub mod loss;
pub mod model;
pub mod observed;
pub mod parser;
pub mod partable;
pub mod se;
pub mod specification;
pub mod start;
pub mod stats;
pub mod syntax;

pub use error::{Result, SemError};
pub use fit::{OptimizerAlgorithm, OptimizerDiagnostics, OptimizerOptions, SemFit, fit};
pub use implied::{Order, RamImplied};
pub use loss::{LossKind, LossTerm, LossValue, Ridge, SemFiml, SemMl, SemWls};
pub use model::{Estimator, ModelOptions, Sem, SemEnsemble, SemObjective};
pub use observed::{MissingPattern, SemObserved, SemObservedCovariance, SemObservedMissing};
pub use partable::{ExternalParam, ParColumn, ParRow, ParTableColumns, ParameterTable, Relation};
pub use se::{HessianMethod, parameter_covariance, standard_errors};
pub use specification::{ParamCells, ParamKind, RamSpec, Triangularity};
pub use start::{SimpleStarts, StartValues};
pub use stats::{FitMeasures, fit_measures};
pub use syntax::SyntaxOptions;

