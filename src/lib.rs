//! Fitting layer around the `ramsem` engine: tracing setup, polars tables, data preparation,
//! simulation from implied moments and parallel multi-start optimization.

pub mod data;
pub mod logging;
pub mod multistart;
pub mod sem;
pub mod simulate;
pub mod tables;

pub use ramsem;
pub use sem::{SemOutput, SemRequest, fit_frame, fit_observed, fit_table};
