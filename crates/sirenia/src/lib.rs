#![forbid(unsafe_code)]

//! One-dimensional separation-constraint projection (IPSep-CoLa Project/Split).
//!
//! `sirenia` assigns scalar positions (one layout axis at a time) so that every constraint
//! `left + gap <= right` (or `==`) holds within a tolerance, while the weighted squared distance
//! of each variable from its desired position is minimal. With the `qpsc` feature (on by
//! default) the goal may also include closeness terms between neighbor pairs, minimized by
//! diagonally scaled gradient projection.
//!
//! ```
//! use sirenia::{Parameters, Solver};
//!
//! let mut solver = Solver::new();
//! let a = solver.add_variable(0.0)?;
//! let b = solver.add_variable(0.0)?;
//! solver.add_constraint(a, b, 10.0)?;
//! let solution = solver.solve(&Parameters::default());
//!
//! assert_eq!(solution.number_of_unsatisfiable_constraints, 0);
//! assert!((solver.variable(a).actual_pos() + 5.0).abs() < 1e-9);
//! assert!((solver.variable(b).actual_pos() - 5.0).abs() < 1e-9);
//! # Ok::<(), sirenia::Error>(())
//! ```

mod block;
pub mod constraint;
pub mod error;
pub mod params;
#[cfg(feature = "qpsc")]
mod qpsc;
pub mod shell;
pub mod solution;
pub mod solver;
pub mod variable;
mod violation_cache;

pub use constraint::{Constraint, ConstraintId, ConstraintKey};
pub use error::{Error, Result};
pub use params::{AdvancedParameters, Parameters};
pub use shell::{FIXED_VAR_WEIGHT, SolverShell};
pub use solution::{Solution, SolverAlgorithm};
pub use solver::Solver;
pub use variable::{BoundedPosition, NeighborAndWeight, Variable, VariableId};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
