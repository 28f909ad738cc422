//! The `stockflow_core` crate compiles stock-flow models into equations and
//! integrates them over time.
//!
//! Key components:
//! - **Model**: the wired graph of variables, operations, integrals and Godley tables.
//! - **Equations**: builds a deduplicated expression DAG and compiles it into an `EvalProgram`.
//! - **Derivative**: symbolic differentiation over the DAG.
//! - **Godley**: double-entry accounting tables and their ledger matrix.
//! - **Solvers**: explicit and implicit Runge-Kutta steppers behind `Steppable`.
//! - **Simulation**: owns the compiled model, simulated time and the integrator.
pub mod dag;
pub mod derivative;
pub mod equations;
pub mod error;
pub mod eval_op;
pub mod expression;
pub mod flow_coef;
pub mod godley;
pub mod model;
pub mod operation;
pub mod render;
pub mod simulation;
pub mod solvers;
pub mod traits;
pub mod value;

pub use equations::SystemOfEquations;
pub use error::{ErrorLocation, Result, SimError};
pub use godley::{AssetClass, GodleySettings, GodleyTable};
pub use model::{DataTable, ItemId, Model};
pub use operation::OperationType;
pub use simulation::{Simulation, SolverSettings};
pub use value::VariableType;
