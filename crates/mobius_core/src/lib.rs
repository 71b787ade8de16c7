//! The `mobius_core` crate is the engine behind Mobius models: declarative dynamical systems
//! whose equations are evaluated over nested, possibly branched, index sets and advanced one
//! timestep at a time.
//!
//! Key components:
//! - **Model**: entity registration (`model`), dependency tracing (`tracer`) and batch
//!   scheduling (`scheduler`), all run by `Model::end_model_definition`.
//! - **DataSet**: indexes, parameter values, input series and results for one model
//!   (`data_set`), laid out by `storage`.
//! - **Run**: the initial value pass and the timestep loop (`run`), integrating ODE batches
//!   with the methods in `solvers`.
pub mod data_set;
pub mod datetime;
pub mod error;
pub mod handles;
pub mod model;
pub mod run;
pub mod scheduler;
pub mod solvers;
pub mod storage;
pub mod tracer;
pub mod traits;

pub use data_set::{generate_data_set, DataSet};
pub use datetime::{ExpandedDateTime, TimestepSize, TimestepUnit};
pub use error::MobiusError;
pub use handles::{
    ConditionalId, EquationId, GroupId, Index, IndexSetId, InputId, ModuleId, ParameterId,
    SolverId, UnitId,
};
pub use model::{Model, ParameterType, ParameterValue};
pub use run::{run_model, run_model_with, CountingProfiler, RunSettings};
pub use solvers::{CashKarp54, Euler, IncaDascru, RosenbrockEuler};
pub use traits::{EquationContext, NoProfiler, OdeSolver, OdeSystem, Profiler, Tolerances};
