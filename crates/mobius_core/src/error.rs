//! Fatal error categories.
//!
//! Public operations return `anyhow::Result`. The variants below are the failures callers
//! are expected to match on; they can be recovered with `err.downcast_ref::<MobiusError>()`.
//! Everything that only needs a readable message is raised with `anyhow::bail!`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MobiusError {
    #[error("the model has already been finalized; {operation} is not allowed after end_model_definition")]
    AlreadyFinalized { operation: String },

    #[error("the model has not been finalized; call end_model_definition before {operation}")]
    NotFinalized { operation: String },

    #[error("tried to look up the handle of the {kind} \"{name}\", but it was not registered with the model")]
    UnknownEntity { kind: &'static str, name: String },

    #[error("the equation body for the registered equation \"{equation}\" has not been defined")]
    MissingEquationBody { equation: String },

    /// `chain` is already formatted as `"A" <- "B" <- ...`.
    #[error("there is a circular dependency between the {what}:\n{chain}")]
    CircularDependency { what: &'static str, chain: String },

    #[error("unable to resolve the index set dependencies of the equations after {iterations} iterations")]
    UnresolvedIndexSets { iterations: usize },

    #[error("index out of bounds for index set \"{index_set}\", got index {index}, count was {count}. This happened while looking up the value of the {kind} \"{entity}\"")]
    IndexOutOfBounds {
        index_set: String,
        index: u32,
        count: u32,
        kind: &'static str,
        entity: String,
    },

    #[error("used an index addressed to the index set \"{got}\" for indexing the index set \"{expected}\". This happened while looking up the value of the {kind} \"{entity}\"")]
    WrongIndexSet {
        got: String,
        expected: String,
        kind: &'static str,
        entity: String,
    },

    #[error("got a NaN or Inf value as the result of the equation \"{equation}\" at timestep {timestep}\n{diagnostics}")]
    NonFiniteResult {
        equation: String,
        timestep: i64,
        diagnostics: String,
    },

    #[error("the solver \"{solver}\" was given a step that is not in the range (0,1]")]
    InvalidSolverStep { solver: String },
}
