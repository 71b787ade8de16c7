//! WASM bridge for `mobius_core`: bundled models and a dataset API for JavaScript.

mod data_set;
mod models;

pub use data_set::{BranchIndex, ParameterInfo, WasmDataSet};
pub use models::{build_model, load_example_setup, model_names, LINEAR_RESERVOIR};

use wasm_bindgen::prelude::*;

/// Names accepted by the `WasmDataSet` constructor.
#[wasm_bindgen]
pub fn available_models() -> Vec<String> {
    model_names()
}
