//! Dataset wrapper exposed to JavaScript.

use crate::models;
use anyhow::{anyhow, Result};
use js_sys::Float64Array;
use mobius_core::datetime::format_date;
use mobius_core::{run_model_with, DataSet, NoProfiler, ParameterType, RunSettings};
use serde::{Deserialize, Serialize};
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

fn js_error(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

fn to_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

fn to_strings(values: Vec<&str>) -> Vec<String> {
    values.into_iter().map(str::to_string).collect()
}

/// Listing entry for a parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub group: String,
    pub unit: Option<String>,
    pub description: Option<String>,
}

/// One index of a branched index set and the indexes flowing into it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BranchIndex {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<String>,
}

#[wasm_bindgen]
pub struct WasmDataSet {
    pub(crate) data: DataSet,
}

impl WasmDataSet {
    pub(crate) fn from_model_name(model_name: &str) -> Result<Self> {
        Ok(Self {
            data: models::new_data_set(model_name)?,
        })
    }

    pub(crate) fn branch_indexes(
        &mut self,
        index_set: &str,
        indexes: &[BranchIndex],
    ) -> Result<()> {
        let inputs: Vec<Vec<&str>> = indexes.iter().map(|index| to_strs(&index.inputs)).collect();
        let pairs: Vec<(&str, &[&str])> = indexes
            .iter()
            .zip(&inputs)
            .map(|(index, inputs)| (index.name.as_str(), inputs.as_slice()))
            .collect();
        self.data.set_branch_indexes(index_set, &pairs)
    }

    pub(crate) fn parameter_infos(&self) -> Vec<ParameterInfo> {
        let model = self.data.model();
        model
            .parameters()
            .iter()
            .filter(|(_, _, spec)| spec.expose)
            .map(|(_, name, spec)| ParameterInfo {
                name: name.to_string(),
                ty: spec.ty.name().to_string(),
                group: model.groups().name(spec.group).to_string(),
                unit: spec.unit.map(|unit| model.units().name(unit).to_string()),
                description: spec.description.clone(),
            })
            .collect()
    }

    pub(crate) fn result_series(&self, name: &str, indexes: &[String]) -> Result<Vec<f64>> {
        self.data.get_result_series(name, &to_strs(indexes))
    }

    pub(crate) fn input_series(
        &self,
        name: &str,
        indexes: &[String],
        align_with_results: bool,
    ) -> Result<Vec<f64>> {
        self.data.get_input_series(name, &to_strs(indexes), align_with_results)
    }

    pub(crate) fn double_min_max(&self, name: &str) -> Result<(f64, f64)> {
        let model = self.data.model();
        let parameter = model.parameters().handle_of(name)?;
        let spec = model.parameters().spec(parameter);
        if !matches!(spec.ty, ParameterType::Double | ParameterType::UInt) {
            return Err(anyhow!(
                "The parameter \"{}\" is a {} parameter and has no numeric range.",
                name,
                spec.ty.name()
            ));
        }
        Ok((spec.min.as_f64(), spec.max.as_f64()))
    }

    pub(crate) fn unit_name(&self, kind: &str, name: &str) -> Result<String> {
        let model = self.data.model();
        let unit = match kind {
            "parameter" => model.parameters().spec(model.parameters().handle_of(name)?).unit,
            "input" => model.inputs().spec(model.inputs().handle_of(name)?).unit,
            "result" => model.equations().spec(model.equations().handle_of(name)?).unit,
            _ => return Err(anyhow!("Unknown entity kind \"{}\".", kind)),
        };
        Ok(unit
            .map(|unit| model.units().name(unit).to_string())
            .unwrap_or_default())
    }
}

#[wasm_bindgen]
impl WasmDataSet {
    /// Builds the named catalogue model and an empty dataset for it.
    #[wasm_bindgen(constructor)]
    pub fn new(model_name: &str) -> Result<WasmDataSet, JsValue> {
        console_error_panic_hook::set_once();
        Self::from_model_name(model_name).map_err(js_error)
    }

    pub fn load_example_setup(&mut self) -> Result<(), JsValue> {
        models::load_example_setup(&mut self.data).map_err(js_error)
    }

    pub fn run(&mut self, test_for_nan: bool, check_bounds: bool) -> Result<(), JsValue> {
        let settings = RunSettings::new()
            .with_nan_test(test_for_nan)
            .with_bounds_check(check_bounds);
        run_model_with(&mut self.data, settings, &mut NoProfiler).map_err(js_error)
    }

    pub fn copy(&self, with_results: bool) -> WasmDataSet {
        WasmDataSet {
            data: self.data.copy(with_results),
        }
    }

    pub fn describe_model(&self) -> String {
        self.data.model().describe_structure()
    }

    // --- Indexes ---

    pub fn set_indexes(&mut self, index_set: &str, names: Vec<String>) -> Result<(), JsValue> {
        self.data.set_indexes(index_set, &to_strs(&names)).map_err(js_error)
    }

    /// `indexes` is an array of `{ name, inputs }` objects.
    pub fn set_branch_indexes(&mut self, index_set: &str, indexes: JsValue) -> Result<(), JsValue> {
        let indexes: Vec<BranchIndex> = from_value(indexes)
            .map_err(|e| JsValue::from_str(&format!("Invalid branch index list: {}", e)))?;
        self.branch_indexes(index_set, &indexes).map_err(js_error)
    }

    pub fn get_index_sets(&self) -> Vec<String> {
        self.data
            .model()
            .index_sets()
            .iter()
            .map(|(_, name, _)| name.to_string())
            .collect()
    }

    pub fn get_index_count(&self, index_set: &str) -> Result<u32, JsValue> {
        self.data.index_count(index_set).map_err(js_error)
    }

    pub fn get_indexes(&self, index_set: &str) -> Result<Vec<String>, JsValue> {
        self.data.index_names(index_set).map(to_strings).map_err(js_error)
    }

    pub fn get_branch_inputs(&self, index_set: &str, index: &str) -> Result<Vec<String>, JsValue> {
        self.data
            .branch_inputs(index_set, index)
            .map(to_strings)
            .map_err(js_error)
    }

    // --- Parameters ---

    pub fn set_parameter_double(
        &mut self,
        name: &str,
        indexes: Vec<String>,
        value: f64,
    ) -> Result<(), JsValue> {
        self.data
            .set_parameter_double(name, &to_strs(&indexes), value)
            .map_err(js_error)
    }

    pub fn set_parameter_uint(
        &mut self,
        name: &str,
        indexes: Vec<String>,
        value: u64,
    ) -> Result<(), JsValue> {
        self.data
            .set_parameter_uint(name, &to_strs(&indexes), value)
            .map_err(js_error)
    }

    pub fn set_parameter_bool(
        &mut self,
        name: &str,
        indexes: Vec<String>,
        value: bool,
    ) -> Result<(), JsValue> {
        self.data
            .set_parameter_bool(name, &to_strs(&indexes), value)
            .map_err(js_error)
    }

    /// `date` is "YYYY-MM-DD" or "YYYY-MM-DD hh:mm:ss".
    pub fn set_parameter_time(
        &mut self,
        name: &str,
        indexes: Vec<String>,
        date: &str,
    ) -> Result<(), JsValue> {
        self.data
            .set_parameter_time(name, &to_strs(&indexes), date)
            .map_err(js_error)
    }

    pub fn set_parameter_enum(
        &mut self,
        name: &str,
        indexes: Vec<String>,
        value: &str,
    ) -> Result<(), JsValue> {
        self.data
            .set_parameter_enum(name, &to_strs(&indexes), value)
            .map_err(js_error)
    }

    pub fn get_parameter_double(&self, name: &str, indexes: Vec<String>) -> Result<f64, JsValue> {
        self.data
            .get_parameter_double(name, &to_strs(&indexes))
            .map_err(js_error)
    }

    pub fn get_parameter_uint(&self, name: &str, indexes: Vec<String>) -> Result<u64, JsValue> {
        self.data
            .get_parameter_uint(name, &to_strs(&indexes))
            .map_err(js_error)
    }

    pub fn get_parameter_bool(&self, name: &str, indexes: Vec<String>) -> Result<bool, JsValue> {
        self.data
            .get_parameter_bool(name, &to_strs(&indexes))
            .map_err(js_error)
    }

    pub fn get_parameter_time(&self, name: &str, indexes: Vec<String>) -> Result<String, JsValue> {
        self.data
            .get_parameter_time(name, &to_strs(&indexes))
            .map_err(js_error)
    }

    pub fn get_parameter_enum(&self, name: &str, indexes: Vec<String>) -> Result<String, JsValue> {
        self.data
            .get_parameter_enum(name, &to_strs(&indexes))
            .map_err(js_error)
    }

    /// `[min, max]` of a double or uint parameter.
    pub fn get_parameter_min_max(&self, name: &str) -> Result<Vec<f64>, JsValue> {
        let (min, max) = self.double_min_max(name).map_err(js_error)?;
        Ok(vec![min, max])
    }

    pub fn get_parameter_description(&self, name: &str) -> Result<String, JsValue> {
        let model = self.data.model();
        let parameter = model.parameters().handle_of(name).map_err(js_error)?;
        Ok(model
            .parameters()
            .spec(parameter)
            .description
            .clone()
            .unwrap_or_default())
    }

    /// Unit name of a `"parameter"`, `"input"` or `"result"`; empty when it has none.
    pub fn get_unit(&self, kind: &str, name: &str) -> Result<String, JsValue> {
        self.unit_name(kind, name).map_err(js_error)
    }

    pub fn get_all_parameters(&self) -> Result<JsValue, JsValue> {
        to_value(&self.parameter_infos())
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    pub fn get_all_parameter_groups(&self) -> Vec<String> {
        self.data
            .model()
            .groups()
            .iter()
            .map(|(_, name, _)| name.to_string())
            .collect()
    }

    pub fn get_parameter_index_sets(&self, name: &str) -> Result<Vec<String>, JsValue> {
        self.data
            .parameter_index_sets(name)
            .map(to_strings)
            .map_err(js_error)
    }

    // --- Inputs ---

    pub fn set_input_start_date(&mut self, date: &str) -> Result<(), JsValue> {
        self.data.set_input_start_date(date).map_err(js_error)
    }

    pub fn get_input_start_date(&self) -> Option<String> {
        self.data.input_start_date().map(format_date)
    }

    pub fn get_input_timesteps(&self) -> u64 {
        self.data.input_timesteps()
    }

    pub fn set_input_series(
        &mut self,
        name: &str,
        indexes: Vec<String>,
        values: Vec<f64>,
        align_with_results: bool,
    ) -> Result<(), JsValue> {
        self.data
            .set_input_series(name, &to_strs(&indexes), &values, align_with_results)
            .map_err(js_error)
    }

    pub fn get_input_series(
        &self,
        name: &str,
        indexes: Vec<String>,
        align_with_results: bool,
    ) -> Result<Float64Array, JsValue> {
        let series = self
            .input_series(name, &indexes, align_with_results)
            .map_err(js_error)?;
        Ok(Float64Array::from(series.as_slice()))
    }

    pub fn input_was_provided(&self, name: &str, indexes: Vec<String>) -> Result<bool, JsValue> {
        self.data
            .input_was_provided(name, &to_strs(&indexes))
            .map_err(js_error)
    }

    pub fn get_all_inputs(&self) -> Vec<String> {
        to_strings(self.data.input_names())
    }

    pub fn get_input_index_sets(&self, name: &str) -> Result<Vec<String>, JsValue> {
        self.data.input_index_sets(name).map(to_strings).map_err(js_error)
    }

    // --- Results ---

    pub fn get_result_series(
        &self,
        name: &str,
        indexes: Vec<String>,
    ) -> Result<Float64Array, JsValue> {
        let series = self.result_series(name, &indexes).map_err(js_error)?;
        Ok(Float64Array::from(series.as_slice()))
    }

    pub fn get_all_results(&self) -> Vec<String> {
        to_strings(self.data.result_names())
    }

    pub fn get_result_index_sets(&self, name: &str) -> Result<Vec<String>, JsValue> {
        self.data.result_index_sets(name).map(to_strings).map_err(js_error)
    }

    /// Timesteps of the next run.
    pub fn get_timesteps(&self) -> Result<u64, JsValue> {
        self.data.timesteps().map_err(js_error)
    }

    pub fn get_start_date(&self) -> Result<String, JsValue> {
        self.data.start_date().map(format_date).map_err(js_error)
    }

    pub fn has_been_run(&self) -> bool {
        self.data.has_been_run()
    }

    pub fn get_timesteps_last_run(&self) -> u64 {
        self.data.timesteps_last_run()
    }
}
