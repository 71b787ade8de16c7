//! Parameter, input and result storage bound to one finalized model.
//!
//! A dataset is created from an `Arc<Model>` and owns every value array of a run. Index
//! names are set first, since all storage layouts depend on the index counts. Parameter
//! and input storage can be allocated explicitly or lazily by the first write.

use crate::datetime::{find_timestep, format_date, parse_date};
use crate::error::MobiusError;
use crate::handles::{EquationId, IndexSetId, InputId, ParameterId};
use crate::model::{
    Cumulation, EquationKind, IndexSetKind, Model, ParameterType, ParameterValue, END_DATE,
    START_DATE, TIMESTEPS,
};
use crate::storage::{units_by_index_sets, StorageStructure, StorageUnit};
use anyhow::{anyhow, bail, Result};
use indexmap::IndexSet;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DataSet {
    pub(crate) model: Arc<Model>,
    /// Indexed by index set handle value.
    pub(crate) index_names: Vec<IndexSet<String>>,
    pub(crate) index_counts: Vec<u32>,
    /// Per index set and index, the indexes that feed into it. Empty for basic index sets.
    pub(crate) branch_inputs: Vec<Vec<Vec<u32>>>,

    pub(crate) parameter_structure: StorageStructure<ParameterId>,
    pub(crate) parameter_data: Option<Vec<ParameterValue>>,

    pub(crate) input_structure: StorageStructure<InputId>,
    /// `input_timesteps` rows of `input_structure.total_count()` values.
    pub(crate) input_data: Option<Vec<f64>>,
    pub(crate) input_provided: Vec<bool>,
    pub(crate) input_timesteps: u64,
    pub(crate) input_start_date: Option<i64>,

    pub(crate) result_structure: StorageStructure<EquationId>,
    /// One row of initial values followed by one row per timestep.
    pub(crate) result_data: Vec<f64>,
    pub(crate) has_been_run: bool,
    pub(crate) timesteps_last_run: u64,
    pub(crate) start_date_last_run: i64,
}

/// Creates an empty dataset for a finalized model.
pub fn generate_data_set(model: &Arc<Model>) -> Result<DataSet> {
    DataSet::new(Arc::clone(model))
}

impl DataSet {
    pub fn new(model: Arc<Model>) -> Result<Self> {
        if !model.is_finalized() {
            return Err(MobiusError::NotFinalized {
                operation: "generate_data_set".to_string(),
            }
            .into());
        }
        let slots = model.index_sets.slot_count();
        Ok(Self {
            index_names: vec![IndexSet::new(); slots],
            index_counts: vec![0; slots],
            branch_inputs: vec![Vec::new(); slots],
            parameter_structure: StorageStructure::default(),
            parameter_data: None,
            input_structure: StorageStructure::default(),
            input_data: None,
            input_provided: Vec::new(),
            input_timesteps: 0,
            input_start_date: None,
            result_structure: StorageStructure::default(),
            result_data: Vec::new(),
            has_been_run: false,
            timesteps_last_run: 0,
            start_date_last_run: 0,
            model,
        })
    }

    /// A deep copy sharing only the model. Results are carried over when `with_results` is
    /// set, otherwise the copy starts out as never run.
    pub fn copy(&self, with_results: bool) -> DataSet {
        let mut copy = self.clone();
        if !with_results {
            copy.result_structure = StorageStructure::default();
            copy.result_data = Vec::new();
            copy.has_been_run = false;
            copy.timesteps_last_run = 0;
            copy.start_date_last_run = 0;
        }
        copy
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    // --- Indexes ---

    fn check_indexes_unset(&self, set: IndexSetId, names_given: usize) -> Result<()> {
        let name = self.model.index_sets.name(set);
        if self.index_counts[set.index()] != 0 {
            bail!("Tried to set the indexes of the index set \"{}\" twice.", name);
        }
        if names_given == 0 {
            bail!("Tried to set the indexes of the index set \"{}\" to an empty list.", name);
        }
        let required = &self.model.index_sets.spec(set).required_indexes;
        if names_given < required.len() {
            bail!(
                "The index set \"{}\" requires at least {} indexes, got {}.",
                name,
                required.len(),
                names_given
            );
        }
        Ok(())
    }

    fn check_required_index(&self, set: IndexSetId, position: usize, given: &str) -> Result<()> {
        let required = &self.model.index_sets.spec(set).required_indexes;
        if let Some(expected) = required.get(position) {
            if expected != given {
                bail!(
                    "The index set \"{}\" requires the index \"{}\" at position {}, got \"{}\".",
                    self.model.index_sets.name(set),
                    expected,
                    position,
                    given
                );
            }
        }
        Ok(())
    }

    pub fn set_indexes(&mut self, index_set: &str, names: &[&str]) -> Result<()> {
        let set = self.model.index_sets.handle_of(index_set)?;
        if self.model.index_sets.spec(set).kind != IndexSetKind::Basic {
            bail!(
                "The index set \"{}\" is branched; use set_branch_indexes to set its indexes.",
                index_set
            );
        }
        self.check_indexes_unset(set, names.len())?;
        let mut lookup = IndexSet::new();
        for (position, name) in names.iter().enumerate() {
            self.check_required_index(set, position, name)?;
            if !lookup.insert(name.to_string()) {
                bail!(
                    "The index \"{}\" appears twice in the index set \"{}\".",
                    name,
                    index_set
                );
            }
        }
        self.index_counts[set.index()] = lookup.len() as u32;
        self.index_names[set.index()] = lookup;
        Ok(())
    }

    /// Every entry is an index name and the names of the earlier indexes that feed into it.
    pub fn set_branch_indexes(
        &mut self,
        index_set: &str,
        indexes: &[(&str, &[&str])],
    ) -> Result<()> {
        let set = self.model.index_sets.handle_of(index_set)?;
        if self.model.index_sets.spec(set).kind != IndexSetKind::Branched {
            bail!(
                "The index set \"{}\" is not branched; use set_indexes to set its indexes.",
                index_set
            );
        }
        self.check_indexes_unset(set, indexes.len())?;
        let mut lookup: IndexSet<String> = IndexSet::new();
        let mut inputs = Vec::with_capacity(indexes.len());
        for (position, (name, feeds)) in indexes.iter().enumerate() {
            self.check_required_index(set, position, name)?;
            let mut branch = Vec::with_capacity(feeds.len());
            for feed in feeds.iter() {
                let Some(source) = lookup.get_index_of(*feed) else {
                    bail!(
                        "The index \"{}\" of the index set \"{}\" lists \"{}\" as an input, but that index is not declared before it.",
                        name,
                        index_set,
                        feed
                    );
                };
                branch.push(source as u32);
            }
            if !lookup.insert(name.to_string()) {
                bail!(
                    "The index \"{}\" appears twice in the index set \"{}\".",
                    name,
                    index_set
                );
            }
            inputs.push(branch);
        }
        self.index_counts[set.index()] = lookup.len() as u32;
        self.index_names[set.index()] = lookup;
        self.branch_inputs[set.index()] = inputs;
        Ok(())
    }

    pub fn index_count(&self, index_set: &str) -> Result<u32> {
        let set = self.model.index_sets.handle_of(index_set)?;
        Ok(self.index_counts[set.index()])
    }

    pub fn index_names(&self, index_set: &str) -> Result<Vec<&str>> {
        let set = self.model.index_sets.handle_of(index_set)?;
        Ok(self.index_names[set.index()].iter().map(String::as_str).collect())
    }

    pub fn branch_inputs(&self, index_set: &str, index: &str) -> Result<Vec<&str>> {
        let set = self.model.index_sets.handle_of(index_set)?;
        let position = self.index_position(set, index)?;
        let names = &self.index_names[set.index()];
        Ok(self.branch_inputs[set.index()]
            .get(position as usize)
            .map(|feeds| {
                feeds
                    .iter()
                    .filter_map(|feed| names.get_index(*feed as usize).map(String::as_str))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub(crate) fn index_name(&self, set: IndexSetId, index: u32) -> &str {
        self.index_names[set.index()]
            .get_index(index as usize)
            .map(String::as_str)
            .unwrap_or("(invalid)")
    }

    fn index_position(&self, set: IndexSetId, name: &str) -> Result<u32> {
        self.index_names[set.index()]
            .get_index_of(name)
            .map(|position| position as u32)
            .ok_or_else(|| {
                anyhow!(
                    "The index set \"{}\" does not contain the index \"{}\".",
                    self.model.index_sets.name(set),
                    name
                )
            })
    }

    fn index_positions(
        &self,
        sets: &[IndexSetId],
        names: &[&str],
        kind: &str,
        entity: &str,
    ) -> Result<Vec<u32>> {
        if names.len() != sets.len() {
            bail!(
                "Got {} index names for the {} \"{}\", but it depends on {} index sets.",
                names.len(),
                kind,
                entity,
                sets.len()
            );
        }
        sets.iter()
            .zip(names)
            .map(|(set, name)| self.index_position(*set, name))
            .collect()
    }

    /// The first index set that has no indexes yet, if any.
    pub(crate) fn missing_index_set(&self) -> Option<IndexSetId> {
        self.model
            .index_sets
            .handles()
            .find(|set| self.index_counts[set.index()] == 0)
    }

    fn check_all_indexes_set(&self, operation: &str) -> Result<()> {
        if let Some(set) = self.missing_index_set() {
            bail!(
                "Tried to {} before the indexes of the index set \"{}\" were set.",
                operation,
                self.model.index_sets.name(set)
            );
        }
        Ok(())
    }

    // --- Allocation ---

    pub fn allocate_parameters(&mut self) -> Result<()> {
        if self.parameter_data.is_some() {
            bail!("Tried to allocate parameter storage twice.");
        }
        self.check_all_indexes_set("allocate parameter storage")?;
        let model = Arc::clone(&self.model);
        let units = units_by_index_sets(
            model
                .parameters
                .iter()
                .map(|(handle, _, spec)| (handle, spec.index_sets.clone())),
        );
        let structure =
            StorageStructure::build(units, &self.index_counts, model.parameters.slot_count());
        let mut data = vec![ParameterValue::default(); structure.total_count()];
        for (parameter, _, spec) in model.parameters.iter() {
            for offset in structure.offsets_of(parameter) {
                data[offset] = spec.default;
            }
        }
        debug!(values = data.len(), "allocated parameter storage");
        self.parameter_structure = structure;
        self.parameter_data = Some(data);
        Ok(())
    }

    /// Input values not provided later read as 0, or NaN for inputs marked clear-to-NaN.
    pub fn allocate_inputs(&mut self, timesteps: u64) -> Result<()> {
        if self.input_data.is_some() {
            bail!("Tried to allocate input storage twice.");
        }
        self.check_all_indexes_set("allocate input storage")?;
        let model = Arc::clone(&self.model);
        let units = units_by_index_sets(
            model
                .inputs
                .iter()
                .map(|(handle, _, spec)| (handle, spec.index_sets.clone())),
        );
        let structure =
            StorageStructure::build(units, &self.index_counts, model.inputs.slot_count());
        let stride = structure.total_count();
        let mut data = vec![0.0; stride * timesteps as usize];
        for (input, _, spec) in model.inputs.iter() {
            if !spec.clear_to_nan {
                continue;
            }
            for offset in structure.offsets_of(input) {
                for step in 0..timesteps as usize {
                    data[offset + step * stride] = f64::NAN;
                }
            }
        }
        debug!(timesteps, values = data.len(), "allocated input storage");
        self.input_provided = vec![false; stride];
        self.input_structure = structure;
        self.input_timesteps = timesteps;
        self.input_data = Some(data);
        Ok(())
    }

    pub(crate) fn parameters(&self) -> &[ParameterValue] {
        self.parameter_data.as_deref().unwrap_or_default()
    }

    pub(crate) fn inputs(&self) -> &[f64] {
        self.input_data.as_deref().unwrap_or_default()
    }

    // --- Parameters ---

    fn parameter_offset(&self, name: &str, indexes: &[&str]) -> Result<(ParameterId, usize)> {
        let parameter = self.model.parameters.handle_of(name)?;
        let sets = &self.model.parameters.spec(parameter).index_sets;
        let positions = self.index_positions(sets, indexes, "parameter", name)?;
        let offset = self
            .parameter_structure
            .offset_for_indexes(parameter, &positions)
            .map_err(|fault| fault.into_error(&self.model.index_sets, "parameter", name))?;
        Ok((parameter, offset))
    }

    /// `value` must have the parameter's type. Allocates parameter storage on first use.
    pub fn set_parameter_value(
        &mut self,
        name: &str,
        indexes: &[&str],
        value: ParameterValue,
    ) -> Result<()> {
        if self.parameter_data.is_none() {
            self.allocate_parameters()?;
        }
        let (parameter, offset) = self.parameter_offset(name, indexes)?;
        let spec = self.model.parameters.spec(parameter);
        if value.ty() != spec.ty {
            bail!(
                "Tried to set a {} value to the {} parameter \"{}\".",
                value.ty().name(),
                spec.ty.name(),
                name
            );
        }
        let outside = match (value, spec.min, spec.max) {
            (
                ParameterValue::Double(v),
                ParameterValue::Double(min),
                ParameterValue::Double(max),
            ) => v < min || v > max,
            (ParameterValue::UInt(v), ParameterValue::UInt(min), ParameterValue::UInt(max)) => {
                v < min || v > max
            }
            _ => false,
        };
        if outside {
            warn!(parameter = name, ?value, "parameter value is outside its recommended range");
        }
        if spec.is_computed_by.is_some() {
            warn!(
                parameter = name,
                "the value of a computed parameter is replaced when the model runs"
            );
        }
        if let Some(data) = self.parameter_data.as_mut() {
            data[offset] = value;
        }
        Ok(())
    }

    pub fn set_parameter_double(&mut self, name: &str, indexes: &[&str], value: f64) -> Result<()> {
        self.set_parameter_value(name, indexes, ParameterValue::Double(value))
    }

    pub fn set_parameter_uint(&mut self, name: &str, indexes: &[&str], value: u64) -> Result<()> {
        self.set_parameter_value(name, indexes, ParameterValue::UInt(value))
    }

    pub fn set_parameter_bool(&mut self, name: &str, indexes: &[&str], value: bool) -> Result<()> {
        self.set_parameter_value(name, indexes, ParameterValue::Bool(value))
    }

    /// `date` on the form `yyyy-mm-dd` or `yyyy-mm-dd hh:mm:ss`.
    pub fn set_parameter_time(&mut self, name: &str, indexes: &[&str], date: &str) -> Result<()> {
        let seconds = parse_date(date)?;
        self.set_parameter_value(name, indexes, ParameterValue::Time(seconds))
    }

    pub fn set_parameter_enum(&mut self, name: &str, indexes: &[&str], value: &str) -> Result<()> {
        let parameter = self.model.parameters.handle_of(name)?;
        let spec = self.model.parameters.spec(parameter);
        let Some(position) = spec.enum_value(value) else {
            bail!(
                "The enum parameter \"{}\" does not have a value named \"{}\".",
                name,
                value
            );
        };
        self.set_parameter_value(name, indexes, ParameterValue::Enum(position))
    }

    pub fn get_parameter_value(&self, name: &str, indexes: &[&str]) -> Result<ParameterValue> {
        let Some(data) = &self.parameter_data else {
            bail!(
                "Tried to read the parameter \"{}\" before parameter storage was allocated.",
                name
            );
        };
        let (_, offset) = self.parameter_offset(name, indexes)?;
        Ok(data[offset])
    }

    fn typed_parameter(
        &self,
        name: &str,
        indexes: &[&str],
        ty: ParameterType,
    ) -> Result<ParameterValue> {
        let value = self.get_parameter_value(name, indexes)?;
        if value.ty() != ty {
            warn!(
                parameter = name,
                stored = value.ty().name(),
                requested = ty.name(),
                "parameter read with the wrong type"
            );
        }
        Ok(value)
    }

    pub fn get_parameter_double(&self, name: &str, indexes: &[&str]) -> Result<f64> {
        Ok(self.typed_parameter(name, indexes, ParameterType::Double)?.as_f64())
    }

    pub fn get_parameter_uint(&self, name: &str, indexes: &[&str]) -> Result<u64> {
        Ok(self.typed_parameter(name, indexes, ParameterType::UInt)?.as_u64())
    }

    pub fn get_parameter_bool(&self, name: &str, indexes: &[&str]) -> Result<bool> {
        Ok(self.typed_parameter(name, indexes, ParameterType::Bool)?.as_bool())
    }

    /// Formatted as `yyyy-mm-dd`, with the time of day when it is not midnight.
    pub fn get_parameter_time(&self, name: &str, indexes: &[&str]) -> Result<String> {
        Ok(format_date(
            self.typed_parameter(name, indexes, ParameterType::Time)?.as_i64(),
        ))
    }

    pub fn get_parameter_enum(&self, name: &str, indexes: &[&str]) -> Result<String> {
        let value = self.typed_parameter(name, indexes, ParameterType::Enum)?.as_u64();
        let parameter = self.model.parameters.handle_of(name)?;
        self.model
            .parameters
            .spec(parameter)
            .enum_names
            .get(value as usize)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "The enum parameter \"{}\" holds the invalid value {}.",
                    name,
                    value
                )
            })
    }

    /// An unindexed parameter, falling back to its default before storage is allocated.
    fn system_parameter(&self, parameter: ParameterId) -> ParameterValue {
        let default = self.model.parameters.spec(parameter).default;
        match &self.parameter_data {
            Some(data) => self
                .parameter_structure
                .offsets_of(parameter)
                .next()
                .map_or(default, |offset| data[offset]),
            None => default,
        }
    }

    /// The "Start date" parameter in seconds since 1970-01-01.
    pub fn start_date(&self) -> Result<i64> {
        let parameter = self.model.parameters.handle_of(START_DATE)?;
        Ok(self.system_parameter(parameter).as_i64())
    }

    /// Derived from "Start date" and "End date" when the model has an end date, otherwise
    /// the "Timesteps" parameter.
    pub fn timesteps(&self) -> Result<u64> {
        if let Some(end_date) = self.model.parameters.find(END_DATE) {
            let start = self.start_date()?;
            let end = self.system_parameter(end_date).as_i64();
            if end < start {
                bail!(
                    "The end date {} is before the start date {}.",
                    format_date(end),
                    format_date(start)
                );
            }
            let steps = find_timestep(start, end, self.model.timestep_size())?;
            return Ok(steps as u64 + 1);
        }
        let parameter = self.model.parameters.handle_of(TIMESTEPS)?;
        Ok(self.system_parameter(parameter).as_u64())
    }

    // --- Inputs ---

    fn input_offset(&self, name: &str, indexes: &[&str]) -> Result<(InputId, usize)> {
        let input = self.model.inputs.handle_of(name)?;
        let sets = &self.model.inputs.spec(input).index_sets;
        let positions = self.index_positions(sets, indexes, "input", name)?;
        let offset = self
            .input_structure
            .offset_for_indexes(input, &positions)
            .map_err(|fault| fault.into_error(&self.model.index_sets, "input", name))?;
        Ok((input, offset))
    }

    /// Lets input series start before the model run.
    pub fn set_input_start_date(&mut self, date: &str) -> Result<()> {
        self.input_start_date = Some(parse_date(date)?);
        Ok(())
    }

    pub fn input_start_date(&self) -> Option<i64> {
        self.input_start_date
    }

    pub fn input_timesteps(&self) -> u64 {
        self.input_timesteps
    }

    /// Input timestep holding the value of the first model timestep.
    pub(crate) fn input_offset_of_run_start(&self) -> Result<i64> {
        match self.input_start_date {
            Some(input_start) => {
                find_timestep(input_start, self.start_date()?, self.model.timestep_size())
            }
            None => Ok(0),
        }
    }

    /// Writes a series starting at input timestep 0, or at the model start date when
    /// `align_with_results` is set. Uncovered timesteps are set to NaN. Allocates input
    /// storage with the length of the series on first use.
    pub fn set_input_series(
        &mut self,
        name: &str,
        indexes: &[&str],
        series: &[f64],
        align_with_results: bool,
    ) -> Result<()> {
        if self.input_data.is_none() {
            self.allocate_inputs(series.len() as u64)?;
        }
        let (_, offset) = self.input_offset(name, indexes)?;
        let first = if align_with_results {
            self.input_offset_of_run_start()?.max(0) as usize
        } else {
            0
        };
        let timesteps = self.input_timesteps as usize;
        if first + series.len() > timesteps {
            bail!(
                "Tried to set the input \"{}\" to a series of {} values starting at timestep {}, but input storage only has {} timesteps.",
                name,
                series.len(),
                first,
                timesteps
            );
        }
        let stride = self.input_structure.total_count();
        if let Some(data) = self.input_data.as_mut() {
            for step in 0..timesteps {
                data[offset + step * stride] = match step.checked_sub(first) {
                    Some(position) if position < series.len() => series[position],
                    _ => f64::NAN,
                };
            }
        }
        self.input_provided[offset] = true;
        Ok(())
    }

    /// The stored series, or only the part covering the model run when `align_with_results`
    /// is set.
    pub fn get_input_series(
        &self,
        name: &str,
        indexes: &[&str],
        align_with_results: bool,
    ) -> Result<Vec<f64>> {
        let Some(data) = &self.input_data else {
            bail!(
                "Tried to read the input \"{}\" before input storage was allocated.",
                name
            );
        };
        let (_, offset) = self.input_offset(name, indexes)?;
        let stride = self.input_structure.total_count();
        let timesteps = self.input_timesteps as usize;
        let (first, count) = if align_with_results {
            let first = (self.input_offset_of_run_start()?.max(0) as usize).min(timesteps);
            (first, (self.timesteps()? as usize).min(timesteps - first))
        } else {
            (0, timesteps)
        };
        Ok((first..first + count)
            .map(|step| data[offset + step * stride])
            .collect())
    }

    pub fn input_was_provided(&self, name: &str, indexes: &[&str]) -> Result<bool> {
        if self.input_data.is_none() {
            return Ok(false);
        }
        let (_, offset) = self.input_offset(name, indexes)?;
        Ok(self.input_provided[offset])
    }

    // --- Results ---

    pub fn has_been_run(&self) -> bool {
        self.has_been_run
    }

    pub fn timesteps_last_run(&self) -> u64 {
        self.timesteps_last_run
    }

    pub fn start_date_last_run(&self) -> i64 {
        self.start_date_last_run
    }

    fn result_equation(&self, name: &str) -> Result<EquationId> {
        let equation = self.model.equations.handle_of(name)?;
        if self.model.equations.spec(equation).kind == EquationKind::InitialValue {
            bail!(
                "The equation \"{}\" is an initial value equation and has no result series.",
                name
            );
        }
        if !self.has_been_run {
            bail!(
                "Tried to read the result series of \"{}\" before the model was run.",
                name
            );
        }
        Ok(equation)
    }

    fn result_offset(&self, name: &str, indexes: &[&str]) -> Result<(EquationId, usize)> {
        let equation = self.result_equation(name)?;
        let sets = self.result_structure.index_sets_of(equation);
        let positions = self.index_positions(sets, indexes, "result", name)?;
        let offset = self
            .result_structure
            .offset_for_indexes(equation, &positions)
            .map_err(|fault| fault.into_error(&self.model.index_sets, "result", name))?;
        Ok((equation, offset))
    }

    /// One value per timestep of the last run, initial values excluded. `indexes` follow the
    /// order given by [`DataSet::result_index_sets`].
    pub fn get_result_series(&self, name: &str, indexes: &[&str]) -> Result<Vec<f64>> {
        let (_, offset) = self.result_offset(name, indexes)?;
        let stride = self.result_structure.total_count();
        Ok((1..=self.timesteps_last_run as usize)
            .map(|step| self.result_data[offset + step * stride])
            .collect())
    }

    /// The value an equation started the last run with.
    pub fn get_initial_value(&self, name: &str, indexes: &[&str]) -> Result<f64> {
        let (_, offset) = self.result_offset(name, indexes)?;
        Ok(self.result_data[offset])
    }

    /// Sum of the result series of `name` over every index of `over`, optionally weighted by
    /// the double parameter `weight`. `indexes` names the remaining index sets of the result
    /// in storage order, leaving out `over`.
    pub fn cumulate_result(
        &self,
        name: &str,
        over: &str,
        indexes: &[&str],
        weight: Option<&str>,
    ) -> Result<Vec<f64>> {
        let equation = self.result_equation(name)?;
        let over_set = self.model.index_sets.handle_of(over)?;
        let sets = self.result_structure.index_sets_of(equation);
        if !sets.contains(&over_set) {
            bail!(
                "Tried to cumulate the result \"{}\" over the index set \"{}\", which it does not depend on.",
                name,
                over
            );
        }
        let others: Vec<IndexSetId> = sets.iter().copied().filter(|set| *set != over_set).collect();
        let positions = self.index_positions(&others, indexes, "result", name)?;
        let mut current = vec![0u32; self.model.index_sets.slot_count()];
        for (set, position) in others.iter().zip(positions) {
            current[set.index()] = position;
        }
        let weight = match weight {
            Some(weight) => {
                let parameter = self.model.parameters.handle_of(weight)?;
                if self.model.parameters.spec(parameter).ty != ParameterType::Double {
                    bail!("The weight \"{}\" must be a double parameter.", weight);
                }
                Some(parameter)
            }
            None => None,
        };
        let cumulation = Cumulation {
            equation,
            over: over_set,
            weight,
        };
        let stride = self.result_structure.total_count();
        Ok((1..=self.timesteps_last_run as usize)
            .map(|step| {
                let row = &self.result_data[step * stride..(step + 1) * stride];
                self.cumulate(row, &cumulation, &current)
            })
            .collect())
    }

    /// Cumulates one row of results at the index position `current`.
    pub(crate) fn cumulate(&self, row: &[f64], cumulation: &Cumulation, current: &[u32]) -> f64 {
        let count = self.index_counts[cumulation.over.index()] as usize;
        let (offset, stride) =
            self.result_structure
                .offset_skipping(cumulation.equation, current, cumulation.over);
        match cumulation.weight {
            None => (0..count).map(|i| row[offset + i * stride]).sum(),
            Some(weight) => {
                let parameters = self.parameters();
                let (weight_offset, weight_stride) =
                    self.parameter_structure
                        .offset_skipping(weight, current, cumulation.over);
                let mut total = 0.0;
                let mut weights = 0.0;
                for i in 0..count {
                    let w = parameters[weight_offset + i * weight_stride].as_f64();
                    total += row[offset + i * stride] * w;
                    weights += w;
                }
                total / weights
            }
        }
    }

    // --- Listings ---

    pub fn parameter_names(&self) -> Vec<&str> {
        self.model
            .parameters
            .iter()
            .filter(|(_, _, spec)| spec.expose)
            .map(|(_, name, _)| name)
            .collect()
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.model.inputs.iter().map(|(_, name, _)| name).collect()
    }

    /// Equations that produce a result series.
    pub fn result_names(&self) -> Vec<&str> {
        self.model
            .equations
            .iter()
            .filter(|(_, _, spec)| spec.kind != EquationKind::InitialValue)
            .map(|(_, name, _)| name)
            .collect()
    }

    fn set_names(&self, sets: &[IndexSetId]) -> Vec<&str> {
        sets.iter().map(|set| self.model.index_sets.name(*set)).collect()
    }

    pub fn parameter_index_sets(&self, name: &str) -> Result<Vec<&str>> {
        let parameter = self.model.parameters.handle_of(name)?;
        Ok(self.set_names(&self.model.parameters.spec(parameter).index_sets))
    }

    pub fn input_index_sets(&self, name: &str) -> Result<Vec<&str>> {
        let input = self.model.inputs.handle_of(name)?;
        Ok(self.set_names(&self.model.inputs.spec(input).index_sets))
    }

    /// Index sets of a result series in storage order, which is the iteration order of the
    /// batch group computing it.
    pub fn result_index_sets(&self, name: &str) -> Result<Vec<&str>> {
        let equation = self.model.equations.handle_of(name)?;
        let model = &self.model;
        let group = model.batch_groups.iter().find(|group| {
            model.batches[group.batches()]
                .iter()
                .any(|batch| batch.all_equations().any(|eq| eq == equation))
        });
        match group {
            Some(group) => Ok(self.set_names(&group.index_sets)),
            None => bail!("The equation \"{}\" has no result series.", name),
        }
    }
}

/// Result storage units mirror the batch groups, with the equations of every batch in
/// storage order.
pub(crate) fn result_units(model: &Model) -> Vec<StorageUnit<EquationId>> {
    model
        .batch_groups
        .iter()
        .map(|group| StorageUnit {
            index_sets: group.index_sets.clone(),
            handles: model.batches[group.batches()]
                .iter()
                .flat_map(|batch| batch.all_equations())
                .collect(),
        })
        .collect()
}
