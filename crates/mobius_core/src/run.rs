//! Model execution.
//!
//! A run walks the batch groups once for the initial values and then once per timestep.
//! Inside a group the index sets are iterated like an odometer, innermost index fastest.
//! Values that only change when an index at some level changes are reloaded into flat
//! "current value" buffers at that level; the storage offsets for these reloads are
//! computed once per run into a fast lookup and replayed in the same order every timestep.

use crate::data_set::{result_units, DataSet};
use crate::datetime::{find_timestep, format_date, shift_timesteps, ExpandedDateTime, TimestepUnit};
use crate::error::MobiusError;
use crate::handles::{EntityHandle, EquationId, Index, IndexSetId, InputId, ParameterId, SolverId};
use crate::model::{EquationKind, InitialValueSource, Model, ParameterType, ParameterValue};
use crate::scheduler::{BatchGroup, EquationBatch};
use crate::storage::StorageStructure;
use crate::traits::{EquationContext, NoProfiler, OdeSystem, Profiler, Tolerances};
use anyhow::{anyhow, bail, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Perturbation used for the finite-difference Jacobian.
const JACOBIAN_STEP: f64 = 1e-6;

// --- Settings ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Fail with a dump of the equation's inputs when a result is NaN or infinite.
    pub test_for_nan: bool,
    /// Check explicit indexes used by equation bodies against the index counts.
    pub check_bounds: bool,
}

impl RunSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nan_test(mut self, enabled: bool) -> Self {
        self.test_for_nan = enabled;
        self
    }

    pub fn with_bounds_check(mut self, enabled: bool) -> Self {
        self.check_bounds = enabled;
        self
    }
}

/// Counts equation evaluations and finished timesteps.
#[derive(Debug, Clone, Default)]
pub struct CountingProfiler {
    pub evaluations: HashMap<EquationId, u64>,
    pub timesteps: u64,
}

impl CountingProfiler {
    pub fn evaluations_of(&self, equation: EquationId) -> u64 {
        self.evaluations.get(&equation).copied().unwrap_or(0)
    }
}

impl Profiler for CountingProfiler {
    fn equation_evaluated(&mut self, equation: EquationId) {
        *self.evaluations.entry(equation).or_default() += 1;
    }

    fn timestep_finished(&mut self, _timestep: i64) {
        self.timesteps += 1;
    }
}

// --- Entry points ---

pub fn run_model(data: &mut DataSet) -> Result<()> {
    run_model_with(data, RunSettings::default(), &mut NoProfiler)
}

#[instrument(skip_all, fields(model = %data.model.name()))]
pub fn run_model_with(
    data: &mut DataSet,
    settings: RunSettings,
    profiler: &mut dyn Profiler,
) -> Result<()> {
    let model = Arc::clone(&data.model);
    if let Some(set) = data.missing_index_set() {
        bail!(
            "The index set \"{}\" does not contain any indexes.",
            model.index_sets.name(set)
        );
    }
    if data.parameter_data.is_none() {
        warn!("parameter storage was not allocated, running with default parameter values only");
        data.allocate_parameters()?;
    }
    let timesteps = data.timesteps()?;
    let start_date = data.start_date()?;
    if data.input_data.is_none() {
        warn!("input storage was not allocated, every input is 0");
        let before_start = data.input_offset_of_run_start()?.max(0) as u64;
        data.allocate_inputs(timesteps + before_start)?;
    }
    let input_offset = check_input_alignment(data, start_date, timesteps)?;

    process_computed_parameters(data, settings, &mut *profiler)?;

    data.has_been_run = false;
    data.result_data = Vec::new();
    data.result_structure = StorageStructure::build(
        result_units(&model),
        &data.index_counts,
        model.equations.slot_count(),
    );
    let results = vec![0.0; (timesteps as usize + 1) * data.result_structure.total_count()];
    info!(
        timesteps,
        start_date = %format_date(start_date),
        values = results.len(),
        "starting model run"
    );

    let time = ExpandedDateTime::new(start_date, model.timestep_size())?;
    let results = {
        let mut state = RunState::new(data, settings, profiler, results, time);
        state.run(timesteps, input_offset)?;
        state.results
    };

    data.result_data = results;
    data.has_been_run = true;
    data.timesteps_last_run = timesteps;
    data.start_date_last_run = start_date;
    info!(timesteps, "model run finished");
    Ok(())
}

fn check_month_start(date: i64, what: &str, data: &DataSet) -> Result<()> {
    let time = ExpandedDateTime::new(date, data.model.timestep_size())?;
    if time.day_of_month != 1 || time.second_of_day != 0 {
        bail!(
            "The model has a monthly timestep, so the {} has to be at midnight on the first day of a month, got {}.",
            what,
            format_date(date)
        );
    }
    Ok(())
}

/// Returns the input timestep holding the first model timestep.
fn check_input_alignment(data: &DataSet, start_date: i64, timesteps: u64) -> Result<usize> {
    let step = data.model.timestep_size();
    let monthly = step.unit == TimestepUnit::Month;
    if monthly {
        check_month_start(start_date, "start date", data)?;
    }
    let offset = match data.input_start_date {
        Some(input_start) => {
            if monthly {
                check_month_start(input_start, "input start date", data)?;
            }
            let offset = find_timestep(input_start, start_date, step)?;
            if offset < 0 {
                bail!(
                    "The input data starts at {}, which is after the model run starts at {}.",
                    format_date(input_start),
                    format_date(start_date)
                );
            }
            if shift_timesteps(input_start, offset, step)? != start_date {
                bail!(
                    "The model start date {} is not a whole number of timesteps after the input start date {}.",
                    format_date(start_date),
                    format_date(input_start)
                );
            }
            offset as u64
        }
        None => 0,
    };
    if data.input_timesteps < offset + timesteps {
        bail!(
            "The input data has {} timesteps from the model start date on, but the model runs for {} timesteps.",
            data.input_timesteps.saturating_sub(offset),
            timesteps
        );
    }
    Ok(offset as usize)
}

/// Evaluates every computed parameter for every index combination of the parameter and
/// writes the values into parameter storage.
pub fn process_computed_parameters(
    data: &mut DataSet,
    settings: RunSettings,
    profiler: &mut dyn Profiler,
) -> Result<()> {
    let model = Arc::clone(&data.model);
    let time = ExpandedDateTime::new(data.start_date()?, model.timestep_size())?;
    for (parameter, name, spec) in model.parameters.iter() {
        let Some(equation) = spec.is_computed_by else {
            continue;
        };
        let values = {
            let mut state = RunState::new(data, settings, &mut *profiler, Vec::new(), time);
            state.compute_parameter(parameter, equation)?
        };
        debug!(parameter = name, instances = values.len(), "computed parameter");
        if let Some(storage) = data.parameter_data.as_mut() {
            for (offset, value) in values {
                storage[offset] = value;
            }
        }
    }
    Ok(())
}

// --- Run state ---

/// Values and offsets recorded by the lookup pass, in model loop order.
#[derive(Debug, Default)]
struct FastLookup {
    parameters: Vec<ParameterValue>,
    inputs: Vec<usize>,
    results: Vec<usize>,
    last_results: Vec<usize>,
}

#[derive(Debug, Default, Clone, Copy)]
struct LookupCursor {
    parameter: usize,
    input: usize,
    result: usize,
    last_result: usize,
}

type LoopBody<'a> = fn(&mut RunState<'a>, usize, Option<usize>) -> Result<()>;

struct RunState<'a> {
    model: &'a Model,
    data: &'a DataSet,
    settings: RunSettings,
    profiler: &'a mut dyn Profiler,

    results: Vec<f64>,
    result_total: usize,
    input_total: usize,

    cur_parameters: Vec<ParameterValue>,
    cur_inputs: Vec<f64>,
    cur_input_provided: Vec<bool>,
    cur_results: Vec<f64>,
    last_results: Vec<f64>,
    /// Indexed by index set handle value.
    current_indexes: Vec<u32>,

    cur_results_base: usize,
    last_results_base: usize,
    inputs_base: usize,
    at_result: usize,
    at_last_result: usize,

    lookup: FastLookup,
    cursor: LookupCursor,

    solver_x0: Vec<f64>,
    solver_workspace: Vec<f64>,

    timestep: i64,
    time: ExpandedDateTime,
    /// First error raised from inside an equation body.
    fault: Option<anyhow::Error>,
}

impl<'a> RunState<'a> {
    fn new(
        data: &'a DataSet,
        settings: RunSettings,
        profiler: &'a mut dyn Profiler,
        results: Vec<f64>,
        time: ExpandedDateTime,
    ) -> Self {
        let model: &'a Model = &data.model;
        Self {
            model,
            data,
            settings,
            profiler,
            results,
            result_total: data.result_structure.total_count(),
            input_total: data.input_structure.total_count(),
            cur_parameters: vec![ParameterValue::default(); model.parameters.slot_count()],
            cur_inputs: vec![0.0; model.inputs.slot_count()],
            cur_input_provided: vec![false; model.inputs.slot_count()],
            cur_results: vec![0.0; model.equations.slot_count()],
            last_results: vec![0.0; model.equations.slot_count()],
            current_indexes: vec![0; model.index_sets.slot_count()],
            cur_results_base: 0,
            last_results_base: 0,
            inputs_base: 0,
            at_result: 0,
            at_last_result: 0,
            lookup: FastLookup::default(),
            cursor: LookupCursor::default(),
            solver_x0: Vec::new(),
            solver_workspace: Vec::new(),
            timestep: -1,
            time,
            fault: None,
        }
    }

    fn run(&mut self, timesteps: u64, input_offset: usize) -> Result<()> {
        self.load_unindexed_parameters();
        self.model_loop(Self::record_lookup)?;
        debug!(
            parameters = self.lookup.parameters.len(),
            inputs = self.lookup.inputs.len(),
            results = self.lookup.results.len(),
            last_results = self.lookup.last_results.len(),
            "built fast lookup"
        );
        self.allocate_solver_storage();

        self.timestep = -1;
        self.inputs_base = input_offset.saturating_sub(1) * self.input_total;
        self.load_unindexed_inputs(true);
        self.at_result = 0;
        self.cursor = LookupCursor::default();
        self.model_loop(Self::initial_value_step)?;

        self.last_results_base = 0;
        self.cur_results_base = self.result_total;
        self.inputs_base = input_offset * self.input_total;
        for timestep in 0..timesteps as i64 {
            self.timestep = timestep;
            self.at_result = self.cur_results_base;
            self.at_last_result = self.last_results_base;
            self.cursor = LookupCursor::default();
            self.load_unindexed_inputs(false);

            self.model_loop(Self::timestep_step)?;

            self.profiler.timestep_finished(timestep);
            self.last_results_base = self.cur_results_base;
            self.cur_results_base += self.result_total;
            self.inputs_base += self.input_total;
            self.time.advance()?;
        }
        Ok(())
    }

    // --- Iteration ---

    /// Calls `body` with level `None` once when entering each batch group, then walks the
    /// group's index sets and calls `body` every time the index at some level changes.
    fn model_loop(&mut self, body: LoopBody<'a>) -> Result<()> {
        let model = self.model;
        for (group_index, group) in model.batch_groups.iter().enumerate() {
            body(self, group_index, None)?;
            let sets = &group.index_sets;
            let Some(bottom) = sets.len().checked_sub(1) else {
                continue;
            };
            for set in sets {
                self.current_indexes[set.index()] = 0;
            }
            let mut level = 0;
            loop {
                let set = sets[level].index();
                let count = self.data.index_counts[set];
                if self.current_indexes[set] != count {
                    body(self, group_index, Some(level))?;
                }
                if level == bottom {
                    self.current_indexes[set] += 1;
                }
                if self.current_indexes[set] == count {
                    self.current_indexes[set] = 0;
                    if level == 0 {
                        break;
                    }
                    level -= 1;
                    self.current_indexes[sets[level].index()] += 1;
                } else if level != bottom {
                    level += 1;
                }
            }
        }
        Ok(())
    }

    fn is_bottom(group: &BatchGroup, level: Option<usize>) -> bool {
        level == group.index_sets.len().checked_sub(1)
    }

    fn record_lookup(&mut self, group_index: usize, level: Option<usize>) -> Result<()> {
        let data = self.data;
        let group = &self.model.batch_groups[group_index];
        let Some(level) = level else {
            for equation in &group.last_results_to_read_at_base {
                let offset = data.result_structure.offset(*equation, &self.current_indexes);
                self.lookup.last_results.push(offset);
            }
            return Ok(());
        };
        let iteration = &group.iteration_data[level];
        let parameters = data.parameters();
        for parameter in &iteration.parameters_to_read {
            let offset = data.parameter_structure.offset(*parameter, &self.current_indexes);
            self.lookup.parameters.push(parameters[offset]);
        }
        for input in &iteration.inputs_to_read {
            let offset = data.input_structure.offset(*input, &self.current_indexes);
            self.lookup.inputs.push(offset);
        }
        for equation in &iteration.results_to_read {
            let offset = data.result_structure.offset(*equation, &self.current_indexes);
            self.lookup.results.push(offset);
        }
        for equation in &iteration.last_results_to_read {
            let offset = data.result_structure.offset(*equation, &self.current_indexes);
            self.lookup.last_results.push(offset);
        }
        Ok(())
    }

    fn load_parameters_and_inputs(&mut self, group: &BatchGroup, level: usize) {
        let iteration = &group.iteration_data[level];
        let inputs = self.data.inputs();
        for parameter in &iteration.parameters_to_read {
            self.cur_parameters[parameter.index()] = self.lookup.parameters[self.cursor.parameter];
            self.cursor.parameter += 1;
        }
        for input in &iteration.inputs_to_read {
            let offset = self.lookup.inputs[self.cursor.input];
            self.cursor.input += 1;
            self.cur_inputs[input.index()] = inputs[self.inputs_base + offset];
            self.cur_input_provided[input.index()] = self.data.input_provided[offset];
        }
    }

    fn load_results(&mut self, group: &BatchGroup, level: Option<usize>) {
        let (results, last_results) = match level {
            Some(level) => {
                let iteration = &group.iteration_data[level];
                (&iteration.results_to_read[..], &iteration.last_results_to_read[..])
            }
            None => (&[][..], &group.last_results_to_read_at_base[..]),
        };
        for equation in results {
            let offset = self.lookup.results[self.cursor.result];
            self.cursor.result += 1;
            self.cur_results[equation.index()] = self.results[self.cur_results_base + offset];
        }
        for equation in last_results {
            let offset = self.lookup.last_results[self.cursor.last_result];
            self.cursor.last_result += 1;
            self.last_results[equation.index()] = self.results[self.last_results_base + offset];
        }
    }

    fn load_unindexed_parameters(&mut self) {
        let parameters = self.data.parameters();
        for (parameter, _, spec) in self.model.parameters.iter() {
            if spec.index_sets.is_empty() {
                if let Some(offset) = self.data.parameter_structure.offsets_of(parameter).next() {
                    self.cur_parameters[parameter.index()] = parameters[offset];
                }
            }
        }
    }

    fn load_unindexed_inputs(&mut self, with_provided_flags: bool) {
        let inputs = self.data.inputs();
        for (input, _, spec) in self.model.inputs.iter() {
            if !spec.index_sets.is_empty() {
                continue;
            }
            if let Some(offset) = self.data.input_structure.offsets_of(input).next() {
                self.cur_inputs[input.index()] = inputs[self.inputs_base + offset];
                if with_provided_flags {
                    self.cur_input_provided[input.index()] = self.data.input_provided[offset];
                }
            }
        }
    }

    fn allocate_solver_storage(&mut self) {
        let mut states = 0;
        let mut workspace = 0;
        for batch in &self.model.batches {
            if let Some(solver) = batch.solver {
                let n = batch.equations_ode.len();
                states = states.max(n);
                workspace = workspace.max(self.model.solvers.spec(solver).method.workspace_size(n));
            }
        }
        self.solver_x0 = vec![0.0; states];
        self.solver_workspace = vec![0.0; workspace];
    }

    // --- Initial values ---

    fn initial_value_step(&mut self, group_index: usize, level: Option<usize>) -> Result<()> {
        let model = self.model;
        let group = &model.batch_groups[group_index];
        if let Some(level) = level {
            self.load_parameters_and_inputs(group, level);
        }
        if !Self::is_bottom(group, level) {
            return Ok(());
        }
        for batch in &model.batches[group.batches()] {
            for equation in &batch.initial_value_order {
                self.setup_initial_value(*equation)?;
            }
        }
        self.at_result += self.data.result_structure.units()[group_index].handles.len();
        Ok(())
    }

    fn setup_initial_value(&mut self, equation: EquationId) -> Result<()> {
        let spec = self.model.equations.spec(equation);
        let value = match spec.initial_value {
            Some(InitialValueSource::Parameter(parameter)) => {
                let offset = self
                    .data
                    .parameter_structure
                    .offset(parameter, &self.current_indexes);
                self.data.parameters()[offset].as_f64()
            }
            Some(InitialValueSource::Constant(value)) => value,
            Some(InitialValueSource::Equation(initial)) => self.evaluate(initial)?,
            // Only reached when an initial value equation depends on this one.
            None => self.evaluate(equation)?,
        };
        self.check_finite(equation, value)?;
        let location = self.data.result_structure.location_in_unit(equation);
        self.results[self.at_result + location] = value;
        self.cur_results[equation.index()] = value;
        self.last_results[equation.index()] = value;
        Ok(())
    }

    fn compute_parameter(
        &mut self,
        parameter: ParameterId,
        equation: EquationId,
    ) -> Result<Vec<(usize, ParameterValue)>> {
        let data = self.data;
        let structure = &data.parameter_structure;
        let Some(unit) = structure.unit_of(parameter) else {
            return Ok(Vec::new());
        };
        let ty = self.model.parameters.spec(parameter).ty;
        let dependencies = &self.model.equations.spec(equation).dependencies.parameters;
        let parameters = data.parameters();
        let instances = structure.instance_count(unit);
        let mut values = Vec::with_capacity(instances);
        for instance in 0..instances {
            for index in structure.instance_indexes(unit, instance) {
                self.current_indexes[index.index_set.index()] = index.value;
            }
            for dependency in dependencies {
                let offset = structure.offset(*dependency, &self.current_indexes);
                self.cur_parameters[dependency.index()] = parameters[offset];
            }
            let value = self.evaluate(equation)?;
            let stored = match ty {
                ParameterType::UInt => ParameterValue::UInt(value.max(0.0) as u64),
                _ => ParameterValue::Double(value),
            };
            values.push((structure.offset(parameter, &self.current_indexes), stored));
        }
        Ok(values)
    }

    // --- Timesteps ---

    fn timestep_step(&mut self, group_index: usize, level: Option<usize>) -> Result<()> {
        let model = self.model;
        let group = &model.batch_groups[group_index];
        if let Some(level) = level {
            self.load_parameters_and_inputs(group, level);
        }
        self.load_results(group, level);
        if !Self::is_bottom(group, level) {
            return Ok(());
        }

        let batches = &model.batches[group.batches()];
        for batch in batches {
            for equation in batch.all_equations() {
                self.last_results[equation.index()] = self.results[self.at_last_result];
                self.at_last_result += 1;
            }
        }
        for batch in batches {
            if !self.batch_is_enabled(batch) {
                for equation in batch.all_equations() {
                    self.cur_results[equation.index()] = 0.0;
                    self.at_result += 1;
                }
                continue;
            }
            match batch.solver {
                None => {
                    for &equation in &batch.equations {
                        let value = self.evaluate(equation)?;
                        self.check_finite(equation, value)?;
                        self.results[self.at_result] = value;
                        self.cur_results[equation.index()] = value;
                        self.at_result += 1;
                    }
                }
                Some(solver) => self.run_solver_batch(batch, solver)?,
            }
        }
        Ok(())
    }

    fn batch_is_enabled(&self, batch: &EquationBatch) -> bool {
        match batch.conditional {
            None => true,
            Some(conditional) => {
                let spec = self.model.conditionals.spec(conditional);
                self.cur_parameters[spec.switch.index()].as_u64() == spec.value
            }
        }
    }

    fn run_solver_batch(&mut self, batch: &'a EquationBatch, solver: SolverId) -> Result<()> {
        let model = self.model;
        let spec = model.solvers.spec(solver);
        let h = match spec.h_parameter {
            Some(parameter) => self.cur_parameters[parameter.index()].as_f64(),
            None => spec.h,
        };
        if !(h > 0.0 && h <= 1.0) {
            return Err(MobiusError::InvalidSolverStep {
                solver: model.solvers.name(solver).to_string(),
            }
            .into());
        }

        let n = batch.equations_ode.len();
        let mut x0 = std::mem::take(&mut self.solver_x0);
        let mut workspace = std::mem::take(&mut self.solver_workspace);
        for (x, equation) in x0.iter_mut().zip(&batch.equations_ode) {
            *x = if model.equations.spec(*equation).reset_every_timestep {
                0.0
            } else {
                self.last_results[equation.index()]
            };
        }
        let tolerances = Tolerances {
            rel_err: spec.rel_err,
            abs_err: spec.abs_err,
        };
        let size = spec.method.workspace_size(n);
        let fault = {
            let mut system = BatchSystem {
                state: self,
                batch,
                fault: None,
            };
            spec.method
                .solve(h, &mut x0[..n], &mut workspace[..size], &mut system, tolerances);
            // Non-ODE values are kept from the last right-hand side evaluation.
            system.fault.take()
        };
        self.solver_x0 = x0;
        self.solver_workspace = workspace;
        if let Some(err) = fault {
            return Err(err);
        }

        for &equation in &batch.equations {
            let value = self.cur_results[equation.index()];
            self.check_finite(equation, value)?;
            self.results[self.at_result] = value;
            self.at_result += 1;
        }
        for (i, &equation) in batch.equations_ode.iter().enumerate() {
            let value = self.solver_x0[i];
            self.check_finite(equation, value)?;
            self.cur_results[equation.index()] = value;
            self.results[self.at_result] = value;
            self.at_result += 1;
        }
        Ok(())
    }

    // --- Evaluation ---

    fn evaluate(&mut self, equation: EquationId) -> Result<f64> {
        let model = self.model;
        let spec = model.equations.spec(equation);
        let value = match (&spec.cumulation, model.equation_body(equation)) {
            (Some(cumulation), _) => {
                let end = self.cur_results_base + self.result_total;
                let row = &self.results[self.cur_results_base..end];
                self.data.cumulate(row, cumulation, &self.current_indexes)
            }
            (None, Some(body)) => {
                let ctx: &mut dyn EquationContext = self;
                (body.0)(ctx)
            }
            (None, None) => {
                return Err(MobiusError::MissingEquationBody {
                    equation: model.equations.name(equation).to_string(),
                }
                .into())
            }
        };
        self.profiler.equation_evaluated(equation);
        match self.fault.take() {
            Some(err) => Err(err.context(format!(
                "while evaluating the equation \"{}\" at timestep {}",
                model.equations.name(equation),
                self.timestep
            ))),
            None => Ok(value),
        }
    }

    fn record_fault(&mut self, err: anyhow::Error) {
        if self.fault.is_none() {
            self.fault = Some(err);
        }
    }

    fn explicit_offset<H: EntityHandle>(
        &mut self,
        structure: &StorageStructure<H>,
        handle: H,
        indexes: &[Index],
        kind: &'static str,
        entity: &str,
    ) -> Option<usize> {
        let check_bounds = self.settings.check_bounds;
        let offset =
            structure.offset_with_overrides(handle, &self.current_indexes, indexes, check_bounds);
        match offset {
            Ok(offset) => Some(offset),
            Err(fault) => {
                self.record_fault(fault.into_error(&self.model.index_sets, kind, entity));
                None
            }
        }
    }

    fn read_result(&mut self, base: usize, offset: Option<usize>, entity: &str) -> f64 {
        match offset.and_then(|offset| self.results.get(base + offset)) {
            Some(value) => *value,
            None => {
                if offset.is_some() {
                    self.record_fault(anyhow!(
                        "The explicit indexes used to read the result \"{}\" point outside result storage.",
                        entity
                    ));
                }
                0.0
            }
        }
    }

    fn check_finite(&self, equation: EquationId, value: f64) -> Result<()> {
        if !self.settings.test_for_nan || value.is_finite() {
            return Ok(());
        }
        Err(MobiusError::NonFiniteResult {
            equation: self.model.equations.name(equation).to_string(),
            timestep: self.timestep,
            diagnostics: self.diagnostics(equation),
        }
        .into())
    }

    fn format_parameter(&self, parameter: ParameterId) -> String {
        let spec = self.model.parameters.spec(parameter);
        match self.cur_parameters[parameter.index()] {
            ParameterValue::Double(v) => v.to_string(),
            ParameterValue::UInt(v) => v.to_string(),
            ParameterValue::Bool(v) => v.to_string(),
            ParameterValue::Time(v) => format_date(v),
            ParameterValue::Enum(v) => spec
                .enum_names
                .get(v as usize)
                .cloned()
                .unwrap_or_else(|| v.to_string()),
        }
    }

    /// The current indexes and every value the equation read directly.
    fn diagnostics(&self, equation: EquationId) -> String {
        let model = self.model;
        let spec = model.equations.spec(equation);
        let deps = match spec.initial_value {
            Some(InitialValueSource::Equation(initial)) if self.timestep < 0 => {
                &model.equations.spec(initial).dependencies
            }
            _ => &spec.dependencies,
        };
        let mut out = String::new();
        for set in &deps.index_sets {
            let index = self.current_indexes[set.index()];
            let _ = writeln!(
                out,
                "Index set \"{}\": \"{}\"",
                model.index_sets.name(*set),
                self.data.index_name(*set, index)
            );
        }
        for parameter in &deps.parameters {
            let _ = writeln!(
                out,
                "Value of \"{}\" is {}",
                model.parameters.name(*parameter),
                self.format_parameter(*parameter)
            );
        }
        for input in &deps.inputs {
            let _ = write!(
                out,
                "Current value of \"{}\" is {}",
                model.inputs.name(*input),
                self.cur_inputs[input.index()]
            );
            if !self.cur_input_provided[input.index()] {
                out.push_str(" (Not provided in dataset)");
            }
            out.push('\n');
        }
        for result in &deps.direct_results {
            let _ = writeln!(
                out,
                "Current value of \"{}\" is {}",
                model.equations.name(*result),
                self.cur_results[result.index()]
            );
        }
        for result in &deps.direct_last_results {
            if model.equations.spec(*result).kind != EquationKind::InitialValue {
                let _ = writeln!(
                    out,
                    "Last value of \"{}\" was {}",
                    model.equations.name(*result),
                    self.last_results[result.index()]
                );
            }
        }
        out
    }
}

impl EquationContext for RunState<'_> {
    fn parameter_value(
        &mut self,
        parameter: ParameterId,
        ty: ParameterType,
        indexes: &[Index],
    ) -> ParameterValue {
        if indexes.is_empty() {
            return self.cur_parameters[parameter.index()];
        }
        let (model, data) = (self.model, self.data);
        let name = model.parameters.name(parameter);
        let offset = self.explicit_offset(
            &data.parameter_structure,
            parameter,
            indexes,
            "parameter",
            name,
        );
        match offset.and_then(|offset| data.parameters().get(offset)) {
            Some(value) => *value,
            None => {
                if offset.is_some() {
                    self.record_fault(anyhow!(
                        "The explicit indexes used to read the parameter \"{}\" point outside parameter storage.",
                        name
                    ));
                }
                ParameterValue::zero(ty)
            }
        }
    }

    fn input(&mut self, input: InputId) -> f64 {
        self.cur_inputs[input.index()]
    }

    fn input_was_provided(&mut self, input: InputId) -> bool {
        self.cur_input_provided[input.index()]
    }

    fn result_value(&mut self, equation: EquationId, indexes: &[Index]) -> f64 {
        if indexes.is_empty() {
            return self.cur_results[equation.index()];
        }
        let (model, data) = (self.model, self.data);
        let name = model.equations.name(equation);
        let offset =
            self.explicit_offset(&data.result_structure, equation, indexes, "result", name);
        self.read_result(self.cur_results_base, offset, name)
    }

    fn last_result_value(&mut self, equation: EquationId, indexes: &[Index]) -> f64 {
        if indexes.is_empty() {
            return self.last_results[equation.index()];
        }
        let (model, data) = (self.model, self.data);
        let name = model.equations.name(equation);
        let offset =
            self.explicit_offset(&data.result_structure, equation, indexes, "result", name);
        self.read_result(self.last_results_base, offset, name)
    }

    fn earlier_result_value(
        &mut self,
        equation: EquationId,
        steps_back: u64,
        indexes: &[Index],
    ) -> f64 {
        let (model, data) = (self.model, self.data);
        let name = model.equations.name(equation);
        let offset =
            self.explicit_offset(&data.result_structure, equation, indexes, "result", name);
        let steps_back = i64::try_from(steps_back).unwrap_or(i64::MAX);
        let row = if steps_back > self.timestep {
            0
        } else {
            (self.timestep + 1 - steps_back) as usize
        };
        self.read_result(row * self.result_total, offset, name)
    }

    fn current_index(&mut self, index_set: IndexSetId) -> Index {
        Index::new(index_set, self.current_indexes[index_set.index()])
    }

    fn index_count(&mut self, index_set: IndexSetId) -> u32 {
        self.data.index_counts[index_set.index()]
    }

    fn branch_input_count(&mut self, index_set: IndexSetId) -> usize {
        let current = self.current_indexes[index_set.index()] as usize;
        self.data.branch_inputs[index_set.index()]
            .get(current)
            .map_or(0, Vec::len)
    }

    fn branch_input(&mut self, index_set: IndexSetId, n: usize) -> Index {
        let current = self.current_indexes[index_set.index()] as usize;
        let data = self.data;
        match data.branch_inputs[index_set.index()]
            .get(current)
            .and_then(|inputs| inputs.get(n))
        {
            Some(input) => Index::new(index_set, *input),
            None => {
                self.record_fault(anyhow!(
                    "Asked for branch input {} of the index \"{}\" of the index set \"{}\", which does not have that many inputs.",
                    n,
                    data.index_name(index_set, current as u32),
                    self.model.index_sets.name(index_set)
                ));
                Index::new(index_set, 0)
            }
        }
    }

    fn timestep(&self) -> i64 {
        self.timestep
    }

    fn current_time(&self) -> ExpandedDateTime {
        self.time
    }
}

// --- Solver batches ---

/// The right-hand side of one solver batch at the current index position.
struct BatchSystem<'s, 'a> {
    state: &'s mut RunState<'a>,
    batch: &'a EquationBatch,
    fault: Option<anyhow::Error>,
}

impl BatchSystem<'_, '_> {
    fn set_states(&mut self, x: &[f64]) -> Result<()> {
        for (equation, value) in self.batch.equations_ode.iter().zip(x) {
            self.state.check_finite(*equation, *value)?;
            self.state.cur_results[equation.index()] = *value;
        }
        for &equation in &self.batch.equations {
            let value = self.state.evaluate(equation)?;
            self.state.check_finite(equation, value)?;
            self.state.cur_results[equation.index()] = value;
        }
        Ok(())
    }

    fn try_evaluate(&mut self, x: &[f64], dxdt: &mut [f64]) -> Result<()> {
        self.set_states(x)?;
        for (equation, derivative) in self.batch.equations_ode.iter().zip(dxdt.iter_mut()) {
            *derivative = self.state.evaluate(*equation)?;
        }
        Ok(())
    }

    /// Forward differences, perturbing one state at a time and re-evaluating only the
    /// equations that depend on it.
    fn try_jacobian(&mut self, x: &[f64], jacobian: &mut DMatrix<f64>) -> Result<()> {
        let batch = self.batch;
        let Some(info) = &batch.jacobian else {
            return Ok(());
        };
        self.set_states(x)?;
        let base = batch
            .equations_ode
            .iter()
            .map(|equation| self.state.evaluate(*equation))
            .collect::<Result<Vec<f64>>>()?;

        for (col, &perturbed) in batch.equations_ode.iter().enumerate() {
            let shifted = x[col] + JACOBIAN_STEP;
            let step = shifted - x[col];
            self.state.cur_results[perturbed.index()] = shifted;

            let dependents = &info.ode_is_dependency_of_non_ode[col];
            let mut backup = Vec::with_capacity(dependents.len());
            for &equation in dependents {
                backup.push(self.state.cur_results[equation.index()]);
                let value = self.state.evaluate(equation)?;
                self.state.cur_results[equation.index()] = value;
            }
            for &row in &info.ode_is_dependency_of_ode[col] {
                let value = self.state.evaluate(batch.equations_ode[row])?;
                jacobian[(row, col)] = (value - base[row]) / step;
            }

            self.state.cur_results[perturbed.index()] = x[col];
            for (equation, value) in dependents.iter().zip(backup) {
                self.state.cur_results[equation.index()] = value;
            }
        }
        Ok(())
    }
}

impl OdeSystem for BatchSystem<'_, '_> {
    fn evaluate(&mut self, x: &[f64], dxdt: &mut [f64]) {
        if self.fault.is_none() {
            if let Err(err) = self.try_evaluate(x, dxdt) {
                self.fault = Some(err);
            }
        }
        if self.fault.is_some() {
            dxdt.fill(0.0);
        }
    }

    fn jacobian(&mut self, x: &[f64], jacobian: &mut DMatrix<f64>) {
        if self.fault.is_none() {
            if let Err(err) = self.try_jacobian(x, jacobian) {
                self.fault = Some(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_set::generate_data_set;
    use crate::model::{START_DATE, TIMESTEPS};
    use crate::solvers::{CashKarp54, Euler, IncaDascru, RosenbrockEuler};

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    fn assert_close(actual: f64, expected: f64, relative: f64) {
        assert!(
            ((actual - expected) / expected).abs() <= relative,
            "expected {expected} within {relative} (relative), got {actual}"
        );
    }

    fn finalize(model: Model) -> Arc<Model> {
        let mut model = model;
        model.end_model_definition().expect("finalize");
        Arc::new(model)
    }

    fn set_timesteps(data: &mut DataSet, timesteps: u64) {
        data.set_parameter_uint(TIMESTEPS, &[], timesteps)
            .expect("timesteps");
    }

    #[test]
    fn constant_feeds_a_dependent_equation() {
        let mut model = Model::new("Scenario");
        let a = model.register_equation("A", None).expect("equation");
        let b = model.register_equation("B", None).expect("equation");
        model
            .set_equation_body(a, |_: &mut dyn EquationContext| 2.0)
            .expect("body");
        model
            .set_equation_body(b, move |ctx: &mut dyn EquationContext| ctx.result(a) + 3.0)
            .expect("body");
        let model = finalize(model);
        assert_eq!(model.batches()[0].equations, vec![a, b]);

        let mut data = generate_data_set(&model).expect("dataset");
        set_timesteps(&mut data, 3);
        run_model(&mut data).expect("run");
        assert_eq!(data.get_result_series("B", &[]).expect("series"), vec![5.0; 3]);
        assert_eq!(data.timesteps_last_run(), 3);
    }

    fn accumulation_model() -> Arc<Model> {
        let mut model = Model::new("Accumulation");
        let boxes = model.register_index_set("Boxes").expect("index set");
        let inflow = model.register_input("In", None).expect("input");
        model.set_input_index_sets(inflow, &[boxes]).expect("input sets");
        let volume = model.register_equation("V", None).expect("equation");
        model
            .set_equation_body(volume, move |ctx: &mut dyn EquationContext| {
                ctx.last_result(volume) + ctx.input(inflow)
            })
            .expect("body");
        model.set_initial_value_constant(volume, 0.0).expect("initial value");
        finalize(model)
    }

    fn accumulation_data() -> DataSet {
        let model = accumulation_model();
        let mut data = generate_data_set(&model).expect("dataset");
        data.set_indexes("Boxes", &["X", "Y"]).expect("indexes");
        set_timesteps(&mut data, 3);
        for name in ["X", "Y"] {
            data.set_input_series("In", &[name], &[1.0, 1.0, 1.0], false)
                .expect("series");
        }
        data
    }

    #[test]
    fn last_results_accumulate_per_index() {
        let mut data = accumulation_data();
        run_model(&mut data).expect("run");
        for name in ["X", "Y"] {
            assert_eq!(
                data.get_result_series("V", &[name]).expect("series"),
                vec![1.0, 2.0, 3.0]
            );
            assert_eq!(data.get_initial_value("V", &[name]).expect("initial"), 0.0);
        }
    }

    #[test]
    fn copies_produce_identical_results() {
        let mut data = accumulation_data();
        data.set_input_series("In", &["Y"], &[0.5, 2.0, 4.0], false)
            .expect("series");
        let mut copy = data.copy(false);
        run_model(&mut data).expect("run");
        run_model(&mut copy).expect("run");
        for name in ["X", "Y"] {
            assert_eq!(
                data.get_result_series("V", &[name]).expect("series"),
                copy.get_result_series("V", &[name]).expect("series")
            );
        }
        assert_eq!(
            copy.get_result_series("V", &["Y"]).expect("series"),
            vec![0.5, 2.5, 6.5]
        );
        let kept = copy.copy(true);
        assert!(kept.has_been_run());
        assert_eq!(
            kept.get_result_series("V", &["Y"]).expect("series"),
            vec![0.5, 2.5, 6.5]
        );
    }

    fn decay_model(method: impl crate::traits::OdeSolver + 'static, h: f64) -> Arc<Model> {
        let mut model = Model::new("Decay");
        let group = model.register_parameter_group("Decay", None).expect("group");
        let rate = model
            .register_parameter_double(group, "k", None, 0.1, 0.0, 1.0)
            .expect("parameter");
        let solver = model.register_solver("Solver", h, method).expect("solver");
        let volume = model.register_equation_ode("V", None).expect("equation");
        model
            .set_equation_body(volume, move |ctx: &mut dyn EquationContext| {
                -ctx.parameter_f64(rate) * ctx.result(volume)
            })
            .expect("body");
        model.set_solver(volume, solver).expect("solver");
        model.set_initial_value_constant(volume, 100.0).expect("initial value");
        finalize(model)
    }

    #[test]
    fn ode_decay_matches_the_exponential() {
        let model = decay_model(IncaDascru, 0.1);
        let mut data = generate_data_set(&model).expect("dataset");
        set_timesteps(&mut data, 1);
        run_model(&mut data).expect("run");
        let series = data.get_result_series("V", &[]).expect("series");
        assert_close(series[0], 100.0 * (-0.1f64).exp(), 5e-4);
    }

    #[test]
    fn error_controlled_solver_tracks_several_timesteps() {
        let model = decay_model(CashKarp54, 0.5);
        let mut data = generate_data_set(&model).expect("dataset");
        set_timesteps(&mut data, 5);
        data.set_parameter_double("k", &[], 0.3).expect("parameter");
        run_model(&mut data).expect("run");
        let series = data.get_result_series("V", &[]).expect("series");
        for (step, value) in series.iter().enumerate() {
            assert_close(*value, 100.0 * (-0.3 * (step + 1) as f64).exp(), 1e-3);
        }
    }

    #[test]
    fn implicit_solver_uses_the_estimated_jacobian() {
        let mut model = Model::new("Transfer");
        let solver = model
            .register_solver("Solver", 0.01, RosenbrockEuler)
            .expect("solver");
        let a = model.register_equation_ode("A", None).expect("equation");
        let b = model.register_equation_ode("B", None).expect("equation");
        let outflow = model.register_equation("Outflow", None).expect("equation");
        model
            .set_equation_body(outflow, move |ctx: &mut dyn EquationContext| 0.1 * ctx.result(a))
            .expect("body");
        model
            .set_equation_body(a, move |ctx: &mut dyn EquationContext| -ctx.result(outflow))
            .expect("body");
        model
            .set_equation_body(b, move |ctx: &mut dyn EquationContext| ctx.result(outflow))
            .expect("body");
        for equation in [a, b, outflow] {
            model.set_solver(equation, solver).expect("solver");
        }
        model.set_initial_value_constant(a, 100.0).expect("initial value");
        model.set_initial_value_constant(b, 0.0).expect("initial value");
        let model = finalize(model);
        assert!(model.batches()[0].jacobian.is_some());

        let mut data = generate_data_set(&model).expect("dataset");
        set_timesteps(&mut data, 1);
        run_model(&mut data).expect("run");
        let a_end = data.get_result_series("A", &[]).expect("series")[0];
        let b_end = data.get_result_series("B", &[]).expect("series")[0];
        assert_close(a_end, 100.0 * (-0.1f64).exp(), 1e-3);
        assert!((a_end + b_end - 100.0).abs() < 1e-6, "mass is conserved");
    }

    #[test]
    fn branched_flow_sums_upstream_reaches() {
        let mut model = Model::new("River");
        let reaches = model.register_branched_index_set("Reach").expect("index set");
        let group = model
            .register_parameter_group("Reach parameters", Some(reaches))
            .expect("group");
        let local = model
            .register_parameter_double(group, "Local", None, 0.0, 0.0, 100.0)
            .expect("parameter");
        let flow = model.register_equation("Flow", None).expect("equation");
        model
            .set_equation_body(flow, move |ctx: &mut dyn EquationContext| {
                let mut upstream = 0.0;
                for n in 0..ctx.branch_input_count(reaches) {
                    let input = ctx.branch_input(reaches, n);
                    upstream += ctx.result_at(flow, &[input]);
                }
                upstream + ctx.parameter_f64(local)
            })
            .expect("body");
        let model = finalize(model);

        let mut data = generate_data_set(&model).expect("dataset");
        data.set_branch_indexes("Reach", &[("R1", &[]), ("R2", &["R1"])])
            .expect("branch indexes");
        set_timesteps(&mut data, 2);
        data.set_parameter_double("Local", &["R1"], 5.0).expect("parameter");
        data.set_parameter_double("Local", &["R2"], 3.0).expect("parameter");
        run_model_with(&mut data, RunSettings::new().with_bounds_check(true), &mut NoProfiler)
            .expect("run");
        assert_eq!(data.get_result_series("Flow", &["R1"]).expect("series"), vec![5.0, 5.0]);
        assert_eq!(data.get_result_series("Flow", &["R2"]).expect("series"), vec![8.0, 8.0]);
    }

    #[test]
    fn cumulative_equations_sum_over_an_index_set() {
        let mut model = Model::new("Landscape");
        let land = model.register_index_set("Landscape units").expect("index set");
        let group = model.register_parameter_group("Land", Some(land)).expect("group");
        let area = model
            .register_parameter_double(group, "Area", None, 1.0, 0.0, 100.0)
            .expect("parameter");
        let runoff = model.register_equation("Runoff", None).expect("equation");
        model
            .set_equation_body(runoff, move |ctx: &mut dyn EquationContext| {
                2.0 * ctx.parameter_f64(area)
            })
            .expect("body");
        let total = model
            .register_equation_cumulative("Total runoff", runoff, land, None)
            .expect("cumulative");
        model
            .register_equation_cumulative("Mean runoff", runoff, land, Some(area))
            .expect("cumulative");
        let doubled = model.register_equation("Doubled total", None).expect("equation");
        model
            .set_equation_body(doubled, move |ctx: &mut dyn EquationContext| {
                2.0 * ctx.result(total)
            })
            .expect("body");
        let model = finalize(model);

        let mut data = generate_data_set(&model).expect("dataset");
        data.set_indexes("Landscape units", &["Forest", "Field"]).expect("indexes");
        set_timesteps(&mut data, 1);
        data.set_parameter_double("Area", &["Forest"], 1.0).expect("parameter");
        data.set_parameter_double("Area", &["Field"], 3.0).expect("parameter");
        run_model(&mut data).expect("run");

        assert_eq!(data.get_result_series("Total runoff", &[]).expect("series"), vec![8.0]);
        // (2 * 1 + 6 * 3) / (1 + 3)
        assert_eq!(data.get_result_series("Mean runoff", &[]).expect("series"), vec![5.0]);
        assert_eq!(data.get_result_series("Doubled total", &[]).expect("series"), vec![16.0]);
        assert_eq!(
            data.cumulate_result("Runoff", "Landscape units", &[], None).expect("sum"),
            vec![8.0]
        );
    }

    #[test]
    fn earlier_results_reach_back_to_the_initial_value() {
        let mut model = Model::new("History");
        let counter = model.register_equation("Counter", None).expect("equation");
        model
            .set_equation_body(counter, |ctx: &mut dyn EquationContext| ctx.timestep() as f64 + 1.0)
            .expect("body");
        model.set_initial_value_constant(counter, -1.0).expect("initial value");
        let delayed = model.register_equation("Delayed", None).expect("equation");
        model
            .set_equation_body(delayed, move |ctx: &mut dyn EquationContext| {
                ctx.earlier_result(counter, 2)
            })
            .expect("body");
        let model = finalize(model);

        let mut data = generate_data_set(&model).expect("dataset");
        set_timesteps(&mut data, 4);
        run_model(&mut data).expect("run");
        assert_eq!(
            data.get_result_series("Counter", &[]).expect("series"),
            vec![1.0, 2.0, 3.0, 4.0]
        );
        assert_eq!(
            data.get_result_series("Delayed", &[]).expect("series"),
            vec![-1.0, -1.0, 1.0, 2.0]
        );
    }

    #[test]
    fn computed_parameters_are_evaluated_before_the_run() {
        let mut model = Model::new("Lakes");
        let lakes = model.register_index_set("Lakes").expect("index set");
        let unit = model.register_unit("m").expect("unit");
        let group = model.register_parameter_group("Lake", Some(lakes)).expect("group");
        let depth = model
            .register_parameter_double(group, "Depth", Some(unit), 2.0, 0.0, 100.0)
            .expect("parameter");
        let level = model
            .register_parameter_double(group, "Level", Some(unit), 0.0, 0.0, 100.0)
            .expect("parameter");
        let compute = model
            .register_equation_initial_value("Level computation", Some(unit))
            .expect("equation");
        model
            .set_equation_body(compute, move |ctx: &mut dyn EquationContext| {
                10.0 + ctx.parameter_f64(depth)
            })
            .expect("body");
        model.parameter_is_computed_by(level, compute, false).expect("computed");
        let reported = model.register_equation("Reported level", Some(unit)).expect("equation");
        model
            .set_equation_body(reported, move |ctx: &mut dyn EquationContext| {
                ctx.parameter_f64(level)
            })
            .expect("body");
        let model = finalize(model);

        let mut data = generate_data_set(&model).expect("dataset");
        data.set_indexes("Lakes", &["Deep", "Shallow"]).expect("indexes");
        set_timesteps(&mut data, 1);
        data.set_parameter_double("Depth", &["Deep"], 30.0).expect("parameter");
        run_model(&mut data).expect("run");
        assert_eq!(data.get_parameter_double("Level", &["Deep"]).expect("parameter"), 40.0);
        assert_eq!(
            data.get_result_series("Reported level", &["Shallow"]).expect("series"),
            vec![12.0]
        );
    }

    #[test]
    fn disabled_batches_keep_zero_results() {
        let mut model = Model::new("Switches");
        let group = model.register_parameter_group("Options", None).expect("group");
        let snow = model.register_parameter_bool(group, "Simulate snow", false).expect("bool");
        let enabled = model
            .register_conditional("Snow enabled", snow, ParameterValue::Bool(true))
            .expect("conditional");
        let melt = model.register_equation("Melt", None).expect("equation");
        model
            .set_equation_body(melt, |_: &mut dyn EquationContext| 4.0)
            .expect("body");
        model.set_equation_conditional(melt, enabled).expect("conditional");
        let model = finalize(model);

        let mut data = generate_data_set(&model).expect("dataset");
        set_timesteps(&mut data, 2);
        run_model(&mut data).expect("run");
        assert_eq!(data.get_result_series("Melt", &[]).expect("series"), vec![0.0, 0.0]);

        data.set_parameter_bool("Simulate snow", &[], true).expect("parameter");
        run_model(&mut data).expect("run");
        assert_eq!(data.get_result_series("Melt", &[]).expect("series"), vec![4.0, 4.0]);
    }

    #[test]
    fn nan_results_are_reported_with_their_inputs() {
        let mut model = Model::new("Broken");
        let group = model.register_parameter_group("Soil", None).expect("group");
        let porosity = model
            .register_parameter_double(group, "Porosity", None, 0.0, 0.0, 1.0)
            .expect("parameter");
        let rain = model.register_input("Rain", None).expect("input");
        let ratio = model.register_equation("Ratio", None).expect("equation");
        model
            .set_equation_body(ratio, move |ctx: &mut dyn EquationContext| {
                ctx.input(rain) / ctx.parameter_f64(porosity)
            })
            .expect("body");
        let model = finalize(model);

        let mut data = generate_data_set(&model).expect("dataset");
        set_timesteps(&mut data, 2);
        let settings = RunSettings::new().with_nan_test(true);
        let result = run_model_with(&mut data, settings, &mut NoProfiler);
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(matches!(
            err.downcast_ref::<MobiusError>(),
            Some(MobiusError::NonFiniteResult { timestep: 0, .. })
        ));
        assert!(message.contains("Value of \"Porosity\" is 0"), "{message}");
        assert!(message.contains("\"Rain\" is 0 (Not provided in dataset)"), "{message}");
        assert!(!data.has_been_run());

        run_model(&mut data).expect("without the test NaN is stored");
        assert!(data.get_result_series("Ratio", &[]).expect("series")[0].is_nan());
    }

    #[test]
    fn explicit_indexes_are_bounds_checked() {
        let mut model = Model::new("Bounds");
        let reaches = model.register_index_set("Reaches").expect("index set");
        let group = model.register_parameter_group("Reach", Some(reaches)).expect("group");
        let area = model
            .register_parameter_double(group, "Area", None, 1.0, 0.0, 10.0)
            .expect("parameter");
        let probe = model.register_equation("Probe", None).expect("equation");
        model
            .set_equation_body(probe, move |ctx: &mut dyn EquationContext| {
                ctx.parameter_f64_at(area, &[Index::new(reaches, 5)])
            })
            .expect("body");
        let model = finalize(model);

        let mut data = generate_data_set(&model).expect("dataset");
        data.set_indexes("Reaches", &["Upper", "Lower"]).expect("indexes");
        set_timesteps(&mut data, 1);
        assert_err_contains(
            run_model_with(&mut data, RunSettings::new().with_bounds_check(true), &mut NoProfiler),
            "got index 5, count was 2",
        );
    }

    #[test]
    fn input_alignment_is_checked() {
        let mut data = accumulation_data();
        data.set_parameter_time(START_DATE, &[], "2000-01-01").expect("start");
        data.set_input_start_date("2000-01-02").expect("input start");
        assert_err_contains(run_model(&mut data), "after the model run starts");

        let mut data = accumulation_data();
        set_timesteps(&mut data, 4);
        assert_err_contains(run_model(&mut data), "but the model runs for 4 timesteps");

        let mut model =
            Model::with_timestep_size("Monthly", crate::datetime::TimestepSize::months(1));
        let eq = model.register_equation("Constant", None).expect("equation");
        model
            .set_equation_body(eq, |_: &mut dyn EquationContext| 1.0)
            .expect("body");
        let model = finalize(model);
        let mut data = generate_data_set(&model).expect("dataset");
        data.set_parameter_time(START_DATE, &[], "2000-01-15").expect("start");
        assert_err_contains(run_model(&mut data), "first day of a month");
    }

    #[test]
    fn inputs_can_start_before_the_model() {
        let mut data = accumulation_data();
        let mut fresh = generate_data_set(data.model()).expect("dataset");
        fresh.set_indexes("Boxes", &["X", "Y"]).expect("indexes");
        set_timesteps(&mut fresh, 2);
        fresh.set_parameter_time(START_DATE, &[], "2000-01-03").expect("start");
        fresh.set_input_start_date("2000-01-01").expect("input start");
        fresh.allocate_inputs(4).expect("inputs");
        for name in ["X", "Y"] {
            fresh
                .set_input_series("In", &[name], &[100.0, 100.0, 1.0, 2.0], false)
                .expect("series");
        }
        run_model(&mut fresh).expect("run");
        assert_eq!(fresh.get_result_series("V", &["X"]).expect("series"), vec![1.0, 3.0]);

        run_model(&mut data).expect("run");
        assert_eq!(data.start_date_last_run(), data.start_date().expect("start"));
    }

    #[test]
    fn profiler_counts_every_evaluation() {
        let mut data = accumulation_data();
        let mut profiler = CountingProfiler::default();
        run_model_with(&mut data, RunSettings::default(), &mut profiler).expect("run");
        let volume = data.model().equations().handle_of("V").expect("equation");
        assert_eq!(profiler.evaluations_of(volume), 3 * 2);
        assert_eq!(profiler.timesteps, 3);
    }

    fn switched_solver_model() -> Arc<Model> {
        let mut model = Model::new("Switched solver");
        let group = model.register_parameter_group("Solver", None).expect("group");
        let step = model
            .register_parameter_double(group, "Solver step", None, 0.25, 0.0, 1.0)
            .expect("parameter");
        let active = model.register_parameter_bool(group, "Use solver", false).expect("bool");
        let on = model
            .register_conditional("Solver on", active, ParameterValue::Bool(true))
            .expect("conditional");
        let solver = model
            .register_solver_with_parameter("Flux solver", step, Euler)
            .expect("solver");
        model.set_solver_conditional(solver, on).expect("conditional");

        let flux = model.register_input("Flux", None).expect("input");
        let daily = model.register_equation_ode("Daily total", None).expect("equation");
        model
            .set_equation_body(daily, move |ctx: &mut dyn EquationContext| ctx.input(flux))
            .expect("body");
        model.set_solver(daily, solver).expect("solver");
        model.reset_every_timestep(daily).expect("reset");
        finalize(model)
    }

    #[test]
    fn solver_step_and_switch_are_read_from_parameters() {
        let model = switched_solver_model();
        let mut data = generate_data_set(&model).expect("dataset");
        set_timesteps(&mut data, 3);
        data.set_input_series("Flux", &[], &[1.0, 2.0, 3.0], false)
            .expect("series");

        run_model(&mut data).expect("run");
        assert_eq!(
            data.get_result_series("Daily total", &[]).expect("series"),
            vec![0.0, 0.0, 0.0]
        );

        data.set_parameter_bool("Use solver", &[], true).expect("parameter");
        run_model(&mut data).expect("run");
        let totals = data.get_result_series("Daily total", &[]).expect("series");
        for (total, expected) in totals.iter().zip([1.0, 2.0, 3.0]) {
            assert!((total - expected).abs() < 1e-12, "expected {expected}, got {total}");
        }

        data.set_parameter_double("Solver step", &[], 0.0).expect("parameter");
        assert_err_contains(run_model(&mut data), "\"Flux solver\" was given a step");
    }

    #[test]
    fn end_date_sets_the_run_length_and_parameters_seed_initial_values() {
        let mut model = Model::new("Dated");
        model.register_end_date("1970-01-05").expect("end date");
        let group = model.register_parameter_group("Storage", None).expect("group");
        let initial = model
            .register_parameter_double(group, "Initial storage", None, 7.0, 0.0, 100.0)
            .expect("parameter");
        let storage = model.register_equation("Storage", None).expect("equation");
        model
            .set_equation_body(storage, move |ctx: &mut dyn EquationContext| {
                ctx.last_result(storage) + 1.0
            })
            .expect("body");
        model.set_initial_value_parameter(storage, initial).expect("initial value");
        let model = finalize(model);

        let mut data = generate_data_set(&model).expect("dataset");
        data.set_parameter_time(START_DATE, &[], "2000-01-01").expect("start");
        data.set_parameter_time("End date", &[], "2000-01-10").expect("end");
        assert_eq!(data.timesteps().expect("timesteps"), 10);

        run_model(&mut data).expect("run");
        let expected: Vec<f64> = (8..18).map(f64::from).collect();
        assert_eq!(data.get_result_series("Storage", &[]).expect("series"), expected);
        assert_eq!(data.get_initial_value("Storage", &[]).expect("initial"), 7.0);

        data.set_parameter_time("End date", &[], "1999-12-31").expect("end");
        assert_err_contains(run_model(&mut data), "is before the start date");
    }

    #[test]
    fn tolerances_are_stored_on_the_solver() {
        let mut model = Model::new("Tolerant");
        let solver = model.register_solver("Adaptive", 0.5, CashKarp54).expect("solver");
        model.set_solver_tolerances(solver, 1e-6, 1e-9).expect("tolerances");
        let spec = model.solvers().spec(solver);
        assert_eq!((spec.rel_err, spec.abs_err), (1e-6, 1e-9));
    }

    #[test]
    fn solver_fluxes_keep_the_last_evaluated_value() {
        let mut model = Model::new("Drain");
        let solver = model.register_solver("Drain solver", 1.0, Euler).expect("solver");
        let volume = model.register_equation_ode("Volume", None).expect("equation");
        let flux = model.register_equation("Flux", None).expect("equation");
        model
            .set_equation_body(flux, move |ctx: &mut dyn EquationContext| 0.5 * ctx.result(volume))
            .expect("body");
        model
            .set_equation_body(volume, move |ctx: &mut dyn EquationContext| -ctx.result(flux))
            .expect("body");
        model.set_solver(volume, solver).expect("solver");
        model.set_solver(flux, solver).expect("solver");
        model.set_initial_value_constant(volume, 100.0).expect("initial value");
        let model = finalize(model);

        let mut data = generate_data_set(&model).expect("dataset");
        set_timesteps(&mut data, 1);
        run_model(&mut data).expect("run");
        // One Euler step evaluates the batch once, at the start of the step.
        assert_eq!(data.get_result_series("Volume", &[]).expect("series"), vec![50.0]);
        assert_eq!(data.get_result_series("Flux", &[]).expect("series"), vec![50.0]);
    }

    #[test]
    fn ode_without_initial_value_is_evaluated_only_when_needed() {
        let mut model = Model::new("Seeded");
        let solver = model.register_solver("Store solver", 1.0, Euler).expect("solver");
        let store = model.register_equation_ode("Store", None).expect("equation");
        let shadow = model.register_equation_ode("Shadow", None).expect("equation");
        let counter = model.register_equation_ode("Counter", None).expect("equation");
        model
            .set_equation_body(store, |_: &mut dyn EquationContext| 3.0)
            .expect("body");
        model
            .set_equation_body(shadow, |_: &mut dyn EquationContext| 0.0)
            .expect("body");
        model
            .set_equation_body(counter, |_: &mut dyn EquationContext| 1.0)
            .expect("body");
        let shadow_start = model
            .register_equation_initial_value("Shadow start", None)
            .expect("equation");
        model
            .set_equation_body(shadow_start, move |ctx: &mut dyn EquationContext| ctx.result(store))
            .expect("body");
        model.set_initial_value_equation(shadow, shadow_start).expect("initial value");
        for equation in [store, shadow, counter] {
            model.set_solver(equation, solver).expect("solver");
        }
        let model = finalize(model);

        let mut data = generate_data_set(&model).expect("dataset");
        set_timesteps(&mut data, 1);
        run_model(&mut data).expect("run");
        // "Store" is its own initial value equation because "Shadow start" reads it.
        assert_eq!(data.get_initial_value("Store", &[]).expect("initial"), 3.0);
        assert_eq!(data.get_initial_value("Shadow", &[]).expect("initial"), 3.0);
        assert_eq!(data.get_initial_value("Counter", &[]).expect("initial"), 0.0);
        assert_eq!(data.get_result_series("Store", &[]).expect("series"), vec![6.0]);
        assert_eq!(data.get_result_series("Shadow", &[]).expect("series"), vec![3.0]);
        assert_eq!(data.get_result_series("Counter", &[]).expect("series"), vec![1.0]);
    }
}
