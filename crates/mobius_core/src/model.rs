//! Model definition: entity registration and the finalisation entry point.

use crate::datetime::{parse_date, TimestepSize};
use crate::error::MobiusError;
use crate::handles::{
    ConditionalId, EquationId, GroupId, IndexSetId, InputId, ModuleId,
    ParameterId, Registry, SolverId, UnitId,
};
use crate::scheduler::{self, BatchGroup, EquationBatch};
use crate::traits::{EquationContext, EquationFn, OdeSolver};
use crate::tracer;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

// --- Parameter values ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterType {
    Double,
    UInt,
    Bool,
    Time,
    Enum,
}

impl ParameterType {
    pub fn name(self) -> &'static str {
        match self {
            ParameterType::Double => "double",
            ParameterType::UInt => "uint",
            ParameterType::Bool => "bool",
            ParameterType::Time => "time",
            ParameterType::Enum => "enum",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Double(f64),
    UInt(u64),
    Bool(bool),
    /// Seconds since 1970-01-01.
    Time(i64),
    /// Position in the parameter's list of names.
    Enum(u64),
}

impl Default for ParameterValue {
    fn default() -> Self {
        ParameterValue::Double(0.0)
    }
}

impl ParameterValue {
    pub fn ty(&self) -> ParameterType {
        match self {
            ParameterValue::Double(_) => ParameterType::Double,
            ParameterValue::UInt(_) => ParameterType::UInt,
            ParameterValue::Bool(_) => ParameterType::Bool,
            ParameterValue::Time(_) => ParameterType::Time,
            ParameterValue::Enum(_) => ParameterType::Enum,
        }
    }

    pub fn zero(ty: ParameterType) -> Self {
        match ty {
            ParameterType::Double => ParameterValue::Double(0.0),
            ParameterType::UInt => ParameterValue::UInt(0),
            ParameterType::Bool => ParameterValue::Bool(false),
            ParameterType::Time => ParameterValue::Time(0),
            ParameterType::Enum => ParameterValue::Enum(0),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            ParameterValue::Double(v) => v,
            ParameterValue::UInt(v) | ParameterValue::Enum(v) => v as f64,
            ParameterValue::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
            ParameterValue::Time(v) => v as f64,
        }
    }

    pub fn as_u64(&self) -> u64 {
        match *self {
            ParameterValue::Double(v) => v as u64,
            ParameterValue::UInt(v) | ParameterValue::Enum(v) => v,
            ParameterValue::Bool(v) => v as u64,
            ParameterValue::Time(v) => v as u64,
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            ParameterValue::Bool(v) => v,
            other => other.as_u64() != 0,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match *self {
            ParameterValue::Time(v) => v,
            ParameterValue::Double(v) => v as i64,
            other => other.as_u64() as i64,
        }
    }
}

// --- Entity specs ---

#[derive(Debug, Clone, Default)]
pub struct UnitSpec {
    pub module: Option<ModuleId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexSetKind {
    Basic,
    Branched,
}

#[derive(Debug, Clone)]
pub struct IndexSetSpec {
    pub kind: IndexSetKind,
    /// Datasets must list these index names first, in this order.
    pub required_indexes: Vec<String>,
    pub module: Option<ModuleId>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupSpec {
    pub parent: Option<GroupId>,
    pub index_set: Option<IndexSetId>,
    pub parameters: Vec<ParameterId>,
    pub module: Option<ModuleId>,
}

#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub ty: ParameterType,
    pub default: ParameterValue,
    pub min: ParameterValue,
    pub max: ParameterValue,
    pub unit: Option<UnitId>,
    pub description: Option<String>,
    pub group: GroupId,
    /// Outermost group's index set first. Filled in by `end_model_definition`.
    pub index_sets: Vec<IndexSetId>,
    pub is_computed_by: Option<EquationId>,
    pub expose: bool,
    pub enum_names: Vec<String>,
    pub module: Option<ModuleId>,
}

impl ParameterSpec {
    pub fn enum_value(&self, name: &str) -> Option<u64> {
        self.enum_names
            .iter()
            .position(|n| n == name)
            .map(|pos| pos as u64)
    }
}

#[derive(Debug, Clone)]
pub struct InputSpec {
    pub unit: Option<UnitId>,
    pub index_sets: Vec<IndexSetId>,
    /// Declared by the user of a dataset rather than by the model.
    pub is_additional: bool,
    /// Missing values read as NaN instead of 0.
    pub clear_to_nan: bool,
    pub module: Option<ModuleId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquationKind {
    Basic,
    Ode,
    InitialValue,
    Cumulative,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitialValueSource {
    Parameter(ParameterId),
    Constant(f64),
    Equation(EquationId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cumulation {
    pub equation: EquationId,
    pub over: IndexSetId,
    pub weight: Option<ParameterId>,
}

#[derive(Clone)]
pub struct EquationBody(pub(crate) Arc<EquationFn>);

impl std::fmt::Debug for EquationBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EquationBody")
    }
}

/// What an equation was found to depend on during finalisation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EquationDependencies {
    pub index_sets: BTreeSet<IndexSetId>,
    /// Parameters read without explicit indexes.
    pub parameters: BTreeSet<ParameterId>,
    pub inputs: BTreeSet<InputId>,
    pub direct_results: BTreeSet<EquationId>,
    pub direct_last_results: BTreeSet<EquationId>,
    pub cross_results: BTreeSet<EquationId>,
    pub cross_last_results: BTreeSet<EquationId>,
}

#[derive(Debug, Clone)]
pub struct EquationSpec {
    pub kind: EquationKind,
    pub unit: Option<UnitId>,
    pub solver: Option<SolverId>,
    pub conditional: Option<ConditionalId>,
    pub initial_value: Option<InitialValueSource>,
    pub reset_every_timestep: bool,
    pub cumulation: Option<Cumulation>,
    /// Set on initial value equations that compute a parameter.
    pub computes_parameter: Option<ParameterId>,
    pub dependencies: EquationDependencies,
    pub module: Option<ModuleId>,
    pub(crate) body: Option<EquationBody>,
}

impl EquationSpec {
    fn new(kind: EquationKind, unit: Option<UnitId>, module: Option<ModuleId>) -> Self {
        Self {
            kind,
            unit,
            solver: None,
            conditional: None,
            initial_value: None,
            reset_every_timestep: false,
            cumulation: None,
            computes_parameter: None,
            dependencies: EquationDependencies::default(),
            module,
            body: None,
        }
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SolverSpec {
    pub h: f64,
    pub h_parameter: Option<ParameterId>,
    pub rel_err: f64,
    pub abs_err: f64,
    pub method: Arc<dyn OdeSolver>,
    pub conditional: Option<ConditionalId>,
    pub module: Option<ModuleId>,
}

#[derive(Debug, Clone, Copy)]
pub struct ConditionalSpec {
    pub switch: ParameterId,
    /// Bool switches compare as 0/1, enum switches by position.
    pub value: u64,
}

#[derive(Debug, Clone)]
pub struct ModuleSpec {
    pub version: String,
}

// --- Model ---

pub const SYSTEM_GROUP: &str = "System";
pub const START_DATE: &str = "Start date";
pub const END_DATE: &str = "End date";
pub const TIMESTEPS: &str = "Timesteps";

/// A model schema. Built with the `register_*` methods, then frozen by
/// [`Model::end_model_definition`], after which it is shared read-only by datasets.
#[derive(Debug)]
pub struct Model {
    name: String,
    timestep_size: TimestepSize,
    finalized: bool,
    current_module: Option<ModuleId>,
    pub(crate) units: Registry<UnitId, UnitSpec>,
    pub(crate) index_sets: Registry<IndexSetId, IndexSetSpec>,
    pub(crate) groups: Registry<GroupId, GroupSpec>,
    pub(crate) parameters: Registry<ParameterId, ParameterSpec>,
    pub(crate) inputs: Registry<InputId, InputSpec>,
    pub(crate) equations: Registry<EquationId, EquationSpec>,
    pub(crate) solvers: Registry<SolverId, SolverSpec>,
    pub(crate) conditionals: Registry<ConditionalId, ConditionalSpec>,
    pub(crate) modules: Registry<ModuleId, ModuleSpec>,
    pub(crate) batches: Vec<EquationBatch>,
    pub(crate) batch_groups: Vec<BatchGroup>,
}

impl Model {
    /// Starts a model definition with a one day timestep.
    pub fn new(name: &str) -> Self {
        Self::with_timestep_size(name, TimestepSize::default())
    }

    pub fn with_timestep_size(name: &str, timestep_size: TimestepSize) -> Self {
        let mut model = Self {
            name: name.to_string(),
            timestep_size,
            finalized: false,
            current_module: None,
            units: Registry::new(),
            index_sets: Registry::new(),
            groups: Registry::new(),
            parameters: Registry::new(),
            inputs: Registry::new(),
            equations: Registry::new(),
            solvers: Registry::new(),
            conditionals: Registry::new(),
            modules: Registry::new(),
            batches: Vec::new(),
            batch_groups: Vec::new(),
        };
        let (system, _) = model.groups.register_with(SYSTEM_GROUP, GroupSpec::default);
        model.add_parameter(
            system,
            START_DATE,
            None,
            ParameterValue::Time(0),
            ParameterValue::Time(i64::MIN),
            ParameterValue::Time(i64::MAX),
        );
        model.add_parameter(
            system,
            TIMESTEPS,
            None,
            ParameterValue::UInt(100),
            ParameterValue::UInt(0),
            ParameterValue::UInt(u64::MAX),
        );
        model
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestep_size(&self) -> TimestepSize {
        self.timestep_size
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.finalized {
            return Err(MobiusError::AlreadyFinalized {
                operation: operation.to_string(),
            }
            .into());
        }
        Ok(())
    }

    // --- Read access ---

    pub fn units(&self) -> &Registry<UnitId, UnitSpec> {
        &self.units
    }

    pub fn index_sets(&self) -> &Registry<IndexSetId, IndexSetSpec> {
        &self.index_sets
    }

    pub fn groups(&self) -> &Registry<GroupId, GroupSpec> {
        &self.groups
    }

    pub fn parameters(&self) -> &Registry<ParameterId, ParameterSpec> {
        &self.parameters
    }

    pub fn inputs(&self) -> &Registry<InputId, InputSpec> {
        &self.inputs
    }

    pub fn equations(&self) -> &Registry<EquationId, EquationSpec> {
        &self.equations
    }

    pub fn solvers(&self) -> &Registry<SolverId, SolverSpec> {
        &self.solvers
    }

    pub fn conditionals(&self) -> &Registry<ConditionalId, ConditionalSpec> {
        &self.conditionals
    }

    pub fn modules(&self) -> &Registry<ModuleId, ModuleSpec> {
        &self.modules
    }

    pub fn batches(&self) -> &[EquationBatch] {
        &self.batches
    }

    pub fn batch_groups(&self) -> &[BatchGroup] {
        &self.batch_groups
    }

    // --- Modules ---

    pub fn begin_module(&mut self, name: &str, version: &str) -> Result<ModuleId> {
        self.ensure_open("begin_module")?;
        let (module, _) = self.modules.register_with(name, || ModuleSpec {
            version: version.to_string(),
        });
        self.current_module = Some(module);
        Ok(module)
    }

    pub fn end_module(&mut self) {
        self.current_module = None;
    }

    // --- Units and index sets ---

    pub fn register_unit(&mut self, name: &str) -> Result<UnitId> {
        self.ensure_open("register_unit")?;
        let module = self.current_module;
        Ok(self.units.register_with(name, || UnitSpec { module }).0)
    }

    pub fn register_index_set(&mut self, name: &str) -> Result<IndexSetId> {
        self.add_index_set(name, IndexSetKind::Basic)
    }

    pub fn register_branched_index_set(&mut self, name: &str) -> Result<IndexSetId> {
        self.add_index_set(name, IndexSetKind::Branched)
    }

    fn add_index_set(&mut self, name: &str, kind: IndexSetKind) -> Result<IndexSetId> {
        self.ensure_open("register_index_set")?;
        let module = self.current_module;
        let (handle, created) = self.index_sets.register_with(name, || IndexSetSpec {
            kind,
            required_indexes: Vec::new(),
            module,
        });
        if !created && self.index_sets.spec(handle).kind != kind {
            bail!(
                "The index set \"{}\" was registered again with a different kind.",
                name
            );
        }
        Ok(handle)
    }

    /// Requires datasets to start the index list of `index_set` with `names`.
    pub fn require_indexes(&mut self, index_set: IndexSetId, names: &[&str]) -> Result<()> {
        self.ensure_open("require_indexes")?;
        let spec = self.index_sets.spec_mut(index_set);
        for name in names {
            if !spec.required_indexes.iter().any(|n| n == name) {
                spec.required_indexes.push(name.to_string());
            }
        }
        Ok(())
    }

    // --- Parameters ---

    pub fn register_parameter_group(
        &mut self,
        name: &str,
        index_set: Option<IndexSetId>,
    ) -> Result<GroupId> {
        self.ensure_open("register_parameter_group")?;
        let module = self.current_module;
        let (group, _) = self.groups.register_with(name, || GroupSpec {
            parent: None,
            index_set,
            parameters: Vec::new(),
            module,
        });
        Ok(group)
    }

    pub fn set_group_index_set(&mut self, group: GroupId, index_set: IndexSetId) -> Result<()> {
        self.ensure_open("set_group_index_set")?;
        if let Some(existing) = self.groups.spec(group).index_set {
            if existing != index_set {
                bail!(
                    "The parameter group \"{}\" is already indexed by \"{}\".",
                    self.groups.name(group),
                    self.index_sets.name(existing)
                );
            }
        }
        self.groups.spec_mut(group).index_set = Some(index_set);
        Ok(())
    }

    pub fn set_parent_group(&mut self, child: GroupId, parent: GroupId) -> Result<()> {
        self.ensure_open("set_parent_group")?;
        let mut walk = Some(parent);
        while let Some(group) = walk {
            if group == child {
                bail!(
                    "Making \"{}\" the parent group of \"{}\" would create a cycle of parameter groups.",
                    self.groups.name(parent),
                    self.groups.name(child)
                );
            }
            walk = self.groups.spec(group).parent;
        }
        self.groups.spec_mut(child).parent = Some(parent);
        Ok(())
    }

    fn add_parameter(
        &mut self,
        group: GroupId,
        name: &str,
        unit: Option<UnitId>,
        default: ParameterValue,
        min: ParameterValue,
        max: ParameterValue,
    ) -> ParameterId {
        let module = self.current_module;
        let (parameter, created) = self.parameters.register_with(name, || ParameterSpec {
            ty: default.ty(),
            default,
            min,
            max,
            unit,
            description: None,
            group,
            index_sets: Vec::new(),
            is_computed_by: None,
            expose: true,
            enum_names: Vec::new(),
            module,
        });
        if created {
            self.groups.spec_mut(group).parameters.push(parameter);
        }
        parameter
    }

    fn check_parameter_reregistration(
        &self,
        parameter: ParameterId,
        ty: ParameterType,
    ) -> Result<()> {
        let existing = self.parameters.spec(parameter).ty;
        if existing != ty {
            bail!(
                "The parameter \"{}\" was already registered with type {}, tried again with type {}.",
                self.parameters.name(parameter),
                existing.name(),
                ty.name()
            );
        }
        Ok(())
    }

    pub fn register_parameter_double(
        &mut self,
        group: GroupId,
        name: &str,
        unit: Option<UnitId>,
        default: f64,
        min: f64,
        max: f64,
    ) -> Result<ParameterId> {
        self.ensure_open("register_parameter_double")?;
        if min > max || default < min || default > max {
            warn!(parameter = name, "default value is outside [min, max]");
        }
        let parameter = self.add_parameter(
            group,
            name,
            unit,
            ParameterValue::Double(default),
            ParameterValue::Double(min),
            ParameterValue::Double(max),
        );
        self.check_parameter_reregistration(parameter, ParameterType::Double)?;
        Ok(parameter)
    }

    pub fn register_parameter_uint(
        &mut self,
        group: GroupId,
        name: &str,
        unit: Option<UnitId>,
        default: u64,
        min: u64,
        max: u64,
    ) -> Result<ParameterId> {
        self.ensure_open("register_parameter_uint")?;
        let parameter = self.add_parameter(
            group,
            name,
            unit,
            ParameterValue::UInt(default),
            ParameterValue::UInt(min),
            ParameterValue::UInt(max),
        );
        self.check_parameter_reregistration(parameter, ParameterType::UInt)?;
        Ok(parameter)
    }

    pub fn register_parameter_bool(
        &mut self,
        group: GroupId,
        name: &str,
        default: bool,
    ) -> Result<ParameterId> {
        self.ensure_open("register_parameter_bool")?;
        let parameter = self.add_parameter(
            group,
            name,
            None,
            ParameterValue::Bool(default),
            ParameterValue::Bool(false),
            ParameterValue::Bool(true),
        );
        self.check_parameter_reregistration(parameter, ParameterType::Bool)?;
        Ok(parameter)
    }

    /// `default` is a date on the form `yyyy-mm-dd`.
    pub fn register_parameter_time(
        &mut self,
        group: GroupId,
        name: &str,
        default: &str,
    ) -> Result<ParameterId> {
        self.ensure_open("register_parameter_time")?;
        let seconds = parse_date(default)?;
        let parameter = self.add_parameter(
            group,
            name,
            None,
            ParameterValue::Time(seconds),
            ParameterValue::Time(i64::MIN),
            ParameterValue::Time(i64::MAX),
        );
        self.check_parameter_reregistration(parameter, ParameterType::Time)?;
        Ok(parameter)
    }

    pub fn register_parameter_enum(
        &mut self,
        group: GroupId,
        name: &str,
        names: &[&str],
        default: &str,
    ) -> Result<ParameterId> {
        self.ensure_open("register_parameter_enum")?;
        let Some(position) = names.iter().position(|n| *n == default) else {
            bail!(
                "The default value \"{}\" of the enum parameter \"{}\" is not one of its values.",
                default,
                name
            );
        };
        let last = names.len() as u64 - 1;
        let parameter = self.add_parameter(
            group,
            name,
            None,
            ParameterValue::Enum(position as u64),
            ParameterValue::Enum(0),
            ParameterValue::Enum(last),
        );
        self.check_parameter_reregistration(parameter, ParameterType::Enum)?;
        self.parameters.spec_mut(parameter).enum_names =
            names.iter().map(|n| n.to_string()).collect();
        Ok(parameter)
    }

    /// Adds the optional "End date" system parameter. When present, the number of timesteps
    /// of a run is computed from "Start date" and "End date" (inclusive).
    pub fn register_end_date(&mut self, default: &str) -> Result<ParameterId> {
        let system = self.groups.handle_of(SYSTEM_GROUP)?;
        self.register_parameter_time(system, END_DATE, default)
    }

    pub fn set_parameter_description(&mut self, parameter: ParameterId, text: &str) -> Result<()> {
        self.ensure_open("set_parameter_description")?;
        self.parameters.spec_mut(parameter).description = Some(text.to_string());
        Ok(())
    }

    // --- Inputs ---

    pub fn register_input(&mut self, name: &str, unit: Option<UnitId>) -> Result<InputId> {
        self.add_input(name, unit, false)
    }

    /// Inputs declared by whoever sets up a dataset rather than by the model itself.
    pub fn register_additional_input(
        &mut self,
        name: &str,
        unit: Option<UnitId>,
    ) -> Result<InputId> {
        self.add_input(name, unit, true)
    }

    fn add_input(
        &mut self,
        name: &str,
        unit: Option<UnitId>,
        is_additional: bool,
    ) -> Result<InputId> {
        self.ensure_open("register_input")?;
        let module = self.current_module;
        let (input, _) = self.inputs.register_with(name, || InputSpec {
            unit,
            index_sets: Vec::new(),
            is_additional,
            clear_to_nan: false,
            module,
        });
        Ok(input)
    }

    pub fn set_input_index_sets(
        &mut self,
        input: InputId,
        index_sets: &[IndexSetId],
    ) -> Result<()> {
        self.ensure_open("set_input_index_sets")?;
        self.inputs.spec_mut(input).index_sets = index_sets.to_vec();
        Ok(())
    }

    /// Values not provided by the dataset read as NaN instead of 0.
    pub fn set_input_clear_to_nan(&mut self, input: InputId) -> Result<()> {
        self.ensure_open("set_input_clear_to_nan")?;
        self.inputs.spec_mut(input).clear_to_nan = true;
        Ok(())
    }

    // --- Equations ---

    pub fn register_equation(&mut self, name: &str, unit: Option<UnitId>) -> Result<EquationId> {
        self.add_equation(name, unit, EquationKind::Basic)
    }

    pub fn register_equation_ode(
        &mut self,
        name: &str,
        unit: Option<UnitId>,
    ) -> Result<EquationId> {
        self.add_equation(name, unit, EquationKind::Ode)
    }

    pub fn register_equation_initial_value(
        &mut self,
        name: &str,
        unit: Option<UnitId>,
    ) -> Result<EquationId> {
        self.add_equation(name, unit, EquationKind::InitialValue)
    }

    fn add_equation(
        &mut self,
        name: &str,
        unit: Option<UnitId>,
        kind: EquationKind,
    ) -> Result<EquationId> {
        self.ensure_open("register_equation")?;
        let module = self.current_module;
        let (equation, created) = self
            .equations
            .register_with(name, || EquationSpec::new(kind, unit, module));
        if !created && self.equations.spec(equation).kind != kind {
            bail!(
                "The equation \"{}\" was registered again with a different type.",
                name
            );
        }
        Ok(equation)
    }

    /// Registers an equation whose value is the sum of `equation` over all indexes of
    /// `over`, optionally weighted by `weight` (sum(v * w) / sum(w)).
    pub fn register_equation_cumulative(
        &mut self,
        name: &str,
        equation: EquationId,
        over: IndexSetId,
        weight: Option<ParameterId>,
    ) -> Result<EquationId> {
        self.ensure_open("register_equation_cumulative")?;
        let target = self.equations.spec(equation);
        if target.kind == EquationKind::InitialValue {
            bail!(
                "The cumulative equation \"{}\" tries to cumulate the initial value equation \"{}\", which is not allowed.",
                name,
                self.equations.name(equation)
            );
        }
        if let Some(weight) = weight {
            if self.parameters.spec(weight).ty != ParameterType::Double {
                bail!(
                    "The weight \"{}\" of the cumulative equation \"{}\" must be a double parameter.",
                    self.parameters.name(weight),
                    name
                );
            }
        }
        let unit = target.unit;
        let handle = self.add_equation(name, unit, EquationKind::Cumulative)?;
        self.equations.spec_mut(handle).cumulation = Some(Cumulation {
            equation,
            over,
            weight,
        });
        Ok(handle)
    }

    pub fn set_equation_body<F>(&mut self, equation: EquationId, body: F) -> Result<()>
    where
        F: Fn(&mut dyn EquationContext) -> f64 + Send + Sync + 'static,
    {
        self.ensure_open("set_equation_body")?;
        let spec = self.equations.spec(equation);
        if spec.kind == EquationKind::Cumulative {
            bail!(
                "The cumulative equation \"{}\" can not have a body.",
                self.equations.name(equation)
            );
        }
        if spec.body.is_some() {
            debug!(equation = %self.equations.name(equation), "replacing equation body");
        }
        self.equations.spec_mut(equation).body = Some(EquationBody(Arc::new(body)));
        Ok(())
    }

    pub fn set_initial_value_parameter(
        &mut self,
        equation: EquationId,
        parameter: ParameterId,
    ) -> Result<()> {
        self.ensure_open("set_initial_value_parameter")?;
        let par = self.parameters.spec(parameter);
        if par.ty != ParameterType::Double {
            bail!(
                "The parameter \"{}\" is used as the initial value of \"{}\" but is not a double parameter.",
                self.parameters.name(parameter),
                self.equations.name(equation)
            );
        }
        self.warn_on_unit_mismatch(equation, par.unit, self.parameters.name(parameter));
        self.equations.spec_mut(equation).initial_value =
            Some(InitialValueSource::Parameter(parameter));
        Ok(())
    }

    pub fn set_initial_value_constant(&mut self, equation: EquationId, value: f64) -> Result<()> {
        self.ensure_open("set_initial_value_constant")?;
        self.equations.spec_mut(equation).initial_value = Some(InitialValueSource::Constant(value));
        Ok(())
    }

    pub fn set_initial_value_equation(
        &mut self,
        equation: EquationId,
        initial: EquationId,
    ) -> Result<()> {
        self.ensure_open("set_initial_value_equation")?;
        let spec = self.equations.spec(initial);
        if spec.kind != EquationKind::InitialValue {
            bail!(
                "The equation \"{}\" is used as an initial value equation for \"{}\", but was not registered as one.",
                self.equations.name(initial),
                self.equations.name(equation)
            );
        }
        self.warn_on_unit_mismatch(equation, spec.unit, self.equations.name(initial));
        self.equations.spec_mut(equation).initial_value =
            Some(InitialValueSource::Equation(initial));
        Ok(())
    }

    fn warn_on_unit_mismatch(&self, equation: EquationId, unit: Option<UnitId>, other: &str) {
        let own = self.equations.spec(equation).unit;
        if own != unit {
            warn!(
                equation = %self.equations.name(equation),
                other,
                "the initial value has a different unit than the equation"
            );
        }
    }

    /// The ODE state of `equation` starts from 0 at every timestep instead of the last value.
    pub fn reset_every_timestep(&mut self, equation: EquationId) -> Result<()> {
        self.ensure_open("reset_every_timestep")?;
        if self.equations.spec(equation).kind != EquationKind::Ode {
            bail!(
                "Tried to reset the equation \"{}\" every timestep, but it is not an ODE equation.",
                self.equations.name(equation)
            );
        }
        self.equations.spec_mut(equation).reset_every_timestep = true;
        Ok(())
    }

    /// The initial value equation `equation` computes `parameter` once before every run.
    pub fn parameter_is_computed_by(
        &mut self,
        parameter: ParameterId,
        equation: EquationId,
        expose: bool,
    ) -> Result<()> {
        self.ensure_open("parameter_is_computed_by")?;
        let eq = self.equations.spec(equation);
        let par = self.parameters.spec(parameter);
        if eq.kind != EquationKind::InitialValue {
            bail!(
                "The parameter \"{}\" is set to be computed by the equation \"{}\", but it is not an initial value equation.",
                self.parameters.name(parameter),
                self.equations.name(equation)
            );
        }
        if !matches!(par.ty, ParameterType::Double | ParameterType::UInt) {
            bail!(
                "The parameter \"{}\" can only be computed if it is a double or uint parameter.",
                self.parameters.name(parameter)
            );
        }
        if eq.unit != par.unit {
            bail!(
                "The parameter \"{}\" and the equation \"{}\" that computes it have different units.",
                self.parameters.name(parameter),
                self.equations.name(equation)
            );
        }
        let spec = self.parameters.spec_mut(parameter);
        spec.is_computed_by = Some(equation);
        spec.expose = expose;
        self.equations.spec_mut(equation).computes_parameter = Some(parameter);
        Ok(())
    }

    // --- Solvers and conditionals ---

    pub fn register_solver(
        &mut self,
        name: &str,
        h: f64,
        method: impl OdeSolver + 'static,
    ) -> Result<SolverId> {
        self.ensure_open("register_solver")?;
        if !(h > 0.0 && h <= 1.0) {
            return Err(MobiusError::InvalidSolverStep {
                solver: name.to_string(),
            }
            .into());
        }
        Ok(self.add_solver(name, h, None, Arc::new(method)))
    }

    /// The step is read from the double parameter `h_parameter` at run time.
    pub fn register_solver_with_parameter(
        &mut self,
        name: &str,
        h_parameter: ParameterId,
        method: impl OdeSolver + 'static,
    ) -> Result<SolverId> {
        self.ensure_open("register_solver")?;
        if self.parameters.spec(h_parameter).ty != ParameterType::Double {
            bail!(
                "The step size parameter \"{}\" of the solver \"{}\" must be a double parameter.",
                self.parameters.name(h_parameter),
                name
            );
        }
        Ok(self.add_solver(name, 0.0, Some(h_parameter), Arc::new(method)))
    }

    fn add_solver(
        &mut self,
        name: &str,
        h: f64,
        h_parameter: Option<ParameterId>,
        method: Arc<dyn OdeSolver>,
    ) -> SolverId {
        let module = self.current_module;
        self.solvers
            .register_with(name, || SolverSpec {
                h,
                h_parameter,
                rel_err: 1e-3,
                abs_err: 1e-6,
                method,
                conditional: None,
                module,
            })
            .0
    }

    pub fn set_solver_tolerances(
        &mut self,
        solver: SolverId,
        rel_err: f64,
        abs_err: f64,
    ) -> Result<()> {
        self.ensure_open("set_solver_tolerances")?;
        if !self.solvers.spec(solver).method.uses_error_control() {
            warn!(
                solver = %self.solvers.name(solver),
                "tolerances were set on a solver that does not use error control"
            );
        }
        let spec = self.solvers.spec_mut(solver);
        spec.rel_err = rel_err;
        spec.abs_err = abs_err;
        Ok(())
    }

    pub fn set_solver(&mut self, equation: EquationId, solver: SolverId) -> Result<()> {
        self.ensure_open("set_solver")?;
        let spec = self.equations.spec(equation);
        if !matches!(spec.kind, EquationKind::Basic | EquationKind::Ode) {
            bail!(
                "Tried to set a solver for the equation \"{}\", which is not a basic or ODE equation.",
                self.equations.name(equation)
            );
        }
        if spec.conditional.is_some() {
            bail!(
                "The equation \"{}\" has a conditional and can not be put on a solver. Put the conditional on the solver \"{}\" instead.",
                self.equations.name(equation),
                self.solvers.name(solver)
            );
        }
        self.equations.spec_mut(equation).solver = Some(solver);
        Ok(())
    }

    /// `value` must have the switch parameter's type; only bool, uint and enum switches
    /// are accepted.
    pub fn register_conditional(
        &mut self,
        name: &str,
        switch: ParameterId,
        value: ParameterValue,
    ) -> Result<ConditionalId> {
        self.ensure_open("register_conditional")?;
        let ty = self.parameters.spec(switch).ty;
        if !matches!(ty, ParameterType::Bool | ParameterType::UInt | ParameterType::Enum) {
            bail!(
                "The conditional \"{}\" uses the parameter \"{}\" as a switch, but only bool, uint and enum parameters can be switches.",
                name,
                self.parameters.name(switch)
            );
        }
        if value.ty() != ty {
            bail!(
                "The conditional \"{}\" compares the {} parameter \"{}\" against a {} value.",
                name,
                ty.name(),
                self.parameters.name(switch),
                value.ty().name()
            );
        }
        let value = value.as_u64();
        Ok(self
            .conditionals
            .register_with(name, || ConditionalSpec { switch, value })
            .0)
    }

    pub fn set_equation_conditional(
        &mut self,
        equation: EquationId,
        conditional: ConditionalId,
    ) -> Result<()> {
        self.ensure_open("set_equation_conditional")?;
        let spec = self.equations.spec(equation);
        if spec.kind == EquationKind::Cumulative || spec.kind == EquationKind::InitialValue {
            bail!(
                "The equation \"{}\" can not be given a conditional since it is a cumulative or initial value equation.",
                self.equations.name(equation)
            );
        }
        if let Some(solver) = spec.solver {
            bail!(
                "The equation \"{}\" is on the solver \"{}\" and can not have its own conditional. Put the conditional on the solver instead.",
                self.equations.name(equation),
                self.solvers.name(solver)
            );
        }
        self.equations.spec_mut(equation).conditional = Some(conditional);
        Ok(())
    }

    pub fn set_solver_conditional(
        &mut self,
        solver: SolverId,
        conditional: ConditionalId,
    ) -> Result<()> {
        self.ensure_open("set_solver_conditional")?;
        self.solvers.spec_mut(solver).conditional = Some(conditional);
        Ok(())
    }

    /// The conditional gating `equation` at run time, directly or through its solver.
    pub fn effective_conditional(&self, equation: EquationId) -> Option<ConditionalId> {
        let spec = self.equations.spec(equation);
        match spec.solver {
            Some(solver) => self.solvers.spec(solver).conditional,
            None => spec.conditional,
        }
    }

    pub(crate) fn equation_body(&self, equation: EquationId) -> Option<&EquationBody> {
        self.equations.spec(equation).body.as_ref()
    }

    // --- Finalisation ---

    /// Traces every equation, resolves index-set dependencies and builds the execution
    /// schedule. The model can not be changed afterwards.
    #[instrument(skip_all, fields(model = %self.name))]
    pub fn end_model_definition(&mut self) -> Result<()> {
        if self.finalized {
            bail!("Called end_model_definition twice on the same model \"{}\".", self.name);
        }
        self.resolve_parameter_index_sets();
        tracer::trace_equations(self)?;
        scheduler::schedule(self)?;
        self.finalized = true;
        info!(
            equations = self.equations.len(),
            batches = self.batches.len(),
            batch_groups = self.batch_groups.len(),
            "model finalized"
        );
        Ok(())
    }

    fn resolve_parameter_index_sets(&mut self) {
        let handles: Vec<ParameterId> = self.parameters.handles().collect();
        for parameter in handles {
            let mut sets = Vec::new();
            let mut group = Some(self.parameters.spec(parameter).group);
            while let Some(g) = group {
                let spec = self.groups.spec(g);
                if let Some(set) = spec.index_set {
                    sets.insert(0, set);
                }
                group = spec.parent;
            }
            self.parameters.spec_mut(parameter).index_sets = sets;
        }
    }

    // --- Printing ---

    /// One line per batch group, batch and equation, in execution order.
    pub fn describe_structure(&self) -> String {
        let mut out = String::new();
        for group in &self.batch_groups {
            if group.index_sets.is_empty() {
                out.push_str("[]");
            }
            for set in &group.index_sets {
                let _ = write!(out, "[{}]", self.index_sets.name(*set));
            }
            out.push('\n');
            for batch in &self.batches[group.first_batch..=group.last_batch] {
                if let Some(conditional) = batch.conditional {
                    let _ = writeln!(out, "\tif \"{}\"", self.conditionals.name(conditional));
                }
                if let Some(solver) = batch.solver {
                    let _ = writeln!(out, "\tsolver \"{}\"", self.solvers.name(solver));
                    for eq in &batch.equations {
                        let _ = writeln!(out, "\t\t\"{}\"", self.equations.name(*eq));
                    }
                    for eq in &batch.equations_ode {
                        let _ = writeln!(out, "\t\t(ODE) \"{}\"", self.equations.name(*eq));
                    }
                } else {
                    for eq in &batch.equations {
                        let _ = writeln!(out, "\t\"{}\"", self.equations.name(*eq));
                    }
                }
            }
        }
        out
    }

    /// The dependencies found for every equation, one block per equation.
    pub fn describe_dependencies(&self) -> String {
        let mut out = String::new();
        for (_, name, spec) in self.equations.iter() {
            let deps = &spec.dependencies;
            let _ = writeln!(out, "\"{}\" ({:?})", name, spec.kind);
            let list = |out: &mut String, label: &str, names: Vec<&str>| {
                if !names.is_empty() {
                    let quoted: Vec<String> = names.iter().map(|n| format!("\"{n}\"")).collect();
                    let _ = writeln!(out, "\t{}: {}", label, quoted.join(", "));
                }
            };
            let equations = |handles: &BTreeSet<EquationId>| -> Vec<&str> {
                handles.iter().map(|h| self.equations.name(*h)).collect()
            };
            list(
                &mut out,
                "index sets",
                deps.index_sets.iter().map(|h| self.index_sets.name(*h)).collect(),
            );
            list(
                &mut out,
                "parameters",
                deps.parameters.iter().map(|h| self.parameters.name(*h)).collect(),
            );
            list(
                &mut out,
                "inputs",
                deps.inputs.iter().map(|h| self.inputs.name(*h)).collect(),
            );
            list(&mut out, "results", equations(&deps.direct_results));
            list(&mut out, "last results", equations(&deps.direct_last_results));
            list(&mut out, "cross-indexed results", equations(&deps.cross_results));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solvers::IncaDascru;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn new_model_registers_system_parameters() {
        let model = Model::new("Test");
        let system = model.groups().handle_of(SYSTEM_GROUP).expect("system group");
        let start = model.parameters().handle_of(START_DATE).expect("start date");
        let steps = model.parameters().handle_of(TIMESTEPS).expect("timesteps");
        assert_eq!(model.parameters().spec(start).ty, ParameterType::Time);
        assert_eq!(model.parameters().spec(steps).default, ParameterValue::UInt(100));
        assert_eq!(model.groups().spec(system).parameters, vec![start, steps]);
    }

    #[test]
    fn registration_is_idempotent_but_type_checked() {
        let mut model = Model::new("Test");
        let group = model.register_parameter_group("Soil", None).expect("group");
        let a = model
            .register_parameter_double(group, "Porosity", None, 0.3, 0.0, 1.0)
            .expect("parameter");
        let b = model
            .register_parameter_double(group, "Porosity", None, 0.3, 0.0, 1.0)
            .expect("parameter");
        assert_eq!(a, b);
        assert_err_contains(
            model.register_parameter_uint(group, "Porosity", None, 1, 0, 2),
            "already registered with type double",
        );
    }

    #[test]
    fn enum_parameters_resolve_names() {
        let mut model = Model::new("Test");
        let group = model.register_parameter_group("Options", None).expect("group");
        let mode = model
            .register_parameter_enum(group, "Mode", &["Off", "Simple", "Full"], "Simple")
            .expect("enum");
        let spec = model.parameters().spec(mode);
        assert_eq!(spec.default, ParameterValue::Enum(1));
        assert_eq!(spec.enum_value("Full"), Some(2));
        assert_err_contains(
            model.register_parameter_enum(group, "Other", &["A"], "B"),
            "not one of its values",
        );
    }

    #[test]
    fn structural_rules_are_enforced_at_registration() {
        let mut model = Model::new("Test");
        let eq = model.register_equation("Flow", None).expect("equation");
        assert_err_contains(model.reset_every_timestep(eq), "not an ODE equation");

        let iv = model.register_equation_initial_value("Flow init", None).expect("iv");
        let set = model.register_index_set("Reaches").expect("index set");
        assert_err_contains(
            model.register_equation_cumulative("Total", iv, set, None),
            "initial value equation",
        );

        let solver = model
            .register_solver("Solver", 0.1, IncaDascru)
            .expect("solver");
        assert_err_contains(model.set_solver(iv, solver), "not a basic or ODE equation");

        let group = model.register_parameter_group("Switches", None).expect("group");
        let switch = model.register_parameter_bool(group, "Enabled", true).expect("bool");
        let cond = model
            .register_conditional("When enabled", switch, ParameterValue::Bool(true))
            .expect("conditional");
        model.set_solver(eq, solver).expect("solver set");
        assert_err_contains(
            model.set_equation_conditional(eq, cond),
            "Put the conditional on the solver",
        );

        assert_err_contains(
            model.register_solver("Too big", 1.5, IncaDascru),
            "not in the range (0,1]",
        );
    }

    #[test]
    fn conditional_values_must_match_switch_type() {
        let mut model = Model::new("Test");
        let group = model.register_parameter_group("Switches", None).expect("group");
        let rate = model
            .register_parameter_double(group, "Rate", None, 1.0, 0.0, 2.0)
            .expect("double");
        let count = model
            .register_parameter_uint(group, "Layers", None, 1, 0, 5)
            .expect("uint");
        assert_err_contains(
            model.register_conditional("Bad", rate, ParameterValue::Double(1.0)),
            "can be switches",
        );
        assert_err_contains(
            model.register_conditional("Mismatch", count, ParameterValue::Bool(true)),
            "against a bool value",
        );
    }

    #[test]
    fn computed_parameters_require_initial_value_equations() {
        let mut model = Model::new("Test");
        let unit = model.register_unit("m").expect("unit");
        let group = model.register_parameter_group("Lake", None).expect("group");
        let depth = model
            .register_parameter_double(group, "Depth", Some(unit), 1.0, 0.0, 100.0)
            .expect("parameter");
        let basic = model.register_equation("Basic", Some(unit)).expect("equation");
        assert_err_contains(
            model.parameter_is_computed_by(depth, basic, false),
            "not an initial value equation",
        );
        let other = model.register_unit("km").expect("unit");
        let iv = model
            .register_equation_initial_value("Depth computation", Some(other))
            .expect("iv");
        assert_err_contains(model.parameter_is_computed_by(depth, iv, false), "different units");
    }

    #[test]
    fn finalized_model_rejects_changes() {
        let mut model = Model::new("Test");
        model.end_model_definition().expect("empty model should finalize");
        assert!(model.is_finalized());
        let err = model.register_unit("mm").expect_err("expected error");
        assert!(matches!(
            err.downcast_ref::<MobiusError>(),
            Some(MobiusError::AlreadyFinalized { .. })
        ));
        assert_err_contains(model.end_model_definition(), "twice");
    }

    #[test]
    fn parent_groups_contribute_index_sets_outermost_first() {
        let mut model = Model::new("Test");
        let reaches = model.register_index_set("Reaches").expect("index set");
        let landscape = model.register_index_set("Landscape units").expect("index set");
        let outer = model.register_parameter_group("Reach", Some(reaches)).expect("group");
        let inner = model
            .register_parameter_group("Land in reach", Some(landscape))
            .expect("group");
        model.set_parent_group(inner, outer).expect("parent");
        assert_err_contains(model.set_parent_group(outer, inner), "cycle");
        let p = model
            .register_parameter_double(inner, "Fraction", None, 0.5, 0.0, 1.0)
            .expect("parameter");
        model.end_model_definition().expect("finalize");
        assert_eq!(model.parameters().spec(p).index_sets, vec![reaches, landscape]);
    }

    #[test]
    fn modules_own_their_entities_and_show_up_in_dumps() {
        let mut model = Model::new("Test");
        let snow = model.begin_module("Snow", "1.2").expect("module");
        let temperature = model.register_input("Air temperature", None).expect("input");
        let melt = model.register_equation("Snow melt", None).expect("equation");
        model
            .set_equation_body(melt, move |ctx: &mut dyn EquationContext| {
                ctx.input(temperature).max(0.0)
            })
            .expect("body");
        model.end_module();
        let extra = model.register_additional_input("Observed melt", None).expect("input");

        let solver = model.register_solver("Soil solver", 0.1, IncaDascru).expect("solver");
        let water = model.register_equation_ode("Soil water", None).expect("equation");
        model
            .set_equation_body(water, move |ctx: &mut dyn EquationContext| ctx.result(melt))
            .expect("body");
        model.set_solver(water, solver).expect("solver");
        model.end_model_definition().expect("finalize");

        assert_eq!(model.modules().spec(snow).version, "1.2");
        assert_eq!(model.equations().spec(melt).module, Some(snow));
        assert_eq!(model.inputs().spec(temperature).module, Some(snow));
        assert_eq!(model.equations().spec(water).module, None);
        assert!(model.inputs().spec(extra).is_additional);

        let structure = model.describe_structure();
        assert!(structure.starts_with("[]\n"));
        assert!(structure.contains("\tsolver \"Soil solver\""));
        assert!(structure.contains("\t\t(ODE) \"Soil water\""));
        let dependencies = model.describe_dependencies();
        assert!(dependencies.contains("\"Snow melt\" (Basic)\n\tinputs: \"Air temperature\""));
        assert!(dependencies.contains("\tresults: \"Snow melt\""));
    }
}
