//! Dependency discovery.
//!
//! Every equation body is called once with a [`TracingContext`] that hands out placeholder
//! values and records which parameters, inputs, results and index sets the body asked for.
//! Index set dependencies are then closed over result dependencies by fixed-point iteration.

use crate::datetime::ExpandedDateTime;
use crate::error::MobiusError;
use crate::handles::{EquationId, Index, IndexSetId, InputId, ParameterId};
use crate::model::{
    EquationDependencies, EquationKind, InitialValueSource, Model, ParameterType, ParameterValue,
};
use crate::traits::EquationContext;
use anyhow::{bail, Result};
use std::collections::BTreeSet;
use tracing::debug;

const MAX_RESOLVE_ITERATIONS: usize = 1000;

/// A result access with explicit indexes, kept until index sets are resolved.
#[derive(Debug, Clone)]
struct IndexedDependency {
    equation: EquationId,
    explicit: Vec<IndexSetId>,
}

#[derive(Debug, Clone, Copy)]
struct ParameterAccess {
    parameter: ParameterId,
    ty: ParameterType,
    explicit: usize,
}

/// Records accesses instead of reading data. Returns zeros everywhere, index 0 for every
/// index lookup and a single branch input.
#[derive(Debug)]
pub struct TracingContext {
    parameters: Vec<ParameterAccess>,
    inputs: BTreeSet<InputId>,
    results: Vec<(EquationId, Vec<IndexSetId>)>,
    last_results: Vec<(EquationId, Vec<IndexSetId>)>,
    index_sets: BTreeSet<IndexSetId>,
    time: ExpandedDateTime,
}

impl TracingContext {
    pub fn new(time: ExpandedDateTime) -> Self {
        Self {
            parameters: Vec::new(),
            inputs: BTreeSet::new(),
            results: Vec::new(),
            last_results: Vec::new(),
            index_sets: BTreeSet::new(),
            time,
        }
    }
}

fn explicit_sets(indexes: &[Index]) -> Vec<IndexSetId> {
    indexes.iter().map(|index| index.index_set).collect()
}

impl EquationContext for TracingContext {
    fn parameter_value(
        &mut self,
        parameter: ParameterId,
        ty: ParameterType,
        indexes: &[Index],
    ) -> ParameterValue {
        self.parameters.push(ParameterAccess {
            parameter,
            ty,
            explicit: indexes.len(),
        });
        ParameterValue::zero(ty)
    }

    fn input(&mut self, input: InputId) -> f64 {
        self.inputs.insert(input);
        0.0
    }

    fn input_was_provided(&mut self, input: InputId) -> bool {
        self.inputs.insert(input);
        false
    }

    fn result_value(&mut self, equation: EquationId, indexes: &[Index]) -> f64 {
        self.results.push((equation, explicit_sets(indexes)));
        0.0
    }

    fn last_result_value(&mut self, equation: EquationId, indexes: &[Index]) -> f64 {
        self.last_results.push((equation, explicit_sets(indexes)));
        0.0
    }

    fn earlier_result_value(
        &mut self,
        equation: EquationId,
        _steps_back: u64,
        indexes: &[Index],
    ) -> f64 {
        self.last_result_value(equation, indexes)
    }

    fn current_index(&mut self, index_set: IndexSetId) -> Index {
        self.index_sets.insert(index_set);
        Index::new(index_set, 0)
    }

    fn index_count(&mut self, _index_set: IndexSetId) -> u32 {
        1
    }

    fn branch_input_count(&mut self, index_set: IndexSetId) -> usize {
        self.index_sets.insert(index_set);
        1
    }

    fn branch_input(&mut self, index_set: IndexSetId, _n: usize) -> Index {
        self.index_sets.insert(index_set);
        Index::new(index_set, 0)
    }

    fn timestep(&self) -> i64 {
        0
    }

    fn current_time(&self) -> ExpandedDateTime {
        self.time
    }
}

/// Fills in `dependencies` on every equation of `model`.
pub(crate) fn trace_equations(model: &mut Model) -> Result<()> {
    let handles: Vec<EquationId> = model.equations.handles().collect();
    let mut indexed: Vec<Vec<IndexedDependency>> = vec![Vec::new(); model.equations.slot_count()];
    let epoch = ExpandedDateTime::epoch(model.timestep_size());

    for &equation in &handles {
        let spec = model.equations.spec(equation);
        if spec.kind == EquationKind::Cumulative {
            if let Some(cumulation) = spec.cumulation {
                model
                    .equations
                    .spec_mut(equation)
                    .dependencies
                    .direct_results
                    .insert(cumulation.equation);
            }
            continue;
        }
        let Some(body) = spec.body.clone() else {
            return Err(MobiusError::MissingEquationBody {
                equation: model.equations.name(equation).to_string(),
            }
            .into());
        };

        let mut context = TracingContext::new(epoch);
        (body.0)(&mut context);

        let (deps, records) = collect_dependencies(model, equation, context)?;
        indexed[equation.index()] = records;
        model.equations.spec_mut(equation).dependencies = deps;
    }

    check_computed_parameters(model, &indexed)?;
    resolve_index_sets(model, &handles, &indexed)?;
    Ok(())
}

fn collect_dependencies(
    model: &Model,
    equation: EquationId,
    context: TracingContext,
) -> Result<(EquationDependencies, Vec<IndexedDependency>)> {
    let spec = model.equations.spec(equation);
    let name = model.equations.name(equation);
    let mut deps = EquationDependencies {
        index_sets: context.index_sets,
        ..Default::default()
    };
    let mut indexed = Vec::new();

    for access in &context.parameters {
        let par = model.parameters.spec(access.parameter);
        let par_name = model.parameters.name(access.parameter);
        if access.ty != par.ty {
            bail!(
                "In the equation \"{}\": the parameter \"{}\" was registered with type {}, but is accessed as type {}.",
                name,
                par_name,
                par.ty.name(),
                access.ty.name()
            );
        }
        if access.explicit > par.index_sets.len() {
            bail!(
                "In the equation \"{}\": the parameter \"{}\" is referenced with more explicit indexes than the number of index sets it depends on.",
                name,
                par_name
            );
        }
        let implicit = par.index_sets.len() - access.explicit;
        deps.index_sets.extend(par.index_sets[..implicit].iter().copied());
        if access.explicit == 0 {
            deps.parameters.insert(access.parameter);
        }
    }

    for &input in &context.inputs {
        deps.index_sets
            .extend(model.inputs.spec(input).index_sets.iter().copied());
        deps.inputs.insert(input);
    }

    match spec.initial_value {
        Some(InitialValueSource::Parameter(parameter)) => {
            deps.index_sets
                .extend(model.parameters.spec(parameter).index_sets.iter().copied());
            deps.parameters.insert(parameter);
        }
        Some(InitialValueSource::Equation(initial)) => {
            deps.direct_last_results.insert(initial);
        }
        _ => {}
    }

    for (last, records) in [(false, &context.results), (true, &context.last_results)] {
        for (dependency, explicit) in records {
            if model.equations.spec(*dependency).kind == EquationKind::InitialValue {
                bail!(
                    "The equation \"{}\" depends explicitly on the result of the equation \"{}\" which is an initial value equation. It should instead depend on the result of the equation that \"{}\" is an initial value for.",
                    name,
                    model.equations.name(*dependency),
                    model.equations.name(*dependency)
                );
            }
            match (explicit.is_empty(), last) {
                (true, false) => {
                    deps.direct_results.insert(*dependency);
                }
                (true, true) => {
                    deps.direct_last_results.insert(*dependency);
                }
                (false, false) => {
                    deps.cross_results.insert(*dependency);
                }
                (false, true) => {
                    deps.cross_last_results.insert(*dependency);
                }
            }
            if !explicit.is_empty() {
                indexed.push(IndexedDependency {
                    equation: *dependency,
                    explicit: explicit.clone(),
                });
            }
        }
    }

    if let Some(solver) = spec.solver {
        if let Some(parameter) = model.solvers.spec(solver).h_parameter {
            deps.index_sets
                .extend(model.parameters.spec(parameter).index_sets.iter().copied());
        }
    }
    if let Some(conditional) = model.effective_conditional(equation) {
        let switch = model.conditionals.spec(conditional).switch;
        deps.index_sets
            .extend(model.parameters.spec(switch).index_sets.iter().copied());
    }

    Ok((deps, indexed))
}

fn check_computed_parameters(model: &mut Model, indexed: &[Vec<IndexedDependency>]) -> Result<()> {
    let parameters: Vec<ParameterId> = model.parameters.handles().collect();
    for parameter in parameters {
        let Some(equation) = model.parameters.spec(parameter).is_computed_by else {
            continue;
        };
        let deps = &model.equations.spec(equation).dependencies;
        if !deps.direct_results.is_empty()
            || !deps.direct_last_results.is_empty()
            || !indexed[equation.index()].is_empty()
            || !deps.inputs.is_empty()
        {
            bail!(
                "The initial value equation \"{}\" assigned to compute the parameter \"{}\" depends on either a result of an equation or an input. This is not allowed for computed parameters.",
                model.equations.name(equation),
                model.parameters.name(parameter)
            );
        }
        let sets: BTreeSet<IndexSetId> = model
            .parameters
            .spec(parameter)
            .index_sets
            .iter()
            .copied()
            .collect();
        model.equations.spec_mut(equation).dependencies.index_sets = sets;
    }
    Ok(())
}

/// Index sets `equation` inherits from what it depends on, given the current state.
fn inherited_index_sets(
    model: &Model,
    equation: EquationId,
    indexed: &[IndexedDependency],
) -> BTreeSet<IndexSetId> {
    let spec = model.equations.spec(equation);
    let sets_of = |eq: EquationId| &model.equations.spec(eq).dependencies.index_sets;
    let mut result = BTreeSet::new();

    if let Some(cumulation) = spec.cumulation {
        result.extend(sets_of(cumulation.equation).iter().copied());
        if let Some(weight) = cumulation.weight {
            result.extend(model.parameters.spec(weight).index_sets.iter().copied());
        }
        result.remove(&cumulation.over);
        return result;
    }

    let deps = &spec.dependencies;
    for dependency in deps.direct_results.iter().chain(&deps.direct_last_results) {
        result.extend(sets_of(*dependency).iter().copied());
    }
    for record in indexed {
        result.extend(
            sets_of(record.equation)
                .iter()
                .filter(|set| !record.explicit.contains(*set))
                .copied(),
        );
    }
    result
}

fn resolve_index_sets(
    model: &mut Model,
    handles: &[EquationId],
    indexed: &[Vec<IndexedDependency>],
) -> Result<()> {
    for iteration in 0..MAX_RESOLVE_ITERATIONS {
        let mut changed = false;
        for &equation in handles {
            if model.equations.spec(equation).computes_parameter.is_some() {
                continue;
            }
            let inherited = inherited_index_sets(model, equation, &indexed[equation.index()]);
            let sets = &mut model.equations.spec_mut(equation).dependencies.index_sets;
            let before = sets.len();
            sets.extend(inherited);
            changed |= sets.len() != before;
        }
        if !changed {
            debug!(iterations = iteration + 1, "index set dependencies resolved");
            return Ok(());
        }
    }
    Err(MobiusError::UnresolvedIndexSets {
        iterations: MAX_RESOLVE_ITERATIONS,
    }
    .into())
}
