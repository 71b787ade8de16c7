//! Turns traced equations into an execution plan.
//!
//! Stage A sorts equations topologically, treating every solver as a single node. Stage B
//! places the sorted nodes into batches (equations sharing index sets and conditional),
//! then shifts equations into later compatible batches to reduce fragmentation. Consecutive
//! batches over the same index sets form a batch group, which is what the run loop
//! iterates over.

use crate::error::MobiusError;
use crate::handles::{ConditionalId, EquationId, IndexSetId, InputId, ParameterId, SolverId};
use crate::model::{EquationKind, InitialValueSource, Model};
use anyhow::{bail, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Number of times the equation shifting pass runs. One pass is not always enough to reach
/// a stable structure.
const SHIFT_PASSES: usize = 2;

/// What has to be reloaded into the current-value buffers when the iteration cursor moves
/// at one index set level of a batch group.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IterationData {
    pub parameters_to_read: Vec<ParameterId>,
    pub inputs_to_read: Vec<InputId>,
    /// Results of earlier batch groups.
    pub results_to_read: Vec<EquationId>,
    /// Last results of other batch groups.
    pub last_results_to_read: Vec<EquationId>,
}

/// Which equations of a solver batch are affected by perturbing each ODE state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JacobianInfo {
    /// Entry `i` lists the positions of the ODE equations whose derivative depends on ODE `i`.
    pub ode_is_dependency_of_ode: Vec<Vec<usize>>,
    /// Entry `i` lists the non-ODE equations of the batch that depend on ODE `i`, in
    /// evaluation order.
    pub ode_is_dependency_of_non_ode: Vec<Vec<EquationId>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EquationBatch {
    pub solver: Option<SolverId>,
    pub conditional: Option<ConditionalId>,
    /// Non-ODE equations in evaluation order.
    pub equations: Vec<EquationId>,
    /// Empty unless this is a solver batch.
    pub equations_ode: Vec<EquationId>,
    pub initial_value_order: Vec<EquationId>,
    pub jacobian: Option<JacobianInfo>,
}

impl EquationBatch {
    pub fn is_solver(&self) -> bool {
        self.solver.is_some()
    }

    /// Non-ODE equations first, then ODE equations. This is also the storage order.
    pub fn all_equations(&self) -> impl Iterator<Item = EquationId> + '_ {
        self.equations.iter().chain(&self.equations_ode).copied()
    }

    pub fn equation_count(&self) -> usize {
        self.equations.len() + self.equations_ode.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchGroup {
    /// Iteration order of the nested loops, outermost first.
    pub index_sets: Vec<IndexSetId>,
    pub first_batch: usize,
    pub last_batch: usize,
    /// One entry per index set level.
    pub iteration_data: Vec<IterationData>,
    /// Last results of unindexed batch groups, read when the group is entered.
    pub last_results_to_read_at_base: Vec<EquationId>,
}

impl BatchGroup {
    pub fn batches(&self) -> std::ops::RangeInclusive<usize> {
        self.first_batch..=self.last_batch
    }
}

// --- Stage A: topological sort ---

#[derive(Debug, Clone, Copy, Default)]
struct Mark {
    temp: bool,
    done: bool,
}

#[derive(Debug, Default, Clone)]
struct SolverNode {
    index_sets: BTreeSet<IndexSetId>,
    direct_results: BTreeSet<EquationId>,
    cross_results: BTreeSet<EquationId>,
    equations: Vec<EquationId>,
}

fn label(model: &Model, equation: EquationId) -> String {
    match model.equations.spec(equation).solver {
        Some(solver) => format!(
            "\"{}\" (\"{}\")",
            model.solvers.name(solver),
            model.equations.name(equation)
        ),
        None => format!("\"{}\"", model.equations.name(equation)),
    }
}

fn cycle_error(what: &'static str, chain: Vec<String>) -> anyhow::Error {
    MobiusError::CircularDependency {
        what,
        chain: chain.join(" <- "),
    }
    .into()
}

struct Sorter<'a> {
    model: &'a Model,
    solvers: &'a [SolverNode],
    marks: Vec<Mark>,
    solver_marks: Vec<Mark>,
}

impl<'a> Sorter<'a> {
    fn new(model: &'a Model, solvers: &'a [SolverNode]) -> Self {
        Self {
            model,
            solvers,
            marks: vec![Mark::default(); model.equations.slot_count()],
            solver_marks: vec![Mark::default(); model.solvers.slot_count()],
        }
    }

    fn mark(&mut self, equation: EquationId) -> &mut Mark {
        match self.model.equations.spec(equation).solver {
            Some(solver) => &mut self.solver_marks[solver.index()],
            None => &mut self.marks[equation.index()],
        }
    }

    /// Solver equations stand in for their whole solver.
    fn visit(
        &mut self,
        equation: EquationId,
        out: &mut Vec<EquationId>,
    ) -> Result<(), Vec<String>> {
        let mark = *self.mark(equation);
        if mark.done {
            return Ok(());
        }
        if mark.temp {
            return Err(vec![label(self.model, equation)]);
        }
        self.mark(equation).temp = true;

        let model = self.model;
        let solvers = self.solvers;
        let solver = model.equations.spec(equation).solver;
        let dependencies = match solver {
            Some(solver) => &solvers[solver.index()].direct_results,
            None => &model.equations.spec(equation).dependencies.direct_results,
        };
        for &dependency in dependencies {
            if solver.is_some() && model.equations.spec(dependency).solver == solver {
                continue;
            }
            self.visit(dependency, out).map_err(|mut chain| {
                chain.push(label(model, equation));
                chain
            })?;
        }
        self.mark(equation).done = true;
        out.push(equation);
        Ok(())
    }

    /// Orders the non-ODE equations of one solver among themselves.
    fn visit_in_solver(
        &mut self,
        equation: EquationId,
        out: &mut Vec<EquationId>,
    ) -> Result<(), Vec<String>> {
        let mark = self.marks[equation.index()];
        if mark.done {
            return Ok(());
        }
        if mark.temp {
            return Err(vec![label(self.model, equation)]);
        }
        self.marks[equation.index()].temp = true;
        let model = self.model;
        let spec = model.equations.spec(equation);
        for &dependency in &spec.dependencies.direct_results {
            let dep = model.equations.spec(dependency);
            if dep.kind == EquationKind::Ode || dep.solver != spec.solver {
                continue;
            }
            self.visit_in_solver(dependency, out).map_err(|mut chain| {
                chain.push(label(model, equation));
                chain
            })?;
        }
        self.marks[equation.index()].done = true;
        out.push(equation);
        Ok(())
    }
}

fn sort_equations(model: &Model) -> Result<(Vec<EquationId>, Vec<SolverNode>)> {
    let mut solvers = vec![SolverNode::default(); model.solvers.slot_count()];
    let mut to_sort = Vec::new();
    for (equation, name, spec) in model.equations.iter() {
        if spec.kind == EquationKind::InitialValue {
            continue;
        }
        match spec.solver {
            Some(solver) => {
                let node = &mut solvers[solver.index()];
                node.index_sets.extend(spec.dependencies.index_sets.iter().copied());
                node.direct_results.extend(spec.dependencies.direct_results.iter().copied());
                node.cross_results.extend(spec.dependencies.cross_results.iter().copied());
                if node.equations.is_empty() {
                    to_sort.push(equation);
                }
                node.equations.push(equation);
            }
            None => {
                if spec.kind == EquationKind::Ode {
                    bail!(
                        "The equation \"{}\" is registered as an ODE equation, but it has not been given a solver.",
                        name
                    );
                }
                to_sort.push(equation);
            }
        }
    }

    let mut sorter = Sorter::new(model, &solvers);
    let mut sorted = Vec::with_capacity(to_sort.len());
    for equation in to_sort {
        sorter
            .visit(equation, &mut sorted)
            .map_err(|chain| cycle_error("equations", chain))?;
    }
    Ok((sorted, solvers))
}

// --- Stage B: batch placement ---

#[derive(Debug, Clone)]
struct BatchTemplate {
    solver: Option<SolverId>,
    conditional: Option<ConditionalId>,
    index_sets: BTreeSet<IndexSetId>,
    equations: Vec<EquationId>,
    equations_ode: Vec<EquationId>,
}

impl BatchTemplate {
    fn plain(model: &Model, equation: EquationId) -> Self {
        Self {
            solver: None,
            conditional: model.effective_conditional(equation),
            index_sets: model.equations.spec(equation).dependencies.index_sets.clone(),
            equations: vec![equation],
            equations_ode: Vec::new(),
        }
    }

    fn accepts(
        &self,
        index_sets: &BTreeSet<IndexSetId>,
        conditional: Option<ConditionalId>,
    ) -> bool {
        self.index_sets == *index_sets && self.conditional == conditional
    }

    fn all_equations(&self) -> impl Iterator<Item = &EquationId> {
        self.equations.iter().chain(&self.equations_ode)
    }
}

fn depends_on_batch(
    direct: &BTreeSet<EquationId>,
    cross: &BTreeSet<EquationId>,
    batch: &BatchTemplate,
) -> bool {
    batch
        .all_equations()
        .any(|equation| direct.contains(equation) || cross.contains(equation))
}

fn place_batches(
    model: &Model,
    sorted: &[EquationId],
    solvers: &[SolverNode],
) -> Result<Vec<BatchTemplate>> {
    let mut build: Vec<BatchTemplate> = Vec::new();
    for &equation in sorted {
        let spec = model.equations.spec(equation);
        if let Some(solver) = spec.solver {
            let node = &solvers[solver.index()];
            let mut batch = BatchTemplate {
                solver: Some(solver),
                conditional: model.solvers.spec(solver).conditional,
                index_sets: node.index_sets.clone(),
                equations: Vec::new(),
                equations_ode: Vec::new(),
            };
            for &member in &node.equations {
                match model.equations.spec(member).kind {
                    EquationKind::Ode => batch.equations_ode.push(member),
                    _ => batch.equations.push(member),
                }
            }

            let mut sorter = Sorter::new(model, solvers);
            let mut ordered = Vec::with_capacity(batch.equations.len());
            for &member in &batch.equations {
                sorter
                    .visit_in_solver(member, &mut ordered)
                    .map_err(|chain| cycle_error("non-ode equations within a solver", chain))?;
            }
            batch.equations = ordered;

            let mut earliest = build.len();
            for idx in (0..build.len()).rev() {
                if build[idx].accepts(&batch.index_sets, batch.conditional) {
                    earliest = idx;
                }
                if depends_on_batch(&node.direct_results, &node.cross_results, &build[idx]) {
                    break;
                }
            }
            if earliest == build.len() {
                build.push(batch);
            } else {
                build.insert(earliest + 1, batch);
            }
            continue;
        }

        let deps = &spec.dependencies;
        let conditional = model.effective_conditional(equation);
        let mut earliest = build.len();
        let mut earliest_is_solver = false;
        for idx in (0..build.len()).rev() {
            if build[idx].accepts(&deps.index_sets, conditional) {
                earliest = idx;
                earliest_is_solver = build[idx].solver.is_some();
            }
            if depends_on_batch(&deps.direct_results, &deps.cross_results, &build[idx]) {
                break;
            }
        }

        if earliest == build.len() {
            let batch = BatchTemplate::plain(model, equation);
            if deps.direct_results.is_empty() && deps.cross_results.is_empty() {
                build.insert(0, batch);
            } else {
                build.push(batch);
            }
        } else if earliest_is_solver {
            let joins_next = build
                .get(earliest + 1)
                .is_some_and(|next| {
                    next.solver.is_none() && next.accepts(&deps.index_sets, conditional)
                });
            if joins_next {
                build[earliest + 1].equations.push(equation);
            } else {
                build.insert(earliest + 1, BatchTemplate::plain(model, equation));
            }
        } else {
            build[earliest].equations.push(equation);
        }
    }
    Ok(build)
}

/// Moves equations to the front of the last compatible later batch that comes before
/// anything depending on them.
fn shift_equations_later(model: &Model, build: &mut Vec<BatchTemplate>) {
    let direct = |equation: EquationId| &model.equations.spec(equation).dependencies.direct_results;
    for b in 0..build.len() {
        if build[b].solver.is_some() {
            continue;
        }
        let mut e = build[b].equations.len();
        while e > 0 {
            e -= 1;
            let equation = build[b].equations[e];
            let blocked = build[b].equations[e + 1..]
                .iter()
                .any(|behind| direct(*behind).contains(&equation));
            if blocked {
                continue;
            }
            let (index_sets, conditional) = (build[b].index_sets.clone(), build[b].conditional);
            let mut last_suitable = b;
            for behind in b + 1..build.len() {
                let next = &build[behind];
                if next.solver.is_none() && next.accepts(&index_sets, conditional) {
                    last_suitable = behind;
                }
                let depends_on_us = next.all_equations().any(|eq| direct(*eq).contains(&equation));
                if behind == build.len() - 1 || depends_on_us {
                    if last_suitable != b {
                        build[last_suitable].equations.insert(0, equation);
                        build[b].equations.remove(e);
                    }
                    break;
                }
            }
        }
    }
    build.retain(|batch| batch.solver.is_some() || !batch.equations.is_empty());
}

// --- Grouping ---

struct Placement {
    batch_of: Vec<usize>,
    group_of: Vec<usize>,
}

fn group_batches(
    model: &Model,
    build: Vec<BatchTemplate>) -> (Vec<EquationBatch>, Vec<BatchGroup>, Placement,
) {
    let mut counts = vec![0usize; model.index_sets.slot_count()];
    for batch in &build {
        for set in &batch.index_sets {
            counts[set.index()] += 1;
        }
    }

    let mut placement = Placement {
        batch_of: vec![usize::MAX; model.equations.slot_count()],
        group_of: vec![usize::MAX; model.equations.slot_count()],
    };
    let mut batches = Vec::with_capacity(build.len());
    let mut groups: Vec<BatchGroup> = Vec::new();
    let mut idx = 0;
    while idx < build.len() {
        let shared = build[idx].index_sets.clone();
        let mut index_sets: Vec<IndexSetId> = shared.iter().copied().collect();
        index_sets.sort_by(|a, b| {
            counts[b.index()]
                .cmp(&counts[a.index()])
                .then(b.index().cmp(&a.index()))
        });
        let first_batch = idx;
        while idx < build.len() && build[idx].index_sets == shared {
            let template = &build[idx];
            for equation in template.all_equations() {
                placement.batch_of[equation.index()] = idx;
                placement.group_of[equation.index()] = groups.len();
            }
            batches.push(EquationBatch {
                solver: template.solver,
                conditional: template.conditional,
                equations: template.equations.clone(),
                equations_ode: template.equations_ode.clone(),
                initial_value_order: Vec::new(),
                jacobian: None,
            });
            idx += 1;
        }
        groups.push(BatchGroup {
            iteration_data: vec![IterationData::default(); index_sets.len()],
            index_sets,
            first_batch,
            last_batch: idx - 1,
            last_results_to_read_at_base: Vec::new(),
        });
    }
    (batches, groups, placement)
}

// --- Initial values ---

struct InitialValueSorter<'a> {
    model: &'a Model,
    placement: &'a Placement,
    marks: Vec<Mark>,
}

impl InitialValueSorter<'_> {
    fn visit(
        &mut self,
        equation: EquationId,
        out: &mut Vec<EquationId>,
    ) -> Result<(), Vec<String>> {
        let model = self.model;
        let placement = self.placement;
        let original = model.equations.spec(equation);
        let lookup = match original.initial_value {
            Some(InitialValueSource::Equation(initial)) => initial,
            _ => equation,
        };
        let mark = self.marks[lookup.index()];
        if mark.done {
            return Ok(());
        }
        if mark.temp {
            return Err(vec![label(model, equation)]);
        }
        self.marks[lookup.index()].temp = true;

        let evaluates_body = matches!(
            original.initial_value,
            None | Some(InitialValueSource::Equation(_))
        );
        if evaluates_body {
            let deps = &model.equations.spec(lookup).dependencies;
            let group = placement.group_of[equation.index()];
            let batch = placement.batch_of[equation.index()];
            let last_in_batch = deps
                .direct_last_results
                .iter()
                .filter(|dep| placement.batch_of[dep.index()] == batch);
            for &dependency in deps.direct_results.iter().chain(last_in_batch) {
                if dependency == equation || dependency == lookup {
                    continue;
                }
                if placement.group_of[dependency.index()] != group {
                    warn!(
                        equation = %model.equations.name(equation),
                        dependency = %model.equations.name(dependency),
                        "the initial value depends on an equation in a different batch group and may not be computed correctly"
                    );
                    continue;
                }
                self.visit(dependency, out).map_err(|mut chain| {
                    chain.push(label(model, equation));
                    chain
                })?;
            }
        }
        self.marks[lookup.index()].done = true;
        out.push(equation);
        Ok(())
    }
}

fn order_initial_values(
    model: &Model,
    batches: &mut [EquationBatch],
    placement: &Placement,
) -> Result<()> {
    let mut sorter = InitialValueSorter {
        model,
        placement,
        marks: vec![Mark::default(); model.equations.slot_count()],
    };
    for batch in batches.iter_mut() {
        let mut order = Vec::new();
        let members: Vec<EquationId> = batch.all_equations().collect();
        for equation in members {
            if model.equations.spec(equation).initial_value.is_some() {
                sorter
                    .visit(equation, &mut order)
                    .map_err(|chain| cycle_error("initial value of the equations", chain))?;
            }
        }
        batch.initial_value_order = order;
    }
    Ok(())
}

// --- Load lists ---

/// True if `level` is the innermost level of `group_sets` that `dependency_sets` varies with.
fn is_top_index_set(
    dependency_sets: &[IndexSetId],
    group_sets: &[IndexSetId],
    level: usize,
) -> bool {
    dependency_sets.contains(&group_sets[level])
        && !group_sets[level + 1..]
            .iter()
            .any(|set| dependency_sets.contains(set))
}

fn build_iteration_data(
    model: &Model,
    batches: &[EquationBatch],
    groups: &mut [BatchGroup],
    placement: &Placement,
) {
    let group_sets: Vec<Vec<IndexSetId>> = groups.iter().map(|g| g.index_sets.clone()).collect();
    for (group_index, group) in groups.iter_mut().enumerate() {
        let mut parameters = BTreeSet::new();
        let mut inputs = BTreeSet::new();
        let mut results = BTreeSet::new();
        let mut last_results = BTreeSet::new();

        for batch in &batches[group.batches()] {
            if let Some(solver) = batch.solver {
                parameters.extend(model.solvers.spec(solver).h_parameter);
            }
            if let Some(conditional) = batch.conditional {
                parameters.insert(model.conditionals.spec(conditional).switch);
            }
            for equation in batch.all_equations() {
                let spec = model.equations.spec(equation);
                if spec.kind == EquationKind::Cumulative {
                    continue;
                }
                let deps = &spec.dependencies;
                parameters.extend(deps.parameters.iter().copied());
                inputs.extend(deps.inputs.iter().copied());
                results.extend(deps.direct_results.iter().copied());
                last_results.extend(deps.direct_last_results.iter().copied());
                if let Some(InitialValueSource::Equation(initial)) = spec.initial_value {
                    let initial_deps = &model.equations.spec(initial).dependencies;
                    parameters.extend(initial_deps.parameters.iter().copied());
                    inputs.extend(initial_deps.inputs.iter().copied());
                }
            }
        }

        let is_runtime = |equation: &EquationId| {
            model.equations.spec(*equation).kind != EquationKind::InitialValue
        };

        let own_sets = &group_sets[group_index];
        for level in 0..group.index_sets.len() {
            let top = |sets: &[IndexSetId]| is_top_index_set(sets, own_sets, level);
            let data = &mut group.iteration_data[level];
            data.parameters_to_read = parameters
                .iter()
                .copied()
                .filter(|p| top(&model.parameters.spec(*p).index_sets))
                .collect();
            data.inputs_to_read = inputs
                .iter()
                .copied()
                .filter(|i| top(&model.inputs.spec(*i).index_sets))
                .collect();
            data.results_to_read = results
                .iter()
                .filter(|eq| is_runtime(eq))
                .copied()
                .filter(|eq| {
                    let other = placement.group_of[eq.index()];
                    other < group_index && top(&group_sets[other])
                })
                .collect();
            data.last_results_to_read = last_results
                .iter()
                .filter(|eq| is_runtime(eq))
                .copied()
                .filter(|eq| {
                    let other = placement.group_of[eq.index()];
                    other != group_index && top(&group_sets[other])
                })
                .collect();
        }

        group.last_results_to_read_at_base = last_results
            .iter()
            .filter(|eq| is_runtime(eq))
            .copied()
            .filter(|eq| {
                let other = placement.group_of[eq.index()];
                other != group_index && group_sets[other].is_empty()
            })
            .collect();
    }
}

// --- Jacobian sparsity ---

fn find_ode_dependencies(
    model: &Model,
    batch: &EquationBatch,
    equation: EquationId,
    out: &mut BTreeSet<usize>,
) {
    for dependency in &model.equations.spec(equation).dependencies.direct_results {
        if let Some(pos) = batch.equations_ode.iter().position(|eq| eq == dependency) {
            out.insert(pos);
        } else if batch.equations.contains(dependency) {
            find_ode_dependencies(model, batch, *dependency, out);
        }
    }
}

fn build_jacobian_info(model: &Model, batch: &EquationBatch) -> JacobianInfo {
    let n = batch.equations_ode.len();
    let mut info = JacobianInfo {
        ode_is_dependency_of_ode: vec![Vec::new(); n],
        ode_is_dependency_of_non_ode: vec![Vec::new(); n],
    };
    for (row, &equation) in batch.equations_ode.iter().enumerate() {
        let mut found = BTreeSet::new();
        find_ode_dependencies(model, batch, equation, &mut found);
        for col in found {
            info.ode_is_dependency_of_ode[col].push(row);
        }
    }
    for &equation in &batch.equations {
        let mut found = BTreeSet::new();
        find_ode_dependencies(model, batch, equation, &mut found);
        for col in found {
            info.ode_is_dependency_of_non_ode[col].push(equation);
        }
    }
    info
}

/// Builds `model.batches` and `model.batch_groups` from the traced dependencies.
pub(crate) fn schedule(model: &mut Model) -> Result<()> {
    let (sorted, solvers) = sort_equations(model)?;
    let mut build = place_batches(model, &sorted, &solvers)?;
    for _ in 0..SHIFT_PASSES {
        shift_equations_later(model, &mut build);
    }
    debug!(batches = build.len(), "placed equations into batches");

    let (mut batches, mut groups, placement) = group_batches(model, build);
    order_initial_values(model, &mut batches, &placement)?;
    build_iteration_data(model, &batches, &mut groups, &placement);
    for batch in batches.iter_mut() {
        if let Some(solver) = batch.solver {
            if model.solvers.spec(solver).method.uses_jacobian() {
                batch.jacobian = Some(build_jacobian_info(model, batch));
            }
        }
    }

    model.batches = batches;
    model.batch_groups = groups;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::Index;
    use crate::model::ParameterValue;
    use crate::solvers::{IncaDascru, RosenbrockEuler};
    use crate::traits::EquationContext;
    use proptest::prelude::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    /// (group, batch, position) of every scheduled equation.
    fn positions(model: &Model) -> Vec<Option<(usize, usize, usize)>> {
        let mut result = vec![None; model.equations().slot_count()];
        for (g, group) in model.batch_groups().iter().enumerate() {
            for b in group.batches() {
                for (p, eq) in model.batches()[b].all_equations().enumerate() {
                    result[eq.index()] = Some((g, b, p));
                }
            }
        }
        result
    }

    fn check_structure(model: &Model) {
        let mut seen = BTreeSet::new();
        let mut next_batch = 0;
        for group in model.batch_groups() {
            assert_eq!(group.first_batch, next_batch);
            next_batch = group.last_batch + 1;
            let group_sets: BTreeSet<IndexSetId> = group.index_sets.iter().copied().collect();
            for b in group.batches() {
                for eq in model.batches()[b].all_equations() {
                    assert!(seen.insert(eq), "equation scheduled twice");
                    assert_eq!(model.equations().spec(eq).dependencies.index_sets, group_sets);
                }
            }
        }
        assert_eq!(next_batch, model.batches().len());
        for (eq, _, spec) in model.equations().iter() {
            assert_eq!(seen.contains(&eq), spec.kind != EquationKind::InitialValue);
        }

        let pos = positions(model);
        for (eq, _, spec) in model.equations().iter() {
            let Some((ga, ba, pa)) = pos[eq.index()] else { continue };
            let deps = &spec.dependencies;
            for dep in deps.direct_results.iter().chain(&deps.cross_results) {
                let (gb, bb, pb) = pos[dep.index()].expect("dependency is scheduled");
                let same_solver =
                    spec.solver.is_some() && model.equations().spec(*dep).solver == spec.solver;
                if same_solver {
                    continue;
                }
                assert!(gb <= ga, "dependency in a later group");
                if gb == ga {
                    assert!((bb, pb) < (ba, pa), "dependency evaluated after its dependent");
                }
            }
        }
    }

    #[test]
    fn constant_and_dependent_share_an_unindexed_group() {
        let mut model = Model::new("Schedule");
        let a = model.register_equation("A", None).expect("equation");
        let b = model.register_equation("B", None).expect("equation");
        model
            .set_equation_body(b, move |ctx: &mut dyn EquationContext| ctx.result(a) + 3.0)
            .expect("body");
        model.set_equation_body(a, |_: &mut dyn EquationContext| 2.0).expect("body");
        model.end_model_definition().expect("finalize");

        assert_eq!(model.batch_groups().len(), 1);
        assert!(model.batch_groups()[0].index_sets.is_empty());
        assert_eq!(model.batches().len(), 1);
        assert_eq!(model.batches()[0].equations, vec![a, b]);
        check_structure(&model);
    }

    #[test]
    fn circular_results_fail_without_a_solver() {
        let mut model = Model::new("Schedule");
        let a = model.register_equation("A", None).expect("equation");
        let b = model.register_equation("B", None).expect("equation");
        model
            .set_equation_body(a, move |ctx: &mut dyn EquationContext| ctx.result(b))
            .expect("body");
        model
            .set_equation_body(b, move |ctx: &mut dyn EquationContext| ctx.result(a))
            .expect("body");
        let err = model.end_model_definition().expect_err("expected error");
        let message = format!("{err}");
        assert!(message.contains("circular dependency between the equations"), "{message}");
        assert!(message.contains("\"A\" <- \"B\""), "{message}");
        assert!(matches!(
            err.downcast_ref::<MobiusError>(),
            Some(MobiusError::CircularDependency { .. })
        ));
    }

    #[test]
    fn circular_odes_on_a_shared_solver_are_allowed() {
        let mut model = Model::new("Schedule");
        let solver = model.register_solver("Solver", 0.1, IncaDascru).expect("solver");
        let a = model.register_equation_ode("A", None).expect("equation");
        let b = model.register_equation_ode("B", None).expect("equation");
        model
            .set_equation_body(a, move |ctx: &mut dyn EquationContext| ctx.result(b))
            .expect("body");
        model
            .set_equation_body(b, move |ctx: &mut dyn EquationContext| ctx.result(a))
            .expect("body");
        model.set_solver(a, solver).expect("solver");
        model.set_solver(b, solver).expect("solver");
        model.end_model_definition().expect("finalize");

        assert_eq!(model.batches().len(), 1);
        assert_eq!(model.batches()[0].solver, Some(solver));
        assert_eq!(model.batches()[0].equations_ode, vec![a, b]);
        check_structure(&model);
    }

    #[test]
    fn non_ode_cycles_inside_a_solver_fail() {
        let mut model = Model::new("Schedule");
        let solver = model.register_solver("Solver", 0.1, IncaDascru).expect("solver");
        let a = model.register_equation("A", None).expect("equation");
        let b = model.register_equation("B", None).expect("equation");
        model
            .set_equation_body(a, move |ctx: &mut dyn EquationContext| ctx.result(b))
            .expect("body");
        model
            .set_equation_body(b, move |ctx: &mut dyn EquationContext| ctx.result(a))
            .expect("body");
        model.set_solver(a, solver).expect("solver");
        model.set_solver(b, solver).expect("solver");
        assert_err_contains(
            model.end_model_definition(),
            "non-ode equations within a solver",
        );
    }

    #[test]
    fn ode_without_solver_fails() {
        let mut model = Model::new("Schedule");
        let a = model.register_equation_ode("A", None).expect("equation");
        model.set_equation_body(a, |_: &mut dyn EquationContext| 1.0).expect("body");
        assert_err_contains(model.end_model_definition(), "has not been given a solver");
    }

    #[test]
    fn different_conditionals_get_separate_batches() {
        let mut model = Model::new("Schedule");
        let group = model.register_parameter_group("Switches", None).expect("group");
        let switch = model.register_parameter_bool(group, "Snow", true).expect("bool");
        let cond = model
            .register_conditional("Snow on", switch, ParameterValue::Bool(true))
            .expect("conditional");
        let a = model.register_equation("A", None).expect("equation");
        let b = model.register_equation("B", None).expect("equation");
        let c = model.register_equation("C", None).expect("equation");
        model.set_equation_body(a, |_: &mut dyn EquationContext| 1.0).expect("body");
        model
            .set_equation_body(b, move |ctx: &mut dyn EquationContext| ctx.result(a))
            .expect("body");
        model
            .set_equation_body(c, move |ctx: &mut dyn EquationContext| ctx.result(b))
            .expect("body");
        model.set_equation_conditional(b, cond).expect("conditional");
        model.end_model_definition().expect("finalize");

        let gated: Vec<_> = model
            .batches()
            .iter()
            .filter(|batch| batch.conditional == Some(cond))
            .collect();
        assert_eq!(gated.len(), 1);
        assert_eq!(gated[0].equations, vec![b]);
        assert!(model.batch_groups()[0].iteration_data.is_empty());
        check_structure(&model);
    }

    #[test]
    fn index_sets_are_sorted_and_loaded_at_their_top_level() {
        let mut model = Model::new("Schedule");
        let reaches = model.register_index_set("Reaches").expect("index set");
        let land = model.register_index_set("Landscape units").expect("index set");
        let reach_group = model.register_parameter_group("Reach", Some(reaches)).expect("group");
        let land_group = model.register_parameter_group("Land", Some(land)).expect("group");
        let width = model
            .register_parameter_double(reach_group, "Width", None, 1.0, 0.0, 10.0)
            .expect("parameter");
        let porosity = model
            .register_parameter_double(land_group, "Porosity", None, 0.3, 0.0, 1.0)
            .expect("parameter");
        let flow = model.register_equation("Flow", None).expect("equation");
        let soil = model.register_equation("Soil", None).expect("equation");
        model
            .set_equation_body(flow, move |ctx: &mut dyn EquationContext| ctx.parameter_f64(width))
            .expect("body");
        model
            .set_equation_body(soil, move |ctx: &mut dyn EquationContext| {
                ctx.parameter_f64(porosity) + ctx.result(flow)
            })
            .expect("body");
        model.end_model_definition().expect("finalize");
        check_structure(&model);

        assert_eq!(model.batch_groups().len(), 2);
        let soil_group = &model.batch_groups()[1];
        // Reaches is used by both groups, so it is the outer loop.
        assert_eq!(soil_group.index_sets, vec![reaches, land]);
        assert_eq!(soil_group.iteration_data[0].parameters_to_read, Vec::<ParameterId>::new());
        assert_eq!(soil_group.iteration_data[0].results_to_read, vec![flow]);
        assert_eq!(soil_group.iteration_data[1].parameters_to_read, vec![porosity]);
        assert_eq!(model.batch_groups()[0].iteration_data[0].parameters_to_read, vec![width]);
    }

    #[test]
    fn unindexed_last_results_are_read_at_base() {
        let mut model = Model::new("Schedule");
        let boxes = model.register_index_set("Boxes").expect("index set");
        let input = model.register_input("Forcing", None).expect("input");
        model.set_input_index_sets(input, &[boxes]).expect("index sets");
        let total = model.register_equation("Total", None).expect("equation");
        let per_box = model.register_equation("Per box", None).expect("equation");
        model
            .set_equation_body(total, |_: &mut dyn EquationContext| 1.0)
            .expect("body");
        model
            .set_equation_body(per_box, move |ctx: &mut dyn EquationContext| {
                ctx.input(input) + ctx.last_result(total)
            })
            .expect("body");
        model.end_model_definition().expect("finalize");
        let group = model
            .batch_groups()
            .iter()
            .find(|g| g.index_sets == vec![boxes])
            .expect("indexed group");
        assert_eq!(group.last_results_to_read_at_base, vec![total]);
        assert_eq!(group.iteration_data[0].inputs_to_read, vec![input]);
    }

    #[test]
    fn initial_values_follow_their_own_dependencies() {
        let mut model = Model::new("Schedule");
        let group = model.register_parameter_group("Soil", None).expect("group");
        let start = model
            .register_parameter_double(group, "Initial water", None, 10.0, 0.0, 100.0)
            .expect("parameter");
        let water = model.register_equation("Water", None).expect("equation");
        let fraction = model.register_equation("Fraction", None).expect("equation");
        let init = model
            .register_equation_initial_value("Initial fraction", None)
            .expect("iv");
        model
            .set_equation_body(water, move |ctx: &mut dyn EquationContext| {
                ctx.last_result(water) + 1.0
            })
            .expect("body");
        model
            .set_equation_body(fraction, move |ctx: &mut dyn EquationContext| {
                ctx.result(water) * 0.5
            })
            .expect("body");
        model
            .set_equation_body(init, move |ctx: &mut dyn EquationContext| ctx.result(water) * 0.1)
            .expect("body");
        model.set_initial_value_parameter(water, start).expect("iv parameter");
        model.set_initial_value_equation(fraction, init).expect("iv equation");
        model.end_model_definition().expect("finalize");

        let order: Vec<_> = model
            .batches()
            .iter()
            .flat_map(|b| b.initial_value_order.iter().copied())
            .collect();
        assert_eq!(order, vec![water, fraction]);
    }

    #[test]
    fn circular_initial_values_fail() {
        let mut model = Model::new("Schedule");
        let a = model.register_equation("A", None).expect("equation");
        let b = model.register_equation("B", None).expect("equation");
        let init_a = model.register_equation_initial_value("Initial A", None).expect("iv");
        let init_b = model.register_equation_initial_value("Initial B", None).expect("iv");
        model.set_equation_body(a, |_: &mut dyn EquationContext| 1.0).expect("body");
        model.set_equation_body(b, |_: &mut dyn EquationContext| 1.0).expect("body");
        model
            .set_equation_body(init_a, move |ctx: &mut dyn EquationContext| ctx.result(b))
            .expect("body");
        model
            .set_equation_body(init_b, move |ctx: &mut dyn EquationContext| ctx.result(a))
            .expect("body");
        model.set_initial_value_equation(a, init_a).expect("iv");
        model.set_initial_value_equation(b, init_b).expect("iv");
        assert_err_contains(model.end_model_definition(), "initial value of the equations");
    }

    #[test]
    fn jacobian_info_tracks_indirect_dependencies() {
        let mut model = Model::new("Schedule");
        let solver = model
            .register_solver("Implicit", 0.1, RosenbrockEuler)
            .expect("solver");
        let x = model.register_equation_ode("X", None).expect("equation");
        let y = model.register_equation_ode("Y", None).expect("equation");
        let rate = model.register_equation("Rate", None).expect("equation");
        model
            .set_equation_body(rate, move |ctx: &mut dyn EquationContext| 0.1 * ctx.result(x))
            .expect("body");
        model
            .set_equation_body(x, move |ctx: &mut dyn EquationContext| -ctx.result(rate))
            .expect("body");
        model
            .set_equation_body(y, move |ctx: &mut dyn EquationContext| {
                ctx.result(rate) - ctx.result(y)
            })
            .expect("body");
        for eq in [x, y, rate] {
            model.set_solver(eq, solver).expect("solver");
        }
        model.end_model_definition().expect("finalize");

        let batch = &model.batches()[0];
        let info = batch.jacobian.as_ref().expect("implicit solvers get jacobian info");
        assert_eq!(info.ode_is_dependency_of_ode, vec![vec![0, 1], vec![1]]);
        assert_eq!(info.ode_is_dependency_of_non_ode, vec![vec![rate], vec![]]);
    }

    #[test]
    fn explicit_cross_indexing_keeps_order() {
        let mut model = Model::new("Schedule");
        let reaches = model.register_index_set("Reaches").expect("index set");
        let input = model.register_input("Local inflow", None).expect("input");
        model.set_input_index_sets(input, &[reaches]).expect("index sets");
        let flow = model.register_equation("Flow", None).expect("equation");
        let outlet = model.register_equation("Outlet", None).expect("equation");
        model
            .set_equation_body(outlet, move |ctx: &mut dyn EquationContext| {
                ctx.result_at(flow, &[Index::new(reaches, 0)])
            })
            .expect("body");
        model
            .set_equation_body(flow, move |ctx: &mut dyn EquationContext| ctx.input(input))
            .expect("body");
        model.end_model_definition().expect("finalize");
        check_structure(&model);
        let pos = positions(&model);
        assert!(pos[flow.index()] < pos[outlet.index()]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn random_models_schedule_soundly(
            specs in prop::collection::vec((0usize..4, any::<u16>(), any::<u16>()), 1..12)
        ) {
            let mut model = Model::new("Random");
            let sets = [
                model.register_index_set("First").expect("index set"),
                model.register_index_set("Second").expect("index set"),
            ];
            let mut inputs = Vec::new();
            for mask in 0..4usize {
                let input = model.register_input(&format!("Input {mask}"), None).expect("input");
                let chosen: Vec<IndexSetId> = (0..2)
                    .filter(|bit| mask & (1 << bit) != 0)
                    .map(|bit| sets[bit])
                    .collect();
                model.set_input_index_sets(input, &chosen).expect("index sets");
                inputs.push(input);
            }
            let equations: Vec<EquationId> = (0..specs.len())
                .map(|i| model.register_equation(&format!("Eq {i}"), None).expect("equation"))
                .collect();
            for (i, (mask, deps, last_deps)) in specs.iter().enumerate() {
                let input = inputs[*mask];
                let current: Vec<EquationId> = (0..i)
                    .filter(|&j| (*deps >> j) & 1 == 1)
                    .map(|j| equations[j])
                    .collect();
                let last: Vec<EquationId> = (0..specs.len())
                    .filter(|&j| (*last_deps >> j) & 1 == 1)
                    .map(|j| equations[j])
                    .collect();
                model
                    .set_equation_body(equations[i], move |ctx: &mut dyn EquationContext| {
                        let mut value = ctx.input(input);
                        for dep in &current {
                            value += ctx.result(*dep);
                        }
                        for dep in &last {
                            value += ctx.last_result(*dep);
                        }
                        value
                    })
                    .expect("body");
            }
            model.end_model_definition().expect("finalize");
            check_structure(&model);
        }
    }
}
