use crate::datetime::ExpandedDateTime;
use crate::handles::{EquationId, Index, IndexSetId, InputId, ParameterId};
use crate::model::{ParameterType, ParameterValue};
use nalgebra::DMatrix;

/// Signature of an equation body. The same closure serves both the dependency tracer and
/// the model run; see [`EquationContext`].
pub type EquationFn = dyn Fn(&mut dyn EquationContext) -> f64 + Send + Sync;

/// Value access available to equation bodies.
///
/// During `end_model_definition` every body is called once with a recording context that
/// returns placeholder values and notes what was accessed. A body therefore has to touch
/// every accessor it could possibly need, whatever branch it takes at run time, or the
/// inferred dependencies will be incomplete.
pub trait EquationContext {
    /// `indexes` overrides the innermost index sets of the parameter explicitly.
    fn parameter_value(
        &mut self,
        parameter: ParameterId,
        ty: ParameterType,
        indexes: &[Index],
    ) -> ParameterValue;

    fn input(&mut self, input: InputId) -> f64;

    fn input_was_provided(&mut self, input: InputId) -> bool;

    /// Result of the current timestep. An empty `indexes` means "same indexes as me".
    fn result_value(&mut self, equation: EquationId, indexes: &[Index]) -> f64;

    /// Result of the previous timestep.
    fn last_result_value(&mut self, equation: EquationId, indexes: &[Index]) -> f64;

    /// Result `steps_back` timesteps ago (0 is the current timestep). Reaching past the
    /// start of the run gives the initial value.
    fn earlier_result_value(
        &mut self,
        equation: EquationId,
        steps_back: u64,
        indexes: &[Index],
    ) -> f64;

    fn current_index(&mut self, index_set: IndexSetId) -> Index;

    fn index_count(&mut self, index_set: IndexSetId) -> u32;

    /// Number of indexes feeding into the current index of a branched index set.
    fn branch_input_count(&mut self, index_set: IndexSetId) -> usize;

    fn branch_input(&mut self, index_set: IndexSetId, n: usize) -> Index;

    /// -1 during the initial value pass.
    fn timestep(&self) -> i64;

    fn current_time(&self) -> ExpandedDateTime;

    // --- Typed shorthands ---

    fn parameter_f64(&mut self, parameter: ParameterId) -> f64 {
        self.parameter_value(parameter, ParameterType::Double, &[])
            .as_f64()
    }

    fn parameter_f64_at(&mut self, parameter: ParameterId, indexes: &[Index]) -> f64 {
        self.parameter_value(parameter, ParameterType::Double, indexes)
            .as_f64()
    }

    fn parameter_u64(&mut self, parameter: ParameterId) -> u64 {
        self.parameter_value(parameter, ParameterType::UInt, &[])
            .as_u64()
    }

    fn parameter_u64_at(&mut self, parameter: ParameterId, indexes: &[Index]) -> u64 {
        self.parameter_value(parameter, ParameterType::UInt, indexes)
            .as_u64()
    }

    fn parameter_bool(&mut self, parameter: ParameterId) -> bool {
        self.parameter_value(parameter, ParameterType::Bool, &[])
            .as_bool()
    }

    fn parameter_time(&mut self, parameter: ParameterId) -> i64 {
        self.parameter_value(parameter, ParameterType::Time, &[])
            .as_i64()
    }

    /// Position of the selected value in the enum's name list.
    fn parameter_enum(&mut self, parameter: ParameterId) -> u64 {
        self.parameter_value(parameter, ParameterType::Enum, &[])
            .as_u64()
    }

    fn result(&mut self, equation: EquationId) -> f64 {
        self.result_value(equation, &[])
    }

    fn result_at(&mut self, equation: EquationId, indexes: &[Index]) -> f64 {
        self.result_value(equation, indexes)
    }

    fn last_result(&mut self, equation: EquationId) -> f64 {
        self.last_result_value(equation, &[])
    }

    fn last_result_at(&mut self, equation: EquationId, indexes: &[Index]) -> f64 {
        self.last_result_value(equation, indexes)
    }

    fn earlier_result(&mut self, equation: EquationId, steps_back: u64) -> f64 {
        self.earlier_result_value(equation, steps_back, &[])
    }

    /// The input if the dataset provided it, otherwise the parameter.
    fn input_or_parameter(&mut self, input: InputId, parameter: ParameterId) -> f64 {
        let provided = self.input_was_provided(input);
        let value = self.input(input);
        let fallback = self.parameter_f64(parameter);
        if provided {
            value
        } else {
            fallback
        }
    }
}

/// The right-hand side of one solver batch.
pub trait OdeSystem {
    /// Evaluates dx/dt at `x`.
    fn evaluate(&mut self, x: &[f64], dxdt: &mut [f64]);

    /// Writes d(dx/dt)/dx at `x` into `jacobian` (n x n, already zeroed).
    fn jacobian(&mut self, x: &[f64], jacobian: &mut DMatrix<f64>);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    pub rel_err: f64,
    pub abs_err: f64,
}

/// An integration method advancing a batch over one model timestep, t in [0, 1].
pub trait OdeSolver: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Length of the scratch slice `solve` expects for a system of dimension `n`.
    fn workspace_size(&self, n: usize) -> usize;

    fn uses_error_control(&self) -> bool {
        false
    }

    fn uses_jacobian(&self) -> bool {
        false
    }

    /// x0: state at t = 0, overwritten with the state at t = 1.
    /// h: suggested step as a fraction of the timestep.
    fn solve(
        &self,
        h: f64,
        x0: &mut [f64],
        workspace: &mut [f64],
        system: &mut dyn OdeSystem,
        tolerances: Tolerances,
    );
}

/// Hooks for measuring a run. The default methods do nothing.
pub trait Profiler {
    fn equation_evaluated(&mut self, _equation: EquationId) {}

    fn timestep_finished(&mut self, _timestep: i64) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProfiler;

impl Profiler for NoProfiler {}
