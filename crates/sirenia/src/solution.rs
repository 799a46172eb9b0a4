use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SolverAlgorithm {
    /// Project/Split only (no neighbor pairs).
    #[default]
    ProjectOnly,
    /// Project/Split driven by QPSC gradient projection with diagonal scaling.
    QpscWithScaling,
    /// Project/Split driven by QPSC gradient projection without diagonal scaling.
    QpscWithoutScaling,
}

/// Diagnostics returned by [`crate::Solver::solve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    /// Constraints flagged unsatisfiable (cycles, contradicting equalities). Callers must check
    /// this; the remaining constraints are still satisfied.
    pub number_of_unsatisfiable_constraints: usize,
    pub outer_project_iterations: usize,
    pub inner_project_iterations_total: u64,
    pub min_inner_project_iterations: usize,
    pub max_inner_project_iterations: usize,
    pub max_constraint_tree_depth: usize,
    pub goal_function_value: f64,
    pub algorithm_used: SolverAlgorithm,
    pub time_limit_exceeded: bool,
    pub outer_project_iterations_limit_exceeded: bool,
    /// When set, the last Project pass was cut short and the result may be infeasible.
    pub inner_project_iterations_limit_exceeded: bool,
}

impl Default for Solution {
    fn default() -> Self {
        Self {
            number_of_unsatisfiable_constraints: 0,
            outer_project_iterations: 0,
            inner_project_iterations_total: 0,
            min_inner_project_iterations: usize::MAX,
            max_inner_project_iterations: 0,
            max_constraint_tree_depth: 0,
            goal_function_value: 0.0,
            algorithm_used: SolverAlgorithm::ProjectOnly,
            time_limit_exceeded: false,
            outer_project_iterations_limit_exceeded: false,
            inner_project_iterations_limit_exceeded: false,
        }
    }
}

impl Solution {
    pub fn execution_limit_exceeded(&self) -> bool {
        self.time_limit_exceeded
            || self.outer_project_iterations_limit_exceeded
            || self.inner_project_iterations_limit_exceeded
    }

    pub(crate) fn record_project_pass(&mut self, iterations: usize) {
        self.inner_project_iterations_total += iterations as u64;
        self.max_inner_project_iterations = self.max_inner_project_iterations.max(iterations);
        self.min_inner_project_iterations = self.min_inner_project_iterations.min(iterations);
    }

    /// Clamps the `usize::MAX` sentinel when no Project pass completed.
    pub(crate) fn finish(&mut self) {
        if self.min_inner_project_iterations > self.max_inner_project_iterations {
            self.min_inner_project_iterations = self.max_inner_project_iterations;
        }
    }
}
