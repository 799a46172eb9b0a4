//! Per-solve tuning parameters.
//!
//! `Parameters` is passed explicitly to [`crate::Solver::solve`]; nothing is read from process-wide
//! state. It can be deserialized from a JSON configuration document whose keys mirror the field
//! names in camelCase. Missing keys keep their defaults.

use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Parameters {
    /// Accepted slack on constraint gaps. A violation greater than this is a violation; equal or
    /// below is not. Larger values trade accuracy for fewer merges.
    pub gap_tolerance: f64,

    /// QPSC is considered converged when the absolute change of the goal-function value between
    /// two iterations drops below this value.
    pub qpsc_convergence_epsilon: f64,

    /// QPSC is considered converged when the change of the goal-function value divided by the
    /// previous value drops below this quotient.
    pub qpsc_convergence_quotient: f64,

    /// Maximum number of outer Project/Split iterations. Negative values are replaced with a
    /// bound derived from the variable count; 0 means unlimited.
    ///
    /// Stopping on this limit still yields a feasible result.
    pub outer_project_iterations_limit: i32,

    /// Maximum number of merge/expand steps within one Project pass. Negative values are replaced
    /// with a bound derived from the constraint count; 0 means unlimited.
    ///
    /// Stopping on this limit may leave constraints violated. Callers that set it must check
    /// [`crate::Solution::inner_project_iterations_limit_exceeded`].
    pub inner_project_iterations_limit: i32,

    /// Wall-clock budget in milliseconds, checked between outer iterations only. Values `<= 0`
    /// mean unlimited. Stopping on this limit still yields a feasible result.
    pub time_limit_ms: i64,

    pub advanced: AdvancedParameters,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            gap_tolerance: 1e-4,
            qpsc_convergence_epsilon: 1e-5,
            qpsc_convergence_quotient: 1e-6,
            outer_project_iterations_limit: -1,
            inner_project_iterations_limit: -1,
            time_limit_ms: -1,
            advanced: AdvancedParameters::default(),
        }
    }
}

impl Parameters {
    /// Parses a JSON configuration document.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parses an already decoded JSON value (e.g. a sub-object of a larger layout config).
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub(crate) fn resolve_limits(&mut self, variable_count: usize, constraint_count: usize) {
        if self.outer_project_iterations_limit < 0 {
            self.outer_project_iterations_limit = 100 * (floor_log2(variable_count) + 1);
        }
        if self.inner_project_iterations_limit < 0 {
            let twice = i32::try_from(constraint_count.saturating_mul(2)).unwrap_or(i32::MAX);
            self.inner_project_iterations_limit =
                twice.saturating_add(100 * (floor_log2(constraint_count).max(0) + 1));
        }
    }
}

fn floor_log2(n: usize) -> i32 {
    if n == 0 {
        // log2(0) is -inf upstream; the outer bound then collapses to 0 ("unlimited").
        return -1;
    }
    (usize::BITS - 1 - n.leading_zeros()) as i32
}

/// Advanced switches, mostly for debugging and performance experiments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdvancedParameters {
    /// Run the QPSC gradient projection even without neighbor pairs.
    pub force_qpsc: bool,

    /// Use diagonal scaling inside QPSC.
    pub scale_in_qpsc: bool,

    /// Any Lagrangian multiplier below (more negative than) this value causes a block split.
    pub min_split_lagrangian_threshold: f64,

    pub use_violation_cache: bool,

    /// The cache is enabled while the block count is above
    /// `min(initial_blocks / divisor, violation_cache_min_blocks_count)`.
    pub violation_cache_min_blocks_divisor: usize,

    pub violation_cache_min_blocks_count: usize,
}

impl Default for AdvancedParameters {
    fn default() -> Self {
        Self {
            force_qpsc: false,
            scale_in_qpsc: true,
            min_split_lagrangian_threshold: -1e-7,
            use_violation_cache: true,
            violation_cache_min_blocks_divisor: 10,
            violation_cache_min_blocks_count: 100,
        }
    }
}
