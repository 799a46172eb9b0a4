//! String-keyed facade over [`Solver`] as used by layout pipelines.
//!
//! On top of the plain solver it knows about fixed variables (pinned with a huge weight) and
//! bounds. When constraints force fixed variables apart the shell relaxes the active gaps around
//! them and solves again.

use crate::constraint::ConstraintKey;
use crate::error::{Error, Result};
use crate::params::Parameters;
use crate::solution::Solution;
use crate::solver::Solver;
use crate::variable::{BoundedPosition, VariableId};
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use tracing::debug;

/// Weight given to fixed variables.
pub const FIXED_VAR_WEIGHT: f64 = 1e9;

/// A fixed variable closer than this to its pinned position has not moved.
const CLOSE_EPSILON: f64 = 0.0005;

/// Relaxing stops once no active gap around a moved fixed variable exceeds this.
const FAIL_TO_ADJUST_EPSILON: f64 = 0.001;

#[derive(Debug, Default)]
pub struct SolverShell {
    solver: Solver,
    variables: FxHashMap<String, VariableId>,
    /// Pinned position per fixed variable, including bound anchors.
    fixed_vars: IndexMap<VariableId, f64>,
    bounds: IndexMap<VariableId, BoundedPosition>,
    bounds_realized: bool,
    constraint_keys: BTreeSet<(ConstraintKey, bool)>,
    solution: Option<Solution>,
}

#[derive(Debug, Default)]
struct Span {
    range: Option<(f64, f64)>,
}

impl Span {
    fn add(&mut self, value: f64) {
        self.range = Some(match self.range {
            None => (value, value),
            Some((lo, hi)) => (lo.min(value), hi.max(value)),
        });
    }

    fn length(&self) -> f64 {
        self.range.map_or(0.0, |(lo, hi)| hi - lo)
    }
}

impl SolverShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable_with_ideal_position(
        &mut self,
        id: impl Into<String>,
        position: f64,
        weight: f64,
    ) -> Result<()> {
        let id = id.into();
        if self.variables.contains_key(&id) {
            return Err(Error::DuplicateVariable { id });
        }
        let v = self.solver.add_variable_with_weight(position, weight)?;
        self.variables.insert(id, v);
        Ok(())
    }

    /// Adds a variable that should stay at `position`.
    pub fn add_fixed_variable(&mut self, id: impl Into<String>, position: f64) -> Result<()> {
        let id = id.into();
        self.add_variable_with_ideal_position(id.clone(), position, FIXED_VAR_WEIGHT)?;
        let v = self.lookup(&id)?;
        self.fixed_vars.insert(v, position);
        Ok(())
    }

    /// Adds `left + gap <= right` (or `==`). Exact duplicates are ignored.
    pub fn add_left_right_separation_constraint(
        &mut self,
        left: &str,
        right: &str,
        gap: f64,
        is_equality: bool,
    ) -> Result<()> {
        let l = self.lookup(left)?;
        let r = self.lookup(right)?;
        let key = ConstraintKey {
            left: l,
            right: r,
            gap,
        };
        if self.constraint_keys.contains(&(key, is_equality)) {
            return Ok(());
        }
        if is_equality {
            self.solver.add_equality_constraint(l, r, gap)?;
        } else {
            self.solver.add_constraint(l, r, gap)?;
        }
        self.constraint_keys.insert((key, is_equality));
        Ok(())
    }

    #[cfg(feature = "qpsc")]
    pub fn add_goal_two_variables_are_close(
        &mut self,
        id1: &str,
        id2: &str,
        weight: f64,
    ) -> Result<()> {
        let a = self.lookup(id1)?;
        let b = self.lookup(id2)?;
        self.solver.add_neighbor_pair(a, b, weight)
    }

    /// Keeps the resolved position of `id` at or above `bound`.
    ///
    /// # Panics
    ///
    /// Panics if `bound` exceeds an upper bound already set for `id`.
    pub fn set_low_bound(&mut self, id: &str, bound: f64) -> Result<()> {
        let v = self.bound_target(id)?;
        self.bounds.entry(v).or_default().set_low_bound(bound);
        Ok(())
    }

    /// Keeps the resolved position of `id` at or below `bound`.
    ///
    /// # Panics
    ///
    /// Panics if `bound` is below a low bound already set for `id`.
    pub fn set_upper_bound(&mut self, id: &str, bound: f64) -> Result<()> {
        let v = self.bound_target(id)?;
        self.bounds.entry(v).or_default().set_upper_bound(bound);
        Ok(())
    }

    fn bound_target(&self, id: &str) -> Result<VariableId> {
        if self.bounds_realized {
            return Err(Error::SolverSealed);
        }
        self.lookup(id)
    }

    /// Solves, relaxing active gaps around fixed variables that were pushed away and solving
    /// again until they stay put. Returns `false` if an execution limit was hit.
    pub fn solve(&mut self, params: &Parameters) -> Result<bool> {
        self.realize_bounds()?;
        let mut rounds = 0usize;
        loop {
            rounds += 1;
            let solution = self.solver.solve(params);
            let limit_exceeded = solution.execution_limit_exceeded();
            self.solution = Some(solution);
            let fixed_vars_moved = self.adjust_constraints_for_moved_fixed_vars()?;
            if !fixed_vars_moved || limit_exceeded {
                debug!(rounds, limit_exceeded, "solver shell finished");
                return Ok(!limit_exceeded);
            }
        }
    }

    /// Anchors every bound with a fixed variable and a zero-gap constraint.
    fn realize_bounds(&mut self) -> Result<()> {
        if self.bounds_realized {
            return Ok(());
        }
        self.bounds_realized = true;
        let bounds: Vec<_> = self.bounds.iter().map(|(&v, b)| (v, *b)).collect();
        for (v, bounded) in bounds {
            let low = bounded.low_bound();
            if low.is_finite() {
                let anchor = self.solver.add_variable_with_weight(low, FIXED_VAR_WEIGHT)?;
                self.fixed_vars.insert(anchor, low);
                self.solver.add_constraint(anchor, v, 0.0)?;
            }
            let upper = bounded.upper_bound();
            if upper.is_finite() {
                let anchor = self
                    .solver
                    .add_variable_with_weight(upper, FIXED_VAR_WEIGHT)?;
                self.fixed_vars.insert(anchor, upper);
                self.solver.add_constraint(v, anchor, 0.0)?;
            }
        }
        Ok(())
    }

    fn adjust_constraints_for_moved_fixed_vars(&mut self) -> Result<bool> {
        let mut moved: IndexSet<VariableId> = self
            .fixed_vars
            .iter()
            .filter(|&(&v, &pinned)| {
                (pinned - self.solver.variable(v).actual_pos()).abs() >= CLOSE_EPSILON
            })
            .map(|(&v, _)| v)
            .collect();
        if moved.is_empty() {
            return Ok(false);
        }

        while let Some(&fixed) = moved.first() {
            let (block, adjusted) = self.adjust_constraints_of_neighbors_of_fixed_variable(fixed)?;
            if !adjusted || block.is_empty() {
                return Ok(false);
            }
            for v in block {
                moved.shift_remove(&v);
            }
        }
        Ok(true)
    }

    /// Shrinks the active gaps of the block holding `fixed` by the ratio between the current and
    /// ideal spread of its fixed variables.
    fn adjust_constraints_of_neighbors_of_fixed_variable(
        &mut self,
        fixed: VariableId,
    ) -> Result<(Vec<VariableId>, bool)> {
        let block = self.solver.block_variables(fixed).to_vec();
        let mut current = Span::default();
        let mut ideal = Span::default();
        let mut scale: f64 = 1.0;
        for &u in &block {
            if !self.fixed_vars.contains_key(&u) {
                continue;
            }
            let var = self.solver.variable(u);
            current.add(var.actual_pos());
            ideal.add(var.desired_pos());
            if ideal.length() > 0.0 {
                scale = scale.max(current.length() / ideal.length());
            }
        }
        if scale == 1.0 {
            scale = 2.0;
        }
        let adjusted = self.fix_active_constraints(&block, scale)?;
        Ok((block, adjusted))
    }

    fn fix_active_constraints(&mut self, block: &[VariableId], scale: f64) -> Result<bool> {
        let mut adjusted = false;
        for &v in block {
            let left_constraints = self.solver.variable(v).left_constraints().to_vec();
            for cid in left_constraints {
                let c = self.solver.constraint(cid);
                if !c.is_active() {
                    continue;
                }
                let gap = c.gap();
                if gap > FAIL_TO_ADJUST_EPSILON {
                    adjusted = true;
                }
                self.solver.set_constraint_update(cid, gap / scale)?;
            }
        }
        Ok(adjusted)
    }

    fn lookup(&self, id: &str) -> Result<VariableId> {
        self.variables
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownVariable { id: id.to_string() })
    }

    /// Solved position of `id`, clamped to its bounds.
    pub fn variable_resolved_position(&self, id: &str) -> Result<f64> {
        let v = self.lookup(id)?;
        let pos = self.solver.variable(v).actual_pos();
        Ok(match self.bounds.get(&v) {
            Some(bounded) => {
                let mut bounded = *bounded;
                bounded.set_position(pos);
                bounded.position()
            }
            None => pos,
        })
    }

    pub fn variable_ideal_position(&self, id: &str) -> Result<f64> {
        let v = self.lookup(id)?;
        Ok(self.solver.variable(v).desired_pos())
    }

    pub fn contains_variable(&self, id: &str) -> bool {
        self.variables.contains_key(id)
    }

    /// Diagnostics of the last solve round.
    pub fn solution(&self) -> Option<&Solution> {
        self.solution.as_ref()
    }

    pub fn solver(&self) -> &Solver {
        &self.solver
    }
}
