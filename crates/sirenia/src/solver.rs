//! The Project/Split state machine.
//!
//! `Project` merges blocks (or expands one) until no inactive constraint is violated by more than
//! the gap tolerance. `Split` then lets every block release the active constraint whose
//! Lagrangian multiplier is most negative. The outer loop alternates the two until a Split pass
//! changes nothing. With neighbor pairs (or `force_qpsc`) each outer iteration is additionally
//! driven by a diagonally scaled gradient step (the `qpsc` module).

use crate::block::{Block, BlockEnv, BlockId, BlockVector, Workspace};
use crate::constraint::{Constraint, ConstraintId, ConstraintVector};
use crate::error::{Error, Result};
use crate::params::Parameters;
#[cfg(feature = "qpsc")]
use crate::qpsc::Qpsc;
use crate::solution::Solution;
#[cfg(feature = "qpsc")]
use crate::solution::SolverAlgorithm;
use crate::variable::{self, Variable, VariableId};
use crate::violation_cache::ViolationCache;
use indexmap::IndexMap;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Violations must beat the current maximum by more than this to replace it.
const DISTANCE_EPSILON: f64 = 1e-6;

fn greater_dist_eps(a: f64, b: f64) -> bool {
    a - b > DISTANCE_EPSILON
}

#[derive(Debug, Clone, Default)]
pub struct Solver {
    variables: Vec<Variable>,
    constraints: Vec<Constraint>,
    equality_constraints: Vec<ConstraintId>,
    constraint_vector: ConstraintVector,
    blocks: BlockVector,
    workspace: Workspace,

    violation_cache: ViolationCache,
    last_modified_block: Option<BlockId>,
    violation_cache_min_block_cutoff: f64,

    /// Pending gap per constraint, in the order first requested.
    updated_constraints: IndexMap<ConstraintId, f64>,
    has_neighbor_pairs: bool,
    variables_edited: bool,
    sealed: bool,

    // Per-solve state.
    params: Parameters,
    solution: Solution,
    is_qpsc: bool,
    started: Option<Instant>,
    #[cfg(feature = "qpsc")]
    qpsc: Option<Qpsc>,
}

impl Solver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable with weight 1 and scale 1.
    pub fn add_variable(&mut self, desired_pos: f64) -> Result<VariableId> {
        self.add_variable_with_scale(desired_pos, 1.0, 1.0)
    }

    pub fn add_variable_with_weight(
        &mut self,
        desired_pos: f64,
        weight: f64,
    ) -> Result<VariableId> {
        self.add_variable_with_scale(desired_pos, weight, 1.0)
    }

    /// Higher weights make the variable less likely to move; `scale` is a diagonal-scaling
    /// factor applied to the position when constraints are evaluated.
    pub fn add_variable_with_scale(
        &mut self,
        desired_pos: f64,
        weight: f64,
        scale: f64,
    ) -> Result<VariableId> {
        if self.sealed {
            return Err(Error::SolverSealed);
        }
        let id = VariableId(self.variables.len());
        self.variables.push(Variable::new(id, desired_pos, weight, scale)?);
        self.workspace.ensure_len(self.variables.len());
        let block = Block::singleton(id, &mut self.variables);
        self.blocks.add(block, &mut self.variables);
        Ok(id)
    }

    /// Adds `left + gap <= right`.
    pub fn add_constraint(
        &mut self,
        left: VariableId,
        right: VariableId,
        gap: f64,
    ) -> Result<ConstraintId> {
        self.add_constraint_impl(left, right, gap, false)
    }

    /// Adds `left + gap == right`. Equalities are merged first and never split.
    pub fn add_equality_constraint(
        &mut self,
        left: VariableId,
        right: VariableId,
        gap: f64,
    ) -> Result<ConstraintId> {
        self.add_constraint_impl(left, right, gap, true)
    }

    fn add_constraint_impl(
        &mut self,
        left: VariableId,
        right: VariableId,
        gap: f64,
        is_equality: bool,
    ) -> Result<ConstraintId> {
        if self.sealed {
            return Err(Error::SolverSealed);
        }
        self.check_variable(left)?;
        self.check_variable(right)?;
        if left == right {
            return Err(Error::SelfConstraint { variable: left });
        }
        check_gap(gap)?;

        let id = ConstraintId(self.constraints.len());
        self.constraints
            .push(Constraint::new(left, right, gap, is_equality));
        self.variables[left.0].left_constraints.push(id);
        self.variables[right.0].right_constraints.push(id);
        if is_equality {
            self.equality_constraints.push(id);
        }
        Ok(id)
    }

    /// Adds a `weight * (x1 - x2)^2` closeness goal. Any neighbor pair switches the solve to QPSC.
    #[cfg(feature = "qpsc")]
    pub fn add_neighbor_pair(
        &mut self,
        variable1: VariableId,
        variable2: VariableId,
        weight: f64,
    ) -> Result<()> {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(Error::InvalidNeighborWeight { weight });
        }
        self.check_variable(variable1)?;
        self.check_variable(variable2)?;
        if variable1 == variable2 {
            return Err(Error::SelfNeighbor {
                variable: variable1,
            });
        }
        self.variables[variable1.0].add_neighbor(variable2, weight);
        self.variables[variable2.0].add_neighbor(variable1, weight);
        self.has_neighbor_pairs = true;
        Ok(())
    }

    /// Registers a new gap for `constraint`; it is applied by the next [`Solver::solve`] so
    /// positions stay untouched until then. The last update before a solve wins.
    pub fn set_constraint_update(&mut self, constraint: ConstraintId, gap: f64) -> Result<()> {
        let current = self
            .constraints
            .get(constraint.0)
            .ok_or(Error::UnknownConstraint { id: constraint })?
            .gap;
        check_gap(gap)?;
        if gap == current {
            self.updated_constraints.shift_remove(&constraint);
        } else {
            self.updated_constraints.insert(constraint, gap);
        }
        Ok(())
    }

    pub fn set_variable_desired_pos(&mut self, id: VariableId, desired_pos: f64) -> Result<()> {
        self.check_variable(id)?;
        let v = &mut self.variables[id.0];
        variable::validate(desired_pos, v.weight, v.scale)?;
        v.desired_pos = desired_pos;
        self.variables_edited = true;
        Ok(())
    }

    pub fn set_variable_weight(&mut self, id: VariableId, weight: f64) -> Result<()> {
        self.check_variable(id)?;
        let v = &mut self.variables[id.0];
        variable::validate(v.desired_pos, weight, v.scale)?;
        v.weight = weight;
        self.variables_edited = true;
        Ok(())
    }

    /// Recomputes every block's reference position from the current desired positions and
    /// weights. [`Solver::solve`] does this itself after `set_variable_*` calls.
    pub fn update_variables(&mut self) {
        for i in 0..self.blocks.count() {
            let id = self.blocks.item(i);
            self.blocks.get_mut(id).update_reference_pos(&mut self.variables);
        }
        self.variables_edited = false;
    }

    /// # Panics
    ///
    /// Panics if `id` was not issued by this solver.
    pub fn variable(&self, id: VariableId) -> &Variable {
        &self.variables[id.0]
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    /// # Panics
    ///
    /// Panics if `id` was not issued by this solver.
    pub fn constraint(&self, id: ConstraintId) -> &Constraint {
        &self.constraints[id.0]
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    /// Current violation of `id` (`> 0` means violated).
    pub fn violation(&self, id: ConstraintId) -> f64 {
        self.constraints[id.0].violation(&self.variables)
    }

    /// Members of the block currently holding `id`.
    pub fn block_variables(&self, id: VariableId) -> &[VariableId] {
        &self.blocks.get(self.variables[id.0].block).variables
    }

    pub fn block_count(&self) -> usize {
        self.blocks.count()
    }

    pub fn has_neighbor_pairs(&self) -> bool {
        self.has_neighbor_pairs
    }

    fn check_variable(&self, id: VariableId) -> Result<()> {
        if id.0 < self.variables.len() {
            Ok(())
        } else {
            Err(Error::UnknownVariable { id: id.to_string() })
        }
    }

    /// Moves every variable to the position that minimally satisfies the constraints.
    ///
    /// The first call seals the solver: variables and constraints can no longer be added, but
    /// gaps can be updated with [`Solver::set_constraint_update`] and the solve repeated.
    pub fn solve(&mut self, params: &Parameters) -> Solution {
        let mut params = params.clone();
        params.resolve_limits(self.variables.len(), self.constraints.len());
        self.params = params;
        self.solution = Solution::default();
        self.started = Some(Instant::now());
        self.workspace.max_tree_depth = 0;
        self.is_qpsc = self.wants_qpsc();

        let is_resolve = self.sealed;
        if self.variables_edited {
            self.update_variables();
        }
        self.check_for_updated_constraints();

        if self.constraints.is_empty() {
            if !self.is_qpsc {
                self.solution.finish();
                return std::mem::take(&mut self.solution);
            }
        } else if !is_resolve {
            self.setup_constraints();
        }
        if self.is_qpsc && is_resolve {
            // Block offsets were computed in the previous run's scaled space.
            self.reinitialize_blocks();
        }

        self.merge_equality_constraints();

        if self.is_qpsc {
            #[cfg(feature = "qpsc")]
            self.solve_qpsc();
        } else {
            self.solve_by_standalone_project();
            self.solution.goal_function_value = self.standalone_goal_function_value();
        }

        self.solution.finish();
        self.solution.number_of_unsatisfiable_constraints = self
            .constraints
            .iter()
            .filter(|c| c.is_unsatisfiable)
            .count();
        self.solution.max_constraint_tree_depth = self.workspace.max_tree_depth;

        debug!(
            algorithm = ?self.solution.algorithm_used,
            variables = self.variables.len(),
            constraints = self.constraints.len(),
            blocks = self.blocks.count(),
            outer = self.solution.outer_project_iterations,
            inner_total = self.solution.inner_project_iterations_total,
            unsatisfiable = self.solution.number_of_unsatisfiable_constraints,
            limit_exceeded = self.solution.execution_limit_exceeded(),
            "projection solve finished"
        );
        std::mem::take(&mut self.solution)
    }

    #[cfg(feature = "qpsc")]
    fn wants_qpsc(&self) -> bool {
        self.has_neighbor_pairs || self.params.advanced.force_qpsc
    }

    #[cfg(not(feature = "qpsc"))]
    fn wants_qpsc(&self) -> bool {
        false
    }

    fn check_for_updated_constraints(&mut self) {
        if self.updated_constraints.is_empty() {
            return;
        }
        // Under QPSC the reference positions derive from desired positions that were restored
        // after the last run, so the block structure is rebuilt.
        let mut must_reinitialize = self.is_qpsc;
        for (cid, gap) in std::mem::take(&mut self.updated_constraints) {
            let c = &mut self.constraints[cid.0];
            c.update_gap(gap);
            if !must_reinitialize && !c.is_equality {
                self.split_on_constraint_if_active(cid);
                continue;
            }
            must_reinitialize = true;
        }
        if must_reinitialize {
            self.reinitialize_blocks();
        }
    }

    fn split_on_constraint_if_active(&mut self, cid: ConstraintId) {
        if !self.constraints[cid.0].is_active {
            return;
        }
        let block = self.variables[self.constraints[cid.0].left.0].block;
        let mut env = BlockEnv {
            vars: &mut self.variables,
            constraints: &mut self.constraints,
            vector: &mut self.constraint_vector,
            ws: &mut self.workspace,
        };
        let split_off = self.blocks.get_mut(block).split_on_constraint(cid, &mut env);
        self.blocks.add(split_off, &mut self.variables);
    }

    fn setup_constraints(&mut self) {
        self.constraint_vector = ConstraintVector::create(&mut self.constraints);

        // Few blocks make the cache overhead outweigh its benefit; so do many merges.
        let advanced = &self.params.advanced;
        self.violation_cache_min_block_cutoff = f64::MAX;
        if advanced.use_violation_cache && advanced.violation_cache_min_blocks_divisor > 0 {
            self.violation_cache_min_block_cutoff = (self.blocks.count() as f64
                / advanced.violation_cache_min_blocks_divisor as f64)
                .min(advanced.violation_cache_min_blocks_count as f64);
        }
        self.sealed = true;
    }

    /// Puts every variable back into its own block at its desired position, with every
    /// constraint inactive and satisfiable.
    fn reinitialize_blocks(&mut self) {
        self.blocks.clear();
        for ordinal in 0..self.variables.len() {
            self.variables[ordinal].reinitialize();
            let block = Block::singleton(VariableId(ordinal), &mut self.variables);
            self.blocks.add(block, &mut self.variables);
        }
        self.constraint_vector.reinitialize(&mut self.constraints);
        self.violation_cache.clear();
    }

    fn merge_equality_constraints(&mut self) {
        for ix in 0..self.equality_constraints.len() {
            let cid = self.equality_constraints[ix];
            let c = &self.constraints[cid.0];
            if self.variables[c.left.0].block == self.variables[c.right.0].block {
                // Already joined by a chain of equalities that always moves as a unit.
                if c.violation(&self.variables).abs() > self.params.gap_tolerance {
                    trace!(constraint = %cid, "conflicting equality constraint");
                    self.constraints[cid.0].is_unsatisfiable = true;
                }
                continue;
            }
            self.merge_blocks(cid);
        }
    }

    fn solve_by_standalone_project(&mut self) {
        // Limits are checked after Project and before Split, so stopping is always feasible.
        loop {
            if !self.run_project() {
                return;
            }
            if !self.split_blocks() {
                break;
            }
        }
    }

    #[cfg(feature = "qpsc")]
    fn solve_qpsc(&mut self) {
        self.solution.algorithm_used = if self.params.advanced.scale_in_qpsc {
            SolverAlgorithm::QpscWithScaling
        } else {
            SolverAlgorithm::QpscWithoutScaling
        };

        // Start from a feasible state.
        if !self.run_project() {
            return;
        }

        let variable_count = self.variables.len();
        let mut qpsc = match self.qpsc.take() {
            Some(mut qpsc) => {
                qpsc.reset(&self.params, variable_count);
                qpsc
            }
            None => Qpsc::new(&self.params, variable_count),
        };
        for var in self.variables.iter_mut() {
            qpsc.add_variable(var);
        }
        qpsc.variables_complete(&mut self.variables);
        self.reinitialize_blocks();
        self.merge_equality_constraints();

        let mut found_split = false;
        loop {
            if !qpsc.pre_project(&mut self.variables) && !found_split {
                break;
            }
            found_split = self.split_blocks();
            if !self.run_project() {
                break;
            }
            if !qpsc.post_project(&self.variables) && !found_split {
                break;
            }
        }

        self.solution.goal_function_value = qpsc.complete(&mut self.variables);
        self.qpsc = Some(qpsc);
    }

    fn run_project(&mut self) -> bool {
        self.solution.outer_project_iterations += 1;
        self.project();
        !self.check_for_limits_exceeded()
    }

    fn check_for_limits_exceeded(&mut self) -> bool {
        if self.params.time_limit_ms > 0 {
            let elapsed = self.started.map_or(0, |started| started.elapsed().as_millis());
            if elapsed >= self.params.time_limit_ms as u128 {
                self.solution.time_limit_exceeded = true;
                return true;
            }
        }
        let outer_limit = self.params.outer_project_iterations_limit;
        if outer_limit > 0 && self.solution.outer_project_iterations >= outer_limit as usize {
            self.solution.outer_project_iterations_limit_exceeded = true;
            return true;
        }
        self.solution.inner_project_iterations_limit_exceeded
    }

    fn standalone_goal_function_value(&self) -> f64 {
        // x'Ax/2 + b'x with A = diag(2w) and b = -2wd.
        self.variables
            .iter()
            .map(|v| {
                v.weight * v.actual_pos * v.actual_pos
                    - 2.0 * v.weight * v.desired_pos * v.actual_pos
            })
            .sum()
    }

    fn use_violation_cache(&self) -> bool {
        self.blocks.count() as f64 > self.violation_cache_min_block_cutoff
    }

    /// Resolves violated constraints until none remains or the inner limit is hit. Returns
    /// whether any violation was found.
    fn project(&mut self) -> bool {
        if self.constraints.is_empty() {
            return false;
        }

        self.violation_cache.clear();
        self.last_modified_block = None;
        let mut use_cache = self.use_violation_cache();
        let mut iterations = 1usize;
        let Some(mut cid) = self.get_max_violated_constraint(use_cache) else {
            return false;
        };

        loop {
            let (left, right) = {
                let c = &self.constraints[cid.0];
                (c.left, c.right)
            };
            let left_block = self.variables[left.0].block;
            if left_block == self.variables[right.0].block {
                let mut env = BlockEnv {
                    vars: &mut self.variables,
                    constraints: &mut self.constraints,
                    vector: &mut self.constraint_vector,
                    ws: &mut self.workspace,
                };
                if !self.blocks.get_mut(left_block).expand(cid, &mut env) {
                    self.violation_cache.clear();
                }
                self.last_modified_block = Some(left_block);
            } else {
                self.last_modified_block = Some(self.merge_blocks(cid));
            }

            let inner_limit = self.params.inner_project_iterations_limit;
            if inner_limit > 0 && iterations >= inner_limit as usize {
                warn!(
                    iterations,
                    "inner project iteration limit reached; constraints may remain violated"
                );
                self.solution.inner_project_iterations_limit_exceeded = true;
                break;
            }

            use_cache = self.use_violation_cache();
            if !use_cache {
                self.violation_cache.clear();
            }
            iterations += 1;
            match self.get_max_violated_constraint(use_cache) {
                Some(next) => cid = next,
                None => break,
            }
        }

        self.solution.record_project_pass(iterations);
        true
    }

    /// Moves the variables of the smaller block into the larger one so that `cid` becomes tight,
    /// then activates it. Returns the surviving block.
    fn merge_blocks(&mut self, cid: ConstraintId) -> BlockId {
        let c = &self.constraints[cid.0];
        let (left, right) = (&self.variables[c.left.0], &self.variables[c.right.0]);
        let mut block_to = left.block;
        let mut block_from = right.block;
        debug_assert_ne!(block_to, block_from, "merging a block with itself");

        let mut distance = left.offset_in_block + c.gap - right.offset_in_block;
        if self.blocks.get(block_from).variables.len() > self.blocks.get(block_to).variables.len() {
            std::mem::swap(&mut block_to, &mut block_from);
            distance = -distance;
        }
        trace!(constraint = %cid, distance, "merge blocks");

        let moved = std::mem::take(&mut self.blocks.get_mut(block_from).variables);
        let target = self.blocks.get_mut(block_to);
        for v in moved {
            self.variables[v.0].offset_in_block += distance;
            target.add_variable(v, &mut self.variables);
        }
        target.update_reference_pos_from_sums(&mut self.variables);

        self.constraint_vector
            .activate(cid, &mut self.constraints, &mut self.variables);
        self.blocks.remove(block_from);
        block_to
    }

    /// Lets every block split once; new blocks join after the pass.
    fn split_blocks(&mut self) -> bool {
        let threshold = self.params.advanced.min_split_lagrangian_threshold;
        let mut new_blocks = Vec::new();
        for i in 0..self.blocks.count() {
            let id = self.blocks.item(i);
            let mut env = BlockEnv {
                vars: &mut self.variables,
                constraints: &mut self.constraints,
                vector: &mut self.constraint_vector,
                ws: &mut self.workspace,
            };
            let split_off = self.blocks.get_mut(id).split(self.is_qpsc, threshold, &mut env);
            if let Some(split_off) = split_off {
                new_blocks.push(split_off);
            }
        }
        let found = !new_blocks.is_empty();
        for block in new_blocks {
            self.blocks.add(block, &mut self.variables);
        }
        found
    }

    fn get_max_violated_constraint(&mut self, use_cache: bool) -> Option<ConstraintId> {
        let max_violation = self.params.gap_tolerance;
        if use_cache {
            if let Some(block) = self.last_modified_block {
                if let Some(found) = self.search_violation_cache(max_violation, block) {
                    return Some(found);
                }
            }
        }
        self.search_all_constraints(max_violation, use_cache)
    }

    /// Rescans only the constraints touching `block` and compares them with the cached
    /// violations from the last full scan.
    fn search_violation_cache(
        &mut self,
        mut max_violation: f64,
        block: BlockId,
    ) -> Option<ConstraintId> {
        if !self
            .violation_cache
            .filter_block(block, &self.constraints, &self.variables)
        {
            return None;
        }

        let mut max_violated: Option<ConstraintId> = None;
        let members = &self.blocks.get(block).variables;
        for &v in members {
            let var = &self.variables[v.0];
            let outgoing = var.left_constraints.iter().map(|&cid| (cid, true));
            let incoming = var.right_constraints.iter().map(|&cid| (cid, false));
            for (cid, is_left) in outgoing.chain(incoming) {
                let c = &self.constraints[cid.0];
                if c.is_active || c.is_unsatisfiable {
                    continue;
                }
                // Intra-block constraints are seen from their left side only.
                if !is_left && self.variables[c.left.0].block == block {
                    continue;
                }
                let violation = c.violation(&self.variables);
                if greater_dist_eps(violation, max_violation) {
                    if max_violation > self.violation_cache.low_violation {
                        if let Some(prev) = max_violated {
                            self.violation_cache.insert(
                                prev,
                                max_violation,
                                &self.constraints,
                                &self.variables,
                            );
                        }
                    }
                    max_violation = violation;
                    max_violated = Some(cid);
                }
            }
        }

        let cached =
            self.violation_cache.find_if_greater(max_violation, &self.constraints, &self.variables);
        if let Some(cached) = cached {
            if max_violation > self.violation_cache.low_violation {
                if let Some(prev) = max_violated {
                    self.violation_cache
                        .insert(prev, max_violation, &self.constraints, &self.variables);
                }
            }
            max_violated = Some(cached);
        }
        max_violated
    }

    /// Scans every inactive constraint, refilling the cache with the runners-up.
    fn search_all_constraints(
        &mut self,
        mut max_violation: f64,
        use_cache: bool,
    ) -> Option<ConstraintId> {
        self.violation_cache.clear();
        let mut max_violated: Option<ConstraintId> = None;
        for &cid in self.constraint_vector.inactive() {
            let c = &self.constraints[cid.0];
            if c.is_unsatisfiable {
                continue;
            }
            let violation = c.violation(&self.variables);

            let mut cache_insert: Option<(ConstraintId, f64)> = None;
            if greater_dist_eps(violation, max_violation) {
                if max_violation > self.violation_cache.low_violation {
                    cache_insert = max_violated.map(|prev| (prev, max_violation));
                }
                max_violation = violation;
                max_violated = Some(cid);
            }

            if !use_cache {
                continue;
            }
            if cache_insert.is_none()
                && max_violated != Some(cid)
                && (!self.violation_cache.is_full()
                    || violation > self.violation_cache.low_violation)
            {
                cache_insert = Some((cid, violation));
            }
            if let Some((insert, insert_violation)) = cache_insert {
                if insert_violation > self.violation_cache.low_violation {
                    self.violation_cache.insert(
                        insert,
                        insert_violation,
                        &self.constraints,
                        &self.variables,
                    );
                }
            }
        }
        max_violated
    }
}

fn check_gap(gap: f64) -> Result<()> {
    if gap.is_finite() && gap >= 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidGap { gap })
    }
}
