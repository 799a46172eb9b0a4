//! Blocks: sets of variables rigidly linked by active constraints.
//!
//! A block moves as one unit. For a member `i` with scale `s_i` and offset `o_i`, and a block with
//! scale `S` and reference position `Y`, the member position is `y_i = (S * Y + o_i) / s_i`. The
//! reference position is the weighted least-squares optimum over all members:
//!
//! ```text
//! a_i = S / s_i,  b_i = o_i / s_i
//! AD = Σ a_i d_i w_i,  AB = Σ a_i b_i w_i,  A2 = Σ a_i² w_i
//! Y  = (AD - AB) / A2
//! ```
//!
//! The active constraints of a block always form a spanning tree over its members.

use crate::constraint::{Constraint, ConstraintId, ConstraintVector};
use crate::variable::{Variable, VariableId};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlockId(pub(crate) usize);

impl BlockId {
    pub(crate) const UNASSIGNED: BlockId = BlockId(usize::MAX);
}

#[derive(Debug, Clone)]
pub(crate) struct Block {
    pub(crate) id: BlockId,
    pub(crate) variables: Vec<VariableId>,
    pub(crate) reference_pos: f64,
    pub(crate) scale: f64,
    sum_ad: f64,
    sum_ab: f64,
    sum_a2: f64,
    /// Slot in [`BlockVector`]'s dense list.
    pub(crate) vector_index: usize,
}

/// Borrowed solver state the block algorithms operate on.
pub(crate) struct BlockEnv<'a> {
    pub(crate) vars: &'a mut [Variable],
    pub(crate) constraints: &'a mut [Constraint],
    pub(crate) vector: &'a mut ConstraintVector,
    pub(crate) ws: &'a mut Workspace,
}

#[derive(Debug, Clone, Copy)]
struct DfDvFrame {
    var: VariableId,
    via: Option<ConstraintId>,
    depth: usize,
}

/// Scratch buffers grown with the variable count.
#[derive(Debug, Clone, Default)]
pub(crate) struct Workspace {
    dfdv: Vec<f64>,
    visited: Vec<bool>,
    in_set: Vec<bool>,
    parent: Vec<Option<ConstraintId>>,
    stack: Vec<DfDvFrame>,
    order: Vec<DfDvFrame>,
    connected: Vec<VariableId>,
    pub(crate) max_tree_depth: usize,
}

impl Workspace {
    pub(crate) fn ensure_len(&mut self, variable_count: usize) {
        if self.dfdv.len() < variable_count {
            self.dfdv.resize(variable_count, 0.0);
            self.visited.resize(variable_count, false);
            self.in_set.resize(variable_count, false);
            self.parent.resize(variable_count, None);
        }
    }
}

impl Block {
    pub(crate) fn empty() -> Self {
        Self {
            id: BlockId::UNASSIGNED,
            variables: Vec::new(),
            reference_pos: 0.0,
            scale: 1.0,
            sum_ad: 0.0,
            sum_ab: 0.0,
            sum_a2: 0.0,
            vector_index: 0,
        }
    }

    /// A block holding only `var`, positioned at its desired position.
    pub(crate) fn singleton(var: VariableId, vars: &mut [Variable]) -> Self {
        let mut b = Self::empty();
        b.add_variable(var, vars);
        b.update_reference_pos(vars);
        b
    }

    pub(crate) fn add_variable(&mut self, var: VariableId, vars: &mut [Variable]) {
        if self.variables.is_empty() {
            self.scale = vars[var.0].scale;
        }
        vars[var.0].block = self.id;
        self.variables.push(var);
        self.add_to_sums(&vars[var.0]);
    }

    fn add_to_sums(&mut self, v: &Variable) {
        let a = self.scale / v.scale;
        let b = v.offset_in_block / v.scale;
        let aw = a * v.weight;
        self.sum_ad += aw * v.desired_pos;
        self.sum_ab += aw * b;
        self.sum_a2 += aw * a;
    }

    /// Recomputes the sums from the members' current desired positions, weights and offsets.
    pub(crate) fn update_reference_pos(&mut self, vars: &mut [Variable]) {
        self.sum_ad = 0.0;
        self.sum_ab = 0.0;
        self.sum_a2 = 0.0;
        for &v in &self.variables {
            let var = &vars[v.0];
            let a = self.scale / var.scale;
            let aw = a * var.weight;
            self.sum_ad += aw * var.desired_pos;
            self.sum_ab += aw * (var.offset_in_block / var.scale);
            self.sum_a2 += aw * a;
        }
        self.update_reference_pos_from_sums(vars);
    }

    pub(crate) fn update_reference_pos_from_sums(&mut self, vars: &mut [Variable]) {
        self.reference_pos = (self.sum_ad - self.sum_ab) / self.sum_a2;
        debug_assert!(
            self.reference_pos.is_finite(),
            "block reference position is not finite"
        );
        let scaled_ref = self.scale * self.reference_pos;
        for &v in &self.variables {
            let var = &mut vars[v.0];
            var.actual_pos = (scaled_ref + var.offset_in_block) / var.scale;
        }
    }

    /// Computes the Lagrangian multiplier of every active constraint in the tree rooted at
    /// `root`. For a constraint reached from its left side the multiplier is the summed
    /// derivative of the subtree on its right; reached from its right side it is the negated sum
    /// of the subtree on its left.
    pub(crate) fn compute_dfdv(&self, root: VariableId, env: &mut BlockEnv<'_>) {
        let ws = &mut *env.ws;
        ws.stack.clear();
        ws.order.clear();
        ws.stack.push(DfDvFrame {
            var: root,
            via: None,
            depth: 1,
        });
        while let Some(frame) = ws.stack.pop() {
            if ws.visited[frame.var.0] {
                continue;
            }
            ws.visited[frame.var.0] = true;
            ws.order.push(frame);
            ws.max_tree_depth = ws.max_tree_depth.max(frame.depth);

            let v = &env.vars[frame.var.0];
            for &cid in &v.left_constraints {
                let c = &env.constraints[cid.0];
                if c.is_active && Some(cid) != frame.via {
                    ws.stack.push(DfDvFrame {
                        var: c.right,
                        via: Some(cid),
                        depth: frame.depth + 1,
                    });
                }
            }
            for &cid in &v.right_constraints {
                let c = &env.constraints[cid.0];
                if c.is_active && Some(cid) != frame.via {
                    ws.stack.push(DfDvFrame {
                        var: c.left,
                        via: Some(cid),
                        depth: frame.depth + 1,
                    });
                }
            }
        }

        for frame in &ws.order {
            ws.dfdv[frame.var.0] = env.vars[frame.var.0].dfdv();
            ws.visited[frame.var.0] = false;
        }
        // Pre-order reversed visits every child before its parent.
        for frame in ws.order.iter().rev() {
            let Some(cid) = frame.via else {
                continue;
            };
            let subtree = ws.dfdv[frame.var.0];
            let c = &mut env.constraints[cid.0];
            let parent = if c.right == frame.var {
                c.lagrangian = subtree;
                c.left
            } else {
                c.lagrangian = -subtree;
                c.right
            };
            ws.dfdv[parent.0] += subtree;
        }
    }

    /// Collects every variable reachable from `start` over active constraints into
    /// `env.ws.connected`.
    fn collect_connected(start: VariableId, env: &mut BlockEnv<'_>) {
        let ws = &mut *env.ws;
        ws.connected.clear();
        ws.stack.clear();
        ws.stack.push(DfDvFrame {
            var: start,
            via: None,
            depth: 0,
        });
        while let Some(frame) = ws.stack.pop() {
            if ws.visited[frame.var.0] {
                continue;
            }
            ws.visited[frame.var.0] = true;
            ws.connected.push(frame.var);
            let v = &env.vars[frame.var.0];
            for &cid in v.left_constraints.iter().chain(v.right_constraints.iter()) {
                let c = &env.constraints[cid.0];
                if !c.is_active {
                    continue;
                }
                let other = if c.left == frame.var { c.right } else { c.left };
                if !ws.visited[other.0] {
                    ws.stack.push(DfDvFrame {
                        var: other,
                        via: Some(cid),
                        depth: 0,
                    });
                }
            }
        }
        for &v in &ws.connected {
            ws.visited[v.0] = false;
        }
    }

    /// Finds the most negative multiplier below `threshold` among the active inequality
    /// constraints and splits there. Ties keep the first constraint met in member order.
    pub(crate) fn split(
        &mut self,
        is_qpsc: bool,
        threshold: f64,
        env: &mut BlockEnv<'_>,
    ) -> Option<Block> {
        if is_qpsc {
            // Desired positions moved with the gradient step.
            self.update_reference_pos(env.vars);
        }
        if self.variables.len() < 2 {
            return None;
        }

        self.compute_dfdv(self.variables[0], env);

        let mut min_lagrangian = threshold;
        let mut to_split: Option<ConstraintId> = None;
        for &v in &self.variables {
            for &cid in &env.vars[v.0].left_constraints {
                let c = &env.constraints[cid.0];
                if c.is_active && !c.is_equality && c.lagrangian < min_lagrangian {
                    min_lagrangian = c.lagrangian;
                    to_split = Some(cid);
                }
            }
        }

        let cid = to_split?;
        trace!(constraint = %cid, lagrangian = min_lagrangian, "split block");
        Some(self.split_on_constraint(cid, env))
    }

    /// Deactivates `cid` and moves the variables on its right side into a new block. Both blocks
    /// are repositioned.
    pub(crate) fn split_on_constraint(
        &mut self,
        cid: ConstraintId,
        env: &mut BlockEnv<'_>,
    ) -> Block {
        env.vector.deactivate(cid, env.constraints, env.vars);
        let right = env.constraints[cid.0].right;
        Self::collect_connected(right, env);

        let mut split_off = Block::empty();
        for &v in &env.ws.connected {
            env.ws.in_set[v.0] = true;
        }
        let in_set = &env.ws.in_set;
        self.variables.retain(|v| !in_set[v.0]);
        for &v in &env.ws.connected {
            split_off.add_variable(v, env.vars);
            env.ws.in_set[v.0] = false;
        }

        split_off.update_reference_pos(env.vars);
        self.update_reference_pos(env.vars);
        split_off
    }

    /// Resolves a violated constraint whose endpoints both already belong to this block.
    ///
    /// Walks the active path from the constraint's left to its right variable and deactivates
    /// the path constraint (traversed left to right, not an equality) with the smallest
    /// multiplier; the right side is then shifted by the violation and the violated constraint
    /// becomes active. Returns `false` and marks the constraint unsatisfiable when no such path
    /// constraint exists (a cycle or contradicting equalities).
    pub(crate) fn expand(&mut self, violated: ConstraintId, env: &mut BlockEnv<'_>) -> bool {
        let (left, right) = {
            let c = &env.constraints[violated.0];
            (c.left, c.right)
        };
        self.compute_dfdv(left, env);

        let mut to_split: Option<ConstraintId> = None;
        if Self::find_path(left, right, env) {
            let mut min_lagrangian = f64::MAX;
            let mut cur = right;
            while cur != left {
                let Some(cid) = env.ws.parent[cur.0] else {
                    break;
                };
                let c = &env.constraints[cid.0];
                let prev = if c.left == cur { c.right } else { c.left };
                let forward = c.left == prev && c.right == cur;
                if forward && !c.is_equality && c.lagrangian < min_lagrangian {
                    min_lagrangian = c.lagrangian;
                    to_split = Some(cid);
                }
                cur = prev;
            }
        }
        Self::clear_path(env);

        let Some(to_split) = to_split else {
            env.constraints[violated.0].is_unsatisfiable = true;
            trace!(constraint = %violated, "unsatisfiable constraint");
            return false;
        };

        trace!(violated = %violated, split = %to_split, "expand block");
        env.vector.deactivate(to_split, env.constraints, env.vars);
        Self::collect_connected(right, env);
        let violation = env.constraints[violated.0].violation(env.vars);
        for &v in &env.ws.connected {
            env.vars[v.0].offset_in_block += violation;
        }
        env.vector.activate(violated, env.constraints, env.vars);
        env.constraints[violated.0].lagrangian = 0.0;
        self.update_reference_pos(env.vars);
        true
    }

    /// Records, for every variable reachable from `from`, the active constraint it was reached
    /// through. Returns whether `to` was reached.
    fn find_path(from: VariableId, to: VariableId, env: &mut BlockEnv<'_>) -> bool {
        let ws = &mut *env.ws;
        ws.connected.clear();
        ws.stack.clear();
        ws.stack.push(DfDvFrame {
            var: from,
            via: None,
            depth: 0,
        });
        let mut found = false;
        while let Some(frame) = ws.stack.pop() {
            if ws.visited[frame.var.0] {
                continue;
            }
            ws.visited[frame.var.0] = true;
            ws.parent[frame.var.0] = frame.via;
            ws.connected.push(frame.var);
            if frame.var == to {
                found = true;
                break;
            }
            let v = &env.vars[frame.var.0];
            for &cid in v.left_constraints.iter().chain(v.right_constraints.iter()) {
                let c = &env.constraints[cid.0];
                if !c.is_active || Some(cid) == frame.via {
                    continue;
                }
                let other = if c.left == frame.var { c.right } else { c.left };
                if !ws.visited[other.0] {
                    ws.stack.push(DfDvFrame {
                        var: other,
                        via: Some(cid),
                        depth: 0,
                    });
                }
            }
        }
        found
    }

    fn clear_path(env: &mut BlockEnv<'_>) {
        let ws = &mut *env.ws;
        for &v in &ws.connected {
            ws.visited[v.0] = false;
            ws.parent[v.0] = None;
        }
        ws.connected.clear();
    }
}

/// Registry of live blocks.
///
/// Blocks live in an arena addressed by a stable [`BlockId`]; the dense `live` list supports O(1)
/// removal by swapping with the last entry, after which the moved block's `vector_index` is
/// rewritten in place.
#[derive(Debug, Clone, Default)]
pub(crate) struct BlockVector {
    slots: Vec<Block>,
    free: Vec<BlockId>,
    live: Vec<BlockId>,
}

impl BlockVector {
    pub(crate) fn add(&mut self, mut block: Block, vars: &mut [Variable]) -> BlockId {
        let id = self.free.pop().unwrap_or(BlockId(self.slots.len()));
        block.id = id;
        block.vector_index = self.live.len();
        for &v in &block.variables {
            vars[v.0].block = id;
        }
        self.live.push(id);
        if id.0 == self.slots.len() {
            self.slots.push(block);
        } else {
            self.slots[id.0] = block;
        }
        id
    }

    pub(crate) fn remove(&mut self, id: BlockId) {
        let ix = self.slots[id.0].vector_index;
        debug_assert_eq!(self.live[ix], id);
        self.live.swap_remove(ix);
        if let Some(&moved) = self.live.get(ix) {
            self.slots[moved.0].vector_index = ix;
        }
        let slot = &mut self.slots[id.0];
        slot.variables.clear();
        slot.id = BlockId::UNASSIGNED;
        self.free.push(id);
    }

    pub(crate) fn count(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn item(&self, index: usize) -> BlockId {
        self.live[index]
    }

    pub(crate) fn get(&self, id: BlockId) -> &Block {
        &self.slots[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.slots[id.0]
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live.clear();
    }
}
