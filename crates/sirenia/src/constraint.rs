//! Separation constraints and the active/inactive partition over them.

use crate::variable::{Variable, VariableId};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstraintId(pub(crate) usize);

impl ConstraintId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// `left + gap <= right` (or `==` for equalities), evaluated on scaled positions.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub(crate) left: VariableId,
    pub(crate) right: VariableId,
    pub(crate) gap: f64,
    pub(crate) is_equality: bool,
    pub(crate) lagrangian: f64,
    pub(crate) is_active: bool,
    pub(crate) is_unsatisfiable: bool,
    /// Slot in [`ConstraintVector`].
    pub(crate) vector_index: usize,
}

impl Constraint {
    pub(crate) fn new(left: VariableId, right: VariableId, gap: f64, is_equality: bool) -> Self {
        Self {
            left,
            right,
            gap,
            is_equality,
            lagrangian: 0.0,
            is_active: false,
            is_unsatisfiable: false,
            vector_index: 0,
        }
    }

    pub fn left(&self) -> VariableId {
        self.left
    }

    pub fn right(&self) -> VariableId {
        self.right
    }

    pub fn gap(&self) -> f64 {
        self.gap
    }

    pub fn is_equality(&self) -> bool {
        self.is_equality
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_unsatisfiable(&self) -> bool {
        self.is_unsatisfiable
    }

    /// Negative values mean deactivating this constraint would lower the goal function.
    pub fn lagrangian(&self) -> f64 {
        self.lagrangian
    }

    pub fn key(&self) -> ConstraintKey {
        ConstraintKey {
            left: self.left,
            right: self.right,
            gap: self.gap,
        }
    }

    /// `> 0` means violated.
    pub fn violation(&self, vars: &[Variable]) -> f64 {
        let l = &vars[self.left.0];
        let r = &vars[self.right.0];
        l.actual_pos * l.scale + (self.gap - r.actual_pos * r.scale)
    }

    pub(crate) fn set_active_state(
        &mut self,
        active: bool,
        new_index: usize,
        vars: &mut [Variable],
    ) {
        debug_assert_ne!(self.is_active, active, "constraint already in requested state");
        self.is_active = active;
        self.vector_index = new_index;
        if active {
            vars[self.left.0].active_constraint_count += 1;
            vars[self.right.0].active_constraint_count += 1;
        } else {
            vars[self.left.0].active_constraint_count -= 1;
            vars[self.right.0].active_constraint_count -= 1;
        }
    }

    pub(crate) fn reinitialize(&mut self) {
        self.is_active = false;
        self.is_unsatisfiable = false;
        self.lagrangian = 0.0;
    }

    pub(crate) fn update_gap(&mut self, gap: f64) {
        self.gap = gap;
    }
}

/// `(left, right, gap)` ordering used to sort and deduplicate constraints.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintKey {
    pub left: VariableId,
    pub right: VariableId,
    pub gap: f64,
}

impl PartialEq for ConstraintKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ConstraintKey {}

impl PartialOrd for ConstraintKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConstraintKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.left
            .cmp(&other.left)
            .then(self.right.cmp(&other.right))
            .then(self.gap.total_cmp(&other.gap))
    }
}

/// Every constraint id, with all inactive constraints stored before all active ones so a
/// violation scan can stop at the first active entry.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConstraintVector {
    vector: Vec<ConstraintId>,
    first_active: usize,
}

impl ConstraintVector {
    pub(crate) fn create(constraints: &mut [Constraint]) -> Self {
        let mut vector = Vec::with_capacity(constraints.len());
        for (ix, c) in constraints.iter_mut().enumerate() {
            debug_assert!(!c.is_active);
            c.vector_index = ix;
            vector.push(ConstraintId(ix));
        }
        let first_active = vector.len();
        Self {
            vector,
            first_active,
        }
    }

    pub(crate) fn inactive(&self) -> &[ConstraintId] {
        &self.vector[..self.first_active]
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> &[ConstraintId] {
        &self.vector[self.first_active..]
    }

    pub(crate) fn activate(
        &mut self,
        id: ConstraintId,
        constraints: &mut [Constraint],
        vars: &mut [Variable],
    ) {
        debug_assert!(!constraints[id.0].is_active);
        // Swap into the last inactive slot, then move the boundary down over it.
        self.first_active -= 1;
        let target = self.first_active;
        self.swap_into(id, target, constraints);
        constraints[id.0].set_active_state(true, target, vars);
    }

    pub(crate) fn deactivate(
        &mut self,
        id: ConstraintId,
        constraints: &mut [Constraint],
        vars: &mut [Variable],
    ) {
        debug_assert!(constraints[id.0].is_active);
        let target = self.first_active;
        self.swap_into(id, target, constraints);
        self.first_active += 1;
        constraints[id.0].set_active_state(false, target, vars);
    }

    fn swap_into(&mut self, id: ConstraintId, target: usize, constraints: &mut [Constraint]) {
        let from = constraints[id.0].vector_index;
        if from == target {
            return;
        }
        let displaced = self.vector[target];
        self.vector.swap(from, target);
        constraints[displaced.0].vector_index = from;
        constraints[id.0].vector_index = target;
    }

    /// Marks every constraint inactive (and satisfiable) again.
    pub(crate) fn reinitialize(&mut self, constraints: &mut [Constraint]) {
        for c in constraints.iter_mut() {
            c.reinitialize();
        }
        self.first_active = self.vector.len();
    }
}

#[cfg(test)]
mod tests {
    use super::{Constraint, ConstraintId, ConstraintKey, ConstraintVector};
    use crate::variable::{Variable, VariableId};

    fn vars(n: usize) -> Vec<Variable> {
        (0..n)
            .map(|i| Variable::new(VariableId(i), 0.0, 1.0, 1.0).unwrap())
            .collect()
    }

    #[test]
    fn activation_keeps_inactive_before_active() {
        let mut vs = vars(4);
        let mut cs = vec![
            Constraint::new(VariableId(0), VariableId(1), 1.0, false),
            Constraint::new(VariableId(1), VariableId(2), 1.0, false),
            Constraint::new(VariableId(2), VariableId(3), 1.0, false),
        ];
        let mut cv = ConstraintVector::create(&mut cs);

        cv.activate(ConstraintId(0), &mut cs, &mut vs);
        assert_eq!(cv.active(), &[ConstraintId(0)]);
        assert!(!cv.inactive().contains(&ConstraintId(0)));
        assert_eq!(vs[0].active_constraint_count, 1);
        assert_eq!(vs[1].active_constraint_count, 1);

        cv.activate(ConstraintId(2), &mut cs, &mut vs);
        assert_eq!(cv.inactive(), &[ConstraintId(1)]);
        for c in cv.active() {
            assert!(cs[c.0].is_active);
            assert_eq!(cv.vector[cs[c.0].vector_index], *c);
        }

        cv.deactivate(ConstraintId(0), &mut cs, &mut vs);
        assert_eq!(cv.active(), &[ConstraintId(2)]);
        assert_eq!(vs[0].active_constraint_count, 0);
        assert_eq!(vs[1].active_constraint_count, 0);
        for (ix, c) in cv.vector.iter().enumerate() {
            assert_eq!(cs[c.0].vector_index, ix);
        }
    }

    #[test]
    fn reinitialize_clears_flags() {
        let mut vs = vars(2);
        let mut cs = vec![Constraint::new(VariableId(0), VariableId(1), 1.0, false)];
        let mut cv = ConstraintVector::create(&mut cs);
        cv.activate(ConstraintId(0), &mut cs, &mut vs);
        cs[0].is_unsatisfiable = true;
        cs[0].lagrangian = -3.0;
        cv.reinitialize(&mut cs);
        assert!(!cs[0].is_active && !cs[0].is_unsatisfiable);
        assert_eq!(cs[0].lagrangian, 0.0);
        assert_eq!(cv.inactive().len(), 1);
    }

    #[test]
    fn keys_order_by_left_right_gap() {
        let a = ConstraintKey {
            left: VariableId(0),
            right: VariableId(2),
            gap: 5.0,
        };
        let b = ConstraintKey {
            left: VariableId(0),
            right: VariableId(2),
            gap: 7.0,
        };
        let c = ConstraintKey {
            left: VariableId(1),
            right: VariableId(0),
            gap: 0.0,
        };
        let mut keys = vec![c, b, a];
        keys.sort();
        assert_eq!(keys, vec![a, b, c]);
        assert_eq!(a, a);
    }

    #[test]
    fn violation_uses_scaled_positions() {
        let mut vs = vars(2);
        vs[0].actual_pos = 3.0;
        vs[0].scale = 2.0;
        vs[1].actual_pos = 4.0;
        let c = Constraint::new(VariableId(0), VariableId(1), 1.0, false);
        assert_eq!(c.violation(&vs), 6.0 + 1.0 - 4.0);
    }
}
