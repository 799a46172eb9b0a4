//! A small cache of the most violated inactive constraints seen by the last full scan.
//!
//! Only constraints touching the most recently modified block can change their violation between
//! two Project steps, so those are filtered out and rescanned while the rest of the cache stays
//! valid. The cache is approximate: it does not guarantee it always holds the top violations, but
//! the constraint Project picks is always violated, and Project only stops after a full scan finds
//! nothing.

use crate::block::BlockId;
use crate::constraint::{Constraint, ConstraintId};
use crate::variable::Variable;

/// Beyond about 20 entries the hit rate stops improving.
pub(crate) const MAX_CONSTRAINTS: usize = 20;

#[derive(Debug, Clone)]
pub(crate) struct ViolationCache {
    constraints: Vec<ConstraintId>,
    /// Lowest violation currently in the cache (0 when empty).
    pub(crate) low_violation: f64,
}

impl Default for ViolationCache {
    fn default() -> Self {
        Self {
            constraints: Vec::with_capacity(MAX_CONSTRAINTS),
            low_violation: 0.0,
        }
    }
}

impl ViolationCache {
    pub(crate) fn clear(&mut self) {
        self.low_violation = 0.0;
        self.constraints.clear();
    }

    pub(crate) fn is_full(&self) -> bool {
        self.constraints.len() == MAX_CONSTRAINTS
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.constraints.len()
    }

    /// Drops entries touching `block` as well as entries that became active or unsatisfiable,
    /// then recomputes `low_violation`. Returns whether the cache held anything beforehand.
    pub(crate) fn filter_block(
        &mut self,
        block: BlockId,
        constraints: &[Constraint],
        vars: &[Variable],
    ) -> bool {
        let had_entries = !self.constraints.is_empty();
        self.low_violation = f64::MAX;
        let mut ii = self.constraints.len();
        while ii > 0 {
            ii -= 1;
            let c = &constraints[self.constraints[ii].0];
            if vars[c.left.0].block == block
                || vars[c.right.0].block == block
                || c.is_active
                || c.is_unsatisfiable
            {
                self.constraints.swap_remove(ii);
            } else {
                self.low_violation = self.low_violation.min(c.violation(vars));
            }
        }
        if self.constraints.is_empty() {
            self.low_violation = 0.0;
        }
        had_entries
    }

    /// The cached constraint with the largest violation strictly greater than `target`.
    pub(crate) fn find_if_greater(
        &self,
        mut target: f64,
        constraints: &[Constraint],
        vars: &[Variable],
    ) -> Option<ConstraintId> {
        let mut found = None;
        for &cid in &self.constraints {
            let violation = constraints[cid.0].violation(vars);
            if violation > target {
                target = violation;
                found = Some(cid);
            }
        }
        found
    }

    /// Adds `cid`, replacing the lowest cached violation once full. Callers check
    /// `violation > low_violation` first.
    pub(crate) fn insert(
        &mut self,
        cid: ConstraintId,
        violation: f64,
        constraints: &[Constraint],
        vars: &[Variable],
    ) {
        let mut lowest_index = 0;
        let mut low = violation;
        let mut next_low = violation;
        for (ii, &cached) in self.constraints.iter().enumerate() {
            let v = constraints[cached.0].violation(vars);
            if v < low {
                next_low = low;
                lowest_index = ii;
                low = v;
            } else if v < next_low {
                next_low = v;
            }
        }

        if !self.is_full() {
            self.constraints.push(cid);
            if self.is_full() {
                self.low_violation = low;
            }
        } else {
            self.constraints[lowest_index] = cid;
            self.low_violation = next_low;
        }
    }
}
