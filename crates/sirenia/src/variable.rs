//! Scalar unknowns.

use crate::block::BlockId;
use crate::constraint::ConstraintId;
use crate::error::{Error, Result};
use std::fmt;

/// Ordinal of a variable inside its [`crate::Solver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableId(pub(crate) usize);

impl VariableId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A `(x_i - x_j)^2` closeness goal, stored on both participating variables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborAndWeight {
    pub neighbor: VariableId,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub(crate) ordinal: VariableId,
    pub(crate) desired_pos: f64,
    pub(crate) actual_pos: f64,
    pub(crate) weight: f64,
    pub(crate) scale: f64,

    /// Scaled offset from the owning block's `scale * reference_pos`.
    pub(crate) offset_in_block: f64,
    pub(crate) block: BlockId,

    /// Constraints where this variable is the left side.
    pub(crate) left_constraints: Vec<ConstraintId>,
    /// Constraints where this variable is the right side.
    pub(crate) right_constraints: Vec<ConstraintId>,
    pub(crate) active_constraint_count: usize,
    pub(crate) neighbors: Vec<NeighborAndWeight>,
}

impl Variable {
    pub(crate) fn new(
        ordinal: VariableId,
        desired_pos: f64,
        weight: f64,
        scale: f64,
    ) -> Result<Self> {
        validate(desired_pos, weight, scale)?;
        Ok(Self {
            ordinal,
            desired_pos,
            actual_pos: desired_pos,
            weight,
            scale,
            offset_in_block: 0.0,
            block: BlockId::UNASSIGNED,
            left_constraints: Vec::new(),
            right_constraints: Vec::new(),
            active_constraint_count: 0,
            neighbors: Vec::new(),
        })
    }

    pub fn ordinal(&self) -> VariableId {
        self.ordinal
    }

    pub fn desired_pos(&self) -> f64 {
        self.desired_pos
    }

    /// The solved position once [`crate::Solver::solve`] returns.
    pub fn actual_pos(&self) -> f64 {
        self.actual_pos
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// `actual_pos * scale`, the value constraints are evaluated against.
    pub fn scaled_pos(&self) -> f64 {
        self.actual_pos * self.scale
    }

    pub fn active_constraint_count(&self) -> usize {
        self.active_constraint_count
    }

    pub fn neighbors(&self) -> &[NeighborAndWeight] {
        &self.neighbors
    }

    pub fn left_constraints(&self) -> &[ConstraintId] {
        &self.left_constraints
    }

    pub fn right_constraints(&self) -> &[ConstraintId] {
        &self.right_constraints
    }

    /// Derivative of the goal function with respect to the scaled position.
    pub fn dfdv(&self) -> f64 {
        2.0 * self.weight * (self.actual_pos - self.desired_pos) / self.scale
    }

    pub(crate) fn reinitialize(&mut self) {
        self.active_constraint_count = 0;
        self.offset_in_block = 0.0;
        self.actual_pos = self.desired_pos;
    }

    #[cfg(feature = "qpsc")]
    pub(crate) fn add_neighbor(&mut self, neighbor: VariableId, weight: f64) {
        self.neighbors.push(NeighborAndWeight { neighbor, weight });
    }
}

pub(crate) fn validate(desired_pos: f64, weight: f64, scale: f64) -> Result<()> {
    let invalid = |reason| Error::InvalidVariable {
        desired_pos,
        weight,
        scale,
        reason,
    };
    if !weight.is_finite() || weight <= 0.0 {
        return Err(invalid("weight must be finite and positive"));
    }
    if !scale.is_finite() || scale <= 0.0 {
        return Err(invalid("scale must be finite and positive"));
    }
    if !(desired_pos * weight).is_finite() || !(desired_pos * scale).is_finite() {
        return Err(invalid("desired position overflows when weighted or scaled"));
    }
    Ok(())
}

/// A position restricted to `[low_bound, upper_bound]`; every write is clamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundedPosition {
    position: f64,
    low_bound: f64,
    upper_bound: f64,
}

impl Default for BoundedPosition {
    fn default() -> Self {
        Self {
            position: 0.0,
            low_bound: f64::NEG_INFINITY,
            upper_bound: f64::INFINITY,
        }
    }
}

impl BoundedPosition {
    /// # Panics
    ///
    /// Panics if `low_bound > upper_bound`.
    pub fn new(position: f64, low_bound: f64, upper_bound: f64) -> Self {
        assert!(
            low_bound <= upper_bound,
            "low bound {low_bound} exceeds upper bound {upper_bound}"
        );
        let mut b = Self {
            position,
            low_bound,
            upper_bound,
        };
        b.set_position(position);
        b
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn set_position(&mut self, value: f64) {
        self.position = value.clamp(self.low_bound, self.upper_bound);
    }

    pub fn low_bound(&self) -> f64 {
        self.low_bound
    }

    pub fn upper_bound(&self) -> f64 {
        self.upper_bound
    }

    /// # Panics
    ///
    /// Panics if the new bound exceeds the current upper bound.
    pub fn set_low_bound(&mut self, bound: f64) {
        assert!(
            bound <= self.upper_bound,
            "low bound {bound} exceeds upper bound {}",
            self.upper_bound
        );
        self.low_bound = bound;
        self.set_position(self.position);
    }

    /// # Panics
    ///
    /// Panics if the new bound is below the current low bound.
    pub fn set_upper_bound(&mut self, bound: f64) {
        assert!(
            self.low_bound <= bound,
            "upper bound {bound} is below low bound {}",
            self.low_bound
        );
        self.upper_bound = bound;
        self.set_position(self.position);
    }
}
