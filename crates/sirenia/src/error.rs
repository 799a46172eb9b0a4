use crate::constraint::ConstraintId;
use crate::variable::VariableId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "invalid variable (desired_pos={desired_pos}, weight={weight}, scale={scale}): {reason}"
    )]
    InvalidVariable {
        desired_pos: f64,
        weight: f64,
        scale: f64,
        reason: &'static str,
    },

    #[error("constraint gap must be finite and non-negative, got {gap}")]
    InvalidGap { gap: f64 },

    #[error("cannot add a constraint between variable {variable} and itself")]
    SelfConstraint { variable: VariableId },

    #[error("neighbor relationship weight must be finite and positive, got {weight}")]
    InvalidNeighborWeight { weight: f64 },

    #[error("cannot make variable {variable} a neighbor of itself")]
    SelfNeighbor { variable: VariableId },

    #[error("cannot add variables or constraints once solve() has been called")]
    SolverSealed,

    #[error("unknown variable: {id}")]
    UnknownVariable { id: String },

    #[error("unknown constraint: {id}")]
    UnknownConstraint { id: ConstraintId },

    #[error("variable {id} has already been added")]
    DuplicateVariable { id: String },

    #[error("invalid solver parameters: {0}")]
    Parameters(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
