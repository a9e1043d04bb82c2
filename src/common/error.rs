//! Error types for manifold_planning

use std::fmt;

/// Main error type for planning operations
#[derive(Debug)]
pub enum PlanningError {
    /// Planning failed to produce a solution
    PlanningFailed(String),
    /// Numerical computation failed (projection divergence, rank-deficient Jacobian, etc.)
    NumericalError(String),
    /// Invalid parameter
    InvalidParameter(String),
    /// Sampling rejection budget exhausted
    SamplingExhausted(String),
}

impl fmt::Display for PlanningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanningError::PlanningFailed(msg) => write!(f, "Planning failed: {}", msg),
            PlanningError::NumericalError(msg) => write!(f, "Numerical error: {}", msg),
            PlanningError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            PlanningError::SamplingExhausted(msg) => write!(f, "Sampling exhausted: {}", msg),
        }
    }
}

impl std::error::Error for PlanningError {}

/// Result type alias for planning operations
pub type PlanningResult<T> = Result<T, PlanningError>;
