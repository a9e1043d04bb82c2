//! Common traits defining interfaces for planning components

use std::time::Duration;

use crate::common::types::{AmbientVector, PlannerStatus};

/// Trait for state validity checking (collision checking and the like).
///
/// The planning core treats validity as an opaque predicate; collision
/// geometry lives entirely on the caller's side.
pub trait StateValidity {
    /// Whether the given ambient point is valid
    fn is_valid(&self, x: &AmbientVector) -> bool;
}

impl<F> StateValidity for F
where
    F: Fn(&AmbientVector) -> bool,
{
    fn is_valid(&self, x: &AmbientVector) -> bool {
        self(x)
    }
}

/// Trait for anytime motion planners driven by a wall-clock budget
pub trait Planner {
    /// Run the planner until the budget elapses or an exact solution is found
    fn solve(&mut self, budget: Duration) -> PlannerStatus;

    /// The best path found so far, as a sequence of ambient points
    fn solution_path(&self) -> Option<Vec<AmbientVector>>;
}
