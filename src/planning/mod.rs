//! Batch-informed tree planning
//!
//! This module contains the planner subsystem:
//! - Cost bookkeeping and identifier generation
//! - Tree vertices with eager cost-cascade maintenance
//! - Validity checking with time-indexed dynamic obstacles
//! - The batch-informed planner and the prioritized multi-robot client

pub mod bit_star;
pub mod cost;
pub mod id_generator;
pub mod prioritized;
pub mod validity;
pub mod vertex;

// Re-exports for convenience
pub use bit_star::{BitStar, BitStarConfig};
pub use cost::{Cost, CostHelper, PathLengthCost};
pub use id_generator::IdGenerator;
pub use prioritized::PrioritizedPlanner;
pub use validity::{PairwiseValidity, ValidityChecker};
pub use vertex::{Vertex, VertexPtr};
