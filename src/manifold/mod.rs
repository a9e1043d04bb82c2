//! Atlas constraint-manifold state space
//!
//! This module contains the manifold subsystem:
//! - Implicit constraints and stock example manifolds
//! - Tangent frames and Newton projection
//! - Local tangent charts with polytopes of validity
//! - The atlas state space with sampling and geodesic traversal

pub mod atlas;
pub mod chart;
pub mod constraint;
pub mod frame;
pub mod projection;
pub mod sampler;

// Re-exports for convenience
pub use atlas::{AtlasConfig, AtlasStateSpace, Traversal, TraversalOutcome};
pub use chart::AtlasChart;
pub use constraint::{Constraint, OrbitingPoints, Sphere};
pub use frame::TangentFrame;
pub use projection::{NewtonProjector, ProjectionSettings};
pub use sampler::{AtlasMotionValidator, AtlasStateSampler};
