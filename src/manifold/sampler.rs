//! State sampling and motion checking on an atlas

use std::rc::Rc;

use crate::common::error::PlanningResult;
use crate::common::types::{AmbientVector, StateId};
use crate::manifold::atlas::{AtlasStateSpace, Traversal};

/// Sampler drawing states uniformly from the charted manifold regions
pub struct AtlasStateSampler {
    atlas: Rc<AtlasStateSpace>,
}

impl AtlasStateSampler {
    pub fn new(atlas: Rc<AtlasStateSpace>) -> Self {
        AtlasStateSampler { atlas }
    }

    /// Sample a state uniformly from the known charted regions of the
    /// manifold, written into `out`
    pub fn sample_uniform(&self, out: StateId) -> PlanningResult<()> {
        self.atlas.sample_uniform(out)
    }

    /// Sample a state within tangent distance `distance` of `near`
    pub fn sample_uniform_near(
        &self,
        out: StateId,
        near: StateId,
        distance: f64,
    ) -> PlanningResult<()> {
        self.atlas.sample_uniform_near(out, near, distance)
    }
}

/// Motion checking that respects the manifold geometry: a motion is the
/// geodesic traversal between its endpoints, validity-checked every delta
pub struct AtlasMotionValidator {
    atlas: Rc<AtlasStateSpace>,
}

impl AtlasMotionValidator {
    pub fn new(atlas: Rc<AtlasStateSpace>) -> Self {
        AtlasMotionValidator { atlas }
    }

    /// Whether the manifold can be traversed from `s1` to `s2` without
    /// collision
    pub fn check_motion(&self, s1: StateId, s2: StateId) -> bool {
        self.atlas.follow_manifold(s1, s2, false, None)
    }

    /// Like `check_motion`, but reports the last valid state (written into
    /// `last_valid`) and its interpolation parameter.
    ///
    /// When traversal terminates by exceeding the lambda budget, the
    /// parameter is computed as though `s2` were the final state visited
    /// before termination, i.e. 1.0: the failure was not geometric.
    pub fn check_motion_with_last_valid(
        &self,
        s1: StateId,
        s2: StateId,
        last_valid: StateId,
    ) -> (bool, f64) {
        let result = self.traverse(s1, s2);
        self.atlas
            .set_state(last_valid, result.final_point.clone(), result.final_chart);
        (result.reached(), result.last_valid_fraction())
    }

    /// Motion check against a time-parameterized validity callback, for
    /// clients with dynamic obstacles. The state's time along the motion is
    /// `start_time + travelled`, treating traversal at unit speed.
    pub fn check_motion_timed(
        &self,
        s1: StateId,
        s2: StateId,
        start_time: f64,
        is_valid_at: &dyn Fn(&AmbientVector, f64) -> bool,
    ) -> bool {
        let from_x = self.atlas.ambient_of(s1);
        let from_c = self.atlas.chart_of(s1);
        let to_x = self.atlas.ambient_of(s2);
        let timed = |x: &AmbientVector, travelled: f64| {
            is_valid_at(x, start_time + travelled)
        };
        let result = self
            .atlas
            .follow_manifold_with(&from_x, from_c, &to_x, false, Some(&timed), None);
        result.reached()
    }

    fn traverse(&self, s1: StateId, s2: StateId) -> Traversal {
        let from_x = self.atlas.ambient_of(s1);
        let from_c = self.atlas.chart_of(s1);
        let to_x = self.atlas.ambient_of(s2);
        self.atlas
            .follow_manifold_with(&from_x, from_c, &to_x, false, None, None)
    }
}
