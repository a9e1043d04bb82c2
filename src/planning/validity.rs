//! State validity checking with optional dynamic obstacles
//!
//! One checker covers the three variants the planners need: a static
//! predicate, a static predicate plus a time-indexed dynamic-obstacle map,
//! and the multi-robot pairwise form where obstacles are other robots'
//! states. Dynamic obstacles are keyed by round(time * scaling_factor).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::common::traits::StateValidity;
use crate::common::types::{AmbientVector, StateId};
use crate::manifold::atlas::AtlasStateSpace;

/// Pairwise predicate: whether a state and another robot's state are jointly
/// valid (not in collision)
pub type PairwiseValidity = Box<dyn Fn(&AmbientVector, &AmbientVector) -> bool>;

/// A dynamic obstacle: another robot's state, owned by that robot's space
type DynamicObstacle = (Rc<AtlasStateSpace>, StateId);

/// Validity checker consulted by the motion validator and the planners
pub struct ValidityChecker {
    static_check: Box<dyn Fn(&AmbientVector) -> bool>,
    are_states_valid: Option<PairwiseValidity>,
    scaling_factor: f64,
    dynamic_obstacles: RefCell<HashMap<i64, Vec<DynamicObstacle>>>,
}

impl ValidityChecker {
    /// A checker that accepts every state
    pub fn all_valid() -> Self {
        ValidityChecker::new(Box::new(|_| true))
    }

    /// Static-only checker
    pub fn new(static_check: Box<dyn Fn(&AmbientVector) -> bool>) -> Self {
        ValidityChecker {
            static_check,
            are_states_valid: None,
            scaling_factor: 1.0,
            dynamic_obstacles: RefCell::new(HashMap::new()),
        }
    }

    /// Checker with a pairwise predicate for dynamic obstacles. Obstacle
    /// lookups are keyed by round(time * scaling_factor).
    pub fn with_pairwise(
        static_check: Box<dyn Fn(&AmbientVector) -> bool>,
        are_states_valid: PairwiseValidity,
        scaling_factor: f64,
    ) -> Self {
        ValidityChecker {
            static_check,
            are_states_valid: Some(are_states_valid),
            scaling_factor,
            dynamic_obstacles: RefCell::new(HashMap::new()),
        }
    }

    pub fn scaling_factor(&self) -> f64 {
        self.scaling_factor
    }

    fn time_key(&self, time: f64) -> i64 {
        (time * self.scaling_factor).round() as i64
    }

    /// Whether a state is valid against the static predicate only
    pub fn is_valid(&self, x: &AmbientVector) -> bool {
        (self.static_check)(x)
    }

    /// Whether a state is valid at a point in time: the static predicate,
    /// then every dynamic obstacle registered at the state's time key. With
    /// no registered obstacles this is exactly `is_valid`.
    pub fn is_valid_at(&self, x: &AmbientVector, time: f64) -> bool {
        let obstacles = self.dynamic_obstacles.borrow();
        if obstacles.is_empty() {
            return self.is_valid(x);
        }
        if !self.is_valid(x) {
            return false;
        }
        let Some(at_time) = obstacles.get(&self.time_key(time)) else {
            return true;
        };
        let Some(pairwise) = &self.are_states_valid else {
            return true;
        };
        at_time
            .iter()
            .all(|(space, state)| pairwise(x, &space.ambient_of(*state)))
    }

    /// Register another robot's state as an obstacle at the given time. The
    /// state must have been allocated through `space`; the checker frees it
    /// on `clear_dynamic_obstacles`.
    pub fn add_dynamic_obstacle(&self, time: f64, space: Rc<AtlasStateSpace>, state: StateId) {
        self.dynamic_obstacles
            .borrow_mut()
            .entry(self.time_key(time))
            .or_default()
            .push((space, state));
    }

    pub fn has_dynamic_obstacles(&self) -> bool {
        !self.dynamic_obstacles.borrow().is_empty()
    }

    /// Drop all dynamic obstacles, releasing their states through the
    /// owning spaces
    pub fn clear_dynamic_obstacles(&self) {
        let mut obstacles = self.dynamic_obstacles.borrow_mut();
        for (_, entries) in obstacles.drain() {
            for (space, state) in entries {
                space.free_state(state);
            }
        }
    }
}

impl StateValidity for ValidityChecker {
    fn is_valid(&self, x: &AmbientVector) -> bool {
        ValidityChecker::is_valid(self, x)
    }
}

impl Drop for ValidityChecker {
    fn drop(&mut self) {
        self.clear_dynamic_obstacles();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::atlas::AtlasConfig;
    use crate::manifold::constraint::Sphere;
    use nalgebra::DVector;

    fn sphere_space() -> Rc<AtlasStateSpace> {
        Rc::new(AtlasStateSpace::new(Rc::new(Sphere::unit()), AtlasConfig::default()).unwrap())
    }

    fn obstacle_at(space: &Rc<AtlasStateSpace>, coords: Vec<f64>) -> StateId {
        let (chart, projected) = space
            .anchor_chart(&DVector::from_vec(coords))
            .unwrap();
        let s = space.alloc_state();
        space.set_state(s, projected, chart);
        s
    }

    #[test]
    fn test_static_only_checker() {
        let checker = ValidityChecker::new(Box::new(|x: &AmbientVector| x[0] > 0.0));
        let good = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        let bad = DVector::from_vec(vec![-1.0, 0.0, 0.0]);
        assert!(checker.is_valid(&good));
        assert!(!checker.is_valid(&bad));
        // Without dynamic obstacles, the timed query degenerates to static.
        assert!(checker.is_valid_at(&good, 3.7));
    }

    #[test]
    fn test_time_key_rounds_scaled_time() {
        let space = sphere_space();
        let other = obstacle_at(&space, vec![0.0, 0.0, 1.0]);
        // Colliding whenever the two states are within 0.5 of each other.
        let checker = ValidityChecker::with_pairwise(
            Box::new(|_| true),
            Box::new(|a, b| (a - b).norm() > 0.5),
            10.0,
        );
        // Register the obstacle at key round(0.4 * 10) = 4.
        checker.add_dynamic_obstacle(0.4, Rc::clone(&space), other);

        let near_pole = DVector::from_vec(vec![0.0, 0.1, 0.995]);
        // t = 0.37 also keys to round(3.7) = 4, so the obstacle applies.
        assert!(!checker.is_valid_at(&near_pole, 0.37));
        // t = 0.25 keys to 2 or 3, where nothing is registered.
        assert!(checker.is_valid_at(&near_pole, 0.25));

        let far_away = DVector::from_vec(vec![0.0, 1.0, 0.0]);
        assert!(checker.is_valid_at(&far_away, 0.37));
    }

    #[test]
    fn test_static_rejection_wins_over_obstacles() {
        let space = sphere_space();
        let other = obstacle_at(&space, vec![0.0, 1.0, 0.0]);
        let checker = ValidityChecker::with_pairwise(
            Box::new(|x: &AmbientVector| x[2] > 0.0),
            Box::new(|_, _| true),
            10.0,
        );
        checker.add_dynamic_obstacle(0.0, Rc::clone(&space), other);
        let below = DVector::from_vec(vec![0.0, 0.0, -1.0]);
        assert!(!checker.is_valid_at(&below, 0.0));
    }

    #[test]
    fn test_clear_frees_states_through_space() {
        let space = sphere_space();
        let other = obstacle_at(&space, vec![0.0, 0.0, 1.0]);
        let checker = ValidityChecker::with_pairwise(
            Box::new(|_| true),
            Box::new(|_, _| true),
            1.0,
        );
        checker.add_dynamic_obstacle(1.0, Rc::clone(&space), other);
        assert!(checker.has_dynamic_obstacles());
        checker.clear_dynamic_obstacles();
        assert!(!checker.has_dynamic_obstacles());
        // The obstacle state is gone; allocating again reuses its slot.
        let reused = space.alloc_state();
        assert_eq!(reused, other);
    }
}
