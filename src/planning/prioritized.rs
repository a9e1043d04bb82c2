//! Prioritized multi-robot planning
//!
//! Robots are planned one after another in priority order. Each solved
//! robot's path is time-parameterized at unit speed and registered, state by
//! state, as dynamic obstacles in the validity checkers of every
//! lower-priority robot, keyed by round(time * scaling_factor).

use std::rc::Rc;
use std::time::Duration;

use itertools::Itertools;

use crate::common::error::{PlanningError, PlanningResult};
use crate::common::traits::Planner;
use crate::common::types::PlannerStatus;
use crate::planning::bit_star::BitStar;

/// Plans a fleet of robots sequentially, earlier robots first
pub struct PrioritizedPlanner {
    robots: Vec<BitStar>,
}

impl PrioritizedPlanner {
    /// The robot order is the priority order: index 0 plans first.
    pub fn new(robots: Vec<BitStar>) -> Self {
        PrioritizedPlanner { robots }
    }

    pub fn robot_count(&self) -> usize {
        self.robots.len()
    }

    pub fn robot(&self, index: usize) -> &BitStar {
        &self.robots[index]
    }

    /// Plan every robot with the given per-robot budget. Fails on the first
    /// robot that cannot produce an exact solution; earlier results stand.
    pub fn solve_all(&mut self, per_robot_budget: Duration) -> PlanningResult<Vec<PlannerStatus>> {
        let mut statuses = Vec::with_capacity(self.robots.len());
        for index in 0..self.robots.len() {
            let status = self.robots[index].solve(per_robot_budget);
            statuses.push(status);
            if !status.solved() {
                return Err(PlanningError::PlanningFailed(format!(
                    "robot {} finished with status {:?}",
                    index, status
                )));
            }
            self.broadcast_path(index)?;
        }
        Ok(statuses)
    }

    /// Register the solved path of `robot` as timed dynamic obstacles for
    /// every lower-priority robot
    fn broadcast_path(&self, robot: usize) -> PlanningResult<()> {
        let path = self.robots[robot].solution_path().ok_or_else(|| {
            PlanningError::PlanningFailed(format!("robot {} has no path to broadcast", robot))
        })?;
        let space = Rc::clone(self.robots[robot].atlas());

        // Unit-speed timestamps: each waypoint's time is the accumulated
        // path length up to it.
        let mut times = vec![0.0];
        for (a, b) in path.iter().tuple_windows() {
            times.push(times.last().unwrap() + (b - a).norm());
        }

        for other in self.robots.iter().skip(robot + 1) {
            for (point, &time) in path.iter().zip(times.iter()) {
                let (chart, projected) = space.anchor_chart(point)?;
                let state = space.alloc_state();
                space.set_state(state, projected, chart);
                other
                    .checker()
                    .add_dynamic_obstacle(time, Rc::clone(&space), state);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::AmbientVector;
    use crate::manifold::atlas::{AtlasConfig, AtlasStateSpace};
    use crate::manifold::constraint::Sphere;
    use crate::planning::bit_star::BitStarConfig;
    use crate::planning::cost::PathLengthCost;
    use crate::planning::id_generator::IdGenerator;
    use crate::planning::validity::ValidityChecker;
    use nalgebra::DVector;

    fn sphere_robot(checker: ValidityChecker, start: Vec<f64>, goal: Vec<f64>) -> BitStar {
        let atlas = Rc::new(
            AtlasStateSpace::new(Rc::new(Sphere::unit()), AtlasConfig::default()).unwrap(),
        );
        BitStar::new(
            atlas,
            Rc::new(checker),
            Rc::new(PathLengthCost),
            Rc::new(IdGenerator::new()),
            BitStarConfig::default(),
            &DVector::from_vec(start),
            &DVector::from_vec(goal),
        )
        .unwrap()
    }

    #[test]
    fn test_higher_priority_path_becomes_obstacles() {
        let first = sphere_robot(
            ValidityChecker::all_valid(),
            vec![0.0, 0.0, 1.0],
            vec![0.0, 1.0, 0.0],
        );
        let second = sphere_robot(
            ValidityChecker::with_pairwise(
                Box::new(|_| true),
                Box::new(|a: &AmbientVector, b: &AmbientVector| (a - b).norm() > 0.2),
                10.0,
            ),
            vec![1.0, 0.0, 0.0],
            vec![0.0, -1.0, 0.0],
        );

        let mut fleet = PrioritizedPlanner::new(vec![first, second]);
        let statuses = fleet.solve_all(Duration::from_secs(20)).unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.solved()));

        // The second robot's checker saw the first robot's path.
        assert!(fleet.robot(1).checker().has_dynamic_obstacles());
        // The first robot's start at time 0 now blocks nearby states for
        // robot 2 at time 0.
        let near_first_start = DVector::from_vec(vec![0.05, 0.0, 0.999]);
        assert!(!fleet
            .robot(1)
            .checker()
            .is_valid_at(&near_first_start, 0.0));
    }
}
