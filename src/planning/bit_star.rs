//! Batch-informed tree planner over an atlas state space
//!
//! Samples arrive in batches; edges between tree vertices and samples are
//! processed best-first by estimated solution cost, extending the tree and
//! rewiring it when a cheaper incoming edge is found. Vertices that cannot
//! contribute to a better solution are pruned between batches.

use std::rc::Rc;
use std::time::{Duration, Instant};

use ordered_float::OrderedFloat;

use crate::common::error::{PlanningError, PlanningResult};
use crate::common::traits::Planner;
use crate::common::types::{AmbientVector, PlannerStatus};
use crate::manifold::atlas::AtlasStateSpace;
use crate::manifold::sampler::{AtlasMotionValidator, AtlasStateSampler};
use crate::planning::cost::CostHelper;
use crate::planning::id_generator::IdGenerator;
use crate::planning::validity::ValidityChecker;
use crate::planning::vertex::{Vertex, VertexPtr};

/// Configuration for the batch-informed planner
#[derive(Debug, Clone)]
pub struct BitStarConfig {
    /// States sampled per batch
    pub samples_per_batch: usize,
    /// Maximum ambient length of a candidate edge
    pub connection_radius: f64,
    /// Whether to prune unreachable-improvement vertices between batches
    pub prune: bool,
    /// Return at the first exact solution instead of refining until the
    /// budget elapses
    pub stop_on_first_solution: bool,
}

impl Default for BitStarConfig {
    fn default() -> Self {
        BitStarConfig {
            samples_per_batch: 30,
            connection_radius: 0.3,
            prune: true,
            stop_on_first_solution: true,
        }
    }
}

/// Batch-informed tree planner
pub struct BitStar {
    atlas: Rc<AtlasStateSpace>,
    sampler: AtlasStateSampler,
    validator: AtlasMotionValidator,
    checker: Rc<ValidityChecker>,
    cost_helper: Rc<dyn CostHelper>,
    ids: Rc<IdGenerator>,
    config: BitStarConfig,
    root: VertexPtr,
    goal: VertexPtr,
    /// Vertices connected to the tree, root first
    vertices: Vec<VertexPtr>,
    /// Disconnected samples awaiting connection; includes the goal until it
    /// joins the tree
    samples: Vec<VertexPtr>,
}

impl BitStar {
    /// Set up a planner between two ambient points, seeding anchor charts at
    /// both. Fails if either endpoint cannot be projected onto the manifold
    /// or is invalid.
    pub fn new(
        atlas: Rc<AtlasStateSpace>,
        checker: Rc<ValidityChecker>,
        cost_helper: Rc<dyn CostHelper>,
        ids: Rc<IdGenerator>,
        config: BitStarConfig,
        start: &AmbientVector,
        goal: &AmbientVector,
    ) -> PlanningResult<Self> {
        let (start_chart, start_x) = atlas.anchor_chart(start)?;
        let (goal_chart, goal_x) = atlas.anchor_chart(goal)?;
        if !checker.is_valid(&start_x) {
            return Err(PlanningError::PlanningFailed("start state is invalid".into()));
        }
        if !checker.is_valid(&goal_x) {
            return Err(PlanningError::PlanningFailed("goal state is invalid".into()));
        }
        atlas.set_validity_checker(Rc::clone(&checker) as Rc<dyn crate::common::traits::StateValidity>);

        let root = Vertex::new(Rc::clone(&atlas), Rc::clone(&cost_helper), &ids, true);
        atlas.set_state(root.borrow().state(), start_x, start_chart);
        let goal_vertex = Vertex::new(Rc::clone(&atlas), Rc::clone(&cost_helper), &ids, false);
        atlas.set_state(goal_vertex.borrow().state(), goal_x, goal_chart);

        Ok(BitStar {
            sampler: AtlasStateSampler::new(Rc::clone(&atlas)),
            validator: AtlasMotionValidator::new(Rc::clone(&atlas)),
            atlas,
            checker,
            cost_helper,
            ids,
            config,
            vertices: vec![Rc::clone(&root)],
            samples: vec![Rc::clone(&goal_vertex)],
            root,
            goal: goal_vertex,
        })
    }

    pub fn atlas(&self) -> &Rc<AtlasStateSpace> {
        &self.atlas
    }

    pub fn checker(&self) -> &Rc<ValidityChecker> {
        &self.checker
    }

    pub fn tree_size(&self) -> usize {
        self.vertices.len()
    }

    /// Cost of the best solution found so far, if the goal is connected
    pub fn solution_cost(&self) -> Option<f64> {
        let goal = self.goal.borrow();
        goal.is_in_tree().then(|| goal.cost().value())
    }

    fn ambient(&self, v: &VertexPtr) -> AmbientVector {
        self.atlas.ambient_of(v.borrow().state())
    }

    /// Admissible estimate of the cost to reach the goal from a point
    fn heuristic(&self, x: &AmbientVector) -> f64 {
        let goal_x = self.ambient(&self.goal);
        self.cost_helper.motion_cost(x, &goal_x).value()
    }

    /// Whether `candidate` is an ancestor of `v` in the tree
    fn is_ancestor(candidate: &VertexPtr, v: &VertexPtr) -> bool {
        let mut current = Rc::clone(v);
        loop {
            let parent = {
                let borrowed = current.borrow();
                if !borrowed.has_parent() {
                    return false;
                }
                borrowed.parent()
            };
            if Rc::ptr_eq(&parent, candidate) {
                return true;
            }
            current = parent;
        }
    }

    /// Sample one batch of valid states onto the free-sample list
    fn sample_batch(&mut self) -> PlanningResult<()> {
        for v in &self.vertices {
            v.borrow_mut().mark_unexpanded_to_samples();
            v.borrow_mut().mark_unexpanded_to_vertices();
        }
        for _ in 0..self.config.samples_per_batch {
            let vertex = Vertex::new(
                Rc::clone(&self.atlas),
                Rc::clone(&self.cost_helper),
                &self.ids,
                false,
            );
            let state = vertex.borrow().state();
            self.sampler.sample_uniform(state)?;
            if self.checker.is_valid(&self.atlas.ambient_of(state)) {
                self.samples.push(vertex);
            }
        }
        Ok(())
    }

    /// Remove samples and childless tree vertices that cannot contribute to
    /// a solution better than the current one
    fn prune(&mut self) {
        let Some(best) = self.solution_cost() else {
            return;
        };
        let root_x = self.ambient(&self.root);

        let atlas = Rc::clone(&self.atlas);
        let helper = Rc::clone(&self.cost_helper);
        let goal_x = self.ambient(&self.goal);
        let lower_bound = |x: &AmbientVector| {
            helper.motion_cost(&root_x, x).value() + helper.motion_cost(x, &goal_x).value()
        };

        self.samples.retain(|s| {
            let x = atlas.ambient_of(s.borrow().state());
            lower_bound(&x) < best
        });

        // Leaves only: an unprunable descendant protects its ancestors.
        let mut removed = true;
        while removed {
            removed = false;
            let mut index = 0;
            while index < self.vertices.len() {
                let v = Rc::clone(&self.vertices[index]);
                let prunable = {
                    let borrowed = v.borrow();
                    !borrowed.is_root()
                        && !borrowed.has_children()
                        && !Rc::ptr_eq(&v, &self.goal)
                        && borrowed.cost().value() + self.heuristic(&self.ambient(&v)) > best
                };
                if prunable {
                    let parent = v.borrow().parent();
                    parent.borrow_mut().remove_child(&v, false);
                    v.borrow_mut().remove_parent(false);
                    v.borrow_mut().mark_pruned();
                    self.vertices.swap_remove(index);
                    removed = true;
                } else {
                    index += 1;
                }
            }
        }
    }

    /// Candidate edges of the current batch, best-first by estimated
    /// solution cost through the edge
    fn edge_queue(&self) -> Vec<(OrderedFloat<f64>, VertexPtr, VertexPtr, bool)> {
        let mut queue = Vec::new();
        let radius = self.config.connection_radius;
        for v in &self.vertices {
            let v_x = self.ambient(v);
            let v_cost = v.borrow().cost().value();
            for (u, is_sample) in self
                .samples
                .iter()
                .map(|u| (u, true))
                .chain(self.vertices.iter().map(|u| (u, false)))
            {
                if Rc::ptr_eq(v, u) {
                    continue;
                }
                let u_x = self.ambient(u);
                let edge = self.cost_helper.motion_cost(&v_x, &u_x).value();
                if edge > radius {
                    continue;
                }
                let key = v_cost + edge + self.heuristic(&u_x);
                queue.push((OrderedFloat(key), Rc::clone(v), Rc::clone(u), is_sample));
            }
        }
        queue.sort_by_key(|(key, _, _, _)| *key);
        queue
    }

    /// Process the best-first edge queue for this batch
    fn process_edges(&mut self, deadline: Instant) {
        let queue = self.edge_queue();
        for (_, v, u, was_sample) in queue {
            if Instant::now() >= deadline {
                return;
            }
            if v.borrow().is_pruned() || u.borrow().is_pruned() {
                continue;
            }
            let v_x = self.ambient(&v);
            let u_x = self.ambient(&u);
            let edge_cost = self.cost_helper.motion_cost(&v_x, &u_x);
            let through = self
                .cost_helper
                .combine_costs(v.borrow().cost(), edge_cost);

            if let Some(best) = self.solution_cost() {
                if through.value() + self.heuristic(&u_x) >= best {
                    continue;
                }
            }

            if was_sample {
                if u.borrow().is_in_tree() {
                    continue;
                }
                if !self.validator.check_motion(v.borrow().state(), u.borrow().state()) {
                    continue;
                }
                u.borrow_mut().add_parent(&v, edge_cost, true);
                v.borrow_mut().add_child(&u, false);
                v.borrow_mut().mark_expanded_to_samples();
                u.borrow_mut().mark_old();
                self.samples.retain(|s| !Rc::ptr_eq(s, &u));
                self.vertices.push(Rc::clone(&u));
            } else {
                // Rewire: only if the new incoming edge is strictly better
                // and does not close a cycle.
                if !u.borrow().is_in_tree() || u.borrow().is_root() {
                    continue;
                }
                if !self
                    .cost_helper
                    .is_cost_better_than(through, u.borrow().cost())
                {
                    continue;
                }
                if Self::is_ancestor(&u, &v) {
                    continue;
                }
                if !self.validator.check_motion(v.borrow().state(), u.borrow().state()) {
                    continue;
                }
                let old_parent = u.borrow().parent();
                old_parent.borrow_mut().remove_child(&u, false);
                u.borrow_mut().remove_parent(false);
                u.borrow_mut().add_parent(&v, edge_cost, true);
                v.borrow_mut().add_child(&u, false);
                v.borrow_mut().mark_expanded_to_vertices();
            }
        }
    }

    /// The tree vertex nearest the goal in ambient distance
    fn nearest_to_goal(&self) -> VertexPtr {
        let goal_x = self.ambient(&self.goal);
        let mut best = Rc::clone(&self.root);
        let mut best_dist = f64::INFINITY;
        for v in &self.vertices {
            let d = (self.ambient(v) - &goal_x).norm();
            if d < best_dist {
                best_dist = d;
                best = Rc::clone(v);
            }
        }
        best
    }

    fn path_to(&self, v: &VertexPtr) -> Vec<AmbientVector> {
        let mut path = Vec::new();
        let mut current = Rc::clone(v);
        loop {
            path.push(self.ambient(&current));
            let parent = {
                let borrowed = current.borrow();
                if !borrowed.has_parent() {
                    break;
                }
                borrowed.parent()
            };
            current = parent;
        }
        path.reverse();
        path
    }
}

impl Planner for BitStar {
    /// Run batches until the budget elapses. The loop itself observes the
    /// deadline; budget exhaustion is reported through the status, never as
    /// an error.
    fn solve(&mut self, budget: Duration) -> PlannerStatus {
        let deadline = Instant::now() + budget;
        loop {
            if Instant::now() >= deadline {
                break;
            }
            if self.config.prune {
                self.prune();
            }
            if self.sample_batch().is_err() {
                return PlannerStatus::Failure;
            }
            self.process_edges(deadline);
            if self.solution_cost().is_some() && self.config.stop_on_first_solution {
                break;
            }
        }

        if self.solution_cost().is_some() {
            PlannerStatus::Exact
        } else if self.vertices.len() > 1 {
            PlannerStatus::Approximate
        } else {
            PlannerStatus::Timeout
        }
    }

    fn solution_path(&self) -> Option<Vec<AmbientVector>> {
        if self.solution_cost().is_some() {
            Some(self.path_to(&self.goal))
        } else if self.vertices.len() > 1 {
            Some(self.path_to(&self.nearest_to_goal()))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::atlas::AtlasConfig;
    use crate::manifold::constraint::Sphere;
    use crate::planning::cost::PathLengthCost;
    use nalgebra::DVector;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;

    fn sphere_planner(checker: ValidityChecker) -> BitStar {
        let atlas = Rc::new(
            AtlasStateSpace::new(Rc::new(Sphere::unit()), AtlasConfig::default()).unwrap(),
        );
        BitStar::new(
            atlas,
            Rc::new(checker),
            Rc::new(PathLengthCost),
            Rc::new(IdGenerator::new()),
            BitStarConfig::default(),
            &DVector::from_vec(vec![0.0, 0.0, 1.0]),
            &DVector::from_vec(vec![0.0, 1.0, 0.0]),
        )
        .unwrap()
    }

    #[test]
    fn test_solves_free_sphere() {
        let mut planner = sphere_planner(ValidityChecker::all_valid());
        let status = planner.solve(Duration::from_secs(20));
        assert_eq!(status, PlannerStatus::Exact);

        let path = planner.solution_path().unwrap();
        assert!(path.len() >= 2);
        assert!((path.first().unwrap() - DVector::from_vec(vec![0.0, 0.0, 1.0])).norm() < 1e-6);
        assert!((path.last().unwrap() - DVector::from_vec(vec![0.0, 1.0, 0.0])).norm() < 1e-6);
        // Solution cost can never beat the straight-line lower bound.
        assert!(planner.solution_cost().unwrap() >= 2.0f64.sqrt() - 1e-6);
    }

    #[test]
    fn test_tree_costs_consistent_after_solve() {
        let mut planner = sphere_planner(ValidityChecker::all_valid());
        planner.solve(Duration::from_secs(10));
        for v in &planner.vertices {
            let borrowed = v.borrow();
            if borrowed.has_parent() {
                let parent = borrowed.parent();
                let expected = parent.borrow().cost().value() + borrowed.edge_in_cost().value();
                assert!((borrowed.cost().value() - expected).abs() < 1e-9);
                assert_eq!(borrowed.depth(), parent.borrow().depth() + 1);
            }
        }
    }

    #[test]
    fn test_unreliable_validity_never_corrupts() {
        // Every state has a 1% chance to be invalid, as in the reference
        // sphere demo. The planner must end in a coherent status without
        // corrupting vertex state.
        let rng = RefCell::new(StdRng::seed_from_u64(99));
        let checker = ValidityChecker::new(Box::new(move |_x: &AmbientVector| {
            rng.borrow_mut().gen::<f64>() < 0.99
        }));
        let mut planner = sphere_planner(checker);
        let status = planner.solve(Duration::from_secs(10));
        assert!(matches!(
            status,
            PlannerStatus::Exact | PlannerStatus::Approximate | PlannerStatus::Timeout
        ));
        for v in &planner.vertices {
            let borrowed = v.borrow();
            assert!(!borrowed.is_pruned());
            if borrowed.has_parent() {
                assert!(borrowed.cost().is_finite());
            }
        }
    }

    #[test]
    fn test_invalid_start_fails_up_front() {
        let atlas = Rc::new(
            AtlasStateSpace::new(Rc::new(Sphere::unit()), AtlasConfig::default()).unwrap(),
        );
        let result = BitStar::new(
            atlas,
            Rc::new(ValidityChecker::new(Box::new(|_| false))),
            Rc::new(PathLengthCost),
            Rc::new(IdGenerator::new()),
            BitStarConfig::default(),
            &DVector::from_vec(vec![0.0, 0.0, 1.0]),
            &DVector::from_vec(vec![0.0, 1.0, 0.0]),
        );
        assert!(result.is_err());
    }
}
