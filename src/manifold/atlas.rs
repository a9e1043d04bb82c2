//! Atlas state space: an incrementally constructed collection of tangent
//! charts approximating an implicit constraint manifold
//!
//! The atlas owns the charts, a measure-weighted sampling distribution over
//! them, and the slab of manifold states handed out to planners. Sampling and
//! traversal grow the chart collection as a side effect, so the chart list,
//! the radius and the random number generator live behind interior
//! mutability; the atlas is not re-entrant.

use std::cell::{Cell, RefCell};
use std::f64::consts::PI;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::error::{PlanningError, PlanningResult};
use crate::common::traits::StateValidity;
use crate::common::types::{AmbientVector, ChartId, StateId, TangentVector};
use crate::manifold::chart::{uniform_in_ball, AtlasChart};
use crate::manifold::constraint::Constraint;
use crate::manifold::frame::TangentFrame;
use crate::manifold::projection::{NewtonProjector, ProjectionSettings};
use crate::manifold::sampler::AtlasStateSampler;

/// Factor by which rho shrinks when a chart is caught misrepresenting the
/// manifold during traversal
const RHO_SHRINK: f64 = 0.5;

/// Tangent-space width to which dichotomic boundary search bisects
const BOUNDARY_TOLERANCE: f64 = 1e-6;

/// Minimum fraction of delta a traversal step must advance; anything less is
/// treated as a projection failure to rule out stalling
const MIN_STEP_FRACTION: f64 = 1e-3;

/// Configuration for an atlas
#[derive(Debug, Clone)]
pub struct AtlasConfig {
    /// Step size for manifold traversal and collision-check granularity
    pub delta: f64,
    /// Maximum chart-to-manifold distance inside a chart's validity region
    pub epsilon: f64,
    /// Maximum chart radius; may shrink during operation of the atlas
    pub rho: f64,
    /// Maximum angle between a chart and the manifold inside its validity region
    pub alpha: f64,
    /// Balance between refinement (0) and frontier exploration (towards 1)
    pub exploration: f64,
    /// Traversal gives up once the accumulated distance exceeds lambda * d(from, to)
    pub lambda: f64,
    /// Newton projection halt criterion on ||F(x)||
    pub projection_tolerance: f64,
    /// Newton projection iteration cap
    pub projection_max_iterations: usize,
    /// Chart measure estimation uses ceil(thoroughness^k) Monte-Carlo samples
    pub monte_carlo_thoroughness: f64,
    /// Rejection budget for one sampling call
    pub max_sampling_attempts: usize,
    /// Seed of the atlas's internal random number generator
    pub seed: u64,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        AtlasConfig {
            delta: 0.02,
            epsilon: 0.1,
            rho: 0.1,
            alpha: PI / 16.0,
            exploration: 0.5,
            lambda: 2.0,
            projection_tolerance: 1e-8,
            projection_max_iterations: 200,
            monte_carlo_thoroughness: 3.5,
            max_sampling_attempts: 100,
            seed: 0,
        }
    }
}

impl AtlasConfig {
    pub fn validate(&self) -> PlanningResult<()> {
        if self.delta <= 0.0 {
            return Err(PlanningError::InvalidParameter("delta must be > 0".into()));
        }
        if self.epsilon <= 0.0 {
            return Err(PlanningError::InvalidParameter("epsilon must be > 0".into()));
        }
        if self.rho <= 0.0 {
            return Err(PlanningError::InvalidParameter("rho must be > 0".into()));
        }
        if self.alpha <= 0.0 || self.alpha >= PI / 2.0 {
            return Err(PlanningError::InvalidParameter(
                "alpha must be in (0, pi/2)".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.exploration) {
            return Err(PlanningError::InvalidParameter(
                "exploration must be in [0, 1)".into(),
            ));
        }
        if self.lambda <= 1.0 {
            return Err(PlanningError::InvalidParameter("lambda must be > 1".into()));
        }
        if self.projection_tolerance <= 0.0 {
            return Err(PlanningError::InvalidParameter(
                "projection tolerance must be > 0".into(),
            ));
        }
        if self.projection_max_iterations == 0 {
            return Err(PlanningError::InvalidParameter(
                "projection max iterations must be >= 1".into(),
            ));
        }
        if self.monte_carlo_thoroughness <= 0.0 {
            return Err(PlanningError::InvalidParameter(
                "Monte-Carlo thoroughness must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Why a manifold traversal stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOutcome {
    /// Came within delta of the target
    Reached,
    /// The validity callback rejected an intermediate state
    Collision,
    /// A step left the chart's trust region; rho has been reduced
    ChartInvalid,
    /// Accumulated distance exceeded lambda * d(from, to)
    TooFar,
    /// Newton projection failed to converge or the Jacobian lost rank
    ProjectionFailed,
}

/// Result of one manifold traversal
#[derive(Debug, Clone)]
pub struct Traversal {
    pub outcome: TraversalOutcome,
    /// Total ambient distance accumulated up to the last accepted state
    pub travelled: f64,
    /// Straight-line ambient distance between the endpoints
    pub straight_line: f64,
    /// Last state visited before stopping
    pub final_point: AmbientVector,
    /// Chart owning the last state
    pub final_chart: ChartId,
}

impl Traversal {
    pub fn reached(&self) -> bool {
        self.outcome == TraversalOutcome::Reached
    }

    /// Interpolation parameter of the last valid state, in [0, 1].
    ///
    /// Non-geometric stops (the lambda budget) report 1.0, as though the
    /// target were the last state visited; geometric stops report the
    /// fraction of the straight-line distance actually covered.
    pub fn last_valid_fraction(&self) -> f64 {
        match self.outcome {
            TraversalOutcome::Reached | TraversalOutcome::TooFar => 1.0,
            _ => {
                if self.straight_line <= f64::EPSILON {
                    1.0
                } else {
                    (self.travelled / self.straight_line).clamp(0.0, 1.0)
                }
            }
        }
    }
}

/// A manifold state: an ambient point plus the chart that owns it
#[derive(Debug, Clone)]
struct AtlasState {
    ambient: AmbientVector,
    chart: Option<ChartId>,
}

/// Slab of states allocated through the atlas
#[derive(Debug, Default)]
struct StateSlab {
    slots: Vec<Option<AtlasState>>,
    free: Vec<usize>,
}

/// State space encapsulating the atlas algorithm for planning on a
/// constraint manifold
pub struct AtlasStateSpace {
    constraint: Rc<dyn Constraint>,
    projector: NewtonProjector,
    delta: f64,
    epsilon: f64,
    alpha: f64,
    exploration: f64,
    lambda: f64,
    thoroughness: f64,
    max_sampling_attempts: usize,
    rho: Cell<f64>,
    rho_s: Cell<f64>,
    charts: RefCell<Vec<AtlasChart>>,
    states: RefCell<StateSlab>,
    rng: RefCell<StdRng>,
    validity: RefCell<Option<Rc<dyn StateValidity>>>,
}

impl AtlasStateSpace {
    pub fn new(constraint: Rc<dyn Constraint>, config: AtlasConfig) -> PlanningResult<Self> {
        config.validate()?;
        let n = constraint.ambient_dim();
        let m = constraint.constraint_dim();
        if m == 0 || m >= n {
            return Err(PlanningError::InvalidParameter(format!(
                "constraint codimension {} incompatible with ambient dimension {}",
                m, n
            )));
        }
        let k = n - m;
        let rho_s = config.rho / (1.0 - config.exploration).powf(1.0 / k as f64);
        Ok(AtlasStateSpace {
            constraint,
            projector: NewtonProjector::new(ProjectionSettings {
                tolerance: config.projection_tolerance,
                max_iterations: config.projection_max_iterations,
            }),
            delta: config.delta,
            epsilon: config.epsilon,
            alpha: config.alpha,
            exploration: config.exploration,
            lambda: config.lambda,
            thoroughness: config.monte_carlo_thoroughness,
            max_sampling_attempts: config.max_sampling_attempts,
            rho: Cell::new(config.rho),
            rho_s: Cell::new(rho_s),
            charts: RefCell::new(Vec::new()),
            states: RefCell::new(StateSlab::default()),
            rng: RefCell::new(StdRng::seed_from_u64(config.seed)),
            validity: RefCell::new(None),
        })
    }

    pub fn ambient_dim(&self) -> usize {
        self.constraint.ambient_dim()
    }

    pub fn manifold_dim(&self) -> usize {
        self.constraint.manifold_dim()
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn exploration(&self) -> f64 {
        self.exploration
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn rho(&self) -> f64 {
        self.rho.get()
    }

    /// Sampling radius, inferred from rho and the exploration parameter
    pub fn rho_s(&self) -> f64 {
        self.rho_s.get()
    }

    pub fn projection_tolerance(&self) -> f64 {
        self.projector.settings().tolerance
    }

    pub fn constraint(&self) -> &Rc<dyn Constraint> {
        &self.constraint
    }

    /// Install the validity checker consulted by non-interpolating traversal.
    /// This is the narrow interface the atlas consumes from the surrounding
    /// planning framework.
    pub fn set_validity_checker(&self, checker: Rc<dyn StateValidity>) {
        *self.validity.borrow_mut() = Some(checker);
    }

    /// Traversal from A to B may visit different points than from B to A
    pub fn has_symmetric_interpolate(&self) -> bool {
        false
    }

    /// Return a sampler bound to this atlas
    pub fn alloc_default_state_sampler(self: &Rc<Self>) -> AtlasStateSampler {
        AtlasStateSampler::new(Rc::clone(self))
    }

    // ---- state slab ----------------------------------------------------

    /// Allocate a fresh (uninitialized) state
    pub fn alloc_state(&self) -> StateId {
        let mut slab = self.states.borrow_mut();
        let state = AtlasState {
            ambient: AmbientVector::zeros(self.ambient_dim()),
            chart: None,
        };
        if let Some(index) = slab.free.pop() {
            slab.slots[index] = Some(state);
            StateId(index)
        } else {
            slab.slots.push(Some(state));
            StateId(slab.slots.len() - 1)
        }
    }

    /// Free a state. Freeing a state twice is a programming error.
    pub fn free_state(&self, s: StateId) {
        let mut slab = self.states.borrow_mut();
        if slab.slots[s.0].take().is_none() {
            panic!("Attempting to free a state that has already been freed.");
        }
        slab.free.push(s.0);
    }

    /// Duplicate src into dst
    pub fn copy_state(&self, dst: StateId, src: StateId) {
        let mut slab = self.states.borrow_mut();
        let copy = slab.slots[src.0]
            .clone()
            .expect("Attempting to copy from a freed state.");
        let slot = slab.slots[dst.0]
            .as_mut()
            .expect("Attempting to copy into a freed state.");
        *slot = copy;
    }

    /// Ambient vector of a state
    pub fn ambient_of(&self, s: StateId) -> AmbientVector {
        self.states.borrow().slots[s.0]
            .as_ref()
            .expect("Attempting to read a freed state.")
            .ambient
            .clone()
    }

    /// Chart owning a state
    pub fn chart_of(&self, s: StateId) -> ChartId {
        self.states.borrow().slots[s.0]
            .as_ref()
            .expect("Attempting to read a freed state.")
            .chart
            .expect("Attempting to read the chart of an uninitialized state.")
    }

    /// Write an ambient point and its owning chart into a state
    pub fn set_state(&self, s: StateId, x: AmbientVector, chart: ChartId) {
        let mut slab = self.states.borrow_mut();
        let slot = slab.slots[s.0]
            .as_mut()
            .expect("Attempting to write a freed state.");
        slot.ambient = x;
        slot.chart = Some(chart);
    }

    // ---- chart collection ----------------------------------------------

    pub fn chart_count(&self) -> usize {
        self.charts.borrow().len()
    }

    pub fn chart_origin(&self, c: ChartId) -> AmbientVector {
        self.charts.borrow()[c.0].origin().clone()
    }

    pub fn chart_radius(&self, c: ChartId) -> f64 {
        self.charts.borrow()[c.0].radius()
    }

    pub fn chart_measure(&self, c: ChartId) -> f64 {
        self.charts.borrow()[c.0].measure()
    }

    pub fn chart_neighbors(&self, c: ChartId) -> Vec<ChartId> {
        self.charts.borrow()[c.0].neighbors().collect()
    }

    pub fn chart_basis(&self, c: ChartId) -> nalgebra::DMatrix<f64> {
        self.charts.borrow()[c.0].frame().basis().clone()
    }

    /// Tangent coordinates of x relative to a chart's origin
    pub fn chart_psi_inverse(&self, c: ChartId, x: &AmbientVector) -> TangentVector {
        self.charts.borrow()[c.0].psi_inverse(x)
    }

    /// On-manifold point for a tangent coordinate of a chart
    pub fn chart_psi(
        &self,
        c: ChartId,
        u: &TangentVector,
    ) -> PlanningResult<AmbientVector> {
        let lifted = self.charts.borrow()[c.0].lift(u);
        self.projector.project(self.constraint.as_ref(), &lifted)
    }

    /// Whether a tangent coordinate lies in a chart's validity polytope
    pub fn chart_contains(&self, c: ChartId, u: &TangentVector) -> bool {
        self.charts.borrow()[c.0].in_polytope(u)
    }

    /// Number of Monte-Carlo samples used per measure estimate
    pub fn monte_carlo_samples(&self) -> usize {
        self.thoroughness.powi(self.manifold_dim() as i32).ceil().max(1.0) as usize
    }

    /// Recompute and store the Monte-Carlo measure of a chart
    pub fn update_measure(&self, c: ChartId) {
        let samples = self.monte_carlo_samples();
        let mut rng = self.rng.borrow_mut();
        let mut charts = self.charts.borrow_mut();
        let measure = charts[c.0].estimate_measure(samples, &mut rng);
        charts[c.0].set_measure(measure);
    }

    /// Create a new chart centered at `xorigin`, which must lie on the
    /// manifold within the projection tolerance. Bisector half-spaces are
    /// inserted against every existing chart whose origin lies within 2 rho,
    /// and the measures of all affected charts are refreshed.
    ///
    /// The atlas grows during logically read-only planning queries; this is
    /// an intended side effect.
    pub fn new_chart(&self, xorigin: &AmbientVector) -> PlanningResult<ChartId> {
        let residual = self.constraint.eval(xorigin).norm();
        if residual > self.projector.settings().tolerance * 10.0 {
            return Err(PlanningError::InvalidParameter(format!(
                "new chart origin violates the constraint by {:.3e}",
                residual
            )));
        }
        let frame = TangentFrame::at(self.constraint.as_ref(), xorigin)?;
        let rho = self.rho.get();

        let id;
        let mut affected = Vec::new();
        {
            let mut charts = self.charts.borrow_mut();
            id = ChartId(charts.len());
            let mut chart = AtlasChart::new(id, xorigin.clone(), frame, rho);
            for other in charts.iter_mut() {
                if (other.origin() - xorigin).norm() <= 2.0 * rho {
                    other.add_boundary(id, xorigin);
                    chart.add_boundary(other.id(), other.origin());
                    affected.push(other.id());
                }
            }
            charts.push(chart);
        }

        self.update_measure(id);
        for c in affected {
            self.update_measure(c);
        }
        Ok(id)
    }

    /// Project `x` onto the manifold and ensure a chart covers it, creating
    /// one when needed. Used to seed charts at the start and goal.
    pub fn anchor_chart(&self, x: &AmbientVector) -> PlanningResult<(ChartId, AmbientVector)> {
        let projected = self.projector.project(self.constraint.as_ref(), x)?;
        match self.owning_chart(&projected, None) {
            Some(c) => Ok((c, projected)),
            None => Ok((self.new_chart(&projected)?, projected)),
        }
    }

    /// Pick a chart at random with probability proportional to its measure.
    /// Sampling an empty atlas is a programming error.
    pub fn sample_chart(&self) -> ChartId {
        let charts = self.charts.borrow();
        if charts.is_empty() {
            panic!("Attempting to sample a chart from an empty atlas.");
        }
        let total: f64 = charts.iter().map(|c| c.measure()).sum();
        let mut rng = self.rng.borrow_mut();
        if total <= 0.0 {
            return ChartId(rng.gen_range(0..charts.len()));
        }
        let mut target = rng.gen::<f64>() * total;
        for chart in charts.iter() {
            target -= chart.measure();
            if target <= 0.0 {
                return chart.id();
            }
        }
        ChartId(charts.len() - 1)
    }

    /// Find the chart whose polytope contains `x`. A `hint` chart is
    /// preferred, then the hint's neighbors, then the containing chart whose
    /// origin is closest in ambient distance.
    pub fn owning_chart(&self, x: &AmbientVector, hint: Option<ChartId>) -> Option<ChartId> {
        let charts = self.charts.borrow();
        let contains = |c: &AtlasChart| c.in_polytope(&c.psi_inverse(x));

        if let Some(h) = hint {
            let hinted = &charts[h.0];
            if contains(hinted) {
                return Some(h);
            }
            let mut best: Option<(f64, ChartId)> = None;
            for n in hinted.neighbors() {
                let chart = &charts[n.0];
                if contains(chart) {
                    let d = (chart.origin() - x).norm();
                    if best.map_or(true, |(bd, _)| d < bd) {
                        best = Some((d, n));
                    }
                }
            }
            if let Some((_, id)) = best {
                return Some(id);
            }
        }

        let mut best: Option<(f64, ChartId)> = None;
        for chart in charts.iter() {
            if contains(chart) {
                let d = (chart.origin() - x).norm();
                if best.map_or(true, |(bd, _)| d < bd) {
                    best = Some((d, chart.id()));
                }
            }
        }
        best.map(|(_, id)| id)
    }

    /// Shrink rho after a chart misrepresented the manifold, cap the
    /// offending chart's radius, and refresh its measure
    fn shrink_radius(&self, c: ChartId) {
        let rho = self.rho.get() * RHO_SHRINK;
        self.rho.set(rho);
        let k = self.manifold_dim();
        self.rho_s
            .set(rho / (1.0 - self.exploration).powf(1.0 / k as f64));
        self.charts.borrow_mut()[c.0].set_radius(rho);
        self.update_measure(c);
    }

    // ---- sampling ------------------------------------------------------

    /// Sample a state uniformly from the charted regions of the manifold
    pub fn sample_uniform(&self, out: StateId) -> PlanningResult<()> {
        let k = self.manifold_dim();
        for _ in 0..self.max_sampling_attempts {
            let c = self.sample_chart();
            let u = {
                let mut rng = self.rng.borrow_mut();
                uniform_in_ball(k, self.rho_s.get(), &mut rng)
            };
            if !self.charts.borrow()[c.0].in_halfspaces(&u) {
                continue;
            }
            let x = match self.chart_psi(c, &u) {
                Ok(x) => x,
                Err(_) => continue,
            };
            let owner = match self.owning_chart(&x, Some(c)) {
                Some(owner) => owner,
                None => match self.new_chart(&x) {
                    Ok(owner) => owner,
                    Err(_) => continue,
                },
            };
            self.set_state(out, x, owner);
            return Ok(());
        }
        Err(PlanningError::SamplingExhausted(format!(
            "no valid sample after {} attempts",
            self.max_sampling_attempts
        )))
    }

    /// Sample a state within tangent distance `distance` of `near`
    pub fn sample_uniform_near(
        &self,
        out: StateId,
        near: StateId,
        distance: f64,
    ) -> PlanningResult<()> {
        let k = self.manifold_dim();
        let c = self.chart_of(near);
        let center = self.chart_psi_inverse(c, &self.ambient_of(near));
        for _ in 0..self.max_sampling_attempts {
            let u = {
                let mut rng = self.rng.borrow_mut();
                &center + uniform_in_ball(k, distance, &mut rng)
            };
            let x = match self.chart_psi(c, &u) {
                Ok(x) => x,
                Err(_) => continue,
            };
            let owner = match self.owning_chart(&x, Some(c)) {
                Some(owner) => owner,
                None => match self.new_chart(&x) {
                    Ok(owner) => owner,
                    Err(_) => continue,
                },
            };
            self.set_state(out, x, owner);
            return Ok(());
        }
        Err(PlanningError::SamplingExhausted(format!(
            "no valid sample near state after {} attempts",
            self.max_sampling_attempts
        )))
    }

    // ---- traversal -----------------------------------------------------

    /// Walk along the manifold from `from` toward `to` in steps of delta,
    /// handing off between charts at polytope boundaries and creating charts
    /// where coverage runs out.
    ///
    /// When `interpolate` is false every intermediate state is checked
    /// against `validity` (or the installed checker when `validity` is
    /// None); the callback receives the candidate state and the distance
    /// travelled up to it. When `trace` is given, the visited states are
    /// appended to it, starting with a copy of `from`; a boundary-crossing
    /// state located by dichotomic search is inserted at each chart handoff.
    pub fn follow_manifold_with(
        &self,
        from: &AmbientVector,
        from_chart: ChartId,
        to: &AmbientVector,
        interpolate: bool,
        validity: Option<&dyn Fn(&AmbientVector, f64) -> bool>,
        mut trace: Option<&mut Vec<(AmbientVector, ChartId)>>,
    ) -> Traversal {
        let delta = self.delta;
        let straight_line = (to - from).norm();
        let mut c = from_chart;
        let mut x = from.clone();
        let mut travelled = 0.0;

        if let Some(t) = trace.as_mut() {
            t.clear();
            t.push((x.clone(), c));
        }

        let finish = |outcome, travelled, final_point: AmbientVector, final_chart| Traversal {
            outcome,
            travelled,
            straight_line,
            final_point,
            final_chart,
        };

        loop {
            if (&x - to).norm() <= delta {
                return finish(TraversalOutcome::Reached, travelled, x, c);
            }

            // One step of length delta toward the target, in tangent coordinates
            let step_result = {
                let charts = self.charts.borrow();
                let chart = &charts[c.0];
                let u_x = chart.psi_inverse(&x);
                let dir = chart.frame().project(&(to - &x));
                let dir_norm = dir.norm();
                if dir_norm < f64::EPSILON {
                    None
                } else {
                    let u_new = &u_x + dir * (delta / dir_norm);
                    let lifted = chart.lift(&u_new);
                    self.projector
                        .project(self.constraint.as_ref(), &lifted)
                        .ok()
                        .map(|x_new| (lifted, x_new))
                }
            };
            let Some((lifted, x_new)) = step_result else {
                return finish(TraversalOutcome::ProjectionFailed, travelled, x, c);
            };

            let step = (&x_new - &x).norm();
            if step < delta * MIN_STEP_FRACTION {
                return finish(TraversalOutcome::ProjectionFailed, travelled, x, c);
            }
            // Excessive curvature or chart-manifold deviation: the chart's
            // radius no longer guarantees the angular tolerance.
            if step > 2.0 * delta || (&lifted - &x_new).norm() > self.epsilon {
                self.shrink_radius(c);
                return finish(TraversalOutcome::ChartInvalid, travelled, x, c);
            }

            let exited = {
                let charts = self.charts.borrow();
                let chart = &charts[c.0];
                !chart.in_polytope(&chart.psi_inverse(&x_new))
            };
            if exited {
                if trace.is_some() {
                    let boundary = self.dichotomic_search(c, &x, &x_new);
                    if let Some(t) = trace.as_mut() {
                        t.push((boundary, c));
                    }
                }
                c = match self.owning_chart(&x_new, Some(c)) {
                    Some(next) => next,
                    None => match self.new_chart(&x_new) {
                        Ok(next) => next,
                        Err(_) => {
                            return finish(TraversalOutcome::ProjectionFailed, travelled, x, c)
                        }
                    },
                };
            }

            if !interpolate {
                let valid = match validity {
                    Some(check) => check(&x_new, travelled + step),
                    None => self
                        .validity
                        .borrow()
                        .as_ref()
                        .map_or(true, |v| v.is_valid(&x_new)),
                };
                if !valid {
                    return finish(TraversalOutcome::Collision, travelled, x, c);
                }
            }

            travelled += step;
            if travelled > self.lambda * straight_line {
                return finish(TraversalOutcome::TooFar, travelled, x_new, c);
            }

            if let Some(t) = trace.as_mut() {
                t.push((x_new.clone(), c));
            }
            x = x_new;
        }
    }

    /// State-level traversal: returns true iff `to` was reached. When
    /// `state_list` is given, copies of the visited states (allocated
    /// through this atlas; the caller frees them) are appended, including a
    /// copy of `from` and the final state.
    pub fn follow_manifold(
        &self,
        from: StateId,
        to: StateId,
        interpolate: bool,
        state_list: Option<&mut Vec<StateId>>,
    ) -> bool {
        let from_x = self.ambient_of(from);
        let from_c = self.chart_of(from);
        let to_x = self.ambient_of(to);

        let mut trace = Vec::new();
        let result = self.follow_manifold_with(
            &from_x,
            from_c,
            &to_x,
            interpolate,
            None,
            state_list.is_some().then_some(&mut trace),
        );
        if let Some(list) = state_list {
            let missing_final = trace
                .last()
                .map_or(true, |(p, _)| (p - &result.final_point).norm() > f64::EPSILON);
            if missing_final {
                trace.push((result.final_point.clone(), result.final_chart));
            }
            for (point, chart) in &trace {
                let s = self.alloc_state();
                self.set_state(s, point.clone(), *chart);
                list.push(s);
            }
        }
        result.reached()
    }

    /// Locate the polytope boundary of chart `c` between a tangent point
    /// inside it and one outside it, by bisection to a fixed tolerance.
    /// Returns the on-manifold point just inside the border.
    pub fn dichotomic_search(
        &self,
        c: ChartId,
        x_inside: &AmbientVector,
        x_outside: &AmbientVector,
    ) -> AmbientVector {
        let lifted = {
            let charts = self.charts.borrow();
            let chart = &charts[c.0];
            let mut u_in = chart.psi_inverse(x_inside);
            let mut u_out = chart.psi_inverse(x_outside);
            while (&u_out - &u_in).norm() > BOUNDARY_TOLERANCE {
                let mid = (&u_in + &u_out) / 2.0;
                if chart.in_polytope(&mid) {
                    u_in = mid;
                } else {
                    u_out = mid;
                }
            }
            chart.lift(&u_in)
        };
        self.projector
            .project(self.constraint.as_ref(), &lifted)
            .unwrap_or_else(|_| x_inside.clone())
    }

    // ---- interpolation -------------------------------------------------

    /// State at parameter `t` along the manifold from `from` to `to`, where
    /// t = 0 is `from` and t = 1 is the final state reached by an
    /// interpolating traversal (which may not be `to`). Written into `out`.
    pub fn interpolate(&self, from: StateId, to: StateId, t: f64, out: StateId) {
        let from_x = self.ambient_of(from);
        let from_c = self.chart_of(from);
        let to_x = self.ambient_of(to);
        let mut trace = Vec::new();
        let _ = self.follow_manifold_with(&from_x, from_c, &to_x, true, None, Some(&mut trace));
        self.write_interpolant(&trace, t, out);
    }

    /// Like `interpolate`, but reuses the intermediate states produced by a
    /// previous `follow_manifold(..., interpolate = true, state_list)`.
    /// `state_list` must contain at least one state.
    pub fn fast_interpolate(&self, state_list: &[StateId], t: f64, out: StateId) {
        let trace: Vec<(AmbientVector, ChartId)> = state_list
            .iter()
            .map(|&s| (self.ambient_of(s), self.chart_of(s)))
            .collect();
        self.write_interpolant(&trace, t, out);
    }

    fn write_interpolant(&self, trace: &[(AmbientVector, ChartId)], t: f64, out: StateId) {
        assert!(
            !trace.is_empty(),
            "Attempting to interpolate over an empty traversal trace."
        );
        if trace.len() == 1 {
            let (point, chart) = &trace[0];
            self.set_state(out, point.clone(), *chart);
            return;
        }

        let total: f64 = trace
            .windows(2)
            .map(|w| (&w[1].0 - &w[0].0).norm())
            .sum();
        let mut remaining = t.clamp(0.0, 1.0) * total;
        for w in trace.windows(2) {
            let (ref a, _) = w[0];
            let (ref b, chart_b) = w[1];
            let seg = (b - a).norm();
            if remaining <= seg || seg <= f64::EPSILON {
                let s = if seg <= f64::EPSILON { 0.0 } else { remaining / seg };
                let lerp = a + (b - a) * s;
                let point = self
                    .projector
                    .project(self.constraint.as_ref(), &lerp)
                    .unwrap_or_else(|_| b.clone());
                let chart = self.owning_chart(&point, Some(chart_b)).unwrap_or(chart_b);
                self.set_state(out, point, chart);
                return;
            }
            remaining -= seg;
        }
        let (point, chart) = trace.last().unwrap().clone();
        self.set_state(out, point, chart);
    }

    /// Ambient Euclidean distance between two states
    pub fn distance(&self, a: StateId, b: StateId) -> f64 {
        (self.ambient_of(a) - self.ambient_of(b)).norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::constraint::Sphere;
    use nalgebra::DVector;

    fn sphere_atlas() -> Rc<AtlasStateSpace> {
        let sphere = Rc::new(Sphere::unit());
        Rc::new(AtlasStateSpace::new(sphere, AtlasConfig::default()).unwrap())
    }

    fn state_at(atlas: &AtlasStateSpace, coords: Vec<f64>) -> StateId {
        let x = DVector::from_vec(coords);
        let (chart, projected) = atlas.anchor_chart(&x).unwrap();
        let s = atlas.alloc_state();
        atlas.set_state(s, projected, chart);
        s
    }

    #[test]
    fn test_config_validation() {
        let mut config = AtlasConfig::default();
        config.lambda = 1.0;
        assert!(config.validate().is_err());
        config = AtlasConfig::default();
        config.exploration = 1.0;
        assert!(config.validate().is_err());
        assert!(AtlasConfig::default().validate().is_ok());
    }

    #[test]
    fn test_anchor_chart_projects_and_covers() {
        let atlas = sphere_atlas();
        let (chart, projected) = atlas
            .anchor_chart(&DVector::from_vec(vec![0.0, 0.0, 1.7]))
            .unwrap();
        assert!(atlas.constraint().eval(&projected).norm() <= 1e-8);
        assert_eq!(atlas.chart_count(), 1);
        let u = atlas.chart_psi_inverse(chart, &projected);
        assert!(atlas.chart_contains(chart, &u));
    }

    #[test]
    fn test_sampled_states_satisfy_invariants() {
        let atlas = sphere_atlas();
        atlas
            .anchor_chart(&DVector::from_vec(vec![0.0, 0.0, 1.0]))
            .unwrap();
        let s = atlas.alloc_state();
        for _ in 0..50 {
            atlas.sample_uniform(s).unwrap();
            let x = atlas.ambient_of(s);
            let c = atlas.chart_of(s);
            assert!(atlas.constraint().eval(&x).norm() <= 1e-8);
            let u = atlas.chart_psi_inverse(c, &x);
            assert!(atlas.chart_contains(c, &u));
        }
        atlas.free_state(s);
    }

    #[test]
    fn test_follow_manifold_to_self_is_single_state() {
        let atlas = sphere_atlas();
        let s = state_at(&atlas, vec![0.0, 0.0, 1.0]);
        let mut states = Vec::new();
        assert!(atlas.follow_manifold(s, s, true, Some(&mut states)));
        assert_eq!(states.len(), 1);
        assert!((atlas.ambient_of(states[0]) - atlas.ambient_of(s)).norm() < 1e-12);
    }

    #[test]
    fn test_follow_manifold_quarter_great_circle() {
        let atlas = sphere_atlas();
        let start = state_at(&atlas, vec![0.0, 0.0, 1.0]);
        let goal = state_at(&atlas, vec![0.0, 1.0, 0.0]);

        let mut states = Vec::new();
        let reached = atlas.follow_manifold(start, goal, true, Some(&mut states));
        assert!(reached);

        let goal_x = atlas.ambient_of(goal);
        let mut travelled = 0.0;
        for w in states.windows(2) {
            travelled += (atlas.ambient_of(w[1]) - atlas.ambient_of(w[0])).norm();
        }
        for &s in &states {
            let x = atlas.ambient_of(s);
            assert!(atlas.constraint().eval(&x).norm() <= 1e-6);
        }
        let last = atlas.ambient_of(*states.last().unwrap());
        assert!((last - goal_x).norm() <= atlas.delta());
        // Quarter great circle plus discretization slack.
        assert!(travelled <= std::f64::consts::FRAC_PI_2 + 2.0 * atlas.delta());
    }

    #[test]
    fn test_traversal_distance_bounded_by_lambda() {
        let atlas = sphere_atlas();
        let start = state_at(&atlas, vec![0.0, 0.0, 1.0]);
        let goal = state_at(&atlas, vec![0.0, 1.0, 0.0]);
        let from_x = atlas.ambient_of(start);
        let from_c = atlas.chart_of(start);
        let to_x = atlas.ambient_of(goal);
        let result = atlas.follow_manifold_with(&from_x, from_c, &to_x, true, None, None);
        assert!(result.travelled <= atlas.lambda() * result.straight_line + atlas.delta());
    }

    #[test]
    fn test_collision_stops_traversal() {
        let atlas = sphere_atlas();
        let start = state_at(&atlas, vec![0.0, 0.0, 1.0]);
        let goal = state_at(&atlas, vec![0.0, 1.0, 0.0]);
        let from_x = atlas.ambient_of(start);
        let from_c = atlas.chart_of(start);
        let to_x = atlas.ambient_of(goal);
        // Everything below z = 0.5 is in collision.
        let blocked = |x: &AmbientVector, _travelled: f64| x[2] > 0.5;
        let result =
            atlas.follow_manifold_with(&from_x, from_c, &to_x, false, Some(&blocked), None);
        assert_eq!(result.outcome, TraversalOutcome::Collision);
        assert!(result.final_point[2] > 0.5);
        let fraction = result.last_valid_fraction();
        assert!((0.0..=1.0).contains(&fraction));
        assert!(fraction < 1.0);
    }

    #[test]
    fn test_chart_growth_is_sublinear() {
        let atlas = sphere_atlas();
        atlas
            .anchor_chart(&DVector::from_vec(vec![0.0, 0.0, 1.0]))
            .unwrap();
        let s = atlas.alloc_state();
        for _ in 0..1000 {
            atlas.sample_uniform(s).unwrap();
        }
        let after_first = atlas.chart_count();
        for _ in 0..1000 {
            atlas.sample_uniform(s).unwrap();
        }
        let after_second = atlas.chart_count();
        atlas.free_state(s);
        // Chart creation saturates as the sphere gets covered: the second
        // thousand samples must add fewer charts than the first did.
        assert!(after_first > 1);
        assert!(after_second - after_first < after_first);
        for i in 0..after_second {
            assert!(atlas.chart_measure(ChartId(i)) >= 0.0);
            let basis = atlas.chart_basis(ChartId(i));
            let gram = basis.tr_mul(&basis);
            for r in 0..gram.nrows() {
                for c in 0..gram.ncols() {
                    let expected = if r == c { 1.0 } else { 0.0 };
                    assert!((gram[(r, c)] - expected).abs() < 1e-10);
                }
            }
        }
    }

    #[test]
    fn test_deterministic_under_fixed_seed() {
        let build = || {
            let atlas = sphere_atlas();
            atlas
                .anchor_chart(&DVector::from_vec(vec![0.0, 0.0, 1.0]))
                .unwrap();
            let s = atlas.alloc_state();
            for _ in 0..300 {
                atlas.sample_uniform(s).unwrap();
            }
            atlas.chart_count()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_interpolate_midpoint_on_manifold() {
        let atlas = sphere_atlas();
        let start = state_at(&atlas, vec![0.0, 0.0, 1.0]);
        let goal = state_at(&atlas, vec![0.0, 1.0, 0.0]);
        let out = atlas.alloc_state();
        atlas.interpolate(start, goal, 0.5, out);
        let mid = atlas.ambient_of(out);
        assert!(atlas.constraint().eval(&mid).norm() <= 1e-6);
        // Roughly equidistant from both endpoints along the great circle.
        let to_start = (atlas.ambient_of(start) - &mid).norm();
        let to_goal = (atlas.ambient_of(goal) - &mid).norm();
        assert!((to_start - to_goal).abs() < 0.2);
    }

    #[test]
    fn test_fast_interpolate_reuses_traversal_trace() {
        let atlas = sphere_atlas();
        let start = state_at(&atlas, vec![0.0, 0.0, 1.0]);
        let goal = state_at(&atlas, vec![0.0, 1.0, 0.0]);
        let mut states = Vec::new();
        assert!(atlas.follow_manifold(start, goal, true, Some(&mut states)));

        let out = atlas.alloc_state();
        atlas.fast_interpolate(&states, 0.0, out);
        assert!((atlas.ambient_of(out) - atlas.ambient_of(start)).norm() < 1e-9);
        atlas.fast_interpolate(&states, 1.0, out);
        let end = atlas.ambient_of(*states.last().unwrap());
        assert!((atlas.ambient_of(out) - end).norm() < 1e-6);

        // Matches the recomputing interpolation to within a step.
        let recomputed = atlas.alloc_state();
        atlas.interpolate(start, goal, 0.5, recomputed);
        atlas.fast_interpolate(&states, 0.5, out);
        assert!((atlas.ambient_of(out) - atlas.ambient_of(recomputed)).norm() < 2.0 * atlas.delta());
    }

    #[test]
    fn test_sample_uniform_near_stays_close() {
        let atlas = sphere_atlas();
        let near = state_at(&atlas, vec![0.0, 0.0, 1.0]);
        let out = atlas.alloc_state();
        for _ in 0..20 {
            atlas.sample_uniform_near(out, near, 0.05).unwrap();
            let x = atlas.ambient_of(out);
            assert!(atlas.constraint().eval(&x).norm() <= 1e-8);
            // A tangent ball of radius 0.05 cannot wander far in ambient space.
            assert!((x - atlas.ambient_of(near)).norm() < 0.1);
        }
    }

    #[test]
    fn test_copy_state_independent() {
        let atlas = sphere_atlas();
        let src = state_at(&atlas, vec![0.0, 0.0, 1.0]);
        let dst = atlas.alloc_state();
        atlas.copy_state(dst, src);
        assert!((atlas.ambient_of(dst) - atlas.ambient_of(src)).norm() < 1e-12);
        assert_eq!(atlas.chart_of(dst), atlas.chart_of(src));
        atlas.free_state(src);
        // dst still readable after src is gone.
        let _ = atlas.ambient_of(dst);
        atlas.free_state(dst);
    }

    #[test]
    #[should_panic(expected = "already been freed")]
    fn test_double_free_panics() {
        let atlas = sphere_atlas();
        let s = atlas.alloc_state();
        atlas.free_state(s);
        atlas.free_state(s);
    }

    #[test]
    #[should_panic(expected = "empty atlas")]
    fn test_sample_chart_on_empty_atlas_panics() {
        let atlas = sphere_atlas();
        atlas.sample_chart();
    }

    #[test]
    fn test_asymmetric_interpolation_flag() {
        let atlas = sphere_atlas();
        assert!(!atlas.has_symmetric_interpolate());
    }
}
