//! Local tangent charts of the atlas
//!
//! A chart is a Euclidean coordinate patch of the manifold: an on-manifold
//! origin, an orthonormal tangent basis, and a polytope of validity in
//! tangent coordinates. The polytope starts as the ball ||u|| <= rho and is
//! narrowed by one perpendicular-bisector half-space per neighboring chart.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::common::error::PlanningResult;
use crate::common::types::{AmbientVector, ChartId, TangentVector};
use crate::manifold::constraint::Constraint;
use crate::manifold::frame::TangentFrame;
use crate::manifold::projection::NewtonProjector;

/// One half-space a . u <= b of a chart polytope, owed to exactly one neighbor
#[derive(Debug, Clone)]
pub struct Halfspace {
    /// Unit normal in tangent coordinates
    pub normal: TangentVector,
    /// Signed offset along the normal
    pub offset: f64,
    /// The neighbor whose bisector this is
    pub neighbor: ChartId,
}

/// A local tangent chart of the manifold
#[derive(Debug, Clone)]
pub struct AtlasChart {
    id: ChartId,
    origin: AmbientVector,
    frame: TangentFrame,
    radius: f64,
    halfspaces: Vec<Halfspace>,
    measure: f64,
}

impl AtlasChart {
    /// Construct a chart at `origin` (assumed on-manifold within the
    /// projection tolerance) with the given frame and radius. The initial
    /// polytope is the bounding ball, so the initial measure is the ball's.
    pub fn new(id: ChartId, origin: AmbientVector, frame: TangentFrame, radius: f64) -> Self {
        let k = frame.tangent_dim();
        let measure = ball_measure(k, radius);
        AtlasChart {
            id,
            origin,
            frame,
            radius,
            halfspaces: Vec::new(),
            measure,
        }
    }

    pub fn id(&self) -> ChartId {
        self.id
    }

    pub fn origin(&self) -> &AmbientVector {
        &self.origin
    }

    pub fn frame(&self) -> &TangentFrame {
        &self.frame
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Shrink the validity radius. The radius only ever decreases.
    pub fn set_radius(&mut self, radius: f64) {
        self.radius = self.radius.min(radius);
    }

    /// Latest Monte-Carlo estimate of the validity region's volume
    pub fn measure(&self) -> f64 {
        self.measure
    }

    pub fn set_measure(&mut self, measure: f64) {
        self.measure = measure;
    }

    /// Neighboring charts, one per polytope half-space
    pub fn neighbors(&self) -> impl Iterator<Item = ChartId> + '_ {
        self.halfspaces.iter().map(|h| h.neighbor)
    }

    pub fn neighbor_count(&self) -> usize {
        self.halfspaces.len()
    }

    /// The ambient point origin + B u, without projection
    pub fn lift(&self, u: &TangentVector) -> AmbientVector {
        &self.origin + self.frame.lift(u)
    }

    /// Tangent coordinates of an ambient point, u = B^T (x - origin)
    pub fn psi_inverse(&self, x: &AmbientVector) -> TangentVector {
        self.frame.project(&(x - &self.origin))
    }

    /// The on-manifold point for tangent coordinate u: lift then project.
    /// Fails when the Newton projection does.
    pub fn psi(
        &self,
        u: &TangentVector,
        constraint: &dyn Constraint,
        projector: &NewtonProjector,
    ) -> PlanningResult<AmbientVector> {
        projector.project(constraint, &self.lift(u))
    }

    /// Whether u satisfies every half-space of the polytope (ignoring the
    /// bounding ball). Sampling uses this form so that frontier samples
    /// beyond the radius can seed new charts.
    pub fn in_halfspaces(&self, u: &TangentVector) -> bool {
        self.halfspaces
            .iter()
            .all(|h| h.normal.dot(u) <= h.offset)
    }

    /// Whether u lies in the validity polytope: all half-space tests and the
    /// bounding ball ||u|| <= radius
    pub fn in_polytope(&self, u: &TangentVector) -> bool {
        u.norm() <= self.radius && self.in_halfspaces(u)
    }

    /// Insert the perpendicular-bisector half-space separating this chart's
    /// origin from `neighbor_origin`, expressed in this chart's tangent
    /// frame, and record the neighbor. A repeated neighbor replaces its
    /// previous half-space, keeping one half-space per neighbor.
    pub fn add_boundary(&mut self, neighbor: ChartId, neighbor_origin: &AmbientVector) {
        let u_n = self.psi_inverse(neighbor_origin);
        let dist = u_n.norm();
        if dist < f64::EPSILON {
            return;
        }
        let halfspace = Halfspace {
            normal: &u_n / dist,
            offset: dist / 2.0,
            neighbor,
        };
        if let Some(existing) = self.halfspaces.iter_mut().find(|h| h.neighbor == neighbor) {
            *existing = halfspace;
        } else {
            self.halfspaces.push(halfspace);
        }
    }

    /// Monte-Carlo estimate of the polytope volume: the fraction of uniform
    /// samples from the bounding ball that satisfy every half-space, times
    /// the ball's measure.
    pub fn estimate_measure(&self, samples: usize, rng: &mut StdRng) -> f64 {
        if self.halfspaces.is_empty() {
            return ball_measure(self.frame.tangent_dim(), self.radius);
        }
        let mut inside = 0usize;
        for _ in 0..samples {
            let u = uniform_in_ball(self.frame.tangent_dim(), self.radius, rng);
            if self.in_halfspaces(&u) {
                inside += 1;
            }
        }
        ball_measure(self.frame.tangent_dim(), self.radius) * inside as f64 / samples as f64
    }
}

/// Lebesgue measure of the k-ball of radius r, via the two-step volume
/// recurrence U_k = U_{k-2} * 2 pi / k on the unit ball
pub fn ball_measure(k: usize, r: f64) -> f64 {
    let mut unit = if k % 2 == 0 { 1.0 } else { 2.0 };
    let mut i = if k % 2 == 0 { 2 } else { 3 };
    while i <= k {
        unit *= 2.0 * std::f64::consts::PI / i as f64;
        i += 2;
    }
    unit * r.powi(k as i32)
}

/// Uniform sample from the k-ball of radius r: normal direction, radius
/// scaled by U^(1/k)
pub fn uniform_in_ball(k: usize, r: f64, rng: &mut StdRng) -> TangentVector {
    let mut dir = TangentVector::zeros(k);
    loop {
        for i in 0..k {
            dir[i] = rng.sample(StandardNormal);
        }
        let norm = dir.norm();
        if norm > f64::EPSILON {
            let radius = r * rng.gen::<f64>().powf(1.0 / k as f64);
            return dir * (radius / norm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::constraint::Sphere;
    use nalgebra::DVector;
    use rand::SeedableRng;

    fn chart_at(origin: Vec<f64>, radius: f64) -> (Sphere, AtlasChart) {
        let sphere = Sphere::unit();
        let origin = DVector::from_vec(origin);
        let frame = TangentFrame::at(&sphere, &origin).unwrap();
        (sphere, AtlasChart::new(ChartId(0), origin, frame, radius))
    }

    #[test]
    fn test_ball_measure_low_dimensions() {
        assert!((ball_measure(1, 1.0) - 2.0).abs() < 1e-12);
        assert!((ball_measure(2, 1.0) - std::f64::consts::PI).abs() < 1e-12);
        assert!((ball_measure(3, 1.0) - 4.0 * std::f64::consts::PI / 3.0).abs() < 1e-12);
        assert!((ball_measure(2, 2.0) - 4.0 * std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn test_uniform_in_ball_stays_in_ball() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let u = uniform_in_ball(2, 0.5, &mut rng);
            assert!(u.norm() <= 0.5 + 1e-12);
        }
    }

    #[test]
    fn test_psi_round_trip_near_origin() {
        let (sphere, chart) = chart_at(vec![0.0, 0.0, 1.0], 0.1);
        let projector = NewtonProjector::new(Default::default());
        let u = DVector::from_vec(vec![0.05, -0.03]);
        let x = chart.psi(&u, &sphere, &projector).unwrap();
        assert!(sphere.eval(&x).norm() <= 1e-8);
        let back = chart.psi_inverse(&x);
        // psi projects back to the manifold, so the round trip agrees to the
        // chart-to-manifold distance, not machine epsilon.
        assert!((back - u).norm() < 1e-2);
    }

    #[test]
    fn test_psi_of_psi_inverse_recovers_on_manifold_point() {
        let (sphere, chart) = chart_at(vec![0.0, 0.0, 1.0], 0.1);
        let projector = NewtonProjector::new(Default::default());
        // An on-manifold point inside the chart's validity region.
        let x = DVector::from_vec(vec![0.06, 0.04, (1.0f64 - 0.0052).sqrt()]);
        let recovered = chart
            .psi(&chart.psi_inverse(&x), &sphere, &projector)
            .unwrap();
        assert!((recovered - x).norm() < 1e-2);
    }

    #[test]
    fn test_bisector_halfspace_splits_neighbors() {
        let (_, mut chart) = chart_at(vec![0.0, 0.0, 1.0], 0.5);
        // A neighbor sitting off to the side of the chart origin.
        let neighbor_origin = DVector::from_vec(vec![0.3, 0.0, (1.0f64 - 0.09).sqrt()]);
        chart.add_boundary(ChartId(1), &neighbor_origin);
        assert_eq!(chart.neighbor_count(), 1);

        let u_n = chart.psi_inverse(&neighbor_origin);
        // Points nearer this chart's origin than the bisector stay inside;
        // the neighbor's own projection falls outside.
        assert!(chart.in_halfspaces(&(&u_n * 0.25)));
        assert!(!chart.in_halfspaces(&u_n));
        // The bisector midpoint itself is on the boundary (inside, closed set).
        assert!(chart.in_halfspaces(&(&u_n * 0.5)));
    }

    #[test]
    fn test_add_boundary_replaces_existing_neighbor() {
        let (_, mut chart) = chart_at(vec![0.0, 0.0, 1.0], 0.5);
        let first = DVector::from_vec(vec![0.3, 0.0, (1.0f64 - 0.09).sqrt()]);
        let second = DVector::from_vec(vec![0.2, 0.0, (1.0f64 - 0.04).sqrt()]);
        chart.add_boundary(ChartId(1), &first);
        chart.add_boundary(ChartId(1), &second);
        assert_eq!(chart.neighbor_count(), 1);
    }

    #[test]
    fn test_in_polytope_requires_ball() {
        let (_, chart) = chart_at(vec![0.0, 0.0, 1.0], 0.1);
        let inside = DVector::from_vec(vec![0.05, 0.0]);
        let outside = DVector::from_vec(vec![0.5, 0.0]);
        assert!(chart.in_polytope(&inside));
        assert!(!chart.in_polytope(&outside));
        // Outside the ball but no half-spaces yet, so the relaxed test passes.
        assert!(chart.in_halfspaces(&outside));
    }

    #[test]
    fn test_measure_halved_by_central_bisector() {
        let (_, mut chart) = chart_at(vec![0.0, 0.0, 1.0], 0.1);
        let full = ball_measure(2, 0.1);
        assert!((chart.measure() - full).abs() < 1e-12);

        // A neighbor whose projection is at tangent distance ~0; fake one at
        // a small offset so the bisector passes near the origin.
        let neighbor_origin = DVector::from_vec(vec![1e-4, 0.0, 1.0]);
        chart.add_boundary(ChartId(1), &neighbor_origin);
        let mut rng = StdRng::seed_from_u64(42);
        let estimate = chart.estimate_measure(4000, &mut rng);
        assert!(
            (estimate - full / 2.0).abs() < full * 0.05,
            "estimate {} not close to half of {}",
            estimate,
            full
        );
    }
}
