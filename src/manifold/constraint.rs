//! Implicit constraint functions defining manifolds
//!
//! A manifold is the zero set of a smooth equality constraint
//! F: R^n -> R^m with Jacobian J: R^n -> R^(m x n). The manifold
//! dimension is k = n - m.

use nalgebra::{DMatrix, DVector};

use crate::common::types::AmbientVector;

/// Trait for a user-supplied equality constraint and its Jacobian.
///
/// Both `eval` and `jacobian` are assumed smooth and side-effect free.
pub trait Constraint {
    /// Dimension n of the ambient space
    fn ambient_dim(&self) -> usize;

    /// Number of constraints m (the codimension)
    fn constraint_dim(&self) -> usize;

    /// Dimension k = n - m of the manifold
    fn manifold_dim(&self) -> usize {
        self.ambient_dim() - self.constraint_dim()
    }

    /// Amount of violation of each constraint at `x`; zero on the manifold
    fn eval(&self, x: &AmbientVector) -> DVector<f64>;

    /// Jacobian of the constraint function at `x`, m rows by n columns
    fn jacobian(&self, x: &AmbientVector) -> DMatrix<f64>;
}

/// The sphere of a given radius in R^n: F(x) = ||x|| - r
#[derive(Debug, Clone)]
pub struct Sphere {
    dim: usize,
    radius: f64,
}

impl Sphere {
    pub fn new(dim: usize, radius: f64) -> Self {
        Sphere { dim, radius }
    }

    /// The unit sphere in R^3
    pub fn unit() -> Self {
        Sphere::new(3, 1.0)
    }
}

impl Constraint for Sphere {
    fn ambient_dim(&self) -> usize {
        self.dim
    }

    fn constraint_dim(&self) -> usize {
        1
    }

    fn eval(&self, x: &AmbientVector) -> DVector<f64> {
        DVector::from_vec(vec![x.norm() - self.radius])
    }

    fn jacobian(&self, x: &AmbientVector) -> DMatrix<f64> {
        let norm = x.norm();
        let mut j = DMatrix::zeros(1, self.dim);
        for i in 0..self.dim {
            j[(0, i)] = x[i] / norm;
        }
        j
    }
}

/// Three points in R^3 with five constraints, a 4D manifold in R^9:
/// p1 sits exactly 3 units above p2, and p3 orbits p1 at distance 2
/// in the plane perpendicular to p1.
#[derive(Debug, Clone, Default)]
pub struct OrbitingPoints;

impl OrbitingPoints {
    pub fn new() -> Self {
        OrbitingPoints
    }
}

impl Constraint for OrbitingPoints {
    fn ambient_dim(&self) -> usize {
        9
    }

    fn constraint_dim(&self) -> usize {
        5
    }

    fn eval(&self, x: &AmbientVector) -> DVector<f64> {
        let p1 = x.rows(0, 3);
        let p2 = x.rows(3, 3);
        let p3 = x.rows(6, 3);

        let mut f = DVector::zeros(5);
        f[0] = p1[0] - p2[0];
        f[1] = p1[1] - p2[1];
        f[2] = p1[2] - p2[2] - 3.0;
        f[3] = (&p1 - &p3).norm() - 2.0;
        f[4] = (&p3 - &p1).dot(&p1);
        f
    }

    fn jacobian(&self, x: &AmbientVector) -> DMatrix<f64> {
        let p1 = x.rows(0, 3).clone_owned();
        let p3 = x.rows(6, 3).clone_owned();

        let mut j = DMatrix::zeros(5, 9);
        j[(0, 0)] = 1.0;
        j[(0, 3)] = -1.0;
        j[(1, 1)] = 1.0;
        j[(1, 4)] = -1.0;
        j[(2, 2)] = 1.0;
        j[(2, 5)] = -1.0;

        let diff = &p1 - &p3;
        let dist = diff.norm();
        for i in 0..3 {
            j[(3, i)] = diff[i] / dist;
            j[(3, 6 + i)] = -diff[i] / dist;
        }
        for i in 0..3 {
            j[(4, i)] = p3[i] - 2.0 * p1[i];
            j[(4, 6 + i)] = p1[i];
        }
        j
    }
}
