//! Orthonormal tangent frames of the constraint manifold
//!
//! A chart's frame is an n x k orthonormal basis B for the null space of the
//! constraint Jacobian at the chart origin, so that B^T B = I_k and
//! J(origin) B = 0.

use nalgebra::{DMatrix, SymmetricEigen};

use crate::common::error::{PlanningError, PlanningResult};
use crate::common::types::{AmbientVector, TangentVector};
use crate::manifold::constraint::Constraint;

/// Relative cutoff under which an eigenvalue of J^T J counts as zero
const RANK_TOLERANCE: f64 = 1e-10;

/// Orthonormal basis of the manifold tangent space at a point
#[derive(Debug, Clone)]
pub struct TangentFrame {
    basis: DMatrix<f64>,
}

impl TangentFrame {
    /// Compute the tangent frame at `origin`, which must lie on the manifold.
    ///
    /// The null space of J(origin) is extracted from the eigendecomposition
    /// of the symmetric matrix J^T J; the eigenvectors for (numerically) zero
    /// eigenvalues form an orthonormal basis of the tangent space. Fails when
    /// the Jacobian has lost rank, e.g. at a manifold singularity.
    pub fn at(constraint: &dyn Constraint, origin: &AmbientVector) -> PlanningResult<Self> {
        let n = constraint.ambient_dim();
        let k = constraint.manifold_dim();
        let j = constraint.jacobian(origin);
        let jtj = j.transpose() * &j;

        let eigen = SymmetricEigen::new(jtj);
        let max_eig = eigen.eigenvalues.iter().fold(0.0f64, |a, &b| a.max(b.abs()));
        let cutoff = RANK_TOLERANCE * max_eig.max(1.0);

        let mut columns = Vec::with_capacity(k);
        for (i, &lambda) in eigen.eigenvalues.iter().enumerate() {
            if lambda.abs() <= cutoff {
                columns.push(eigen.eigenvectors.column(i).clone_owned());
            }
        }
        if columns.len() != k {
            return Err(PlanningError::NumericalError(format!(
                "tangent frame: Jacobian null space has dimension {} but the manifold \
                 dimension is {} (rank-deficient Jacobian)",
                columns.len(),
                k
            )));
        }

        let basis = DMatrix::from_columns(&columns);
        debug_assert_eq!(basis.nrows(), n);
        debug_assert_eq!(basis.ncols(), k);
        Ok(TangentFrame { basis })
    }

    /// The n x k basis matrix B
    pub fn basis(&self) -> &DMatrix<f64> {
        &self.basis
    }

    /// Ambient dimension n
    pub fn ambient_dim(&self) -> usize {
        self.basis.nrows()
    }

    /// Tangent (manifold) dimension k
    pub fn tangent_dim(&self) -> usize {
        self.basis.ncols()
    }

    /// Orthogonal projection of an ambient direction into tangent
    /// coordinates, u = B^T v
    pub fn project(&self, v: &AmbientVector) -> TangentVector {
        self.basis.tr_mul(v)
    }

    /// Lift of a tangent coordinate into the ambient space, v = B u
    pub fn lift(&self, u: &TangentVector) -> AmbientVector {
        &self.basis * u
    }
}
