//! Newton projection onto the constraint manifold

use nalgebra::SVD;

use crate::common::error::{PlanningError, PlanningResult};
use crate::common::types::AmbientVector;
use crate::manifold::constraint::Constraint;

/// Relative cutoff under which a singular value of the Jacobian counts as zero
const RANK_TOLERANCE: f64 = 1e-10;

/// Settings for the Newton iteration
#[derive(Debug, Clone, Copy)]
pub struct ProjectionSettings {
    /// Iteration stops successfully once ||F(x)|| falls below this
    pub tolerance: f64,
    /// Iteration fails after this many steps
    pub max_iterations: usize,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        ProjectionSettings {
            tolerance: 1e-8,
            max_iterations: 200,
        }
    }
}

/// Maps ambient points onto the manifold via x <- x - J(x)^+ F(x).
///
/// Purely functional: projection never touches atlas state.
#[derive(Debug, Clone, Copy)]
pub struct NewtonProjector {
    settings: ProjectionSettings,
}

impl NewtonProjector {
    pub fn new(settings: ProjectionSettings) -> Self {
        NewtonProjector { settings }
    }

    pub fn settings(&self) -> ProjectionSettings {
        self.settings
    }

    /// Project `guess` onto the manifold, or fail on non-convergence or a
    /// rank-deficient Jacobian.
    pub fn project(
        &self,
        constraint: &dyn Constraint,
        guess: &AmbientVector,
    ) -> PlanningResult<AmbientVector> {
        let m = constraint.constraint_dim();
        let mut x = guess.clone();

        for _ in 0..self.settings.max_iterations {
            let f = constraint.eval(&x);
            if f.norm() <= self.settings.tolerance {
                return Ok(x);
            }

            let j = constraint.jacobian(&x);
            let svd = SVD::new(j, true, true);
            let max_sv = svd
                .singular_values
                .iter()
                .fold(0.0f64, |a, &b| a.max(b));
            let cutoff = RANK_TOLERANCE * max_sv.max(1.0);
            if svd.rank(cutoff) < m {
                return Err(PlanningError::NumericalError(
                    "projection: Jacobian rank deficient".to_string(),
                ));
            }

            // Minimum-norm Newton step through the pseudoinverse
            let dx = svd.solve(&f, cutoff).map_err(|e| {
                PlanningError::NumericalError(format!("projection: SVD solve failed: {}", e))
            })?;
            x -= dx;
        }

        Err(PlanningError::NumericalError(format!(
            "projection: no convergence within {} iterations",
            self.settings.max_iterations
        )))
    }
}
