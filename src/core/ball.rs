//! Constraint domain for perturbations.

use nalgebra::DVector;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;

/// Default constraint radius for the perturbation magnitude.
pub const DEFAULT_RADIUS: f64 = 8e-4;

/// Error returned by masked projection.
#[derive(Debug, Error)]
pub enum BallError {
    /// The mask has a different length than the ball dimension.
    #[error("mask has length {actual}, expected {expected}")]
    MaskLength {
        /// Expected length (the ball dimension).
        expected: usize,
        /// Actual length of the mask.
        actual: usize,
    },
    /// The mask selects a proper subset of the components. Scaling a subset
    /// independently would not preserve the global norm semantics, so
    /// partial masks are rejected rather than silently worked around.
    #[error("partial projection masks are not supported")]
    PartialMask,
}

/// The constraint domain: a ball of given radius under the RMS norm.
///
/// The optimizer keeps every candidate perturbation inside this ball by
/// Euclidean projection, which for a centered ball amounts to scaling the
/// vector down to the boundary whenever its norm exceeds the radius.
#[derive(Debug, Clone)]
pub struct Ball {
    dim: usize,
    radius: f64,
}

impl Ball {
    /// Creates the ball with given dimension and radius.
    pub fn new(dim: usize, radius: f64) -> Self {
        assert!(dim > 0, "empty domain");
        assert!(radius > 0.0, "radius must be positive");

        Self { dim, radius }
    }

    /// Gets the dimension of the domain.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Gets the constraint radius.
    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// RMS norm of a vector: `sqrt(mean(u_i^2))`.
    pub fn rms_norm(u: &DVector<f64>) -> f64 {
        (u.norm_squared() / u.len() as f64).sqrt()
    }

    /// Projects the vector onto the ball in place. Returns `true` if the
    /// vector was scaled, `false` if it was already inside.
    pub fn project(&self, u: &mut DVector<f64>) -> bool {
        let norm = Self::rms_norm(u);

        if norm <= self.radius {
            false
        } else {
            *u *= self.radius / norm;
            true
        }
    }

    /// Returns the projection of the vector onto the ball.
    pub fn projection(&self, u: &DVector<f64>) -> DVector<f64> {
        let mut proj = u.clone_owned();
        self.project(&mut proj);
        proj
    }

    /// Projects the vector in place, restricted to the components selected
    /// by the mask.
    ///
    /// A full mask is the ordinary projection and an empty mask is a no-op.
    /// A partial mask is rejected with [`BallError::PartialMask`].
    pub fn project_masked(&self, u: &mut DVector<f64>, mask: &[bool]) -> Result<bool, BallError> {
        if mask.len() != u.len() {
            return Err(BallError::MaskLength {
                expected: u.len(),
                actual: mask.len(),
            });
        }

        if mask.iter().all(|&m| m) {
            Ok(self.project(u))
        } else if mask.iter().any(|&m| m) {
            Err(BallError::PartialMask)
        } else {
            Ok(false)
        }
    }

    /// Samples a point uniformly on the sphere of the constraint radius.
    ///
    /// Used for random initial perturbations: a standard normal vector
    /// scaled to the boundary of the ball.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        loop {
            let u = DVector::from_iterator(
                self.dim,
                (0..self.dim).map(|_| -> f64 { StandardNormal.sample(rng) }),
            );
            let norm = Self::rms_norm(&u);

            // A zero draw has probability zero, but guard against it anyway.
            if norm > 0.0 {
                return u * (self.radius / norm);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn projection_is_bounded() {
        let mut rng = StdRng::seed_from_u64(3);
        let ball = Ball::new(6, 0.75);

        for _ in 0..100 {
            let mut u = DVector::from_iterator(6, (0..6).map(|_| rng.gen_range(-10.0..10.0)));
            ball.project(&mut u);
            assert!(Ball::rms_norm(&u) <= 0.75 + 1e-12);
        }
    }

    #[test]
    fn projection_inside_is_identity() {
        let ball = Ball::new(3, 1.0);
        let u = dvector![0.1, -0.2, 0.3];

        let mut proj = u.clone();
        let scaled = ball.project(&mut proj);

        assert!(!scaled);
        assert_eq!(proj, u);
    }

    #[test]
    fn projection_outside_scales_to_boundary() {
        let ball = Ball::new(2, 1.0);
        let mut u = dvector![3.0, 4.0];

        let scaled = ball.project(&mut u);

        assert!(scaled);
        assert_abs_diff_eq!(Ball::rms_norm(&u), 1.0, epsilon = 1e-12);
        // Direction is preserved.
        assert_abs_diff_eq!(u[1] / u[0], 4.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn full_mask_projects() {
        let ball = Ball::new(2, 1.0);
        let mut u = dvector![3.0, 4.0];

        let scaled = ball.project_masked(&mut u, &[true, true]).unwrap();

        assert!(scaled);
        assert_abs_diff_eq!(Ball::rms_norm(&u), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_mask_is_noop() {
        let ball = Ball::new(2, 1.0);
        let mut u = dvector![3.0, 4.0];

        let scaled = ball.project_masked(&mut u, &[false, false]).unwrap();

        assert!(!scaled);
        assert_eq!(u, dvector![3.0, 4.0]);
    }

    #[test]
    fn partial_mask_is_rejected() {
        let ball = Ball::new(2, 1.0);
        let mut u = dvector![3.0, 4.0];

        let error = ball.project_masked(&mut u, &[true, false]).unwrap_err();
        assert!(matches!(error, BallError::PartialMask));
    }

    #[test]
    fn sample_lies_on_the_sphere() {
        let mut rng = StdRng::seed_from_u64(7);
        let ball = Ball::new(8, 0.5);

        for _ in 0..10 {
            let u = ball.sample(&mut rng);
            assert_abs_diff_eq!(Ball::rms_norm(&u), 0.5, epsilon = 1e-12);
        }
    }
}
