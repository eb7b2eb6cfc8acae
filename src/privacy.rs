//! Differential-privacy noise for shared aggregates (FED-88).
//!
//! Outbound bundles never carry raw averages: each per-division value gets
//! Laplace noise calibrated to the policy's `dp_epsilon` before signing.
//! Smaller epsilon means more noise and stronger privacy.

use rand_distr::{Distribution, Exp};

/// Smallest epsilon the sampler will honor. Values at or below zero clamp
/// here, which errs toward more noise, never less.
const MIN_EPSILON: f64 = 1e-9;

/// Sample Laplace(0, scale) noise.
///
/// The difference of two i.i.d. Exponential(1/scale) draws is Laplace with
/// that scale, which keeps the sampling on `rand_distr` primitives.
pub fn laplace_noise(scale: f64) -> f64 {
    let b = scale.max(MIN_EPSILON);
    match Exp::new(1.0 / b) {
        Ok(dist) => {
            let mut rng = rand::rng();
            dist.sample(&mut rng) - dist.sample(&mut rng)
        }
        Err(_) => 0.0,
    }
}

/// Add Laplace noise scaled to `1 / epsilon` to a shared value.
pub fn apply_dp_noise(value: f64, epsilon: f64) -> f64 {
    value + laplace_noise(1.0 / epsilon.max(MIN_EPSILON))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_centers_on_zero() {
        let samples: Vec<f64> = (0..2000).map(|_| laplace_noise(1.0)).collect();
        let mean: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!(
            mean.abs() < 0.15,
            "mean of Laplace(1.0) samples should be near 0, got {}",
            mean
        );
    }

    #[test]
    fn test_spread_grows_as_epsilon_shrinks() {
        let tight: f64 = (0..2000)
            .map(|_| (apply_dp_noise(0.0, 10.0)).abs())
            .sum::<f64>()
            / 2000.0;
        let loose: f64 = (0..2000)
            .map(|_| (apply_dp_noise(0.0, 0.1)).abs())
            .sum::<f64>()
            / 2000.0;
        // Expected absolute deviations are 0.1 and 10.0
        assert!(
            loose > tight * 10.0,
            "epsilon 0.1 should be far noisier than epsilon 10: {} vs {}",
            loose,
            tight
        );
    }

    #[test]
    fn test_huge_epsilon_is_nearly_exact() {
        for _ in 0..100 {
            let noised = apply_dp_noise(3.5, 1e9);
            assert!(
                (noised - 3.5).abs() < 1e-6,
                "epsilon 1e9 should leave the value essentially unchanged, got {}",
                noised
            );
        }
    }

    #[test]
    fn test_nonpositive_epsilon_does_not_panic() {
        let _ = apply_dp_noise(5.0, 0.0);
        let _ = apply_dp_noise(5.0, -1.0);
        let _ = laplace_noise(0.0);
    }
}
