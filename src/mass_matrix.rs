//! Diagonal euclidean metric and the running variance estimate that feeds
//! it during warmup.

use rand::Rng;
use rand_distr::StandardNormal;

/// Lower and upper clamp for adapted variances.
const VARIANCE_LIMITS: (f64, f64) = (1e-10, 1e10);

/// Diagonal mass matrix, stored as the position-space variance estimate
/// (the inverse metric) together with the momentum standard deviations.
#[derive(Debug, Clone)]
pub struct DiagMassMatrix {
    variance: Vec<f64>,
    momentum_std: Vec<f64>,
}

impl DiagMassMatrix {
    /// Identity metric.
    pub fn new(dim: usize) -> DiagMassMatrix {
        DiagMassMatrix {
            variance: vec![1.0; dim],
            momentum_std: vec![1.0; dim],
        }
    }

    pub fn dim(&self) -> usize {
        self.variance.len()
    }

    pub fn variance(&self) -> &[f64] {
        &self.variance
    }

    /// Replace the diagonal with a clamped variance estimate.
    pub fn update(&mut self, variance: &[f64]) {
        debug_assert_eq!(variance.len(), self.variance.len());
        let (lower, upper) = VARIANCE_LIMITS;
        for (slot, &var) in self.variance.iter_mut().zip(variance.iter()) {
            *slot = if var.is_finite() && var > 0.0 {
                var.clamp(lower, upper)
            } else {
                1.0
            };
        }
        for (std, &var) in self.momentum_std.iter_mut().zip(self.variance.iter()) {
            *std = var.sqrt().recip();
        }
    }

    /// Velocity is the inverse metric applied to the momentum.
    pub fn velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        for ((v, &p), &var) in velocity
            .iter_mut()
            .zip(momentum.iter())
            .zip(self.variance.iter())
        {
            *v = p * var;
        }
    }

    pub fn kinetic_energy(&self, momentum: &[f64]) -> f64 {
        0.5 * momentum
            .iter()
            .zip(self.variance.iter())
            .map(|(&p, &var)| p * p * var)
            .sum::<f64>()
    }

    /// Draw a fresh momentum from the metric's gaussian.
    pub fn randomize_momentum<R: Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]) {
        for (p, &std) in momentum.iter_mut().zip(self.momentum_std.iter()) {
            let z: f64 = rng.sample(StandardNormal);
            *p = std * z;
        }
    }
}

/// Welford accumulator over warmup draws.
#[derive(Debug, Clone)]
pub struct RunningVariance {
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: u64,
}

impl RunningVariance {
    pub fn new(dim: usize) -> RunningVariance {
        RunningVariance {
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
            count: 0,
        }
    }

    pub fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for ((mean, m2), &v) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(value) {
            let delta = v - *mean;
            *mean += delta / n;
            *m2 += delta * (v - *mean);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Regularized variance estimate, shrunk toward a small constant while
    /// the sample is small; `None` until enough draws accumulated.
    pub fn estimate(&self) -> Option<Vec<f64>> {
        if self.count < 3 {
            return None;
        }
        let n = self.count as f64;
        let shrink = n / (n + 5.0);
        Some(
            self.m2
                .iter()
                .map(|&m2| shrink * (m2 / (n - 1.0)) + (1.0 - shrink) * 1e-3)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn identity_metric_round_trips_momentum() {
        let mass = DiagMassMatrix::new(3);
        let momentum = [1.0, -2.0, 0.5];
        let mut velocity = [0.0; 3];
        mass.velocity(&momentum, &mut velocity);
        assert_eq!(velocity, momentum);
        assert_relative_eq!(mass.kinetic_energy(&momentum), 0.5 * (1.0 + 4.0 + 0.25));
    }

    #[test]
    fn update_clamps_bad_variances() {
        let mut mass = DiagMassMatrix::new(3);
        mass.update(&[4.0, 0.0, f64::NAN]);
        assert_eq!(mass.variance(), &[4.0, 1.0, 1.0]);
    }

    #[test]
    fn running_variance_matches_direct_computation() {
        let mut acc = RunningVariance::new(1);
        for v in [1.0, 2.0, 3.0, 4.0] {
            acc.add_sample(&[v]);
        }
        // Sample variance of 1..4 is 5/3; shrinkage pulls it slightly down.
        let est = acc.estimate().unwrap();
        let n = 4.0f64;
        let expected = (n / (n + 5.0)) * (5.0 / 3.0) + (5.0 / (n + 5.0)) * 1e-3;
        assert_relative_eq!(est[0], expected);
    }

    #[test]
    fn momentum_scales_with_metric() {
        let mut mass = DiagMassMatrix::new(1);
        mass.update(&[1e-4]);
        let mut rng = SmallRng::seed_from_u64(1);
        let mut momentum = [0.0];
        let mut scale = 0.0f64;
        for _ in 0..200 {
            mass.randomize_momentum(&mut rng, &mut momentum);
            scale = scale.max(momentum[0].abs());
        }
        // std of the momentum is 1/sqrt(var) = 100.
        assert!(scale > 10.0);
    }
}
