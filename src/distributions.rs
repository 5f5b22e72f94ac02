/*!
Target and proposal distributions used by the reference [`RandomWalk`](crate::metropolis::RandomWalk)
sampling step.

The crate does not care how draws are produced; these types exist so that the
coordinator and observers can be exercised against a real posterior. The
[`LinearRegression`] target is the classic toy model: `y = intercept + slope * x + noise`
with weakly informative priors.

# Examples

```rust
use mcmc_callback::distributions::{
    IsotropicGaussian, LinearRegression, ProposalDistribution, TargetDistribution,
};

let model = LinearRegression::simulate(50, 1.0, 2.0, 0.5, 42);
let lp_good = model.unnorm_log_prob(&vec![1.0, 2.0, 0.5f64.ln()]);
let lp_bad = model.unnorm_log_prob(&vec![-5.0, 0.0, 0.0]);
assert!(lp_good > lp_bad);

let mut proposal: IsotropicGaussian<f64> = IsotropicGaussian::new(0.1)?.set_seed(1);
let candidate = proposal.sample(&vec![0.0, 0.0, 0.0]);
assert_eq!(candidate.len(), 3);
assert!(IsotropicGaussian::new(f64::NAN).is_err());
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

use num_traits::Float;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use std::f64::consts::PI;
use thiserror::Error;

use crate::trace::Payload;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DistributionError {
    #[error("proposal standard deviation must be finite and positive, got {0}")]
    InvalidStd(f64),
}

/// A trait for generating proposals in Metropolis–Hastings or similar algorithms.
/// The state type `S` is typically a vector of continuous values.
pub trait ProposalDistribution<S, T: Float> {
    /// Samples a new point from q(x' | x).
    fn sample(&mut self, current: &S) -> S;

    /// Evaluates log q(x' | x).
    fn log_prob(&self, from: &S, to: &S) -> T;

    /// Returns a new instance of this proposal distribution seeded with `seed`.
    fn set_seed(self, seed: u64) -> Self;
}

/// A trait for continuous target distributions from which we want to sample.
pub trait TargetDistribution<S, T: Float> {
    /// Returns the log of the unnormalized density for state `theta`.
    fn unnorm_log_prob(&self, theta: &S) -> T;
}

/// Maps a flat, unconstrained state vector to named variables.
pub trait Parameterized<T: Float> {
    /// Length of the state vector.
    fn dim(&self) -> usize;

    fn to_payload(&self, theta: &[T]) -> Payload;
}

/// A Gaussian random-walk proposal with the same standard deviation in every dimension.
#[derive(Clone, Debug)]
pub struct IsotropicGaussian<T: Float> {
    std: T,
    rng: SmallRng,
}

impl<T: Float> IsotropicGaussian<T> {
    /// Fails unless `std` is finite and strictly positive.
    pub fn new(std: T) -> Result<Self, DistributionError> {
        if !std.is_finite() || std <= T::zero() {
            return Err(DistributionError::InvalidStd(std.to_f64().unwrap_or(f64::NAN)));
        }
        Ok(Self {
            std,
            rng: SmallRng::from_entropy(),
        })
    }

    pub fn std(&self) -> T {
        self.std
    }
}

impl<T: Float> ProposalDistribution<Vec<T>, T> for IsotropicGaussian<T>
where
    StandardNormal: Distribution<T>,
{
    fn sample(&mut self, current: &Vec<T>) -> Vec<T> {
        current
            .iter()
            .map(|&x| {
                let z: T = self.rng.sample(StandardNormal);
                x + z * self.std
            })
            .collect()
    }

    fn log_prob(&self, from: &Vec<T>, to: &Vec<T>) -> T {
        let two = T::one() + T::one();
        let half = T::one() / two;
        let var = self.std * self.std;
        let d = T::from(from.len()).unwrap_or_else(T::zero);
        let pi = T::from(PI).unwrap_or_else(T::zero);
        let sq: T = from
            .iter()
            .zip(to)
            .map(|(&f, &t)| (t - f) * (t - f))
            .fold(T::zero(), |acc, x| acc + x);
        -sq / (two * var) - d * half * (two * pi * var).ln()
    }

    fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

/**
Bayesian simple linear regression.

The state is `[intercept, slope, log_sigma]`. Priors are `Normal(0, 10)` on
intercept and slope and `HalfNormal(1)` on `sigma`; the density includes the
Jacobian of the log transform. Draws report `sigma` on its natural scale.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct LinearRegression<T: Float> {
    pub x: Vec<T>,
    pub y: Vec<T>,
}

impl<T: Float> LinearRegression<T> {
    pub const NAMES: [&'static str; 3] = ["intercept", "slope", "sigma"];

    pub fn new(x: Vec<T>, y: Vec<T>) -> Self {
        Self { x, y }
    }
}

impl LinearRegression<f64> {
    /// Generates `n` points on `x` in `[0, 1]` with Gaussian noise.
    pub fn simulate(n: usize, intercept: f64, slope: f64, sigma: f64, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let step = if n > 1 { 1.0 / (n - 1) as f64 } else { 0.0 };
        let x: Vec<f64> = (0..n).map(|i| i as f64 * step).collect();
        let y = x
            .iter()
            .map(|xi| {
                let z: f64 = rng.sample(StandardNormal);
                intercept + slope * xi + sigma * z
            })
            .collect();
        Self { x, y }
    }
}

impl<T: Float> TargetDistribution<Vec<T>, T> for LinearRegression<T> {
    fn unnorm_log_prob(&self, theta: &Vec<T>) -> T {
        let half = T::from(0.5).unwrap_or_else(T::zero);
        let prior_scale = T::from(10.0).unwrap_or_else(T::one);
        let &[intercept, slope, log_sigma] = theta.as_slice() else {
            return T::nan();
        };
        let sigma = log_sigma.exp();

        let prior = -half * (intercept / prior_scale).powi(2)
            - half * (slope / prior_scale).powi(2)
            - half * sigma * sigma
            + log_sigma;
        let n = T::from(self.x.len()).unwrap_or_else(T::zero);
        let sq: T = self
            .x
            .iter()
            .zip(&self.y)
            .map(|(&x, &y)| {
                let r = (y - intercept - slope * x) / sigma;
                r * r
            })
            .fold(T::zero(), |acc, r| acc + r);
        prior - n * log_sigma - half * sq
    }
}

impl<T: Float> Parameterized<T> for LinearRegression<T> {
    fn dim(&self) -> usize {
        Self::NAMES.len()
    }

    /// Missing components are reported as NaN.
    fn to_payload(&self, theta: &[T]) -> Payload {
        let value = |i: usize| {
            theta
                .get(i)
                .and_then(|&t| (if i == 2 { t.exp() } else { t }).to_f64())
                .unwrap_or(f64::NAN)
        };
        Self::NAMES
            .iter()
            .enumerate()
            .map(|(i, name)| (*name, vec![value(i)]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_proposal_log_prob_matches_normal_density() {
        let proposal: IsotropicGaussian<f64> = IsotropicGaussian::new(2.0).unwrap();
        let lp = proposal.log_prob(&vec![0.0], &vec![1.0]);
        let expected = -0.125 - 0.5 * (2.0 * PI * 4.0).ln();
        assert_abs_diff_eq!(lp, expected, epsilon = 1e-12);
        // Symmetric.
        assert_abs_diff_eq!(lp, proposal.log_prob(&vec![1.0], &vec![0.0]), epsilon = 1e-12);
    }

    #[test]
    fn test_proposal_is_reproducible() {
        let mut a: IsotropicGaussian<f64> = IsotropicGaussian::new(1.0).unwrap().set_seed(7);
        let mut b: IsotropicGaussian<f64> = IsotropicGaussian::new(1.0).unwrap().set_seed(7);
        assert_eq!(a.sample(&vec![0.0, 1.0]), b.sample(&vec![0.0, 1.0]));
    }

    #[test]
    fn test_proposal_rejects_bad_std() {
        for std in [f64::NAN, f64::INFINITY, 0.0, -1.0] {
            assert!(matches!(
                IsotropicGaussian::new(std),
                Err(DistributionError::InvalidStd(_))
            ));
        }
    }

    #[test]
    fn test_proposal_moves_every_component() {
        let mut proposal: IsotropicGaussian<f64> = IsotropicGaussian::new(0.5).unwrap().set_seed(3);
        let current = vec![1.0, -1.0, 0.0];
        let candidate = proposal.sample(&current);
        assert_eq!(candidate.len(), 3);
        assert!(candidate.iter().zip(&current).all(|(c, x)| c != x));
    }

    #[test]
    fn test_regression_short_state_is_not_finite() {
        let model = LinearRegression::simulate(10, 1.0, 2.0, 0.5, 0);
        assert!(model.unnorm_log_prob(&vec![0.0]).is_nan());
        let payload = model.to_payload(&[1.0]);
        assert_eq!(payload.get("intercept"), Some(&[1.0][..]));
        assert!(payload.get("sigma").unwrap()[0].is_nan());
    }

    #[test]
    fn test_regression_prefers_true_parameters() {
        let model = LinearRegression::simulate(100, -1.0, 3.0, 0.2, 3);
        let truth = model.unnorm_log_prob(&vec![-1.0, 3.0, 0.2f64.ln()]);
        for wrong in [
            vec![0.0, 3.0, 0.2f64.ln()],
            vec![-1.0, 0.0, 0.2f64.ln()],
            vec![-1.0, 3.0, 2.0f64.ln()],
        ] {
            assert!(truth > model.unnorm_log_prob(&wrong));
        }
    }

    #[test]
    fn test_payload_uses_natural_sigma() {
        let model = LinearRegression::<f64>::new(vec![], vec![]);
        let payload = model.to_payload(&[1.0, 2.0, 0.0]);
        assert_eq!(payload.get("intercept"), Some(&[1.0][..]));
        assert_eq!(payload.get("slope"), Some(&[2.0][..]));
        assert_eq!(payload.get("sigma"), Some(&[1.0][..]));
    }
}
