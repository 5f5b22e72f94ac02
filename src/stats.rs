//! Provides the potential scale reduction factor for multi-chain draws.
//!
//! This is the classic Gelman-Rubin statistic on whole chains, meant to back
//! convergence-based stopping rules in observers. Rank normalization and
//! chain splitting are not applied.

use ndarray::prelude::*;
use ndarray::NdFloat;
use num_traits::FromPrimitive;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsError {
    #[error("need at least 2 chains, got {0}")]
    TooFewChains(usize),
    #[error("need at least 2 draws per chain, got {0}")]
    TooFewDraws(usize),
}

/**
Computes R-hat for every component of an array shaped `(chain, draw, component)`.

With `n` draws per chain, the within-chain variance `W` is the average of the
per-chain sample variances and the between-chain variance `B` is `n` times the
sample variance of the chain means. The result is
`sqrt(((n - 1) / n * W + B / n) / W)`.

Components whose within-chain variance is zero yield `NaN` or infinity.

# Examples

```rust
use mcmc_callback::stats::potential_scale_reduction;
use ndarray::Array3;

let draws = Array3::from_shape_fn((2, 100, 1), |(_, d, _)| (d % 7) as f64);
let rhat = potential_scale_reduction(&draws.view()).unwrap();
assert!((rhat[0] - 1.0).abs() < 0.05);
```
*/
pub fn potential_scale_reduction<T>(draws: &ArrayView3<T>) -> Result<Array1<T>, StatsError>
where
    T: NdFloat + FromPrimitive,
{
    let (n_chains, n_draws, _) = draws.dim();
    if n_chains < 2 {
        return Err(StatsError::TooFewChains(n_chains));
    }
    if n_draws < 2 {
        return Err(StatsError::TooFewDraws(n_draws));
    }
    let n = T::from_usize(n_draws).ok_or(StatsError::TooFewDraws(n_draws))?;
    let m = T::from_usize(n_chains).ok_or(StatsError::TooFewChains(n_chains))?;

    // chain x component
    let mean = draws.sum_axis(Axis(1)) / n;
    let mean_sq = draws.mapv(|x| x * x).sum_axis(Axis(1)) / n;
    let sm2 = (mean_sq - mean.mapv(|x| x * x)) * n / (n - T::one());
    let within = sm2.sum_axis(Axis(0)) / m;

    let mean_chain = mean.sum_axis(Axis(0)) / m;
    let between = (mean - &mean_chain.insert_axis(Axis(0)))
        .mapv(|x| x * x)
        .sum_axis(Axis(0))
        * (n / (m - T::one()));

    let var = &within * ((n - T::one()) / n) + between / n;
    Ok((var / within).mapv(T::sqrt))
}
