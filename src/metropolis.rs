/*!
# Random-Walk Metropolis Step

A minimal [`SamplingStep`] used to drive the coordinator against a real
target. Each call proposes a move with a [`ProposalDistribution`] and accepts
it with the Metropolis–Hastings rule

\[
\log \alpha = \left[\log p(x') + \log q(x \mid x')\right] - \left[\log p(x) + \log q(x' \mid x)\right].
\]

The step size is fixed; draws flagged as tuning are produced exactly like the
others.

# Examples

```rust
use mcmc_callback::distributions::{IsotropicGaussian, LinearRegression, ProposalDistribution};
use mcmc_callback::metropolis::RandomWalk;
use mcmc_callback::sampler::SamplingStep;

let model = LinearRegression::simulate(20, 1.0, 2.0, 0.5, 0);
let proposal = IsotropicGaussian::new(0.1)?.set_seed(3);
let mut step = RandomWalk::new(model, proposal, vec![0.0, 0.0, 0.0])?.set_seed(3);
let payload = step.step(false)?;
assert!(payload.get("slope").is_some());
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

use num_traits::Float;
use rand::prelude::*;
use std::marker::PhantomData;
use thiserror::Error;

use crate::distributions::{Parameterized, ProposalDistribution, TargetDistribution};
use crate::sampler::SamplingStep;
use crate::trace::Payload;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("log density is not finite at the current state {0:?}")]
    NonFiniteLogProb(Vec<f64>),
    #[error("state has {found} components, the target expects {expected}")]
    Dimension { expected: usize, found: usize },
}

/// One random-walk Metropolis chain.
#[derive(Debug, Clone)]
pub struct RandomWalk<T, D, Q> {
    pub target: D,
    pub proposal: Q,
    pub current_state: Vec<T>,
    pub seed: u64,
    rng: SmallRng,
    n_steps: usize,
    n_accepted: usize,
    phantom: PhantomData<T>,
}

impl<T, D, Q> RandomWalk<T, D, Q>
where
    T: Float,
    D: TargetDistribution<Vec<T>, T> + Parameterized<T>,
    Q: ProposalDistribution<Vec<T>, T>,
    rand_distr::Standard: rand_distr::Distribution<T>,
{
    /// Fails if `initial_state` does not match the target's dimension.
    pub fn new(target: D, proposal: Q, initial_state: Vec<T>) -> Result<Self, StepError> {
        check_dim(&target, &initial_state)?;
        let seed = thread_rng().gen::<u64>();
        Ok(Self {
            target,
            proposal,
            current_state: initial_state,
            seed,
            rng: SmallRng::seed_from_u64(seed),
            n_steps: 0,
            n_accepted: 0,
            phantom: PhantomData,
        })
    }

    /// Reseeds the acceptance RNG and the proposal.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self.proposal = self.proposal.set_seed(seed.wrapping_add(1));
        self
    }

    /// Fraction of accepted proposals so far, 0 before the first step.
    pub fn acceptance_rate(&self) -> f64 {
        if self.n_steps == 0 {
            0.0
        } else {
            self.n_accepted as f64 / self.n_steps as f64
        }
    }

    fn state_f64(&self) -> Vec<f64> {
        self.current_state
            .iter()
            .map(|x| x.to_f64().unwrap_or(f64::NAN))
            .collect()
    }
}

fn check_dim<T: Float, D: Parameterized<T>>(target: &D, state: &[T]) -> Result<(), StepError> {
    if state.len() == target.dim() {
        Ok(())
    } else {
        Err(StepError::Dimension {
            expected: target.dim(),
            found: state.len(),
        })
    }
}

impl<T, D, Q> SamplingStep for RandomWalk<T, D, Q>
where
    T: Float + Send,
    D: TargetDistribution<Vec<T>, T> + Parameterized<T> + Send,
    Q: ProposalDistribution<Vec<T>, T> + Send,
    rand_distr::Standard: rand_distr::Distribution<T>,
{
    type Error = StepError;

    fn step(&mut self, _tuning: bool) -> Result<Payload, StepError> {
        // `current_state` is public and may have been replaced since `new`.
        check_dim(&self.target, &self.current_state)?;
        let current_lp = self.target.unnorm_log_prob(&self.current_state);
        if !current_lp.is_finite() {
            return Err(StepError::NonFiniteLogProb(self.state_f64()));
        }

        let proposed = self.proposal.sample(&self.current_state);
        let proposed_lp = self.target.unnorm_log_prob(&proposed);
        let log_q_forward = self.proposal.log_prob(&self.current_state, &proposed);
        let log_q_backward = self.proposal.log_prob(&proposed, &self.current_state);
        let log_accept_ratio = (proposed_lp + log_q_backward) - (current_lp + log_q_forward);

        self.n_steps += 1;
        let u: T = self.rng.gen();
        // NaN ratios compare false and reject.
        if log_accept_ratio > u.ln() {
            self.current_state = proposed;
            self.n_accepted += 1;
        }
        Ok(self.target.to_payload(&self.current_state))
    }
}
