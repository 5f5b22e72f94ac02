/*!
# Observers

An [`Observer`] is called once for every draw a chain produces, right after
the draw was appended to the chain's [`Trace`] and before the chain produces
its next draw. It answers with a [`Signal`]:

- [`Signal::Continue`] lets sampling proceed.
- [`Signal::Stop`] ends the run cleanly. The partial traces are returned with
  status [`RunStatus::StoppedByObserver`](crate::sampler::RunStatus).

Returning an error instead is a failure of the run, not a clean stop.

Any closure `FnMut(&Trace, &Draw) -> Result<Signal, ObserverError>` is an
observer. This module also ships three ready-made ones:

- [`StopAfter`]: stop as soon as a chain reaches a given length.
- [`TraceCollector`]: remember the latest trace of every chain.
- [`ConvergenceStop`]: stop once R-hat across all chains is below a threshold.

# Examples

```rust
use mcmc_callback::observer::{ObserverError, Signal};
use mcmc_callback::sampler::{Sampler, SamplerConfig, SamplingStep};
use mcmc_callback::trace::{Draw, Payload, Trace};
use std::convert::Infallible;

struct Constant;

impl SamplingStep for Constant {
    type Error = Infallible;
    fn step(&mut self, _tuning: bool) -> Result<Payload, Infallible> {
        Ok([("x", vec![1.0])].into_iter().collect())
    }
}

let config = SamplerConfig::new(2).tune(0).draws(10).parallelism(1);
let mut sampler = Sampler::from_fn(config, |_| Constant)?;

let mut seen = 0;
let output = sampler.run_with(&mut |_: &Trace, _: &Draw| -> Result<Signal, ObserverError> {
    seen += 1;
    Ok(Signal::Continue)
});
assert!(output.is_completed());
assert_eq!(seen, 20);
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

use ndarray_stats::QuantileExt;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use thiserror::Error;
use tracing::debug;

use crate::aggregate::{combine, AggregateView};
use crate::stats::potential_scale_reduction;
use crate::trace::{ChainId, Draw, Trace};

/// Opaque failure raised by an observer.
pub type ObserverError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvergenceStopError {
    #[error("at least one chain is required")]
    NoChains,
    #[error("check interval must be positive")]
    ZeroInterval,
    #[error("R-hat threshold must be finite, got {0}")]
    InvalidThreshold(f64),
}

/// What the observer wants the coordinator to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Continue,
    Stop,
}

/// A per-draw callback.
///
/// Calls are serialized by the coordinator, but calls for different chains
/// may interleave. Use `draw.chain_id` to route per-chain state.
pub trait Observer {
    fn notify(&mut self, trace: &Trace, draw: &Draw) -> Result<Signal, ObserverError>;
}

impl<F> Observer for F
where
    F: FnMut(&Trace, &Draw) -> Result<Signal, ObserverError>,
{
    fn notify(&mut self, trace: &Trace, draw: &Draw) -> Result<Signal, ObserverError> {
        self(trace, draw)
    }
}

/// Stops the run as soon as any chain's trace holds `n_draws` draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopAfter {
    n_draws: usize,
}

impl StopAfter {
    pub fn new(n_draws: usize) -> Self {
        Self { n_draws }
    }
}

impl Observer for StopAfter {
    fn notify(&mut self, trace: &Trace, _draw: &Draw) -> Result<Signal, ObserverError> {
        if trace.len() >= self.n_draws {
            Ok(Signal::Stop)
        } else {
            Ok(Signal::Continue)
        }
    }
}

/// Keeps the most recent trace handed over for each chain.
#[derive(Debug, Clone, Default)]
pub struct TraceCollector {
    traces: BTreeMap<ChainId, Trace>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> &BTreeMap<ChainId, Trace> {
        &self.traces
    }

    pub fn n_chains(&self) -> usize {
        self.traces.len()
    }

    /// Snapshot of the latest traces of all chains seen so far.
    pub fn aggregate(&self) -> AggregateView {
        combine(self.traces.values())
    }
}

impl Observer for TraceCollector {
    fn notify(&mut self, trace: &Trace, draw: &Draw) -> Result<Signal, ObserverError> {
        self.traces.insert(draw.chain_id, trace.clone());
        Ok(Signal::Continue)
    }
}

/**
Stops the run once every variable has converged across chains.

Every `interval` draws of a chain, and only after its warm-up, the observer
builds the post-tuning [`AggregateView`] of all chains, truncates it to the
shortest chain and computes R-hat for every component of every variable.
It requests a stop when all of them are finite and below `threshold`.

Nothing is computed until `n_chains` chains have been seen, which means that
in sequential mode a stop can only happen during the last chain.

# Examples

```rust
use mcmc_callback::observer::ConvergenceStop;

let observer = ConvergenceStop::new(4, 100, 1.01)?;
assert_eq!(observer.last_rhat(), None);
assert!(ConvergenceStop::new(4, 0, 1.01).is_err());
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
#[derive(Debug, Clone)]
pub struct ConvergenceStop {
    collector: TraceCollector,
    n_chains: usize,
    interval: usize,
    threshold: f64,
    last_rhat: Option<f64>,
}

impl ConvergenceStop {
    pub fn new(
        n_chains: usize,
        interval: usize,
        threshold: f64,
    ) -> Result<Self, ConvergenceStopError> {
        if n_chains == 0 {
            return Err(ConvergenceStopError::NoChains);
        }
        if interval == 0 {
            return Err(ConvergenceStopError::ZeroInterval);
        }
        if !threshold.is_finite() {
            return Err(ConvergenceStopError::InvalidThreshold(threshold));
        }
        Ok(Self {
            collector: TraceCollector::new(),
            n_chains,
            interval,
            threshold,
            last_rhat: None,
        })
    }

    /// Largest R-hat found by the most recent check, if any check ran.
    pub fn last_rhat(&self) -> Option<f64> {
        self.last_rhat
    }

    pub fn collector(&self) -> &TraceCollector {
        &self.collector
    }

    /// Largest R-hat over all variables, or `None` when the chains are not
    /// ready yet or some component has no finite R-hat.
    fn max_rhat(view: &AggregateView) -> Result<Option<f64>, ObserverError> {
        let mut worst = f64::NEG_INFINITY;
        for name in view.variable_names() {
            let draws = view.variable(&name)?;
            if draws.shape()[2] == 0 {
                continue;
            }
            let rhat = potential_scale_reduction(&draws.view())?;
            if rhat.iter().any(|r| !r.is_finite()) {
                return Ok(None);
            }
            worst = worst.max(*rhat.max()?);
        }
        Ok(worst.is_finite().then_some(worst))
    }
}

impl Observer for ConvergenceStop {
    fn notify(&mut self, trace: &Trace, draw: &Draw) -> Result<Signal, ObserverError> {
        self.collector.notify(trace, draw)?;
        if draw.is_tuning || trace.len() % self.interval != 0 {
            return Ok(Signal::Continue);
        }
        if self.collector.n_chains() < self.n_chains {
            return Ok(Signal::Continue);
        }

        let view = self.collector.aggregate().posterior().truncated_to_shortest();
        if view.min_len() < 2 {
            return Ok(Signal::Continue);
        }
        let Some(rhat) = Self::max_rhat(&view)? else {
            return Ok(Signal::Continue);
        };
        self.last_rhat = Some(rhat);
        debug!(
            chain = %draw.chain_id,
            draws = view.min_len(),
            rhat,
            "convergence check"
        );
        if rhat < self.threshold {
            Ok(Signal::Stop)
        } else {
            Ok(Signal::Continue)
        }
    }
}
