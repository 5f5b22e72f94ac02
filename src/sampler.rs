/*!
# Multi-Chain Coordinator

[`Sampler`] owns one [`SamplingStep`] per chain and drives them, sequentially
or on a dedicated rayon pool, for `n_tune + n_draws` draws each. After every
draw it appends the draw to the chain's [`Trace`] and hands both to the
observer, which may stop the whole run.

- **Sequential** (`parallelism == 1`): chains run one after another. A stop or
  failure skips every chain that has not started yet.
- **Concurrent** (`parallelism > 1`): chains run as rayon jobs on a pool with
  `parallelism` threads. Observer calls are serialized behind one mutex. A
  stop or failure raises a shared cancellation flag that every chain checks
  before producing its next draw, so each sibling appends at most one more
  draw, and nothing is handed to the observer after the stop.

Whatever happens, every trace collected so far is returned, frozen, in
[`RunOutput`].

# Examples

```rust
use mcmc_callback::observer::StopAfter;
use mcmc_callback::sampler::{RunStatus, Sampler, SamplerConfig, SamplingStep};
use mcmc_callback::trace::{ChainId, Payload};
use std::convert::Infallible;

struct Counter(f64);

impl SamplingStep for Counter {
    type Error = Infallible;
    fn step(&mut self, _tuning: bool) -> Result<Payload, Infallible> {
        self.0 += 1.0;
        Ok([("x", vec![self.0])].into_iter().collect())
    }
}

let config = SamplerConfig::new(1).tune(0).draws(500).parallelism(1);
let mut sampler = Sampler::from_fn(config, |_| Counter(0.0)).unwrap();
let output = sampler.run_with(&mut StopAfter::new(100));

assert!(matches!(
    output.status,
    RunStatus::StoppedByObserver { chain_id: ChainId(0) }
));
assert_eq!(output.traces[&ChainId(0)].len(), 100);
```
*/

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

use rayon::prelude::*;

use crate::observer::{Observer, ObserverError, Signal};
use crate::trace::{ChainId, Draw, Payload, Trace, TraceError, TraceWriter};

/// Produces the draws of one chain.
///
/// The coordinator calls `step` once per draw, with `tuning` set during the
/// first `n_tune` draws of the chain.
pub trait SamplingStep: Send {
    type Error: StdError + Send + Sync + 'static;

    fn step(&mut self, tuning: bool) -> Result<Payload, Self::Error>;
}

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("sampling step failed on chain {chain_id}")]
    SamplingStepFailed {
        chain_id: ChainId,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("observer failed on chain {chain_id}")]
    ObserverFailed {
        chain_id: ChainId,
        #[source]
        source: ObserverError,
    },
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("invalid sampler configuration: {0}")]
    Config(String),
    #[error("failed to build the chain thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl SamplerError {
    /// The chain the failure originated from, when there is one.
    pub fn chain_id(&self) -> Option<ChainId> {
        match self {
            SamplerError::SamplingStepFailed { chain_id, .. }
            | SamplerError::ObserverFailed { chain_id, .. } => Some(*chain_id),
            SamplerError::Trace(TraceError::OrderViolation { chain_id, .. }) => Some(*chain_id),
            _ => None,
        }
    }
}

/**
Options recognized by [`Sampler`].

| Field | Effect |
|---|---|
| `n_chains` | number of independent chains, ids `0..n_chains` |
| `n_tune` | leading draws per chain flagged `is_tuning` |
| `n_draws` | post-tuning draws per chain |
| `parallelism` | 1 runs chains sequentially, more runs them on that many threads |

# Examples

```rust
use mcmc_callback::sampler::SamplerConfig;

let config = SamplerConfig::new(2).tune(100).draws(400).parallelism(2);
assert_eq!(config.total_draws(), 500);
assert!(config.validate().is_ok());
assert!(SamplerConfig::new(0).validate().is_err());
```
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerConfig {
    pub n_chains: usize,
    pub n_tune: usize,
    pub n_draws: usize,
    pub parallelism: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            n_chains: 4,
            n_tune: 1000,
            n_draws: 1000,
            parallelism: available_threads(),
        }
    }
}

fn available_threads() -> usize {
    match std::thread::available_parallelism() {
        Ok(v) => v.get(),
        Err(err) => {
            warn!(%err, "could not get number of threads; defaulting to 1");
            1
        }
    }
}

impl SamplerConfig {
    /// Defaults with `n_chains` chains.
    pub fn new(n_chains: usize) -> Self {
        Self {
            n_chains,
            ..Self::default()
        }
    }

    pub fn tune(mut self, n_tune: usize) -> Self {
        self.n_tune = n_tune;
        self
    }

    pub fn draws(mut self, n_draws: usize) -> Self {
        self.n_draws = n_draws;
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn total_draws(&self) -> usize {
        self.n_tune + self.n_draws
    }

    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.n_chains == 0 {
            return Err(SamplerError::Config("n_chains must be positive".into()));
        }
        if self.parallelism == 0 {
            return Err(SamplerError::Config("parallelism must be positive".into()));
        }
        Ok(())
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunStatus {
    /// Every chain produced all its draws.
    Completed,
    /// The observer asked to stop after a draw of `chain_id`.
    StoppedByObserver { chain_id: ChainId },
    /// A sampling step or the observer failed.
    Failed(SamplerError),
}

/// Frozen traces of every chain plus how the run ended.
#[derive(Debug)]
pub struct RunOutput {
    pub traces: BTreeMap<ChainId, Trace>,
    pub status: RunStatus,
}

impl RunOutput {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, RunStatus::Completed)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.status, RunStatus::StoppedByObserver { .. })
    }

    /// The traces, unless the run failed.
    pub fn into_result(self) -> Result<BTreeMap<ChainId, Trace>, SamplerError> {
        match self.status {
            RunStatus::Failed(err) => Err(err),
            _ => Ok(self.traces),
        }
    }
}

/// Why one chain stopped producing draws.
#[derive(Debug)]
enum ChainEnd {
    Completed,
    Stopped,
    Cancelled,
    Failed(SamplerError),
}

/// Observer shared across chains, serialized by the mutex.
struct ObserverSlot<'a> {
    observer: Option<Mutex<&'a mut (dyn Observer + Send)>>,
    cancel: AtomicBool,
}

impl<'a> ObserverSlot<'a> {
    fn new(observer: Option<&'a mut (dyn Observer + Send)>) -> Self {
        Self {
            observer: observer.map(Mutex::new),
            cancel: AtomicBool::new(false),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Hands the draw to the observer unless the run was cancelled meanwhile.
    /// `None` means the chain keeps going.
    fn notify(&self, trace: &Trace, draw: &Draw) -> Option<ChainEnd> {
        let Some(observer) = &self.observer else {
            return self.is_cancelled().then_some(ChainEnd::Cancelled);
        };
        let mut observer = observer.lock();
        // Checked under the lock so no notify follows a stop.
        if self.is_cancelled() {
            return Some(ChainEnd::Cancelled);
        }
        match (**observer).notify(trace, draw) {
            Ok(Signal::Continue) => None,
            Ok(Signal::Stop) => {
                self.cancel();
                Some(ChainEnd::Stopped)
            }
            Err(source) => {
                self.cancel();
                Some(ChainEnd::Failed(SamplerError::ObserverFailed {
                    chain_id: draw.chain_id,
                    source,
                }))
            }
        }
    }
}

/// Runs one chain until it completes, is cancelled, stops or fails.
fn drive_chain<St: SamplingStep>(
    chain_id: ChainId,
    chain: &mut St,
    config: &SamplerConfig,
    slot: &ObserverSlot<'_>,
) -> (Trace, ChainEnd) {
    let mut writer = TraceWriter::new(chain_id);
    debug!(chain = %chain_id, "chain started");

    let end = loop {
        let index = writer.len();
        if index >= config.total_draws() {
            break ChainEnd::Completed;
        }
        if slot.is_cancelled() {
            break ChainEnd::Cancelled;
        }

        let is_tuning = index < config.n_tune;
        let payload = match chain.step(is_tuning) {
            Ok(payload) => payload,
            Err(err) => {
                slot.cancel();
                break ChainEnd::Failed(SamplerError::SamplingStepFailed {
                    chain_id,
                    source: Box::new(err),
                });
            }
        };
        let draw = Draw::new(chain_id, index, is_tuning, payload);
        if let Err(err) = writer.append(draw.clone()) {
            slot.cancel();
            break ChainEnd::Failed(err.into());
        }

        if let Some(end) = slot.notify(writer.trace(), &draw) {
            break end;
        }
    };

    let trace = writer.freeze();
    match &end {
        ChainEnd::Failed(err) => {
            warn!(chain = %chain_id, draws = trace.len(), %err, "chain failed")
        }
        _ => debug!(chain = %chain_id, draws = trace.len(), end = ?end, "chain finished"),
    }
    (trace, end)
}

/// Drives a fixed set of chains and reports their traces.
pub struct Sampler<St> {
    config: SamplerConfig,
    chains: Vec<St>,
}

impl<St: SamplingStep> Sampler<St> {
    /// One sampling step per chain; `chains.len()` must equal `config.n_chains`.
    pub fn new(config: SamplerConfig, chains: Vec<St>) -> Result<Self, SamplerError> {
        config.validate()?;
        if chains.len() != config.n_chains {
            return Err(SamplerError::Config(format!(
                "expected {} chains, got {}",
                config.n_chains,
                chains.len()
            )));
        }
        Ok(Self { config, chains })
    }

    /// Builds the sampling step of every chain from its id.
    pub fn from_fn<F>(config: SamplerConfig, make_chain: F) -> Result<Self, SamplerError>
    where
        F: FnMut(ChainId) -> St,
    {
        let chains = (0..config.n_chains).map(ChainId).map(make_chain).collect();
        Self::new(config, chains)
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn chains(&self) -> &[St] {
        &self.chains
    }

    pub fn chains_mut(&mut self) -> &mut [St] {
        &mut self.chains
    }

    /// Runs every chain to completion without an observer.
    pub fn run(&mut self) -> RunOutput {
        self.execute(None)
    }

    /// Runs the chains, calling `observer` after every draw.
    pub fn run_with<O: Observer + Send>(&mut self, observer: &mut O) -> RunOutput {
        let observer: &mut (dyn Observer + Send) = observer;
        self.execute(Some(observer))
    }

    fn execute(&mut self, observer: Option<&mut (dyn Observer + Send)>) -> RunOutput {
        info!(
            chains = self.config.n_chains,
            tune = self.config.n_tune,
            draws = self.config.n_draws,
            parallelism = self.config.parallelism,
            "starting run"
        );
        let slot = ObserverSlot::new(observer);
        let results = if self.config.parallelism == 1 {
            self.run_sequential(&slot)
        } else {
            match self.run_concurrent(&slot) {
                Ok(results) => results,
                Err(err) => {
                    warn!(%err, "could not start chains");
                    return RunOutput {
                        traces: self.empty_traces(),
                        status: RunStatus::Failed(err),
                    };
                }
            }
        };
        let output = Self::collect(results);
        info!(status = ?output.status, "run finished");
        output
    }

    fn run_sequential(&mut self, slot: &ObserverSlot<'_>) -> Vec<(Trace, ChainEnd)> {
        let config = &self.config;
        let mut results = Vec::with_capacity(self.chains.len());
        for (i, chain) in self.chains.iter_mut().enumerate() {
            let chain_id = ChainId(i);
            if slot.is_cancelled() {
                results.push((TraceWriter::new(chain_id).freeze(), ChainEnd::Cancelled));
                continue;
            }
            results.push(drive_chain(chain_id, chain, config, slot));
        }
        results
    }

    fn run_concurrent(
        &mut self,
        slot: &ObserverSlot<'_>,
    ) -> Result<Vec<(Trace, ChainEnd)>, SamplerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallelism)
            .build()?;
        let config = &self.config;
        let chains = &mut self.chains;
        Ok(pool.install(|| {
            chains
                .par_iter_mut()
                .enumerate()
                .map(|(i, chain)| drive_chain(ChainId(i), chain, config, slot))
                .collect()
        }))
    }

    fn empty_traces(&self) -> BTreeMap<ChainId, Trace> {
        (0..self.config.n_chains)
            .map(|i| (ChainId(i), TraceWriter::new(ChainId(i)).freeze()))
            .collect()
    }

    /// The lowest failing chain decides a failure, which outranks a stop.
    fn collect(results: Vec<(Trace, ChainEnd)>) -> RunOutput {
        let mut traces = BTreeMap::new();
        let mut failure: Option<(ChainId, SamplerError)> = None;
        let mut stopped_by = None;
        for (trace, end) in results {
            let chain_id = trace.chain_id();
            traces.insert(chain_id, trace);
            match end {
                ChainEnd::Failed(err) => {
                    if failure.as_ref().map_or(true, |(first, _)| chain_id < *first) {
                        failure = Some((chain_id, err));
                    }
                }
                ChainEnd::Stopped => stopped_by = Some(chain_id),
                ChainEnd::Completed | ChainEnd::Cancelled => {}
            }
        }
        let status = match (failure, stopped_by) {
            (Some((_, err)), _) => RunStatus::Failed(err),
            (None, Some(chain_id)) => RunStatus::StoppedByObserver { chain_id },
            (None, None) => RunStatus::Completed,
        };
        RunOutput { traces, status }
    }
}
