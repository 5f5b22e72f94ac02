//! End-to-end checks of the coordinator/observer contract in sequential and
//! concurrent mode.

use mcmc_callback::aggregate::combine;
use mcmc_callback::distributions::{IsotropicGaussian, LinearRegression, ProposalDistribution};
use mcmc_callback::metropolis::RandomWalk;
use mcmc_callback::observer::{ConvergenceStop, ObserverError, Signal, StopAfter, TraceCollector};
use mcmc_callback::sampler::{RunStatus, Sampler, SamplerConfig, SamplerError, SamplingStep};
use mcmc_callback::trace::{ChainId, Draw, Payload, Trace};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug)]
struct StepFailed;

impl fmt::Display for StepFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "numerical error")
    }
}

impl std::error::Error for StepFailed {}

/// Emits a running counter, optionally sleeping so that chains interleave.
struct Counter {
    n: usize,
    pause: Option<Duration>,
    fail_at: Option<usize>,
}

impl SamplingStep for Counter {
    type Error = StepFailed;

    fn step(&mut self, _tuning: bool) -> Result<Payload, StepFailed> {
        if let Some(pause) = self.pause {
            std::thread::sleep(pause);
        }
        if Some(self.n) == self.fail_at {
            return Err(StepFailed);
        }
        self.n += 1;
        Ok([("n", vec![self.n as f64])].into_iter().collect())
    }
}

fn counter(_: ChainId) -> Counter {
    Counter {
        n: 0,
        pause: None,
        fail_at: None,
    }
}

fn slow_counter(_: ChainId) -> Counter {
    Counter {
        n: 0,
        pause: Some(Duration::from_micros(200)),
        fail_at: None,
    }
}

/// Records every (chain, index) pair the observer is handed.
fn recording(
    seen: &mut BTreeMap<ChainId, Vec<usize>>,
) -> impl FnMut(&Trace, &Draw) -> Result<Signal, ObserverError> + Send + '_ {
    move |_trace: &Trace, draw: &Draw| -> Result<Signal, ObserverError> {
        seen.entry(draw.chain_id).or_default().push(draw.index);
        Ok(Signal::Continue)
    }
}

/// Stops once `chain` reaches `len` draws.
fn stop_chain_at(
    chain: ChainId,
    len: usize,
) -> impl FnMut(&Trace, &Draw) -> Result<Signal, ObserverError> + Send {
    move |trace: &Trace, draw: &Draw| -> Result<Signal, ObserverError> {
        if draw.chain_id == chain && trace.len() == len {
            Ok(Signal::Stop)
        } else {
            Ok(Signal::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_contiguous_in_every_mode() {
        for parallelism in [1, 4] {
            let config = SamplerConfig::new(4)
                .tune(10)
                .draws(40)
                .parallelism(parallelism);
            let mut sampler = Sampler::from_fn(config, counter).unwrap();
            let mut seen = BTreeMap::new();
            let output = sampler.run_with(&mut recording(&mut seen));

            assert!(matches!(output.status, RunStatus::Completed));
            assert_eq!(seen.len(), 4);
            for indices in seen.values() {
                assert_eq!(*indices, (0..50).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn test_completed_run_has_full_traces() {
        for parallelism in [1, 3] {
            let config = SamplerConfig::new(3)
                .tune(7)
                .draws(13)
                .parallelism(parallelism);
            let output = Sampler::from_fn(config, counter)
                .unwrap()
                .run_with(&mut |_: &Trace, _: &Draw| -> Result<Signal, ObserverError> {
                    Ok(Signal::Continue)
                });
            assert!(output.is_completed());
            assert_eq!(output.traces.len(), 3);
            assert!(output.traces.values().all(|t| t.len() == 20));
        }
    }

    #[test]
    fn test_stop_after_100_of_500() {
        let config = SamplerConfig::new(1).tune(0).draws(500).parallelism(1);
        let output = Sampler::from_fn(config, counter)
            .unwrap()
            .run_with(&mut StopAfter::new(100));
        assert!(matches!(
            output.status,
            RunStatus::StoppedByObserver {
                chain_id: ChainId(0)
            }
        ));
        assert_eq!(output.traces[&ChainId(0)].len(), 100);
    }

    #[test]
    fn test_two_sequential_chains_notify_1000_times() {
        let config = SamplerConfig::new(2).tune(0).draws(500).parallelism(1);
        let mut calls = 0_usize;
        let output = Sampler::from_fn(config, counter).unwrap().run_with(
            &mut |_: &Trace, _: &Draw| -> Result<Signal, ObserverError> {
                calls += 1;
                Ok(Signal::Continue)
            },
        );
        assert!(output.is_completed());
        assert_eq!(calls, 1000);
    }

    #[test]
    fn test_stopped_chain_keeps_exact_length() {
        for parallelism in [1, 4] {
            let config = SamplerConfig::new(4)
                .tune(5)
                .draws(200)
                .parallelism(parallelism);
            let mut sampler = Sampler::from_fn(config, slow_counter).unwrap();
            let output = sampler.run_with(&mut stop_chain_at(ChainId(2), 37));
            assert!(matches!(
                output.status,
                RunStatus::StoppedByObserver {
                    chain_id: ChainId(2)
                }
            ));
            assert_eq!(output.traces[&ChainId(2)].len(), 37);
            assert!(output.traces.values().all(Trace::is_frozen));
        }
    }

    #[test]
    fn test_sequential_stop_skips_later_chains() {
        let config = SamplerConfig::new(4).tune(0).draws(50).parallelism(1);
        let output = Sampler::from_fn(config, counter)
            .unwrap()
            .run_with(&mut stop_chain_at(ChainId(1), 10));
        assert!(output.is_stopped());
        assert_eq!(output.traces[&ChainId(0)].len(), 50);
        assert_eq!(output.traces[&ChainId(1)].len(), 10);
        assert_eq!(output.traces[&ChainId(2)].len(), 0);
        assert_eq!(output.traces[&ChainId(3)].len(), 0);
    }

    #[test]
    fn test_concurrent_siblings_append_at_most_one_more_draw() {
        let config = SamplerConfig::new(4).tune(0).draws(10_000).parallelism(4);
        let mut sampler = Sampler::from_fn(config, slow_counter).unwrap();
        let mut notified: BTreeMap<ChainId, usize> = BTreeMap::new();
        let mut stop = stop_chain_at(ChainId(0), 50);
        let output = sampler.run_with(
            &mut |trace: &Trace, draw: &Draw| -> Result<Signal, ObserverError> {
                notified.insert(draw.chain_id, trace.len());
                stop(trace, draw)
            },
        );

        assert!(output.is_stopped());
        for (chain_id, trace) in &output.traces {
            let seen = notified.get(chain_id).copied().unwrap_or(0);
            assert!(
                trace.len() <= seen + 1,
                "chain {chain_id} appended {} draws, observer saw {seen}",
                trace.len()
            );
            assert!(trace.len() < 10_000);
        }
    }

    #[test]
    fn test_concurrent_step_failure_cancels_siblings() {
        let config = SamplerConfig::new(3).tune(0).draws(10_000).parallelism(3);
        let mut sampler = Sampler::from_fn(config, |chain_id| Counter {
            n: 0,
            pause: Some(Duration::from_micros(200)),
            fail_at: (chain_id == ChainId(1)).then_some(20),
        })
        .unwrap();
        let output = sampler.run();

        match &output.status {
            RunStatus::Failed(SamplerError::SamplingStepFailed { chain_id, source }) => {
                assert_eq!(*chain_id, ChainId(1));
                assert_eq!(source.to_string(), "numerical error");
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(output.traces[&ChainId(1)].len(), 20);
        assert!(output.traces.values().all(|t| t.len() < 10_000));
    }

    #[test]
    fn test_concurrent_observer_failure_cancels_siblings() {
        let config = SamplerConfig::new(3).tune(0).draws(10_000).parallelism(3);
        let mut sampler = Sampler::from_fn(config, slow_counter).unwrap();
        let mut notified: BTreeMap<ChainId, usize> = BTreeMap::new();
        let output = sampler.run_with(
            &mut |trace: &Trace, draw: &Draw| -> Result<Signal, ObserverError> {
                notified.insert(draw.chain_id, trace.len());
                if draw.chain_id == ChainId(1) && trace.len() == 25 {
                    Err("statistic diverged".into())
                } else {
                    Ok(Signal::Continue)
                }
            },
        );

        match &output.status {
            RunStatus::Failed(SamplerError::ObserverFailed { chain_id, source }) => {
                assert_eq!(*chain_id, ChainId(1));
                assert_eq!(source.to_string(), "statistic diverged");
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert!(!output.is_stopped());
        assert_eq!(output.traces[&ChainId(1)].len(), 25);
        for (chain_id, trace) in &output.traces {
            let seen = notified.get(chain_id).copied().unwrap_or(0);
            assert!(trace.len() <= seen + 1, "chain {chain_id} ran on");
            assert!(trace.is_frozen());
        }
    }

    #[test]
    fn test_collector_view_holds_only_seen_chains() {
        use mcmc_callback::observer::Observer;

        for parallelism in [1, 2] {
            let config = SamplerConfig::new(2)
                .tune(0)
                .draws(30)
                .parallelism(parallelism);
            let mut sampler = Sampler::from_fn(config, counter).unwrap();
            let mut collector = TraceCollector::new();
            let mut seen: BTreeMap<ChainId, usize> = BTreeMap::new();
            let mut checks = 0;

            let output = sampler.run_with(
                &mut |trace: &Trace, draw: &Draw| -> Result<Signal, ObserverError> {
                    collector.notify(trace, draw)?;
                    seen.insert(draw.chain_id, trace.len());

                    let view = collector.aggregate();
                    let expected: Vec<ChainId> = seen.keys().copied().collect();
                    assert_eq!(view.chain_ids().collect::<Vec<_>>(), expected);
                    // The triggering chain's snapshot is exactly its current trace.
                    assert_eq!(
                        view.chain(draw.chain_id).map(<[Draw]>::len),
                        Some(trace.len())
                    );
                    checks += 1;
                    Ok(Signal::Continue)
                },
            );

            assert!(output.is_completed());
            assert_eq!(checks, 60);
            let view = combine(output.traces.values());
            assert_eq!(view.n_chains(), 2);
            assert!(view.is_aligned());
        }
    }

    #[test]
    fn test_convergence_stop_ends_regression_run_early() {
        const N_CHAINS: usize = 4;
        const TOTAL: usize = 20_000;
        let model = LinearRegression::simulate(50, 1.0, 2.0, 0.5, 7);
        let config = SamplerConfig::new(N_CHAINS)
            .tune(500)
            .draws(TOTAL)
            .parallelism(N_CHAINS);
        let mut sampler = Sampler::from_fn(config, |chain_id| {
            let seed = 100 + chain_id.0 as u64;
            let proposal = IsotropicGaussian::new(0.1).unwrap().set_seed(seed);
            RandomWalk::new(model.clone(), proposal, vec![0.0, 0.0, 0.0])
                .unwrap()
                .set_seed(seed)
        })
        .unwrap();

        let mut observer = ConvergenceStop::new(N_CHAINS, 250, 1.1).unwrap();
        let output = sampler.run_with(&mut observer);

        assert!(output.is_stopped(), "status: {:?}", output.status);
        assert!(observer.last_rhat().unwrap() < 1.1);
        assert!(output.traces.values().all(|t| t.len() < TOTAL + 500));
        assert!(output.traces.values().all(|t| t.n_tuning() == 500));
    }
}
