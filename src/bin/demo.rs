//! Fits a simple linear regression with random-walk Metropolis on four chains
//! and stops as soon as R-hat says the chains agree.

use mcmc_callback::distributions::{IsotropicGaussian, LinearRegression, ProposalDistribution};
use mcmc_callback::metropolis::RandomWalk;
use mcmc_callback::observer::ConvergenceStop;
use mcmc_callback::sampler::{RunStatus, Sampler, SamplerConfig};
use std::error::Error;
use tracing::{info, Level};

fn main() -> Result<(), Box<dyn Error>> {
    const N_CHAINS: usize = 4;
    const N_TUNE: usize = 1_000;
    const N_DRAWS: usize = 100_000;
    const CHECK_EVERY: usize = 500;
    const RHAT_THRESHOLD: f64 = 1.01;
    const SEED: u64 = 42;

    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let model = LinearRegression::simulate(100, 1.0, 2.0, 0.5, SEED);
    let chains = (0..N_CHAINS as u64)
        .map(|i| -> Result<_, Box<dyn Error>> {
            let proposal = IsotropicGaussian::new(0.05)?.set_seed(SEED + i);
            let chain = RandomWalk::new(model.clone(), proposal, vec![0.0, 0.0, 0.0])?;
            Ok(chain.set_seed(SEED + i))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let config = SamplerConfig::new(N_CHAINS).tune(N_TUNE).draws(N_DRAWS);
    let mut sampler = Sampler::new(config, chains)?;

    let mut observer = ConvergenceStop::new(N_CHAINS, CHECK_EVERY, RHAT_THRESHOLD)?;
    let output = sampler.run_with(&mut observer);

    match &output.status {
        RunStatus::StoppedByObserver { chain_id } => info!(
            chain = %chain_id,
            rhat = ?observer.last_rhat(),
            "stopped early, chains converged"
        ),
        RunStatus::Completed => info!(rhat = ?observer.last_rhat(), "ran all draws"),
        RunStatus::Failed(err) => info!(%err, "sampling failed"),
    }
    for (chain_id, trace) in &output.traces {
        info!(chain = %chain_id, draws = trace.len(), "trace length");
    }
    for chain in sampler.chains() {
        info!(acceptance = chain.acceptance_rate(), "chain acceptance");
    }

    let traces = output.into_result()?;
    let posterior = mcmc_callback::aggregate::combine(traces.values())
        .posterior()
        .truncated_to_shortest();
    for name in posterior.variable_names() {
        let draws = posterior.variable(&name)?;
        let mean = draws.mean().unwrap_or(f64::NAN);
        info!(variable = %name, mean, "posterior mean");
    }

    #[cfg(feature = "csv")]
    {
        mcmc_callback::io::csv::save_csv(&posterior, "/tmp/demo_trace.csv")?;
        info!("saved trace to /tmp/demo_trace.csv");
    }

    Ok(())
}
