//! Per-draw observers with early stopping for multi-chain MCMC runs.
//!
//! A [`sampler::Sampler`] drives one [`sampler::SamplingStep`] per chain and
//! calls an [`observer::Observer`] after every draw. The observer sees the
//! chain's [`trace::Trace`] so far and may stop the whole run; partial traces
//! are always returned.

pub mod aggregate;
pub mod distributions;
pub mod io;
pub mod metropolis;
pub mod observer;
pub mod sampler;
pub mod stats;
pub mod trace;
