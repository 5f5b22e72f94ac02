//! Cross-chain snapshots of traces.
//!
//! [`combine`] takes the latest known [`Trace`] of each chain and freezes a
//! copy of their contents into an [`AggregateView`]. The view does not follow
//! later appends; build a new one whenever an up-to-date picture is needed.
//! Chains may differ in length, and it is up to the caller to decide how to
//! align them (see [`AggregateView::truncated_to_shortest`]).

use ndarray::Array3;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::trace::{ChainId, Draw, Trace};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("variable `{0}` not present in every draw")]
    MissingVariable(String),
    #[error("variable `{name}` has {found} components in chain {chain_id}, expected {expected}")]
    ShapeMismatch {
        name: String,
        chain_id: ChainId,
        expected: usize,
        found: usize,
    },
}

/// Read-only combination of per-chain draws, ordered by chain id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateView {
    chains: BTreeMap<ChainId, Vec<Draw>>,
}

/// Snapshots the given traces. A later trace for the same chain replaces an
/// earlier one.
pub fn combine<'a, I>(traces: I) -> AggregateView
where
    I: IntoIterator<Item = &'a Trace>,
{
    let chains = traces
        .into_iter()
        .map(|trace| (trace.chain_id(), trace.draws()))
        .collect();
    AggregateView { chains }
}

impl AggregateView {
    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn contains(&self, chain_id: ChainId) -> bool {
        self.chains.contains_key(&chain_id)
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = ChainId> + '_ {
        self.chains.keys().copied()
    }

    pub fn chain(&self, chain_id: ChainId) -> Option<&[Draw]> {
        self.chains.get(&chain_id).map(Vec::as_slice)
    }

    pub fn chains(&self) -> impl Iterator<Item = (ChainId, &[Draw])> {
        self.chains.iter().map(|(id, d)| (*id, d.as_slice()))
    }

    pub fn lengths(&self) -> BTreeMap<ChainId, usize> {
        self.chains.iter().map(|(id, d)| (*id, d.len())).collect()
    }

    /// Length of the shortest chain, 0 for an empty view.
    pub fn min_len(&self) -> usize {
        self.chains.values().map(Vec::len).min().unwrap_or(0)
    }

    /// True when every chain has the same number of draws.
    pub fn is_aligned(&self) -> bool {
        let mut lens = self.chains.values().map(Vec::len);
        match lens.next() {
            Some(first) => lens.all(|l| l == first),
            None => true,
        }
    }

    /// Drops warm-up draws from every chain.
    pub fn posterior(&self) -> AggregateView {
        let chains = self
            .chains
            .iter()
            .map(|(id, draws)| {
                let kept = draws.iter().filter(|d| !d.is_tuning).cloned().collect();
                (*id, kept)
            })
            .collect();
        AggregateView { chains }
    }

    /// Keeps at most the first `len` draws of each chain.
    pub fn truncated(&self, len: usize) -> AggregateView {
        let chains = self
            .chains
            .iter()
            .map(|(id, draws)| (*id, draws.iter().take(len).cloned().collect()))
            .collect();
        AggregateView { chains }
    }

    pub fn truncated_to_shortest(&self) -> AggregateView {
        self.truncated(self.min_len())
    }

    /// Variable names present in the first draw of the first chain.
    pub fn variable_names(&self) -> Vec<String> {
        self.chains
            .values()
            .find_map(|draws| draws.first())
            .map(|d| d.payload.names().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /**
    Collects one variable into an array of shape `(chain, draw, component)`.

    Chains are truncated to the shortest one so the result is rectangular.
    Every retained draw must carry the variable with the same number of
    components.
    */
    pub fn variable(&self, name: &str) -> Result<Array3<f64>, AggregateError> {
        let n_draws = self.min_len();
        let n_chains = self.chains.len();
        let n_components = match self.chains.values().find_map(|d| d.first()) {
            Some(draw) if n_draws > 0 => draw
                .payload
                .get(name)
                .ok_or_else(|| AggregateError::MissingVariable(name.to_string()))?
                .len(),
            _ => 0,
        };

        let mut out = Array3::<f64>::zeros((n_chains, n_draws, n_components));
        for (c, (chain_id, draws)) in self.chains.iter().enumerate() {
            for (d, draw) in draws.iter().take(n_draws).enumerate() {
                let values = draw
                    .payload
                    .get(name)
                    .ok_or_else(|| AggregateError::MissingVariable(name.to_string()))?;
                if values.len() != n_components {
                    return Err(AggregateError::ShapeMismatch {
                        name: name.to_string(),
                        chain_id: *chain_id,
                        expected: n_components,
                        found: values.len(),
                    });
                }
                for (k, v) in values.iter().enumerate() {
                    out[[c, d, k]] = *v;
                }
            }
        }
        Ok(out)
    }
}
