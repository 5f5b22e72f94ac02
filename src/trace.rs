/*!
# Draws and Traces

A [`Draw`] is one sample produced by one chain. A [`Trace`] is the ordered,
append-only history of a single chain's draws.

Traces are split into a read handle and a writer:

- [`Trace`] is cheap to clone and can be read from any thread while its chain
  keeps producing draws. It has no mutators.
- [`TraceWriter`] owns the append side. The coordinator holds exactly one per
  running chain and freezes it when the chain terminates.

# Examples

```rust
use mcmc_callback::trace::{ChainId, Draw, Payload, TraceWriter};

let mut writer = TraceWriter::new(ChainId(0));
let payload: Payload = [("mu", vec![0.5])].into_iter().collect();
writer.append(Draw::new(ChainId(0), 0, true, payload)).unwrap();

let trace = writer.trace().clone();
assert_eq!(trace.len(), 1);
assert!(trace.get(0).unwrap().is_tuning);
assert!(trace.get(1).is_err());
```
*/

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identifier of a chain, unique among the chains of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainId(pub usize);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The sampled state of a draw: variable name to its values.
///
/// Scalar variables are stored as vectors of length one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    values: BTreeMap<String, Vec<f64>>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts (or replaces) the values of a variable.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.values.insert(name.into(), values);
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Vec<f64>)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, Vec<f64>)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// One produced sample plus its chain, position and phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Draw {
    /// The chain that produced this draw.
    pub chain_id: ChainId,
    /// Position within the chain, starting at 0.
    pub index: usize,
    /// Whether the draw was produced during warm-up.
    pub is_tuning: bool,
    /// The sampled state.
    pub payload: Payload,
}

impl Draw {
    pub fn new(chain_id: ChainId, index: usize, is_tuning: bool, payload: Payload) -> Self {
        Self {
            chain_id,
            index,
            is_tuning,
            payload,
        }
    }
}

/// Why an append was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderViolation {
    #[error("expected draw index {expected}, got {found}")]
    IndexGap { expected: usize, found: usize },
    #[error("draw belongs to chain {found}, trace belongs to chain {expected}")]
    ForeignChain { expected: ChainId, found: ChainId },
    #[error("tuning draw {index} follows a post-tuning draw")]
    TuningResumed { index: usize },
    #[error("trace is frozen")]
    Frozen,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("order violation on chain {chain_id}: {violation}")]
    OrderViolation {
        chain_id: ChainId,
        violation: OrderViolation,
    },
    #[error("index {index} out of range for trace of length {len}")]
    OutOfRange { index: usize, len: usize },
}

#[derive(Debug, Default)]
struct TraceState {
    draws: Vec<Draw>,
    frozen: bool,
}

/// Read handle on the draws of one chain.
///
/// Clones share the same underlying storage, so a clone taken early keeps
/// seeing draws appended later until the trace is frozen.
#[derive(Debug, Clone)]
pub struct Trace {
    chain_id: ChainId,
    state: Arc<RwLock<TraceState>>,
}

impl Trace {
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Number of appended draws.
    pub fn len(&self) -> usize {
        self.state.read().draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the draw at position `index`.
    pub fn get(&self, index: usize) -> Result<Draw, TraceError> {
        let state = self.state.read();
        state
            .draws
            .get(index)
            .cloned()
            .ok_or(TraceError::OutOfRange {
                index,
                len: state.draws.len(),
            })
    }

    pub fn last(&self) -> Option<Draw> {
        self.state.read().draws.last().cloned()
    }

    /// Snapshot of all draws appended so far.
    pub fn draws(&self) -> Vec<Draw> {
        self.state.read().draws.clone()
    }

    /// Number of warm-up draws appended so far.
    pub fn n_tuning(&self) -> usize {
        // Tuning draws form a prefix.
        self.state
            .read()
            .draws
            .iter()
            .take_while(|d| d.is_tuning)
            .count()
    }

    pub fn is_frozen(&self) -> bool {
        self.state.read().frozen
    }
}

/// The append side of a [`Trace`].
#[derive(Debug)]
pub struct TraceWriter {
    trace: Trace,
}

impl TraceWriter {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            trace: Trace {
                chain_id,
                state: Arc::new(RwLock::new(TraceState::default())),
            },
        }
    }

    /// Appends the next draw of this chain.
    ///
    /// The draw must carry this trace's chain id and the index equal to the
    /// current length, and must not return to tuning once tuning ended.
    pub fn append(&mut self, draw: Draw) -> Result<(), TraceError> {
        let chain_id = self.trace.chain_id;
        let violation = |violation| TraceError::OrderViolation {
            chain_id,
            violation,
        };

        let mut state = self.trace.state.write();
        if state.frozen {
            return Err(violation(OrderViolation::Frozen));
        }
        if draw.chain_id != chain_id {
            return Err(violation(OrderViolation::ForeignChain {
                expected: chain_id,
                found: draw.chain_id,
            }));
        }
        if draw.index != state.draws.len() {
            return Err(violation(OrderViolation::IndexGap {
                expected: state.draws.len(),
                found: draw.index,
            }));
        }
        if draw.is_tuning && state.draws.last().is_some_and(|d| !d.is_tuning) {
            return Err(violation(OrderViolation::TuningResumed { index: draw.index }));
        }
        state.draws.push(draw);
        Ok(())
    }

    /// Read handle on the trace being written.
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn len(&self) -> usize {
        self.trace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
    }

    /// Marks the trace read-only and returns its read handle.
    pub fn freeze(self) -> Trace {
        self.trace.state.write().frozen = true;
        self.trace
    }
}
