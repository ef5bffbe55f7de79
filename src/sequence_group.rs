//! Lock-free copy-on-write registry of gating sequences.
//!
//! Producers read this set on every capacity check, so readers must never
//! lock: they load an immutable snapshot and iterate it. Writers (consumer
//! attach/detach, typically at wiring time but legal while running) build a
//! new snapshot and swap it in atomically, retrying on conflict.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::sequence::{minimum_sequence, Sequence};

/// A copy-on-write set of [`Sequence`] references.
///
/// Snapshots are never mutated in place, so a producer iterating one while
/// a consumer is added or removed always sees a consistent membership.
#[derive(Default)]
pub struct SequenceGroup {
    sequences: ArcSwap<Vec<Arc<Sequence>>>,
}

impl SequenceGroup {
    /// Create an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequences: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Append `to_add`, initializing each new entry to the cursor value so a
    /// late-joining consumer does not report itself behind the ring.
    ///
    /// The entries are re-set after the swap as well: the cursor may have
    /// moved between building the snapshot and it becoming visible, and a
    /// too-small gating value would stall producers.
    pub fn add(&self, cursor: &Sequence, to_add: &[Arc<Sequence>]) {
        self.sequences.rcu(|current| {
            let mut updated = Vec::with_capacity(current.len() + to_add.len());
            updated.extend(current.iter().cloned());
            let cursor_value = cursor.get();
            for sequence in to_add {
                sequence.set(cursor_value);
                updated.push(Arc::clone(sequence));
            }
            updated
        });

        let cursor_value = cursor.get();
        for sequence in to_add {
            sequence.set(cursor_value);
        }
    }

    /// Remove every entry that is the same allocation as `sequence`
    /// (identity, not value). Returns whether anything was removed.
    pub fn remove(&self, sequence: &Arc<Sequence>) -> bool {
        let mut removed = false;
        self.sequences.rcu(|current| {
            let updated: Vec<_> = current
                .iter()
                .filter(|existing| !Arc::ptr_eq(existing, sequence))
                .cloned()
                .collect();
            removed = updated.len() != current.len();
            updated
        });
        removed
    }

    /// Current membership snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<Sequence>>> {
        self.sequences.load_full()
    }

    /// Minimum value over the current snapshot, or `fallback` when empty.
    /// The fallback also caps the result, matching the producer contract
    /// that the gating floor never exceeds the cursor.
    pub fn minimum(&self, fallback: i64) -> i64 {
        minimum_sequence(&self.sequences.load(), fallback)
    }

    /// Number of registered sequences.
    pub fn len(&self) -> usize {
        self.sequences.load().len()
    }

    /// True when no consumer is registered.
    pub fn is_empty(&self) -> bool {
        self.sequences.load().is_empty()
    }
}

impl std::fmt::Debug for SequenceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values: Vec<i64> = self.sequences.load().iter().map(|s| s.get()).collect();
        f.debug_struct("SequenceGroup")
            .field("sequences", &values)
            .finish()
    }
}
