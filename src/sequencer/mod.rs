//! Producer-side sequencing protocols.
//!
//! A sequencer owns the publish cursor and the gating-sequence registry and
//! implements the claim/publish protocol: a producer claims one or more
//! sequence numbers (blocking while the claim would overwrite unconsumed
//! slots), writes the slots, then publishes to make them visible.

mod multi;
mod single;

pub use multi::MultiProducerSequencer;
pub use single::SingleProducerSequencer;

use std::sync::Arc;

use crate::sequence::Sequence;
use crate::wait::WaitStrategy;
use crate::Result;

/// Whether one or many threads will publish into the ring.
///
/// The single-producer protocol keeps its claim state in plain per-thread
/// fields and needs no synchronization until publish; the multi-producer
/// protocol pays one CAS per claim plus a release store per publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerType {
    /// Exactly one publishing thread. Fastest, but not thread-safe: claims
    /// from two threads corrupt the private claim state.
    Single,
    /// Any number of publishing threads, coordinated by CAS on the cursor.
    Multi,
}

impl ProducerType {
    /// Build the matching sequencer.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidBufferSize`] unless `buffer_size` is a
    /// positive power of two.
    pub fn new_sequencer(
        self,
        buffer_size: usize,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Result<Arc<dyn Sequencer>> {
        Ok(match self {
            ProducerType::Single => {
                Arc::new(SingleProducerSequencer::new(buffer_size, wait_strategy)?)
            }
            ProducerType::Multi => {
                Arc::new(MultiProducerSequencer::new(buffer_size, wait_strategy)?)
            }
        })
    }
}

/// Claim/publish coordination between producers and the ring buffer.
///
/// Both implementations guarantee that publication never overtakes the
/// slowest gating sequence by more than the buffer size, and that
/// `try_next` fails fast instead of waiting.
pub trait Sequencer: Send + Sync + std::fmt::Debug {
    /// Capacity of the ring this sequencer coordinates.
    fn buffer_size(&self) -> usize;

    /// The cursor tracking the highest published sequence.
    fn cursor(&self) -> Arc<Sequence>;

    /// The wait strategy producers signal after publishing.
    fn wait_strategy(&self) -> Arc<dyn WaitStrategy>;

    /// True when `required` more slots could be claimed right now without
    /// waiting on a consumer.
    fn has_available_capacity(&self, required: i64) -> bool;

    /// Claim the next sequence, waiting for capacity if the ring is full.
    fn next(&self) -> Result<i64> {
        self.next_n(1)
    }

    /// Claim `n` consecutive sequences, waiting for capacity if needed.
    /// Returns the highest claimed sequence.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidBatchSize`] unless
    /// `1 <= n <= buffer_size`; an oversized batch could never succeed and
    /// is treated as a usage error rather than a deadlock.
    fn next_n(&self, n: i64) -> Result<i64>;

    /// Claim the next sequence without waiting.
    ///
    /// # Errors
    /// Returns [`crate::Error::InsufficientCapacity`] when claiming would
    /// overrun the slowest gating sequence.
    fn try_next(&self) -> Result<i64> {
        self.try_next_n(1)
    }

    /// Claim `n` consecutive sequences without waiting.
    ///
    /// # Errors
    /// [`crate::Error::InsufficientCapacity`] when capacity is exhausted,
    /// [`crate::Error::InvalidBatchSize`] for an out-of-range `n`.
    fn try_next_n(&self, n: i64) -> Result<i64>;

    /// Make a claimed sequence visible to consumers and wake waiters.
    fn publish(&self, sequence: i64);

    /// Publish the inclusive range `lo..=hi` as one unit.
    fn publish_range(&self, lo: i64, hi: i64);

    /// True when `sequence` has been published and is safe to read.
    fn is_available(&self, sequence: i64) -> bool;

    /// Highest sequence in `lo..=available` with no unpublished gap below
    /// it. For a single producer this is `available` itself; with multiple
    /// producers out-of-order publication can leave holes that consumers
    /// must not read past.
    fn highest_published_sequence(&self, lo: i64, available: i64) -> i64;

    /// Register consumer positions this sequencer must not overrun.
    fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]);

    /// Deregister a consumer position; true when it was present.
    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool;

    /// Slowest gating position, or the cursor when none is registered.
    fn minimum_sequence(&self) -> i64;

    /// Number of slots that could be claimed right now.
    fn remaining_capacity(&self) -> i64;
}
