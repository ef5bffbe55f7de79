//! Single-producer claim protocol.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::sequence::Sequence;
use crate::sequence_group::SequenceGroup;
use crate::sequencer::Sequencer;
use crate::wait::WaitStrategy;
use crate::{is_power_of_two, Error, Result, INITIAL_CURSOR_VALUE};

/// Sequencer for exactly one producer thread.
///
/// The claim path needs no synchronization at all: `next_value` (the last
/// claimed sequence) and `cached_value` (the last observed gating minimum)
/// are private to the producer thread, and the only shared write is the
/// release store of the cursor at publish time. Both fields are stored in
/// relaxed atomics purely so the type stays `Sync`; no other thread ever
/// touches them.
///
/// Claiming from two threads concurrently corrupts the claim state - use
/// [`super::MultiProducerSequencer`] for that.
pub struct SingleProducerSequencer {
    buffer_size: i64,
    cursor: Arc<Sequence>,
    wait_strategy: Arc<dyn WaitStrategy>,
    gating_sequences: SequenceGroup,
    /// Last claimed sequence. Producer-thread private.
    next_value: AtomicI64,
    /// Cached minimum gating sequence, to avoid re-reading every consumer
    /// position on each claim. Producer-thread private.
    cached_value: AtomicI64,
}

impl SingleProducerSequencer {
    /// Create a sequencer over `buffer_size` slots.
    ///
    /// # Errors
    /// [`Error::InvalidBufferSize`] unless `buffer_size` is a positive
    /// power of two.
    pub fn new(buffer_size: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Result<Self> {
        if !is_power_of_two(buffer_size) {
            return Err(Error::InvalidBufferSize(buffer_size));
        }
        Ok(Self {
            buffer_size: buffer_size as i64,
            cursor: Arc::new(Sequence::new()),
            wait_strategy,
            gating_sequences: SequenceGroup::new(),
            next_value: AtomicI64::new(INITIAL_CURSOR_VALUE),
            cached_value: AtomicI64::new(INITIAL_CURSOR_VALUE),
        })
    }

    fn has_capacity(&self, required: i64, do_store: bool) -> bool {
        let next_value = self.next_value.load(Ordering::Relaxed);
        let wrap_point = (next_value + required) - self.buffer_size;
        let cached_gating_sequence = self.cached_value.load(Ordering::Relaxed);

        if wrap_point > cached_gating_sequence || cached_gating_sequence > next_value {
            if do_store {
                // StoreLoad fence: expose the cursor so consumers blocked on
                // it can advance before we re-read their positions.
                self.cursor.set_volatile(next_value);
            }

            let min_sequence = self.gating_sequences.minimum(next_value);
            self.cached_value.store(min_sequence, Ordering::Relaxed);

            if wrap_point > min_sequence {
                return false;
            }
        }

        true
    }
}

impl Sequencer for SingleProducerSequencer {
    fn buffer_size(&self) -> usize {
        self.buffer_size as usize
    }

    fn cursor(&self) -> Arc<Sequence> {
        Arc::clone(&self.cursor)
    }

    fn wait_strategy(&self) -> Arc<dyn WaitStrategy> {
        Arc::clone(&self.wait_strategy)
    }

    fn has_available_capacity(&self, required: i64) -> bool {
        self.has_capacity(required, false)
    }

    fn next_n(&self, n: i64) -> Result<i64> {
        if n < 1 || n > self.buffer_size {
            return Err(Error::InvalidBatchSize(n));
        }

        let next_value = self.next_value.load(Ordering::Relaxed);
        let next_sequence = next_value + n;
        let wrap_point = next_sequence - self.buffer_size;
        let cached_gating_sequence = self.cached_value.load(Ordering::Relaxed);

        if wrap_point > cached_gating_sequence || cached_gating_sequence > next_value {
            // Force-publish what we have claimed so far so consumers can
            // drain it while we wait for the ring to open up.
            self.cursor.set_volatile(next_value);

            let min_sequence = loop {
                let min_sequence = self.gating_sequences.minimum(next_value);
                if wrap_point <= min_sequence {
                    break min_sequence;
                }
                thread::park_timeout(Duration::from_nanos(1));
            };
            self.cached_value.store(min_sequence, Ordering::Relaxed);
        }

        self.next_value.store(next_sequence, Ordering::Relaxed);
        Ok(next_sequence)
    }

    fn try_next_n(&self, n: i64) -> Result<i64> {
        if n < 1 || n > self.buffer_size {
            return Err(Error::InvalidBatchSize(n));
        }
        if !self.has_capacity(n, true) {
            return Err(Error::InsufficientCapacity);
        }

        let next_sequence = self.next_value.load(Ordering::Relaxed) + n;
        self.next_value.store(next_sequence, Ordering::Relaxed);
        Ok(next_sequence)
    }

    fn publish(&self, sequence: i64) {
        self.cursor.set(sequence);
        self.wait_strategy.signal_all_when_blocking();
    }

    fn publish_range(&self, _lo: i64, hi: i64) {
        // The cursor is the only visibility marker for a single producer,
        // so publishing the top of the range publishes everything below it.
        self.publish(hi);
    }

    fn is_available(&self, sequence: i64) -> bool {
        sequence <= self.cursor.get()
    }

    fn highest_published_sequence(&self, _lo: i64, available: i64) -> i64 {
        available
    }

    fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]) {
        self.gating_sequences.add(&self.cursor, sequences);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        self.gating_sequences.remove(sequence)
    }

    fn minimum_sequence(&self) -> i64 {
        self.gating_sequences.minimum(self.cursor.get())
    }

    fn remaining_capacity(&self) -> i64 {
        let next_value = self.next_value.load(Ordering::Relaxed);
        let consumed = self.gating_sequences.minimum(next_value);
        self.buffer_size - (next_value - consumed)
    }
}

impl std::fmt::Debug for SingleProducerSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleProducerSequencer")
            .field("buffer_size", &self.buffer_size)
            .field("cursor", &self.cursor.get())
            .field("next_value", &self.next_value.load(Ordering::Relaxed))
            .finish()
    }
}
