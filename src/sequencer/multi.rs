//! Multi-producer claim protocol.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::sequence::Sequence;
use crate::sequence_group::SequenceGroup;
use crate::sequencer::Sequencer;
use crate::wait::WaitStrategy;
use crate::{is_power_of_two, Error, Result};

/// Sequencer safe for any number of producer threads.
///
/// Sequence numbers are granted in strict total order by a CAS loop on the
/// shared cursor, but producers can finish writing their slots out of
/// order. Publication therefore does not move the cursor; instead each
/// publish marks the slot's entry in `available_buffer` with the sequence's
/// lap number (sequence >> log2(buffer_size)) using a release store.
/// Consumers recover a gap-free frontier by scanning forward while
/// [`Sequencer::is_available`] holds.
pub struct MultiProducerSequencer {
    buffer_size: i64,
    cursor: Arc<Sequence>,
    wait_strategy: Arc<dyn WaitStrategy>,
    gating_sequences: SequenceGroup,
    /// Lap number of the last publish into each slot; -1 means never
    /// published. Keeping laps rather than a boolean avoids an ABA hazard
    /// when a slot is reused on a later wrap.
    available_buffer: Box<[AtomicI32]>,
    index_mask: i64,
    index_shift: u32,
    /// Shared cache of the minimum gating sequence, so every producer does
    /// not re-scan all consumer positions on every claim.
    gating_sequence_cache: Sequence,
}

impl MultiProducerSequencer {
    /// Create a sequencer over `buffer_size` slots.
    ///
    /// # Errors
    /// [`Error::InvalidBufferSize`] unless `buffer_size` is a positive
    /// power of two.
    pub fn new(buffer_size: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Result<Self> {
        if !is_power_of_two(buffer_size) {
            return Err(Error::InvalidBufferSize(buffer_size));
        }
        let available_buffer: Box<[AtomicI32]> =
            (0..buffer_size).map(|_| AtomicI32::new(-1)).collect();
        Ok(Self {
            buffer_size: buffer_size as i64,
            cursor: Arc::new(Sequence::new()),
            wait_strategy,
            gating_sequences: SequenceGroup::new(),
            available_buffer,
            index_mask: (buffer_size - 1) as i64,
            index_shift: buffer_size.trailing_zeros(),
            gating_sequence_cache: Sequence::new(),
        })
    }

    fn calculate_index(&self, sequence: i64) -> usize {
        (sequence & self.index_mask) as usize
    }

    fn calculate_availability_flag(&self, sequence: i64) -> i32 {
        (sequence >> self.index_shift) as i32
    }

    fn set_available(&self, sequence: i64) {
        let index = self.calculate_index(sequence);
        let flag = self.calculate_availability_flag(sequence);
        self.available_buffer[index].store(flag, Ordering::Release);
    }

    fn has_capacity(&self, required: i64, cursor_value: i64) -> bool {
        let wrap_point = (cursor_value + required) - self.buffer_size;
        let cached_gating_sequence = self.gating_sequence_cache.get();

        if wrap_point > cached_gating_sequence || cached_gating_sequence > cursor_value {
            let min_sequence = self.gating_sequences.minimum(cursor_value);
            self.gating_sequence_cache.set(min_sequence);

            if wrap_point > min_sequence {
                return false;
            }
        }

        true
    }
}

impl Sequencer for MultiProducerSequencer {
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
        self.has_capacity(required, self.cursor.get())
    }

    fn next_n(&self, n: i64) -> Result<i64> {
        if n < 1 || n > self.buffer_size {
            return Err(Error::InvalidBatchSize(n));
        }

        loop {
            let current = self.cursor.get();
            let next = current + n;
            let wrap_point = next - self.buffer_size;
            let cached_gating_sequence = self.gating_sequence_cache.get();

            if wrap_point > cached_gating_sequence || cached_gating_sequence > current {
                let gating_sequence = self.gating_sequences.minimum(current);

                if wrap_point > gating_sequence {
                    // Ring full: let consumers run, then retry the whole
                    // claim against a fresh cursor.
                    thread::park_timeout(Duration::from_nanos(1));
                    continue;
                }

                self.gating_sequence_cache.set(gating_sequence);
            } else if self.cursor.compare_and_set(current, next) {
                return Ok(next);
            }
        }
    }

    fn try_next_n(&self, n: i64) -> Result<i64> {
        if n < 1 || n > self.buffer_size {
            return Err(Error::InvalidBatchSize(n));
        }

        loop {
            let current = self.cursor.get();
            let next = current + n;

            if !self.has_capacity(n, current) {
                return Err(Error::InsufficientCapacity);
            }

            if self.cursor.compare_and_set(current, next) {
                return Ok(next);
            }
        }
    }

    fn publish(&self, sequence: i64) {
        self.set_available(sequence);
        self.wait_strategy.signal_all_when_blocking();
    }

    fn publish_range(&self, lo: i64, hi: i64) {
        for sequence in lo..=hi {
            self.set_available(sequence);
        }
        self.wait_strategy.signal_all_when_blocking();
    }

    fn is_available(&self, sequence: i64) -> bool {
        let index = self.calculate_index(sequence);
        let flag = self.calculate_availability_flag(sequence);
        self.available_buffer[index].load(Ordering::Acquire) == flag
    }

    fn highest_published_sequence(&self, lo: i64, available: i64) -> i64 {
        let mut sequence = lo;
        while sequence <= available {
            if !self.is_available(sequence) {
                return sequence - 1;
            }
            sequence += 1;
        }
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
        let produced = self.cursor.get();
        let consumed = self.gating_sequences.minimum(produced);
        self.buffer_size - (produced - consumed)
    }
}

impl std::fmt::Debug for MultiProducerSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiProducerSequencer")
            .field("buffer_size", &self.buffer_size)
            .field("cursor", &self.cursor.get())
            .finish()
    }
}
