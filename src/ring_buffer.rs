//! Fixed-capacity pre-allocated slot storage.
//!
//! The ring buffer owns the event slots and delegates every ordering
//! decision to its [`Sequencer`]. Slot contents are reused across laps:
//! nothing is allocated after construction.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::barrier::ProcessingSequenceBarrier;
use crate::event::{EventFactory, EventTranslator, EventTranslatorOneArg, EventTranslatorTwoArg};
use crate::sequence::Sequence;
use crate::sequencer::{ProducerType, Sequencer};
use crate::wait::WaitStrategy;
use crate::{Error, Result};

/// Power-of-two ring of pre-built event slots.
///
/// The slot for sequence `s` lives at index `s & (capacity - 1)`. Access
/// is coordinated entirely by sequence ownership: a slot is written only
/// by the producer currently holding its sequence, and read by consumers
/// only after that sequence has been published.
pub struct RingBuffer<E> {
    slots: Box<[UnsafeCell<E>]>,
    index_mask: i64,
    sequencer: Arc<dyn Sequencer>,
}

// SAFETY: slots are UnsafeCell, but the sequencing protocol guarantees a
// slot is never written concurrently with any other access: producers own
// a sequence exclusively between claim and publish, and consumers only
// touch sequences at or below the published frontier.
unsafe impl<E: Send> Send for RingBuffer<E> {}
unsafe impl<E: Send> Sync for RingBuffer<E> {}

impl<E> RingBuffer<E> {
    /// Build a ring for the given producer model.
    ///
    /// The factory is invoked once per slot, up front.
    ///
    /// # Errors
    /// [`Error::InvalidBufferSize`] unless `buffer_size` is a positive
    /// power of two.
    pub fn new<F>(
        producer_type: ProducerType,
        buffer_size: usize,
        factory: &F,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Result<Self>
    where
        F: EventFactory<E>,
    {
        let sequencer = producer_type.new_sequencer(buffer_size, wait_strategy)?;
        Self::with_sequencer(sequencer, factory)
    }

    /// Build a ring over an existing sequencer.
    ///
    /// # Errors
    /// [`Error::InvalidBufferSize`] if the sequencer reports a capacity
    /// that is not a positive power of two.
    pub fn with_sequencer<F>(sequencer: Arc<dyn Sequencer>, factory: &F) -> Result<Self>
    where
        F: EventFactory<E>,
    {
        let buffer_size = sequencer.buffer_size();
        if !crate::is_power_of_two(buffer_size) {
            return Err(Error::InvalidBufferSize(buffer_size));
        }
        let slots: Box<[UnsafeCell<E>]> = (0..buffer_size)
            .map(|_| UnsafeCell::new(factory.new_instance()))
            .collect();
        Ok(Self {
            slots,
            index_mask: (buffer_size - 1) as i64,
            sequencer,
        })
    }

    /// Capacity of the ring.
    pub fn buffer_size(&self) -> usize {
        self.slots.len()
    }

    /// The sequencer coordinating this ring.
    pub fn sequencer(&self) -> &Arc<dyn Sequencer> {
        &self.sequencer
    }

    /// The publish cursor.
    pub fn cursor(&self) -> Arc<Sequence> {
        self.sequencer.cursor()
    }

    /// Slots that could be claimed right now.
    pub fn remaining_capacity(&self) -> i64 {
        self.sequencer.remaining_capacity()
    }

    /// Shared reference to the slot holding `sequence`.
    ///
    /// Callers must only read sequences the sequencing protocol has made
    /// safe: at or below their barrier's returned frontier, or between
    /// claim and publish for a producer.
    pub fn get(&self, sequence: i64) -> &E {
        let index = (sequence & self.index_mask) as usize;
        // SAFETY: index is masked into bounds; aliasing is prevented by
        // the sequencing protocol (see type-level comment).
        unsafe { &*self.slots.get_unchecked(index).get() }
    }

    /// Mutable reference to the slot holding `sequence`.
    ///
    /// # Safety
    /// The caller must hold exclusive ownership of `sequence`: either a
    /// producer between claim and publish, or a consumer to which the
    /// protocol has handed the sequence (work pools hand each sequence to
    /// exactly one worker; broadcast chains rely on stage ordering).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, sequence: i64) -> &mut E {
        let index = (sequence & self.index_mask) as usize;
        &mut *self.slots.get_unchecked(index).get()
    }

    /// Claim the next sequence, fill the slot via `translator`, publish.
    ///
    /// Publication happens on every exit path - even if the translator
    /// panics - because an unpublished claimed sequence would stall every
    /// consumer forever.
    ///
    /// Returns the published sequence.
    ///
    /// # Errors
    /// Propagates claim errors from the sequencer.
    pub fn publish_event<T>(&self, translator: &T) -> Result<i64>
    where
        T: EventTranslator<E>,
    {
        let sequence = self.sequencer.next()?;
        self.translate_and_publish(translator, sequence);
        Ok(sequence)
    }

    /// As [`RingBuffer::publish_event`], but failing fast when the ring is full.
    ///
    /// # Errors
    /// [`Error::InsufficientCapacity`] when no slot can be claimed.
    pub fn try_publish_event<T>(&self, translator: &T) -> Result<i64>
    where
        T: EventTranslator<E>,
    {
        let sequence = self.sequencer.try_next()?;
        self.translate_and_publish(translator, sequence);
        Ok(sequence)
    }

    /// As [`RingBuffer::publish_event`], threading one caller argument
    /// through to the translator.
    ///
    /// # Errors
    /// Propagates claim errors from the sequencer.
    pub fn publish_event_one_arg<T, A>(&self, translator: &T, arg: A) -> Result<i64>
    where
        T: EventTranslatorOneArg<E, A>,
    {
        let sequence = self.sequencer.next()?;
        self.translate_one_arg_and_publish(translator, sequence, arg);
        Ok(sequence)
    }

    /// As [`RingBuffer::publish_event_one_arg`], failing fast when the
    /// ring is full.
    ///
    /// # Errors
    /// [`Error::InsufficientCapacity`] when no slot can be claimed.
    pub fn try_publish_event_one_arg<T, A>(&self, translator: &T, arg: A) -> Result<i64>
    where
        T: EventTranslatorOneArg<E, A>,
    {
        let sequence = self.sequencer.try_next()?;
        self.translate_one_arg_and_publish(translator, sequence, arg);
        Ok(sequence)
    }

    /// As [`RingBuffer::publish_event`], threading two caller arguments
    /// through to the translator.
    ///
    /// # Errors
    /// Propagates claim errors from the sequencer.
    pub fn publish_event_two_arg<T, A, B>(&self, translator: &T, arg0: A, arg1: B) -> Result<i64>
    where
        T: EventTranslatorTwoArg<E, A, B>,
    {
        let sequence = self.sequencer.next()?;
        self.translate_two_arg_and_publish(translator, sequence, arg0, arg1);
        Ok(sequence)
    }

    /// As [`RingBuffer::publish_event_two_arg`], failing fast when the
    /// ring is full.
    ///
    /// # Errors
    /// [`Error::InsufficientCapacity`] when no slot can be claimed.
    pub fn try_publish_event_two_arg<T, A, B>(
        &self,
        translator: &T,
        arg0: A,
        arg1: B,
    ) -> Result<i64>
    where
        T: EventTranslatorTwoArg<E, A, B>,
    {
        let sequence = self.sequencer.try_next()?;
        self.translate_two_arg_and_publish(translator, sequence, arg0, arg1);
        Ok(sequence)
    }

    /// Claim `n` consecutive sequences, fill each slot, publish the range
    /// as one unit. Returns the highest published sequence.
    ///
    /// # Errors
    /// [`Error::InvalidBatchSize`] for an out-of-range `n`.
    pub fn publish_events<T>(&self, translator: &T, n: i64) -> Result<i64>
    where
        T: EventTranslator<E>,
    {
        let hi = self.sequencer.next_n(n)?;
        self.translate_and_publish_range(translator, hi - n + 1, hi);
        Ok(hi)
    }

    /// As [`RingBuffer::publish_events`], failing fast when `n` slots are
    /// not free.
    ///
    /// # Errors
    /// [`Error::InsufficientCapacity`] or [`Error::InvalidBatchSize`].
    pub fn try_publish_events<T>(&self, translator: &T, n: i64) -> Result<i64>
    where
        T: EventTranslator<E>,
    {
        let hi = self.sequencer.try_next_n(n)?;
        self.translate_and_publish_range(translator, hi - n + 1, hi);
        Ok(hi)
    }

    fn translate_and_publish<T>(&self, translator: &T, sequence: i64)
    where
        T: EventTranslator<E>,
    {
        let _guard = PublishGuard {
            sequencer: self.sequencer.as_ref(),
            lo: sequence,
            hi: sequence,
        };
        // SAFETY: the sequence was claimed above and not yet published,
        // so this thread owns the slot exclusively.
        let event = unsafe { self.get_mut(sequence) };
        translator.translate_to(event, sequence);
    }

    fn translate_one_arg_and_publish<T, A>(&self, translator: &T, sequence: i64, arg: A)
    where
        T: EventTranslatorOneArg<E, A>,
    {
        let _guard = PublishGuard {
            sequencer: self.sequencer.as_ref(),
            lo: sequence,
            hi: sequence,
        };
        // SAFETY: the sequence was claimed above and not yet published,
        // so this thread owns the slot exclusively.
        let event = unsafe { self.get_mut(sequence) };
        translator.translate_to(event, sequence, arg);
    }

    fn translate_two_arg_and_publish<T, A, B>(
        &self,
        translator: &T,
        sequence: i64,
        arg0: A,
        arg1: B,
    ) where
        T: EventTranslatorTwoArg<E, A, B>,
    {
        let _guard = PublishGuard {
            sequencer: self.sequencer.as_ref(),
            lo: sequence,
            hi: sequence,
        };
        // SAFETY: as above, claimed and unpublished.
        let event = unsafe { self.get_mut(sequence) };
        translator.translate_to(event, sequence, arg0, arg1);
    }

    fn translate_and_publish_range<T>(&self, translator: &T, lo: i64, hi: i64)
    where
        T: EventTranslator<E>,
    {
        let _guard = PublishGuard {
            sequencer: self.sequencer.as_ref(),
            lo,
            hi,
        };
        for sequence in lo..=hi {
            // SAFETY: the whole range was claimed and is unpublished.
            let event = unsafe { self.get_mut(sequence) };
            translator.translate_to(event, sequence);
        }
    }

    /// Build a barrier over this ring's cursor and the given upstream
    /// dependencies (empty means the barrier waits on the cursor alone).
    pub fn new_barrier(&self, dependencies: Vec<Arc<Sequence>>) -> ProcessingSequenceBarrier {
        ProcessingSequenceBarrier::new(
            Arc::clone(&self.sequencer),
            self.sequencer.wait_strategy(),
            self.sequencer.cursor(),
            dependencies,
        )
    }

    /// Register consumer positions producers must not overrun.
    pub fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]) {
        self.sequencer.add_gating_sequences(sequences);
    }

    /// Deregister a consumer position; true when it was present.
    pub fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        self.sequencer.remove_gating_sequence(sequence)
    }

    /// Slowest registered consumer position, or the cursor when none.
    pub fn minimum_gating_sequence(&self) -> i64 {
        self.sequencer.minimum_sequence()
    }
}

impl<E> std::fmt::Debug for RingBuffer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("buffer_size", &self.slots.len())
            .field("sequencer", &self.sequencer)
            .finish()
    }
}

/// Publishes a claimed range when dropped, including during unwinding.
struct PublishGuard<'a> {
    sequencer: &'a dyn Sequencer,
    lo: i64,
    hi: i64,
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        if self.lo == self.hi {
            self.sequencer.publish(self.hi);
        } else {
            self.sequencer.publish_range(self.lo, self.hi);
        }
    }
}
