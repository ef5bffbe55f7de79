//! Event plumbing: factories, translators and handler traits.
//!
//! These are the seams the wiring layer plugs user code into. The core
//! never allocates events after construction: a factory pre-builds every
//! slot once, translators mutate claimed slots in place, and handlers
//! receive mutable references into the ring.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::sequence::Sequence;

/// Factory invoked once per slot at ring construction.
pub trait EventFactory<E>: Send + Sync {
    /// Build one pre-allocated event instance.
    fn new_instance(&self) -> E;
}

impl<E, F> EventFactory<E> for F
where
    F: Fn() -> E + Send + Sync,
{
    fn new_instance(&self) -> E {
        self()
    }
}

/// Factory for event types with a [`Default`] value.
#[derive(Debug)]
pub struct DefaultEventFactory<E: Default>(PhantomData<E>);

impl<E: Default> DefaultEventFactory<E> {
    #[must_use]
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E: Default> Default for DefaultEventFactory<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Default + Send + Sync> EventFactory<E> for DefaultEventFactory<E> {
    fn new_instance(&self) -> E {
        E::default()
    }
}

/// Populates a claimed slot before it is published.
pub trait EventTranslator<E>: Send + Sync {
    /// Write data into `event`, which occupies `sequence` in the ring.
    fn translate_to(&self, event: &mut E, sequence: i64);
}

impl<E, F> EventTranslator<E> for F
where
    F: Fn(&mut E, i64) + Send + Sync,
{
    fn translate_to(&self, event: &mut E, sequence: i64) {
        self(event, sequence);
    }
}

/// Translator threading one extra argument through to the slot.
pub trait EventTranslatorOneArg<E, A>: Send + Sync {
    fn translate_to(&self, event: &mut E, sequence: i64, arg: A);
}

impl<E, A, F> EventTranslatorOneArg<E, A> for F
where
    F: Fn(&mut E, i64, A) + Send + Sync,
{
    fn translate_to(&self, event: &mut E, sequence: i64, arg: A) {
        self(event, sequence, arg);
    }
}

/// Translator threading two extra arguments through to the slot.
pub trait EventTranslatorTwoArg<E, A, B>: Send + Sync {
    fn translate_to(&self, event: &mut E, sequence: i64, arg0: A, arg1: B);
}

impl<E, A, B, F> EventTranslatorTwoArg<E, A, B> for F
where
    F: Fn(&mut E, i64, A, B) + Send + Sync,
{
    fn translate_to(&self, event: &mut E, sequence: i64, arg0: A, arg1: B) {
        self(event, sequence, arg0, arg1);
    }
}

/// Explicit translator wrapper for contexts where a named type reads
/// better than a bare closure.
pub struct ClosureEventTranslator<E, F>
where
    F: Fn(&mut E, i64) + Send + Sync,
{
    translator: F,
    _marker: PhantomData<fn(&mut E)>,
}

impl<E, F> ClosureEventTranslator<E, F>
where
    F: Fn(&mut E, i64) + Send + Sync,
{
    pub fn new(translator: F) -> Self {
        Self {
            translator,
            _marker: PhantomData,
        }
    }
}

impl<E, F> EventTranslator<E> for ClosureEventTranslator<E, F>
where
    F: Fn(&mut E, i64) + Send + Sync,
{
    fn translate_to(&self, event: &mut E, sequence: i64) {
        (self.translator)(event, sequence);
    }
}

/// Broadcast consumer callback, invoked for every published event.
///
/// The optional notifications have no-op defaults; implementations opt in
/// by overriding them. Resolution happens once through the vtable - the
/// processing loop never probes capabilities per event.
pub trait EventHandler<E>: Send {
    /// Process one event.
    ///
    /// `end_of_batch` is true for the last event available in this wait
    /// cycle, letting handlers that buffer I/O flush once per batch.
    ///
    /// # Errors
    /// Any error is routed to the processor's
    /// [`ExceptionHandler`](crate::ExceptionHandler); the processor's
    /// sequence still advances past the failing event.
    fn on_event(&mut self, event: &mut E, sequence: i64, end_of_batch: bool) -> anyhow::Result<()>;

    /// Called once on the processing thread before the first wait.
    ///
    /// # Errors
    /// Routed to
    /// [`ExceptionHandler::handle_on_start_exception`](crate::ExceptionHandler::handle_on_start_exception);
    /// the processing loop still runs.
    fn on_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once after the processing loop exits.
    ///
    /// # Errors
    /// Routed to
    /// [`ExceptionHandler::handle_on_shutdown_exception`](crate::ExceptionHandler::handle_on_shutdown_exception).
    fn on_shutdown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when a bounded wait strategy times out; the loop then waits
    /// again. `sequence` is the handler's current position.
    ///
    /// # Errors
    /// Routed to the exception handler like an event failure.
    fn on_timeout(&mut self, sequence: i64) -> anyhow::Result<()> {
        let _ = sequence;
        Ok(())
    }

    /// Called before each batch with the number of events about to be
    /// delivered.
    fn on_batch_start(&mut self, batch_size: i64) {
        let _ = batch_size;
    }

    /// Offers the handler the processor's own sequence, for handlers that
    /// want to checkpoint progress mid-batch rather than at batch end.
    fn set_sequence_callback(&mut self, sequence: Arc<Sequence>) {
        let _ = sequence;
    }
}

/// Competing consumer callback: each published event reaches exactly one
/// [`WorkHandler`] in a pool.
pub trait WorkHandler<E>: Send {
    /// Process one event owned exclusively by this worker.
    ///
    /// # Errors
    /// Routed to the pool's exception handler; the work sequence has
    /// already moved on, so the event is not redelivered.
    fn on_event(&mut self, event: &mut E) -> anyhow::Result<()>;
}

impl<E, F> WorkHandler<E> for F
where
    F: FnMut(&mut E) -> anyhow::Result<()> + Send,
{
    fn on_event(&mut self, event: &mut E) -> anyhow::Result<()> {
        self(event)
    }
}
