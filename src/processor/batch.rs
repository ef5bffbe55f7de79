//! Broadcast consumption loop.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::barrier::SequenceBarrier;
use crate::event::EventHandler;
use crate::exception::ExceptionHandler;
use crate::processor::{EventProcessor, RunState};
use crate::ring_buffer::RingBuffer;
use crate::sequence::Sequence;
use crate::{Error, Result};

/// Drives an [`EventHandler`] over every published event.
///
/// Each instance sees the full stream; independent instances on the same
/// ring each get their own copy of the traffic. The progress sequence is
/// written once per drained batch, not once per event, so downstream gating
/// reads a mostly-quiet cache line.
pub struct BatchEventProcessor<E, H>
where
    H: EventHandler<E>,
{
    ring: Arc<RingBuffer<E>>,
    barrier: Arc<dyn SequenceBarrier>,
    sequence: Arc<Sequence>,
    handler: Mutex<H>,
    exception_handler: Arc<dyn ExceptionHandler<E>>,
    state: RunState,
}

impl<E, H> BatchEventProcessor<E, H>
where
    E: Send + Sync,
    H: EventHandler<E>,
{
    /// Wire a handler to a ring through a barrier.
    ///
    /// The handler is offered the processor's own sequence via
    /// [`EventHandler::set_sequence_callback`] before the first run.
    pub fn new(
        ring: Arc<RingBuffer<E>>,
        barrier: Arc<dyn SequenceBarrier>,
        mut handler: H,
        exception_handler: Arc<dyn ExceptionHandler<E>>,
    ) -> Self {
        let sequence = Arc::new(Sequence::new());
        handler.set_sequence_callback(Arc::clone(&sequence));
        Self {
            ring,
            barrier,
            sequence,
            handler: Mutex::new(handler),
            exception_handler,
            state: RunState::new(),
        }
    }

    /// The barrier this processor waits on.
    pub fn barrier(&self) -> &Arc<dyn SequenceBarrier> {
        &self.barrier
    }

    fn process_events(&self, handler: &mut H) -> Result<()> {
        let mut next_sequence = self.sequence.get() + 1;

        loop {
            match self.barrier.wait_for(next_sequence) {
                Ok(available) if available >= next_sequence => {
                    handler.on_batch_start(available - next_sequence + 1);

                    while next_sequence <= available {
                        let end_of_batch = next_sequence == available;
                        // SAFETY: everything up to `available` is published
                        // and this stage owns `next_sequence` exclusively
                        // until its progress sequence moves past it.
                        let event = unsafe { self.ring.get_mut(next_sequence) };
                        if let Err(cause) = handler.on_event(event, next_sequence, end_of_batch) {
                            // Move past the poison event no matter what the
                            // policy decides; a stuck sequence would gate
                            // producers forever.
                            self.sequence.set(next_sequence);
                            self.exception_handler.handle_event_exception(
                                &cause,
                                next_sequence,
                                event,
                            )?;
                        }
                        next_sequence += 1;
                    }

                    self.sequence.set(available);
                }
                // The wait strategy came back early with nothing new.
                Ok(_) => {}
                Err(Error::Timeout) => {
                    let current = self.sequence.get();
                    if let Err(cause) = handler.on_timeout(current) {
                        self.exception_handler
                            .handle_timeout_exception(&cause, current)?;
                    }
                }
                Err(Error::Alerted) => {
                    if !self.state.is_running() {
                        return Ok(());
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }
}

impl<E, H> EventProcessor for BatchEventProcessor<E, H>
where
    E: Send + Sync,
    H: EventHandler<E>,
{
    fn sequence(&self) -> Arc<Sequence> {
        Arc::clone(&self.sequence)
    }

    fn run(&self) -> Result<()> {
        match self.state.enter_running() {
            Ok(()) => {}
            Err(Error::Alerted) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.barrier.clear_alert();

        let mut handler = self.handler.lock();
        if let Err(cause) = handler.on_start() {
            self.exception_handler.handle_on_start_exception(&cause);
        }
        debug!(sequence = self.sequence.get(), "batch processor started");

        let result = self.process_events(&mut handler);

        if let Err(cause) = handler.on_shutdown() {
            self.exception_handler.handle_on_shutdown_exception(&cause);
        }
        debug!(sequence = self.sequence.get(), "batch processor stopped");
        self.state.exit();
        result
    }

    fn halt(&self) {
        self.state.halt();
        self.barrier.alert();
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

impl<E, H> std::fmt::Debug for BatchEventProcessor<E, H>
where
    H: EventHandler<E>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEventProcessor")
            .field("sequence", &self.sequence.get())
            .field("running", &self.state.is_running())
            .finish()
    }
}
