//! Consumption loops.
//!
//! A processor owns a progress [`Sequence`], drives a handler from a
//! [`SequenceBarrier`](crate::barrier::SequenceBarrier) and obeys a small
//! lifecycle: `Idle -> Running` on a CAS-guarded `run`, back to `Idle` when
//! halted, restartable from there on any thread.

mod batch;
mod work;

pub use batch::BatchEventProcessor;
pub use work::{WorkProcessor, WorkerPool};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::sequence::Sequence;
use crate::{Error, Result};

pub(crate) const IDLE: u8 = 0;
pub(crate) const RUNNING: u8 = 1;
pub(crate) const HALTED: u8 = 2;

/// Lifecycle state shared by every processor kind.
#[derive(Debug)]
pub(crate) struct RunState {
    state: AtomicU8,
}

impl RunState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Claim the transition to Running.
    ///
    /// # Errors
    /// [`Error::AlreadyRunning`] when another thread holds the loop.
    pub(crate) fn enter_running(&self) -> Result<()> {
        match self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(RUNNING) => Err(Error::AlreadyRunning),
            // Halted before the loop ever started; treat as a completed run.
            Err(_) => {
                self.state.store(IDLE, Ordering::Release);
                Err(Error::Alerted)
            }
        }
    }

    pub(crate) fn halt(&self) {
        self.state.store(HALTED, Ordering::Release);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Back to Idle after the loop exits, allowing a restart.
    pub(crate) fn exit(&self) {
        self.state.store(IDLE, Ordering::Release);
    }
}

/// A runnable consumption loop.
///
/// `run` executes on the caller's thread until halted; the wiring layer
/// hands it to a dedicated thread.
pub trait EventProcessor: Send + Sync {
    /// This processor's progress position, registered as a gating sequence
    /// and used as a dependency by downstream stages.
    fn sequence(&self) -> Arc<Sequence>;

    /// Execute the processing loop until halted.
    ///
    /// # Errors
    /// [`Error::AlreadyRunning`] when the loop is already live on another
    /// thread; [`Error::FatalEventHandler`] when the exception handler
    /// escalates a handler failure.
    fn run(&self) -> Result<()>;

    /// Ask the loop to exit after the event it is currently processing.
    fn halt(&self);

    /// True while the loop is live.
    fn is_running(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_round_trips() {
        let state = RunState::new();
        assert!(!state.is_running());

        state.enter_running().unwrap();
        assert!(state.is_running());
        assert_eq!(state.enter_running(), Err(Error::AlreadyRunning));

        state.halt();
        assert!(!state.is_running());
        state.exit();
        state.enter_running().unwrap();
    }

    #[test]
    fn halt_before_run_is_a_clean_no_op() {
        let state = RunState::new();
        state.halt();
        assert_eq!(state.enter_running(), Err(Error::Alerted));
        // The failed start reset the state; a fresh run works.
        state.enter_running().unwrap();
    }
}
