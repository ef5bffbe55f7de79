//! `sluice` - lock-free bounded event sequencing
//!
//! A high-throughput, low-latency mechanism for passing a fixed ring of
//! reusable event slots between producer and consumer threads without locks
//! on the hot path. Producers claim sequence numbers, write into
//! pre-allocated slots and publish; consumers wait on a [`SequenceBarrier`]
//! and drain every published slot up to the returned frontier.
//!
//! ## Quick start
//!
//! ```rust
//! use sluice::{Disruptor, EventHandler};
//!
//! #[derive(Debug, Default)]
//! struct Tick {
//!     value: i64,
//! }
//!
//! struct Doubler;
//!
//! impl EventHandler<Tick> for Doubler {
//!     fn on_event(&mut self, event: &mut Tick, sequence: i64, _end_of_batch: bool) -> anyhow::Result<()> {
//!         assert_eq!(event.value, sequence * 2);
//!         Ok(())
//!     }
//! }
//!
//! let mut disruptor = Disruptor::<Tick>::with_defaults(Tick::default, 64).unwrap();
//! disruptor.handle_events_with(Doubler);
//! disruptor.start().unwrap();
//! for _ in 0..10 {
//!     disruptor.publish(|event: &mut Tick, sequence: i64| event.value = sequence * 2).unwrap();
//! }
//! disruptor.shutdown().unwrap();
//! ```
//!
//! ## Architecture
//!
//! - [`Sequence`]: cache-line padded monotonic counter
//! - [`Sequencer`]: claim/publish protocol and producer backpressure
//!   ([`SingleProducerSequencer`], [`MultiProducerSequencer`])
//! - [`RingBuffer`]: pre-allocated power-of-two slot storage
//! - [`SequenceBarrier`] + [`WaitStrategy`]: consumer-side coordination
//! - [`BatchEventProcessor`] / [`WorkerPool`]: broadcast and competing
//!   consumption loops
//! - [`Disruptor`]: wiring layer that composes the above

pub mod barrier;
pub mod dsl;
pub mod event;
pub mod exception;
pub mod processor;
pub mod ring_buffer;
pub mod sequence;
pub mod sequence_group;
pub mod sequencer;
pub mod wait;

pub use barrier::{ProcessingSequenceBarrier, SequenceBarrier};
pub use dsl::Disruptor;
pub use event::{
    ClosureEventTranslator, DefaultEventFactory, EventFactory, EventHandler, EventTranslator,
    EventTranslatorOneArg, EventTranslatorTwoArg, WorkHandler,
};
pub use exception::{ExceptionHandler, FatalExceptionHandler, IgnoreExceptionHandler};
pub use processor::{BatchEventProcessor, EventProcessor, WorkProcessor, WorkerPool};
pub use ring_buffer::RingBuffer;
pub use sequence::Sequence;
pub use sequence_group::SequenceGroup;
pub use sequencer::{MultiProducerSequencer, ProducerType, Sequencer, SingleProducerSequencer};
pub use wait::{
    AlertFlag, BlockingWaitStrategy, BusySpinWaitStrategy, LiteBlockingWaitStrategy,
    LiteTimeoutBlockingWaitStrategy, PhasedBackoffWaitStrategy, SleepingWaitStrategy,
    TimeoutBlockingWaitStrategy, WaitStrategy, YieldingWaitStrategy,
};

/// Initial value of every sequence before anything has been published.
pub const INITIAL_CURSOR_VALUE: i64 = -1;

/// Errors surfaced by the sequencing core.
///
/// The control-flow variants (`InsufficientCapacity`, `Alerted`, `Timeout`)
/// carry no payload: they are raised on hot paths and must never allocate
/// or capture context.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// A non-blocking claim could not be satisfied without overrunning the
    /// slowest gating sequence. Recoverable; the caller decides whether to
    /// retry, drop or back off.
    #[error("insufficient capacity in ring buffer")]
    InsufficientCapacity,

    /// The barrier was alerted while waiting. Not a failure: the wait loop
    /// exits so the processor can observe its running flag.
    #[error("sequence barrier alerted")]
    Alerted,

    /// A bounded wait strategy's deadline elapsed before data arrived.
    #[error("timed out waiting for sequence")]
    Timeout,

    /// Ring construction was given a size that is not a positive power of two.
    #[error("buffer size must be a positive power of two, got {0}")]
    InvalidBufferSize(usize),

    /// A batch claim asked for fewer than 1 or more than `buffer_size` slots.
    #[error("batch claim must be between 1 and the buffer size, got {0}")]
    InvalidBatchSize(i64),

    /// `run` was called on a processor that is already running.
    #[error("event processor already running")]
    AlreadyRunning,

    /// An event handler failed and the exception handler chose to halt.
    #[error("event handler failure at sequence {0} was fatal")]
    FatalEventHandler(i64),

    /// The OS refused to spawn a processor thread.
    #[error("failed to spawn processor thread: {0}")]
    ThreadSpawn(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// True when `n` is a positive power of two.
#[must_use]
pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}
