//! Wiring layer: compose a ring, processors and threads in a few calls.
//!
//! [`Disruptor`] owns the ring buffer, builds barriers so dependent stages
//! form a graph, registers the terminal stages as gating sequences and
//! drives every processor on its own named thread.

use std::fmt;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info};

use crate::event::{EventFactory, EventHandler, EventTranslator, WorkHandler};
use crate::exception::{ExceptionHandler, FatalExceptionHandler};
use crate::processor::{BatchEventProcessor, EventProcessor, WorkerPool};
use crate::ring_buffer::RingBuffer;
use crate::sequence::Sequence;
use crate::sequencer::ProducerType;
use crate::wait::{BlockingWaitStrategy, WaitStrategy};
use crate::{Error, Result};

enum Consumer<E>
where
    E: Send + Sync + 'static,
{
    Processor(Arc<dyn EventProcessor>),
    Pool(Arc<WorkerPool<E>>),
}

/// One call to `handle_events_with`/`then`/worker-pool creates one group.
struct Group<E>
where
    E: Send + Sync + 'static,
{
    consumers: Vec<Consumer<E>>,
    /// Positions downstream stages and producer gating read.
    sequences: Vec<Arc<Sequence>>,
    /// False once a later stage depends on this group.
    end_of_chain: bool,
}

/// Builder and lifecycle owner for a complete processing graph.
///
/// Construct, add consumer stages, `start`, publish, then `shutdown` to
/// drain or `halt` to stop immediately.
pub struct Disruptor<E>
where
    E: Send + Sync + 'static,
{
    ring: Arc<RingBuffer<E>>,
    exception_handler: Arc<dyn ExceptionHandler<E>>,
    groups: Vec<Group<E>>,
    threads: Vec<thread::JoinHandle<Result<()>>>,
    started: bool,
}

impl<E> Disruptor<E>
where
    E: Send + Sync + 'static,
{
    /// Build a disruptor with an explicit producer model and wait strategy.
    ///
    /// # Errors
    /// [`Error::InvalidBufferSize`] unless `buffer_size` is a positive
    /// power of two.
    pub fn new<F>(
        factory: F,
        buffer_size: usize,
        producer_type: ProducerType,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Result<Self>
    where
        F: EventFactory<E>,
        E: fmt::Debug,
    {
        let ring = Arc::new(RingBuffer::new(
            producer_type,
            buffer_size,
            &factory,
            wait_strategy,
        )?);
        Ok(Self {
            ring,
            exception_handler: Arc::new(FatalExceptionHandler),
            groups: Vec::new(),
            threads: Vec::new(),
            started: false,
        })
    }

    /// Single producer with the blocking wait strategy.
    ///
    /// # Errors
    /// [`Error::InvalidBufferSize`] unless `buffer_size` is a positive
    /// power of two.
    pub fn with_defaults<F>(factory: F, buffer_size: usize) -> Result<Self>
    where
        F: EventFactory<E>,
        E: fmt::Debug,
    {
        Self::new(
            factory,
            buffer_size,
            ProducerType::Single,
            Arc::new(BlockingWaitStrategy::new()),
        )
    }

    /// Replace the failure policy for stages added after this call.
    pub fn with_exception_handler(
        &mut self,
        exception_handler: Arc<dyn ExceptionHandler<E>>,
    ) -> &mut Self {
        self.exception_handler = exception_handler;
        self
    }

    /// Add a broadcast stage fed directly from the publish cursor.
    pub fn handle_events_with<H>(&mut self, handler: H) -> &mut Self
    where
        H: EventHandler<E> + 'static,
    {
        self.add_batch_group(handler, Vec::new())
    }

    /// Add a broadcast stage that runs after the most recently added
    /// stage. With no prior stage it feeds from the cursor.
    pub fn then<H>(&mut self, handler: H) -> &mut Self
    where
        H: EventHandler<E> + 'static,
    {
        let dependencies = match self.groups.last_mut() {
            Some(group) => {
                group.end_of_chain = false;
                group.sequences.clone()
            }
            None => Vec::new(),
        };
        self.add_batch_group(handler, dependencies)
    }

    /// Add a pool of competing workers fed from the publish cursor.
    pub fn handle_events_with_worker_pool(
        &mut self,
        handlers: Vec<Box<dyn WorkHandler<E>>>,
    ) -> &mut Self {
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&self.ring),
            Vec::new(),
            Arc::clone(&self.exception_handler),
            handlers,
        ));
        let sequences = pool.worker_sequences();
        self.groups.push(Group {
            consumers: vec![Consumer::Pool(pool)],
            sequences,
            end_of_chain: true,
        });
        self
    }

    fn add_batch_group<H>(&mut self, handler: H, dependencies: Vec<Arc<Sequence>>) -> &mut Self
    where
        H: EventHandler<E> + 'static,
    {
        let barrier = Arc::new(self.ring.new_barrier(dependencies));
        let processor = Arc::new(BatchEventProcessor::new(
            Arc::clone(&self.ring),
            barrier,
            handler,
            Arc::clone(&self.exception_handler),
        ));
        let sequences = vec![processor.sequence()];
        self.groups.push(Group {
            consumers: vec![Consumer::Processor(processor)],
            sequences,
            end_of_chain: true,
        });
        self
    }

    /// Register terminal gating and start every consumer on its own thread.
    ///
    /// # Errors
    /// [`Error::AlreadyRunning`] on a second call;
    /// [`Error::ThreadSpawn`] when the OS refuses a thread.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyRunning);
        }
        self.started = true;

        // Producers only gate on the ends of chains; intermediate stages
        // are covered transitively by their dependents.
        for group in self.groups.iter().filter(|group| group.end_of_chain) {
            self.ring.add_gating_sequences(&group.sequences);
        }

        let mut index = 0usize;
        for group in &self.groups {
            for consumer in &group.consumers {
                match consumer {
                    Consumer::Processor(processor) => {
                        let processor = Arc::clone(processor);
                        let handle = thread::Builder::new()
                            .name(format!("sluice-processor-{index}"))
                            .spawn(move || processor.run())
                            .map_err(|e| Error::ThreadSpawn(e.to_string()))?;
                        self.threads.push(handle);
                        index += 1;
                    }
                    Consumer::Pool(pool) => pool.start()?,
                }
            }
        }
        info!(
            buffer_size = self.ring.buffer_size(),
            stages = self.groups.len(),
            "disruptor started"
        );
        Ok(())
    }

    /// Claim, translate and publish one event, waiting for capacity.
    ///
    /// # Errors
    /// Propagates claim errors from the sequencer.
    pub fn publish<T>(&self, translator: T) -> Result<i64>
    where
        T: EventTranslator<E>,
    {
        self.ring.publish_event(&translator)
    }

    /// As [`Disruptor::publish`], failing fast when the ring is full.
    ///
    /// # Errors
    /// [`Error::InsufficientCapacity`] when no slot is free.
    pub fn try_publish<T>(&self, translator: T) -> Result<i64>
    where
        T: EventTranslator<E>,
    {
        self.ring.try_publish_event(&translator)
    }

    /// Publish `n` events as one claimed range.
    ///
    /// # Errors
    /// [`Error::InvalidBatchSize`] for an out-of-range `n`.
    pub fn publish_batch<T>(&self, translator: T, n: i64) -> Result<i64>
    where
        T: EventTranslator<E>,
    {
        self.ring.publish_events(&translator, n)
    }

    /// The underlying ring, for direct claim/publish access.
    pub fn ring_buffer(&self) -> &Arc<RingBuffer<E>> {
        &self.ring
    }

    /// Current publish cursor value.
    pub fn cursor(&self) -> i64 {
        self.ring.cursor().get()
    }

    /// True while any terminal stage still lags the cursor.
    pub fn has_backlog(&self) -> bool {
        let cursor = self.cursor();
        self.groups
            .iter()
            .filter(|group| group.end_of_chain)
            .flat_map(|group| group.sequences.iter())
            .any(|sequence| sequence.get() < cursor)
    }

    /// Wait for every consumer to catch up with the cursor, then stop all
    /// of them and join their threads.
    ///
    /// A consumer that died mid-stream leaves its sequence frozen below
    /// the cursor, so the drain also ends as soon as any consumer thread
    /// has exited; the join then reports its failure.
    ///
    /// # Errors
    /// The first processor failure encountered while joining, if any.
    pub fn shutdown(&mut self) -> Result<()> {
        while self.has_backlog() {
            if self.any_consumer_stopped() {
                break;
            }
            thread::yield_now();
        }
        self.halt()
    }

    fn any_consumer_stopped(&self) -> bool {
        self.threads.iter().any(|handle| handle.is_finished())
            || self.groups.iter().any(|group| {
                group.consumers.iter().any(|consumer| match consumer {
                    Consumer::Processor(_) => false,
                    Consumer::Pool(pool) => pool.has_stopped_worker(),
                })
            })
    }

    /// Stop every consumer without draining and join their threads.
    ///
    /// # Errors
    /// The first processor failure encountered while joining, if any.
    pub fn halt(&mut self) -> Result<()> {
        let mut result = Ok(());
        for group in &self.groups {
            for consumer in &group.consumers {
                match consumer {
                    Consumer::Processor(processor) => processor.halt(),
                    Consumer::Pool(pool) => {
                        if let Err(e) = pool.halt() {
                            if result.is_ok() {
                                result = Err(e);
                            }
                        }
                    }
                }
            }
        }
        for handle in self.threads.drain(..) {
            match handle.join() {
                Ok(Err(e)) if result.is_ok() => result = Err(e),
                _ => {}
            }
        }
        self.started = false;
        debug!("disruptor stopped");
        result
    }
}

impl<E> Drop for Disruptor<E>
where
    E: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.started {
            let _ = self.halt();
        }
    }
}

impl<E> fmt::Debug for Disruptor<E>
where
    E: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disruptor")
            .field("buffer_size", &self.ring.buffer_size())
            .field("stages", &self.groups.len())
            .field("started", &self.started)
            .finish()
    }
}
