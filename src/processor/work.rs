//! Competing consumption: work processors and the pool that owns them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::debug;

use crate::barrier::SequenceBarrier;
use crate::event::WorkHandler;
use crate::exception::ExceptionHandler;
use crate::processor::{EventProcessor, RunState};
use crate::ring_buffer::RingBuffer;
use crate::sequence::Sequence;
use crate::{Error, Result};

/// One member of a [`WorkerPool`].
///
/// Pool members race on a shared work sequence: whoever wins the CAS for a
/// sequence number owns that event exclusively, so each published event is
/// handled by exactly one member. A member only falls back to the barrier
/// once its cached availability frontier is exhausted, keeping barrier
/// traffic at one wait per batch rather than one per event.
pub struct WorkProcessor<E> {
    ring: Arc<RingBuffer<E>>,
    barrier: Arc<dyn SequenceBarrier>,
    sequence: Arc<Sequence>,
    work_sequence: Arc<Sequence>,
    handler: Mutex<Box<dyn WorkHandler<E>>>,
    exception_handler: Arc<dyn ExceptionHandler<E>>,
    state: RunState,
}

impl<E> WorkProcessor<E>
where
    E: Send + Sync,
{
    pub fn new(
        ring: Arc<RingBuffer<E>>,
        barrier: Arc<dyn SequenceBarrier>,
        handler: Box<dyn WorkHandler<E>>,
        exception_handler: Arc<dyn ExceptionHandler<E>>,
        work_sequence: Arc<Sequence>,
    ) -> Self {
        Self {
            ring,
            barrier,
            sequence: Arc::new(Sequence::new()),
            work_sequence,
            handler: Mutex::new(handler),
            exception_handler,
            state: RunState::new(),
        }
    }

    fn process_events(&self, handler: &mut dyn WorkHandler<E>) -> Result<()> {
        let mut processed = true;
        let mut cached_available = i64::MIN;
        let mut next_sequence = self.sequence.get();

        loop {
            if processed {
                // Claim the next unowned sequence. The processor's own
                // sequence trails the claim so producers stay gated on
                // work actually finished.
                processed = false;
                loop {
                    next_sequence = self.work_sequence.get() + 1;
                    self.sequence.set(next_sequence - 1);
                    if self
                        .work_sequence
                        .compare_and_set(next_sequence - 1, next_sequence)
                    {
                        break;
                    }
                }
            }

            if cached_available >= next_sequence {
                // SAFETY: the CAS above granted this sequence to this
                // worker alone, and it is at or below the published
                // frontier returned by the barrier.
                let event = unsafe { self.ring.get_mut(next_sequence) };
                processed = true;
                if let Err(cause) = handler.on_event(event) {
                    self.exception_handler
                        .handle_event_exception(&cause, next_sequence, event)?;
                }
            } else {
                match self.barrier.wait_for(next_sequence) {
                    Ok(available) => cached_available = available,
                    Err(Error::Timeout) => {}
                    Err(Error::Alerted) => {
                        if !self.state.is_running() {
                            // The claim was won before the alert landed. If
                            // its event is already published it must still
                            // be handled, or a drain would silently drop it.
                            if self.ring.sequencer().is_available(next_sequence) {
                                // SAFETY: this worker won the CAS for the
                                // sequence and it is published.
                                let event = unsafe { self.ring.get_mut(next_sequence) };
                                if let Err(cause) = handler.on_event(event) {
                                    self.exception_handler.handle_event_exception(
                                        &cause,
                                        next_sequence,
                                        event,
                                    )?;
                                }
                            }
                            return Ok(());
                        }
                    }
                    Err(other) => return Err(other),
                }
            }
        }
    }
}

impl<E> EventProcessor for WorkProcessor<E>
where
    E: Send + Sync,
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
        debug!(sequence = self.sequence.get(), "work processor started");

        let result = self.process_events(handler.as_mut());

        // Park the progress sequence at the ceiling so a stopped worker
        // neither gates producers nor reads as a drain laggard.
        self.sequence.set(i64::MAX);
        debug!("work processor stopped");
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

impl<E> std::fmt::Debug for WorkProcessor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkProcessor")
            .field("sequence", &self.sequence.get())
            .field("running", &self.state.is_running())
            .finish()
    }
}

/// A set of competing workers draining one ring.
///
/// Every published event reaches exactly one worker. The pool owns the
/// shared work sequence, spawns one thread per worker and exposes both an
/// immediate and a drain-then-stop shutdown.
pub struct WorkerPool<E>
where
    E: Send + Sync + 'static,
{
    ring: Arc<RingBuffer<E>>,
    work_sequence: Arc<Sequence>,
    workers: Vec<Arc<WorkProcessor<E>>>,
    threads: Mutex<Vec<thread::JoinHandle<Result<()>>>>,
    started: AtomicBool,
}

impl<E> WorkerPool<E>
where
    E: Send + Sync + 'static,
{
    /// Build one worker per handler, all gated on `barrier_dependencies`
    /// (the cursor alone when empty).
    pub fn new(
        ring: Arc<RingBuffer<E>>,
        barrier_dependencies: Vec<Arc<Sequence>>,
        exception_handler: Arc<dyn ExceptionHandler<E>>,
        handlers: Vec<Box<dyn WorkHandler<E>>>,
    ) -> Self {
        let work_sequence = Arc::new(Sequence::new());
        let barrier: Arc<dyn SequenceBarrier> =
            Arc::new(ring.new_barrier(barrier_dependencies));
        let workers = handlers
            .into_iter()
            .map(|handler| {
                Arc::new(WorkProcessor::new(
                    Arc::clone(&ring),
                    Arc::clone(&barrier),
                    handler,
                    Arc::clone(&exception_handler),
                    Arc::clone(&work_sequence),
                ))
            })
            .collect();
        Self {
            ring,
            work_sequence,
            workers,
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Positions producers must gate on: every worker plus the shared work
    /// sequence, which covers claimed-but-unfinished events.
    #[must_use]
    pub fn worker_sequences(&self) -> Vec<Arc<Sequence>> {
        let mut sequences: Vec<Arc<Sequence>> = self
            .workers
            .iter()
            .map(|worker| worker.sequence())
            .collect();
        sequences.push(Arc::clone(&self.work_sequence));
        sequences
    }

    /// Spawn one named thread per worker.
    ///
    /// Worker and work sequences start from the current cursor so the pool
    /// only sees events published after this call.
    ///
    /// # Errors
    /// [`Error::AlreadyRunning`] when the pool is already live;
    /// [`Error::ThreadSpawn`] when the OS refuses a thread.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }

        let cursor = self.ring.cursor().get();
        self.work_sequence.set(cursor);

        let mut threads = self.threads.lock();
        for (index, worker) in self.workers.iter().enumerate() {
            worker.sequence().set(cursor);
            let worker = Arc::clone(worker);
            let handle = thread::Builder::new()
                .name(format!("sluice-worker-{index}"))
                .spawn(move || worker.run())
                .map_err(|e| Error::ThreadSpawn(e.to_string()))?;
            threads.push(handle);
        }
        debug!(workers = self.workers.len(), cursor, "worker pool started");
        Ok(())
    }

    /// Stop every worker as soon as it finishes its current event.
    ///
    /// # Errors
    /// The first worker failure encountered while joining, if any.
    pub fn halt(&self) -> Result<()> {
        for worker in &self.workers {
            worker.halt();
        }
        self.join()
    }

    /// Let the pool finish everything already published, then stop.
    ///
    /// A worker lost to a fatal failure leaves the shared work sequence
    /// frozen behind the cursor, so the drain also ends once every worker
    /// thread has exited.
    ///
    /// # Errors
    /// The first worker failure encountered while joining, if any.
    pub fn drain_and_halt(&self) -> Result<()> {
        let cursor = self.ring.cursor();
        while self.work_sequence.get() < cursor.get() {
            if self.threads.lock().iter().all(|handle| handle.is_finished()) {
                break;
            }
            thread::yield_now();
        }
        self.halt()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// True when any worker thread has exited. While the pool is live this
    /// means a worker was lost to a fatal failure.
    pub fn has_stopped_worker(&self) -> bool {
        self.threads.lock().iter().any(|handle| handle.is_finished())
    }

    fn join(&self) -> Result<()> {
        let mut result = Ok(());
        for handle in self.threads.lock().drain(..) {
            match handle.join() {
                Ok(Err(e)) if result.is_ok() => result = Err(e),
                _ => {}
            }
        }
        self.started.store(false, Ordering::Release);
        result
    }
}

impl<E> std::fmt::Debug for WorkerPool<E>
where
    E: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("work_sequence", &self.work_sequence.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DefaultEventFactory;
    use crate::exception::FatalExceptionHandler;
    use crate::sequencer::ProducerType;
    use crate::wait::BlockingWaitStrategy;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Job {
        id: i64,
    }

    fn ring() -> Arc<RingBuffer<Job>> {
        Arc::new(
            RingBuffer::new(
                ProducerType::Single,
                16,
                &DefaultEventFactory::<Job>::new(),
                Arc::new(BlockingWaitStrategy::new()),
            )
            .unwrap(),
        )
    }

    fn pool_with_recorder(
        ring: &Arc<RingBuffer<Job>>,
        workers: usize,
    ) -> (WorkerPool<Job>, mpsc::Receiver<(usize, i64)>) {
        let (tx, rx) = mpsc::channel();
        let handlers: Vec<Box<dyn WorkHandler<Job>>> = (0..workers)
            .map(|worker_id| {
                let tx = tx.clone();
                let handler = move |job: &mut Job| -> anyhow::Result<()> {
                    tx.send((worker_id, job.id)).ok();
                    Ok(())
                };
                Box::new(handler) as Box<dyn WorkHandler<Job>>
            })
            .collect();
        let pool = WorkerPool::new(
            Arc::clone(ring),
            Vec::new(),
            Arc::new(FatalExceptionHandler),
            handlers,
        );
        ring.add_gating_sequences(&pool.worker_sequences());
        (pool, rx)
    }

    #[test]
    fn every_event_reaches_exactly_one_worker() {
        let ring = ring();
        let (pool, rx) = pool_with_recorder(&ring, 3);
        pool.start().unwrap();

        for _ in 0..9 {
            ring.publish_event(&|job: &mut Job, sequence: i64| job.id = sequence)
                .unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..9 {
            let (_, id) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(seen.insert(id), "event {id} delivered twice");
        }
        assert_eq!(seen, (0..9).collect::<HashSet<_>>());

        pool.drain_and_halt().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn drain_and_halt_finishes_the_backlog() {
        let ring = ring();
        let (pool, rx) = pool_with_recorder(&ring, 2);

        // Publish before starting; started sequences skip this backlog.
        for _ in 0..4 {
            ring.publish_event(&|job: &mut Job, sequence: i64| job.id = sequence)
                .unwrap();
        }
        pool.start().unwrap();
        for _ in 0..4 {
            ring.publish_event(&|job: &mut Job, sequence: i64| job.id = sequence)
                .unwrap();
        }
        pool.drain_and_halt().unwrap();

        let delivered: Vec<i64> = rx.try_iter().map(|(_, id)| id).collect();
        assert_eq!(
            delivered.iter().copied().collect::<HashSet<_>>(),
            (4..8).collect::<HashSet<_>>()
        );
        assert!(!pool.is_running());
    }

    #[test]
    fn double_start_is_rejected() {
        let ring = ring();
        let (pool, _rx) = pool_with_recorder(&ring, 1);
        pool.start().unwrap();
        assert_eq!(pool.start(), Err(Error::AlreadyRunning));
        pool.halt().unwrap();
    }

    #[test]
    fn drain_ends_and_reports_when_every_worker_has_died() {
        let ring = ring();
        let handler = |_: &mut Job| -> anyhow::Result<()> { anyhow::bail!("bad job") };
        let pool = WorkerPool::new(
            Arc::clone(&ring),
            Vec::new(),
            Arc::new(FatalExceptionHandler),
            vec![Box::new(handler) as Box<dyn WorkHandler<Job>>],
        );
        ring.add_gating_sequences(&pool.worker_sequences());
        pool.start().unwrap();

        for _ in 0..3 {
            ring.publish_event(&|job: &mut Job, sequence: i64| job.id = sequence)
                .unwrap();
        }

        // The lone worker dies on sequence 0 and the work sequence never
        // reaches the cursor; the drain must still end with the failure.
        assert_eq!(pool.drain_and_halt(), Err(Error::FatalEventHandler(0)));
        assert!(!pool.is_running());
    }
}
