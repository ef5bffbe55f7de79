//! Consumer-side coordination point.
//!
//! A barrier is what a processing loop waits on. It combines the publish
//! cursor, the positions of any upstream consumers, the wait strategy and
//! an alert flag for cooperative shutdown into a single `wait_for` call.

use std::sync::Arc;

use crate::sequence::Sequence;
use crate::sequencer::Sequencer;
use crate::wait::{AlertFlag, DependentSequences, WaitStrategy};
use crate::Result;

/// Coordination handle consumers wait on.
pub trait SequenceBarrier: Send + Sync {
    /// Wait until `sequence` is safe to read.
    ///
    /// Returns the highest contiguously published sequence at or above the
    /// request, which is usually larger: callers should drain the whole
    /// range. A return below `sequence` means the wait strategy gave up
    /// early with nothing new; callers simply wait again.
    ///
    /// # Errors
    /// [`crate::Error::Alerted`] once the barrier is alerted;
    /// [`crate::Error::Timeout`] from bounded wait strategies.
    fn wait_for(&self, sequence: i64) -> Result<i64>;

    /// Current value of the publish cursor.
    fn cursor(&self) -> i64;

    /// Raise the alert flag and wake any parked waiters.
    fn alert(&self);

    /// Lower the alert flag so waiting can resume.
    fn clear_alert(&self);

    /// True while the alert flag is raised.
    fn is_alerted(&self) -> bool;

    /// Fail fast when the alert flag is raised.
    ///
    /// # Errors
    /// [`crate::Error::Alerted`].
    fn check_alert(&self) -> Result<()>;
}

/// The one barrier implementation: waits through a [`WaitStrategy`] and
/// clamps the result to the sequencer's contiguously published frontier.
pub struct ProcessingSequenceBarrier {
    sequencer: Arc<dyn Sequencer>,
    wait_strategy: Arc<dyn WaitStrategy>,
    cursor: Arc<Sequence>,
    dependents: DependentSequences,
    alert: AlertFlag,
}

impl ProcessingSequenceBarrier {
    /// Build a barrier gated on `dependencies`, or on the cursor alone when
    /// none are given.
    #[must_use]
    pub fn new(
        sequencer: Arc<dyn Sequencer>,
        wait_strategy: Arc<dyn WaitStrategy>,
        cursor: Arc<Sequence>,
        dependencies: Vec<Arc<Sequence>>,
    ) -> Self {
        let dependents = DependentSequences::new(Arc::clone(&cursor), dependencies);
        Self {
            sequencer,
            wait_strategy,
            cursor,
            dependents,
            alert: AlertFlag::new(),
        }
    }
}

impl SequenceBarrier for ProcessingSequenceBarrier {
    fn wait_for(&self, sequence: i64) -> Result<i64> {
        self.alert.check()?;

        let available =
            self.wait_strategy
                .wait_for(sequence, &self.cursor, &self.dependents, &self.alert)?;

        if available < sequence {
            return Ok(available);
        }

        // With multiple producers the dependent minimum can run ahead of
        // the contiguously published frontier; never hand out a gap.
        Ok(self.sequencer.highest_published_sequence(sequence, available))
    }

    fn cursor(&self) -> i64 {
        self.cursor.get()
    }

    fn alert(&self) {
        self.alert.raise();
        self.wait_strategy.signal_all_when_blocking();
    }

    fn clear_alert(&self) {
        self.alert.clear();
    }

    fn is_alerted(&self) -> bool {
        self.alert.is_raised()
    }

    fn check_alert(&self) -> Result<()> {
        self.alert.check()
    }
}

impl std::fmt::Debug for ProcessingSequenceBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingSequenceBarrier")
            .field("cursor", &self.cursor.get())
            .field("alerted", &self.alert.is_raised())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DefaultEventFactory;
    use crate::ring_buffer::RingBuffer;
    use crate::sequencer::ProducerType;
    use crate::wait::{BlockingWaitStrategy, BusySpinWaitStrategy};
    use crate::Error;
    use std::thread;
    use std::time::Duration;

    fn ring(producer_type: ProducerType) -> RingBuffer<i64> {
        RingBuffer::new(
            producer_type,
            16,
            &DefaultEventFactory::<i64>::new(),
            Arc::new(BusySpinWaitStrategy),
        )
        .unwrap()
    }

    #[test]
    fn wait_for_returns_the_published_frontier() {
        let ring = ring(ProducerType::Single);
        let barrier = ring.new_barrier(Vec::new());

        let translator = |event: &mut i64, sequence: i64| *event = sequence;
        for _ in 0..5 {
            ring.publish_event(&translator).unwrap();
        }

        assert_eq!(barrier.wait_for(0).unwrap(), 4);
        assert_eq!(barrier.cursor(), 4);
    }

    #[test]
    fn wait_for_never_returns_a_multi_producer_gap() {
        let ring = ring(ProducerType::Multi);
        let barrier = ring.new_barrier(Vec::new());
        let sequencer = ring.sequencer();

        let s0 = sequencer.next().unwrap();
        let s1 = sequencer.next().unwrap();
        let s2 = sequencer.next().unwrap();
        sequencer.publish(s0);
        sequencer.publish(s2);
        let _ = s1;

        // Sequence 1 is claimed but unpublished; the frontier stops at 0.
        assert_eq!(barrier.wait_for(0).unwrap(), 0);
    }

    #[test]
    fn dependent_sequences_gate_behind_upstream_consumers() {
        let ring = ring(ProducerType::Single);
        let upstream = Arc::new(Sequence::with_value(2));
        let barrier = ring.new_barrier(vec![Arc::clone(&upstream)]);

        let translator = |event: &mut i64, sequence: i64| *event = sequence;
        for _ in 0..10 {
            ring.publish_event(&translator).unwrap();
        }

        assert_eq!(barrier.wait_for(0).unwrap(), 2);
        upstream.set(7);
        assert_eq!(barrier.wait_for(3).unwrap(), 7);
    }

    #[test]
    fn alert_interrupts_and_clear_resumes() {
        let ring = RingBuffer::new(
            ProducerType::Single,
            16,
            &DefaultEventFactory::<i64>::new(),
            Arc::new(BlockingWaitStrategy::new()),
        )
        .unwrap();
        let barrier = Arc::new(ring.new_barrier(Vec::new()));

        assert!(!barrier.is_alerted());

        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait_for(0))
        };
        thread::sleep(Duration::from_millis(20));
        barrier.alert();
        assert_eq!(waiter.join().unwrap(), Err(Error::Alerted));

        // Alert is sticky until cleared.
        assert_eq!(barrier.wait_for(0), Err(Error::Alerted));
        assert_eq!(barrier.check_alert(), Err(Error::Alerted));

        barrier.clear_alert();
        assert!(barrier.check_alert().is_ok());
        ring.publish_event(&|event: &mut i64, _: i64| *event = 42).unwrap();
        assert_eq!(barrier.wait_for(0).unwrap(), 0);
    }
}
