//! End-to-end producer/consumer sequencing behavior.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sluice::{
    BatchEventProcessor, BlockingWaitStrategy, BusySpinWaitStrategy, DefaultEventFactory,
    EventHandler, EventProcessor, FatalExceptionHandler, ProducerType, RingBuffer,
    SequenceBarrier, YieldingWaitStrategy,
};

#[derive(Debug, Default, Clone)]
struct Item {
    producer: i64,
    payload: i64,
}

struct Collector {
    tx: mpsc::Sender<(i64, Item, bool)>,
}

impl EventHandler<Item> for Collector {
    fn on_event(&mut self, event: &mut Item, sequence: i64, end_of_batch: bool) -> anyhow::Result<()> {
        self.tx.send((sequence, event.clone(), end_of_batch)).ok();
        Ok(())
    }
}

fn spsc_parts(
    buffer_size: usize,
) -> (
    Arc<RingBuffer<Item>>,
    Arc<BatchEventProcessor<Item, Collector>>,
    mpsc::Receiver<(i64, Item, bool)>,
) {
    let ring = Arc::new(
        RingBuffer::new(
            ProducerType::Single,
            buffer_size,
            &DefaultEventFactory::<Item>::new(),
            Arc::new(BlockingWaitStrategy::new()),
        )
        .unwrap(),
    );
    let barrier: Arc<dyn SequenceBarrier> = Arc::new(ring.new_barrier(Vec::new()));
    let (tx, rx) = mpsc::channel();
    let processor = Arc::new(BatchEventProcessor::new(
        Arc::clone(&ring),
        barrier,
        Collector { tx },
        Arc::new(FatalExceptionHandler),
    ));
    ring.add_gating_sequences(&[processor.sequence()]);
    (ring, processor, rx)
}

#[test]
fn ten_events_through_a_capacity_four_ring_arrive_in_order() {
    let (ring, processor, rx) = spsc_parts(4);
    let runner = {
        let processor = Arc::clone(&processor);
        thread::spawn(move || processor.run())
    };

    for i in 0..10i64 {
        ring.publish_event(&move |event: &mut Item, sequence: i64| {
            event.producer = 0;
            event.payload = i * 100 + sequence;
        })
        .unwrap();
    }

    let mut deliveries = Vec::new();
    for _ in 0..10 {
        deliveries.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    for (expected, (sequence, item, _)) in deliveries.iter().enumerate() {
        assert_eq!(*sequence, expected as i64);
        assert_eq!(item.payload % 100, *sequence % 100);
    }
    // end_of_batch marks the last item of each wait cycle; the very last
    // delivery must always close a batch.
    assert!(deliveries.last().unwrap().2);

    processor.halt();
    assert!(runner.join().unwrap().is_ok());
}

#[test]
fn producer_never_runs_more_than_capacity_ahead_of_the_consumer() {
    let capacity = 8usize;
    let ring = Arc::new(
        RingBuffer::new(
            ProducerType::Single,
            capacity,
            &DefaultEventFactory::<Item>::new(),
            Arc::new(BusySpinWaitStrategy),
        )
        .unwrap(),
    );
    let consumer = Arc::new(sluice::Sequence::new());
    ring.add_gating_sequences(&[Arc::clone(&consumer)]);

    let highest_claim = Arc::new(AtomicI64::new(-1));
    let done = Arc::new(AtomicBool::new(false));

    let producer = {
        let ring = Arc::clone(&ring);
        let highest_claim = Arc::clone(&highest_claim);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for _ in 0..100 {
                let seq = ring
                    .publish_event(&|_: &mut Item, _: i64| {})
                    .unwrap();
                highest_claim.store(seq, Ordering::SeqCst);
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    // Release capacity one slot at a time, checking the claim bound after
    // every step the consumer takes.
    let mut position = -1i64;
    while !done.load(Ordering::SeqCst) {
        let claimed = highest_claim.load(Ordering::SeqCst);
        assert!(
            claimed <= position + capacity as i64,
            "claim {claimed} overran consumer at {position}"
        );
        position += 1;
        consumer.set(position);
        thread::sleep(Duration::from_millis(1));
    }
    producer.join().unwrap();
}

#[test]
fn four_producers_deliver_four_thousand_distinct_items() {
    let ring = Arc::new(
        RingBuffer::new(
            ProducerType::Multi,
            1024,
            &DefaultEventFactory::<Item>::new(),
            Arc::new(YieldingWaitStrategy::new()),
        )
        .unwrap(),
    );
    let barrier: Arc<dyn SequenceBarrier> = Arc::new(ring.new_barrier(Vec::new()));
    let (tx, rx) = mpsc::channel();
    let processor = Arc::new(BatchEventProcessor::new(
        Arc::clone(&ring),
        barrier,
        Collector { tx },
        Arc::new(FatalExceptionHandler),
    ));
    ring.add_gating_sequences(&[processor.sequence()]);
    let runner = {
        let processor = Arc::clone(&processor);
        thread::spawn(move || processor.run())
    };

    let producers: Vec<_> = (0..4i64)
        .map(|producer_id| {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for payload in 0..1000i64 {
                    ring.publish_event(&move |event: &mut Item, _: i64| {
                        event.producer = producer_id;
                        event.payload = payload;
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let mut last_sequence = -1i64;
    let mut seen = std::collections::HashSet::new();
    for _ in 0..4000 {
        let (sequence, item, _) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(sequence > last_sequence, "sequence went backwards");
        last_sequence = sequence;
        assert!(
            seen.insert((item.producer, item.payload)),
            "duplicate item {item:?}"
        );
    }
    assert_eq!(seen.len(), 4000);
    assert_eq!(last_sequence, 3999);

    processor.halt();
    assert!(runner.join().unwrap().is_ok());
}

#[test]
fn alerted_consumer_exits_promptly_and_restarts() {
    let (ring, processor, rx) = spsc_parts(16);

    let runner = {
        let processor = Arc::clone(&processor);
        thread::spawn(move || processor.run())
    };
    while !processor.is_running() {
        thread::yield_now();
    }

    processor.halt();
    assert!(runner.join().unwrap().is_ok());
    assert!(!processor.is_running());

    // Restart on a fresh thread and verify events still flow.
    let runner = {
        let processor = Arc::clone(&processor);
        thread::spawn(move || processor.run())
    };
    ring.publish_event(&|event: &mut Item, _: i64| event.payload = 42)
        .unwrap();
    let (_, item, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(item.payload, 42);

    processor.halt();
    assert!(runner.join().unwrap().is_ok());
}
