//! Full pipelines wired through the builder.

use std::sync::mpsc;
use std::sync::Arc;

use sluice::{
    Disruptor, EventHandler, IgnoreExceptionHandler, ProducerType, WorkHandler,
    YieldingWaitStrategy,
};

#[derive(Debug, Default, Clone)]
struct Quote {
    raw: i64,
    normalized: i64,
}

struct Normalizer;

impl EventHandler<Quote> for Normalizer {
    fn on_event(&mut self, event: &mut Quote, _sequence: i64, _end_of_batch: bool) -> anyhow::Result<()> {
        event.normalized = event.raw * 2;
        Ok(())
    }
}

struct Auditor {
    tx: mpsc::Sender<Quote>,
}

impl EventHandler<Quote> for Auditor {
    fn on_event(&mut self, event: &mut Quote, _sequence: i64, _end_of_batch: bool) -> anyhow::Result<()> {
        self.tx.send(event.clone()).ok();
        Ok(())
    }
}

#[test]
fn two_stage_pipeline_sees_upstream_mutations() {
    let (tx, rx) = mpsc::channel();
    let mut disruptor = Disruptor::<Quote>::with_defaults(Quote::default, 32).unwrap();
    disruptor.handle_events_with(Normalizer).then(Auditor { tx });
    disruptor.start().unwrap();

    for raw in 1..=50i64 {
        disruptor
            .publish(move |event: &mut Quote, _: i64| {
                event.raw = raw;
                event.normalized = 0;
            })
            .unwrap();
    }
    disruptor.shutdown().unwrap();

    // The second stage only runs after the first, so it observes the
    // normalization applied in place.
    let audited: Vec<Quote> = rx.try_iter().collect();
    assert_eq!(audited.len(), 50);
    for quote in audited {
        assert_eq!(quote.normalized, quote.raw * 2);
    }
}

#[test]
fn multi_producer_pipeline_with_batch_publication() {
    let (tx, rx) = mpsc::channel();
    let mut disruptor = Disruptor::<Quote>::new(
        Quote::default,
        64,
        ProducerType::Multi,
        Arc::new(YieldingWaitStrategy::new()),
    )
    .unwrap();
    disruptor.handle_events_with(Auditor { tx });
    disruptor.start().unwrap();

    let hi = disruptor
        .publish_batch(|event: &mut Quote, sequence: i64| event.raw = sequence, 10)
        .unwrap();
    assert_eq!(hi, 9);
    disruptor.shutdown().unwrap();

    let raws: Vec<i64> = rx.try_iter().map(|quote| quote.raw).collect();
    assert_eq!(raws, (0..10).collect::<Vec<_>>());
}

#[test]
fn failing_events_are_skipped_under_the_ignore_policy() {
    struct Flaky {
        tx: mpsc::Sender<i64>,
    }
    impl EventHandler<Quote> for Flaky {
        fn on_event(&mut self, event: &mut Quote, _sequence: i64, _end_of_batch: bool) -> anyhow::Result<()> {
            if event.raw % 3 == 0 {
                anyhow::bail!("rejecting {}", event.raw);
            }
            self.tx.send(event.raw).ok();
            Ok(())
        }
    }

    let (tx, rx) = mpsc::channel();
    let mut disruptor = Disruptor::<Quote>::with_defaults(Quote::default, 16).unwrap();
    disruptor
        .with_exception_handler(Arc::new(IgnoreExceptionHandler))
        .handle_events_with(Flaky { tx });
    disruptor.start().unwrap();

    for raw in 1..=9i64 {
        disruptor
            .publish(move |event: &mut Quote, _: i64| event.raw = raw)
            .unwrap();
    }
    disruptor.shutdown().unwrap();

    let delivered: Vec<i64> = rx.try_iter().collect();
    assert_eq!(delivered, vec![1, 2, 4, 5, 7, 8]);
}

#[test]
fn worker_pool_downstream_of_the_builder() {
    let (tx, rx) = mpsc::channel();
    let handlers: Vec<Box<dyn WorkHandler<Quote>>> = (0..2)
        .map(|_| {
            let tx = tx.clone();
            Box::new(move |event: &mut Quote| -> anyhow::Result<()> {
                tx.send(event.raw).ok();
                Ok(())
            }) as Box<dyn WorkHandler<Quote>>
        })
        .collect();
    drop(tx);

    let mut disruptor = Disruptor::<Quote>::with_defaults(Quote::default, 32).unwrap();
    disruptor.handle_events_with_worker_pool(handlers);
    disruptor.start().unwrap();

    for raw in 0..20i64 {
        disruptor
            .publish(move |event: &mut Quote, _: i64| event.raw = raw)
            .unwrap();
    }
    disruptor.shutdown().unwrap();

    let mut raws: Vec<i64> = rx.try_iter().collect();
    raws.sort_unstable();
    assert_eq!(raws, (0..20).collect::<Vec<_>>());
}
