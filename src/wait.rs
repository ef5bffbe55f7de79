//! Consumer wait strategies.
//!
//! A wait strategy decides how a consumer thread spends its time while the
//! sequence it needs has not been published yet. The choice trades CPU for
//! latency: busy spinning reacts in nanoseconds but burns a core, blocking
//! frees the core but pays for kernel wakeups, and the hybrids sit between.
//!
//! Every strategy observes the same contract: return a sequence at or above
//! the requested one once the dependent minimum reaches it, return
//! [`Error::Alerted`] promptly after the alert flag is raised, and for the
//! bounded variants return [`Error::Timeout`] when the wait deadline passes.

use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::sequence::Sequence;
use crate::{Error, Result};

/// Cooperative cancellation flag shared between a barrier and the threads
/// waiting through it.
#[derive(Debug, Default)]
pub struct AlertFlag {
    raised: AtomicBool,
}

impl AlertFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Waiters observe it on their next poll.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Lower the flag so waiting can resume.
    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Fail with [`Error::Alerted`] when the flag is raised.
    ///
    /// # Errors
    /// [`Error::Alerted`].
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            Err(Error::Alerted)
        } else {
            Ok(())
        }
    }
}

/// The upstream positions a waiting consumer must stay behind.
///
/// Always non-empty: a consumer with no upstream stages depends directly on
/// the publish cursor.
#[derive(Debug, Clone)]
pub struct DependentSequences {
    sequences: Arc<[Arc<Sequence>]>,
}

impl DependentSequences {
    /// Wrap the given positions, falling back to the cursor when none are
    /// supplied.
    #[must_use]
    pub fn new(cursor: Arc<Sequence>, dependencies: Vec<Arc<Sequence>>) -> Self {
        let sequences: Arc<[Arc<Sequence>]> = if dependencies.is_empty() {
            Arc::from(vec![cursor])
        } else {
            Arc::from(dependencies)
        };
        Self { sequences }
    }

    /// Minimum of the wrapped positions.
    pub fn value(&self) -> i64 {
        crate::sequence::minimum_sequence(&self.sequences, i64::MAX)
    }
}

/// Strategy for waiting until a sequence becomes available.
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    /// Wait until the dependent minimum reaches `sequence`.
    ///
    /// `cursor` is the publish cursor, used by blocking strategies as the
    /// wakeup signal; progress past upstream consumers is then polled via
    /// `dependents`. The returned value may exceed `sequence` when more
    /// events are already available.
    ///
    /// # Errors
    /// [`Error::Alerted`] when `alert` is raised mid-wait;
    /// [`Error::Timeout`] from the bounded strategies.
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &DependentSequences,
        alert: &AlertFlag,
    ) -> Result<i64>;

    /// Wake threads parked in `wait_for`. Called by producers after every
    /// publish; a no-op for non-blocking strategies.
    fn signal_all_when_blocking(&self) {}
}

/// Park on a condition variable until the cursor advances.
///
/// Lowest CPU use and worst wakeup latency. The default choice when
/// consumers share cores with other work.
#[derive(Debug, Default)]
pub struct BlockingWaitStrategy {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl BlockingWaitStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &DependentSequences,
        alert: &AlertFlag,
    ) -> Result<i64> {
        if cursor.get() < sequence {
            let mut guard = self.lock.lock();
            while cursor.get() < sequence {
                alert.check()?;
                self.condvar.wait(&mut guard);
            }
        }

        // The cursor is far enough; now spin briefly for upstream stages.
        let mut available;
        while {
            available = dependents.value();
            available < sequence
        } {
            alert.check()?;
            hint::spin_loop();
        }
        Ok(available)
    }

    fn signal_all_when_blocking(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }
}

/// [`BlockingWaitStrategy`] that elides the producer-side lock when no
/// consumer is parked.
///
/// Producers publishing into an already-busy ring skip the notify entirely,
/// at the cost of a small race window that can cause one spurious wakeup.
#[derive(Debug, Default)]
pub struct LiteBlockingWaitStrategy {
    lock: Mutex<()>,
    condvar: Condvar,
    signal_needed: AtomicBool,
}

impl LiteBlockingWaitStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for LiteBlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &DependentSequences,
        alert: &AlertFlag,
    ) -> Result<i64> {
        if cursor.get() < sequence {
            let mut guard = self.lock.lock();
            loop {
                self.signal_needed.store(true, Ordering::Release);
                if cursor.get() >= sequence {
                    break;
                }
                alert.check()?;
                self.condvar.wait(&mut guard);
            }
        }

        let mut available;
        while {
            available = dependents.value();
            available < sequence
        } {
            alert.check()?;
            hint::spin_loop();
        }
        Ok(available)
    }

    fn signal_all_when_blocking(&self) {
        if self.signal_needed.swap(false, Ordering::AcqRel) {
            let _guard = self.lock.lock();
            self.condvar.notify_all();
        }
    }
}

/// Spin flat out until the sequence arrives.
///
/// Lowest possible latency; requires a dedicated core per waiting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct BusySpinWaitStrategy;

impl WaitStrategy for BusySpinWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        _cursor: &Sequence,
        dependents: &DependentSequences,
        alert: &AlertFlag,
    ) -> Result<i64> {
        let mut available;
        while {
            available = dependents.value();
            available < sequence
        } {
            alert.check()?;
            hint::spin_loop();
        }
        Ok(available)
    }
}

/// Spin a bounded number of times, then yield the time slice between polls.
#[derive(Debug, Clone, Copy)]
pub struct YieldingWaitStrategy {
    spin_tries: u32,
}

impl YieldingWaitStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self { spin_tries: 100 }
    }
}

impl Default for YieldingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        _cursor: &Sequence,
        dependents: &DependentSequences,
        alert: &AlertFlag,
    ) -> Result<i64> {
        let mut counter = self.spin_tries;
        let mut available;
        while {
            available = dependents.value();
            available < sequence
        } {
            alert.check()?;
            if counter > 0 {
                counter -= 1;
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
        Ok(available)
    }
}

/// Back off in three phases: spin, yield, then park for a fixed interval.
///
/// A reasonable default when latency matters but cores are shared; the
/// final parking phase keeps an idle consumer near-free.
#[derive(Debug, Clone, Copy)]
pub struct SleepingWaitStrategy {
    retries: i32,
    sleep: Duration,
}

impl SleepingWaitStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self::with_retries_and_sleep(200, Duration::from_nanos(100))
    }

    #[must_use]
    pub fn with_retries_and_sleep(retries: i32, sleep: Duration) -> Self {
        Self { retries, sleep }
    }
}

impl Default for SleepingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for SleepingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        _cursor: &Sequence,
        dependents: &DependentSequences,
        alert: &AlertFlag,
    ) -> Result<i64> {
        let mut counter = self.retries;
        let mut available;
        while {
            available = dependents.value();
            available < sequence
        } {
            alert.check()?;
            if counter > 100 {
                counter -= 1;
                hint::spin_loop();
            } else if counter > 0 {
                counter -= 1;
                thread::yield_now();
            } else {
                thread::park_timeout(self.sleep);
            }
        }
        Ok(available)
    }
}

/// [`BlockingWaitStrategy`] with a bound on each wait.
///
/// A timed-out wait surfaces as [`Error::Timeout`], which processors turn
/// into a timeout notification rather than a failure.
#[derive(Debug)]
pub struct TimeoutBlockingWaitStrategy {
    lock: Mutex<()>,
    condvar: Condvar,
    timeout: Duration,
}

impl TimeoutBlockingWaitStrategy {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            timeout,
        }
    }
}

impl WaitStrategy for TimeoutBlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &DependentSequences,
        alert: &AlertFlag,
    ) -> Result<i64> {
        if cursor.get() < sequence {
            let deadline = Instant::now() + self.timeout;
            let mut guard = self.lock.lock();
            while cursor.get() < sequence {
                alert.check()?;
                if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                    return Err(Error::Timeout);
                }
            }
        }

        let mut available;
        while {
            available = dependents.value();
            available < sequence
        } {
            alert.check()?;
            hint::spin_loop();
        }
        Ok(available)
    }

    fn signal_all_when_blocking(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }
}

/// [`TimeoutBlockingWaitStrategy`] with the lite notify elision.
#[derive(Debug)]
pub struct LiteTimeoutBlockingWaitStrategy {
    lock: Mutex<()>,
    condvar: Condvar,
    signal_needed: AtomicBool,
    timeout: Duration,
}

impl LiteTimeoutBlockingWaitStrategy {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            signal_needed: AtomicBool::new(false),
            timeout,
        }
    }
}

impl WaitStrategy for LiteTimeoutBlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &DependentSequences,
        alert: &AlertFlag,
    ) -> Result<i64> {
        if cursor.get() < sequence {
            let deadline = Instant::now() + self.timeout;
            let mut guard = self.lock.lock();
            loop {
                self.signal_needed.store(true, Ordering::Release);
                if cursor.get() >= sequence {
                    break;
                }
                alert.check()?;
                if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                    return Err(Error::Timeout);
                }
            }
        }

        let mut available;
        while {
            available = dependents.value();
            available < sequence
        } {
            alert.check()?;
            hint::spin_loop();
        }
        Ok(available)
    }

    fn signal_all_when_blocking(&self) {
        if self.signal_needed.swap(false, Ordering::AcqRel) {
            let _guard = self.lock.lock();
            self.condvar.notify_all();
        }
    }
}

/// Spin for a window, yield for a window, then hand off to a fallback
/// strategy.
///
/// Gets spin-level latency while traffic is flowing and the fallback's CPU
/// profile once the ring goes quiet.
#[derive(Debug)]
pub struct PhasedBackoffWaitStrategy {
    spin_timeout: Duration,
    yield_timeout: Duration,
    fallback: Arc<dyn WaitStrategy>,
}

impl PhasedBackoffWaitStrategy {
    const SPIN_TRIES: u32 = 10_000;

    #[must_use]
    pub fn new(
        spin_timeout: Duration,
        yield_timeout: Duration,
        fallback: Arc<dyn WaitStrategy>,
    ) -> Self {
        Self {
            spin_timeout,
            // The yield phase runs after the spin phase.
            yield_timeout: spin_timeout + yield_timeout,
            fallback,
        }
    }

    /// Fall back to [`BlockingWaitStrategy`].
    #[must_use]
    pub fn with_lock(spin_timeout: Duration, yield_timeout: Duration) -> Self {
        Self::new(
            spin_timeout,
            yield_timeout,
            Arc::new(BlockingWaitStrategy::new()),
        )
    }

    /// Fall back to [`LiteBlockingWaitStrategy`].
    #[must_use]
    pub fn with_lite_lock(spin_timeout: Duration, yield_timeout: Duration) -> Self {
        Self::new(
            spin_timeout,
            yield_timeout,
            Arc::new(LiteBlockingWaitStrategy::new()),
        )
    }

    /// Fall back to [`SleepingWaitStrategy`].
    #[must_use]
    pub fn with_sleep(spin_timeout: Duration, yield_timeout: Duration) -> Self {
        Self::new(
            spin_timeout,
            yield_timeout,
            Arc::new(SleepingWaitStrategy::new()),
        )
    }
}

impl WaitStrategy for PhasedBackoffWaitStrategy {
    fn wait_for(
        &self,
        sequence: i64,
        cursor: &Sequence,
        dependents: &DependentSequences,
        alert: &AlertFlag,
    ) -> Result<i64> {
        let mut start: Option<Instant> = None;
        let mut counter = Self::SPIN_TRIES;

        loop {
            let available = dependents.value();
            if available >= sequence {
                return Ok(available);
            }
            alert.check()?;

            counter -= 1;
            if counter == 0 {
                match start {
                    None => start = Some(Instant::now()),
                    Some(started) => {
                        let elapsed = started.elapsed();
                        if elapsed > self.yield_timeout {
                            return self.fallback.wait_for(sequence, cursor, dependents, alert);
                        }
                        if elapsed > self.spin_timeout {
                            thread::yield_now();
                        }
                    }
                }
                counter = Self::SPIN_TRIES;
            } else {
                hint::spin_loop();
            }
        }
    }

    fn signal_all_when_blocking(&self) {
        self.fallback.signal_all_when_blocking();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(cursor: &Arc<Sequence>) -> DependentSequences {
        DependentSequences::new(Arc::clone(cursor), Vec::new())
    }

    fn assert_waits_and_wakes(strategy: Arc<dyn WaitStrategy>) {
        let cursor = Arc::new(Sequence::new());
        let alert = Arc::new(AlertFlag::new());
        let dependents = deps(&cursor);

        let waiter = {
            let strategy = Arc::clone(&strategy);
            let cursor = Arc::clone(&cursor);
            let alert = Arc::clone(&alert);
            let dependents = dependents.clone();
            thread::spawn(move || strategy.wait_for(5, &cursor, &dependents, &alert))
        };

        thread::sleep(Duration::from_millis(20));
        cursor.set(7);
        strategy.signal_all_when_blocking();

        let available = waiter.join().unwrap().unwrap();
        assert!(available >= 5);
    }

    fn assert_alert_unblocks(strategy: Arc<dyn WaitStrategy>) {
        let cursor = Arc::new(Sequence::new());
        let alert = Arc::new(AlertFlag::new());
        let dependents = deps(&cursor);

        let waiter = {
            let strategy = Arc::clone(&strategy);
            let cursor = Arc::clone(&cursor);
            let alert = Arc::clone(&alert);
            let dependents = dependents.clone();
            thread::spawn(move || strategy.wait_for(0, &cursor, &dependents, &alert))
        };

        thread::sleep(Duration::from_millis(20));
        alert.raise();
        strategy.signal_all_when_blocking();

        assert_eq!(waiter.join().unwrap(), Err(Error::Alerted));
    }

    #[test]
    fn already_available_sequences_return_immediately() {
        let cursor = Arc::new(Sequence::with_value(10));
        let alert = AlertFlag::new();
        let strategies: Vec<Arc<dyn WaitStrategy>> = vec![
            Arc::new(BlockingWaitStrategy::new()),
            Arc::new(LiteBlockingWaitStrategy::new()),
            Arc::new(BusySpinWaitStrategy),
            Arc::new(YieldingWaitStrategy::new()),
            Arc::new(SleepingWaitStrategy::new()),
            Arc::new(TimeoutBlockingWaitStrategy::new(Duration::from_secs(1))),
            Arc::new(LiteTimeoutBlockingWaitStrategy::new(Duration::from_secs(1))),
            Arc::new(PhasedBackoffWaitStrategy::with_lock(
                Duration::from_millis(1),
                Duration::from_millis(1),
            )),
        ];

        for strategy in strategies {
            let available = strategy
                .wait_for(3, &cursor, &deps(&cursor), &alert)
                .unwrap();
            assert_eq!(available, 10, "{strategy:?}");
        }
    }

    #[test]
    fn blocking_wakes_on_publish_signal() {
        assert_waits_and_wakes(Arc::new(BlockingWaitStrategy::new()));
        assert_waits_and_wakes(Arc::new(LiteBlockingWaitStrategy::new()));
    }

    #[test]
    fn spinning_strategies_observe_progress() {
        assert_waits_and_wakes(Arc::new(BusySpinWaitStrategy));
        assert_waits_and_wakes(Arc::new(YieldingWaitStrategy::new()));
        assert_waits_and_wakes(Arc::new(SleepingWaitStrategy::new()));
    }

    #[test]
    fn alert_interrupts_every_strategy() {
        assert_alert_unblocks(Arc::new(BlockingWaitStrategy::new()));
        assert_alert_unblocks(Arc::new(LiteBlockingWaitStrategy::new()));
        assert_alert_unblocks(Arc::new(BusySpinWaitStrategy));
        assert_alert_unblocks(Arc::new(YieldingWaitStrategy::new()));
        assert_alert_unblocks(Arc::new(SleepingWaitStrategy::new()));
        assert_alert_unblocks(Arc::new(TimeoutBlockingWaitStrategy::new(
            Duration::from_secs(5),
        )));
    }

    #[test]
    fn timeout_strategies_report_elapsed_deadlines() {
        let cursor = Arc::new(Sequence::new());
        let alert = AlertFlag::new();

        let strategy = TimeoutBlockingWaitStrategy::new(Duration::from_millis(5));
        assert_eq!(
            strategy.wait_for(0, &cursor, &deps(&cursor), &alert),
            Err(Error::Timeout)
        );

        let lite = LiteTimeoutBlockingWaitStrategy::new(Duration::from_millis(5));
        assert_eq!(
            lite.wait_for(0, &cursor, &deps(&cursor), &alert),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn phased_backoff_reaches_its_fallback() {
        let strategy = Arc::new(PhasedBackoffWaitStrategy::with_sleep(
            Duration::from_micros(100),
            Duration::from_micros(100),
        ));
        assert_waits_and_wakes(strategy);
    }

    #[test]
    fn dependent_minimum_gates_past_the_cursor() {
        let cursor = Arc::new(Sequence::with_value(50));
        let upstream = Arc::new(Sequence::with_value(7));
        let dependents = DependentSequences::new(Arc::clone(&cursor), vec![upstream]);
        assert_eq!(dependents.value(), 7);
    }
}
