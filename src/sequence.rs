//! Cache-line padded sequence counter.
//!
//! A [`Sequence`] marks the highest position its owner has fully published
//! or processed. Producers, consumers and barriers coordinate exclusively
//! through these counters, so each one gets its own cache line to keep a
//! busy producer from invalidating the line a consumer is spinning on.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::INITIAL_CURSOR_VALUE;

/// A padded 64-bit monotonic counter with atomic read/write/CAS operations.
///
/// `CachePadded` reserves a full cache line on both sides of the value, so
/// two sequences placed next to each other never share a line.
#[derive(Default)]
pub struct Sequence {
    value: CachePadded<AtomicI64>,
}

impl Sequence {
    /// Create a sequence starting at [`INITIAL_CURSOR_VALUE`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_value(INITIAL_CURSOR_VALUE)
    }

    /// Create a sequence starting at `initial`.
    #[must_use]
    pub fn with_value(initial: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(initial)),
        }
    }

    /// Current value (acquire load).
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Store `value`, ordered after all prior writes by this thread
    /// (release store). Visibility to other threads may lag until they
    /// perform an acquire load.
    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Store `value` with a full fence, immediately visible both ways.
    ///
    /// The single-producer claim path uses this as a StoreLoad barrier
    /// before re-reading the gating sequences.
    #[inline]
    pub fn set_volatile(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Atomically replace `expected` with `new`; true on success.
    #[inline]
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Atomically add one and return the new value.
    #[inline]
    pub fn increment_and_get(&self) -> i64 {
        self.add_and_get(1)
    }

    /// Atomically add `increment` and return the new value.
    #[inline]
    pub fn add_and_get(&self, increment: i64) -> i64 {
        self.value.fetch_add(increment, Ordering::AcqRel) + increment
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Sequence").field(&self.get()).finish()
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Minimum value across `sequences`, or `minimum` when the slice is empty.
///
/// Producers call this with the cursor as the fallback so an empty gating
/// set never reports a stale floor.
pub fn minimum_sequence(sequences: &[Arc<Sequence>], minimum: i64) -> i64 {
    sequences
        .iter()
        .map(|s| s.get())
        .fold(minimum, std::cmp::min)
}
