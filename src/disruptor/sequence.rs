//! Cache-padded sequence counter shared between producers and consumers.

use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::constants::INITIAL_CURSOR_VALUE;

/// Monotonic 64-bit cursor. Padded to a cache line so that neighbouring
/// cursors owned by different threads do not false-share.
pub struct Sequence {
    value: CachePadded<AtomicI64>,
}

impl Sequence {
    pub fn new(initial: i64) -> Self {
        Self { value: CachePadded::new(AtomicI64::new(initial)) }
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    #[inline]
    pub fn compare_and_set(&self, current: i64, new: i64) -> bool {
        self.value
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub(crate) fn get_seq_cst(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn compare_and_set_seq_cst(&self, current: i64, new: i64) -> bool {
        self.value
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(INITIAL_CURSOR_VALUE)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sequence").field(&self.get()).finish()
    }
}
