//! Slot claiming for single- and multi-producer rings.
//!
//! ## Memory Ordering (Sequence Barrier Pattern)
//!
//! - **cursor**: single producer: highest published sequence. Multi producer:
//!   highest *claimed* sequence (CAS), which is not yet proof of publication.
//! - **available[]**: multi producer only. One bit per slot, flipped on each
//!   publish, so the expected bit value alternates with the parity of
//!   `sequence / capacity` (LMAX Disruptor technique). Consumers scan it to
//!   find the highest contiguous published sequence.
//! - **published**: highest contiguous published sequence. Equal to the
//!   cursor for a single producer; a separate watermark for multi producer,
//!   advanced by whichever publisher closes a gap.
//! - **gating**: consumer cursors plus the published watermark. A claim never
//!   laps the slowest consumer, nor a slot whose previous lap is still being
//!   written.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::RwLock;

use crate::disruptor::{Sequence, WaitStrategy};
use crate::error::{Result, TopicError};

/// A claimed slot, and whether claiming it had to wait for consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub sequence: i64,
    pub waited: bool,
}

/// Consumer cursors that producers must not lap.
#[derive(Debug, Default)]
pub(crate) struct GatingSequences {
    sequences: RwLock<Vec<Arc<Sequence>>>,
}

impl GatingSequences {
    /// Minimum of all gating cursors, or `default` when there are none.
    pub(crate) fn minimum(&self, default: i64) -> i64 {
        self.sequences.read().iter().map(|s| s.get()).fold(default, i64::min)
    }

    /// Register `sequence`, positioned at the highest contiguous `published`
    /// sequence.
    ///
    /// The sequence is set both before and after registration: a producer
    /// that read the gating set before the push cannot have claimed past
    /// `published + capacity`, so the consumer's first slot is never lapped.
    pub(crate) fn add(&self, sequence: &Arc<Sequence>, published: &Sequence) {
        let mut sequences = self.sequences.write();
        sequence.set(published.get());
        sequences.push(Arc::clone(sequence));
        sequence.set(published.get());
    }

    pub(crate) fn remove(&self, sequence: &Arc<Sequence>) -> bool {
        let mut sequences = self.sequences.write();
        let before = sequences.len();
        sequences.retain(|s| !Arc::ptr_eq(s, sequence));
        sequences.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.sequences.read().len()
    }
}

pub(crate) trait Sequencer: Send + Sync {
    /// The cursor consumers wait on.
    fn cursor(&self) -> &Sequence;

    /// Highest sequence below which every slot has been published.
    fn published(&self) -> &Sequence;

    /// Claim the next slot, waiting while the ring is full. Returns `None`
    /// once `deadline` passes without a free slot.
    fn next(
        &self,
        gating: &GatingSequences,
        wait_strategy: &dyn WaitStrategy,
        deadline: Option<Instant>,
    ) -> Result<Option<Claim>>;

    /// Make a claimed slot visible to consumers.
    fn publish(&self, sequence: i64, wait_strategy: &dyn WaitStrategy);

    /// Highest contiguous published sequence in `[low, available]`,
    /// `low - 1` when `low` itself is not yet published.
    fn highest_published(&self, low: i64, available: i64) -> i64;

    fn is_multi_producer(&self) -> bool;
}

#[inline]
fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

// ============================================================================
// Single producer
// ============================================================================

pub(crate) struct SingleProducerSequencer {
    capacity: i64,
    cursor: Sequence,
    next_value: CachePadded<AtomicI64>,
    cached_gating: CachePadded<AtomicI64>,
    // Held between next() and publish(); a second producer entering at the
    // same time is rejected instead of sharing the slot.
    claiming: AtomicBool,
}

impl SingleProducerSequencer {
    pub(crate) fn new(capacity: usize) -> Self {
        let cursor = Sequence::default();
        let initial = cursor.get();
        Self {
            capacity: capacity as i64,
            cursor,
            next_value: CachePadded::new(AtomicI64::new(initial)),
            cached_gating: CachePadded::new(AtomicI64::new(initial)),
            claiming: AtomicBool::new(false),
        }
    }
}

impl Sequencer for SingleProducerSequencer {
    fn cursor(&self) -> &Sequence {
        &self.cursor
    }

    fn published(&self) -> &Sequence {
        &self.cursor
    }

    fn next(
        &self,
        gating: &GatingSequences,
        wait_strategy: &dyn WaitStrategy,
        deadline: Option<Instant>,
    ) -> Result<Option<Claim>> {
        if self.claiming.swap(true, Ordering::Acquire) {
            return Err(TopicError::illegal_state(
                "concurrent publication on a single-producer topic",
            ));
        }

        let current = self.next_value.load(Ordering::Relaxed);
        let next = current + 1;
        let wrap_point = next - self.capacity;
        let mut waited = false;

        if wrap_point > self.cached_gating.load(Ordering::Relaxed) {
            let backoff = Backoff::new();
            loop {
                let min = gating.minimum(current);
                if wrap_point <= min {
                    self.cached_gating.store(min, Ordering::Relaxed);
                    break;
                }
                if deadline_passed(deadline) {
                    self.claiming.store(false, Ordering::Release);
                    return Ok(None);
                }
                waited = true;
                wait_strategy.signal_all_when_blocking();
                backoff.snooze();
            }
        }

        self.next_value.store(next, Ordering::Relaxed);
        Ok(Some(Claim { sequence: next, waited }))
    }

    fn publish(&self, sequence: i64, wait_strategy: &dyn WaitStrategy) {
        self.cursor.set(sequence);
        self.claiming.store(false, Ordering::Release);
        wait_strategy.signal_all_when_blocking();
    }

    fn highest_published(&self, _low: i64, available: i64) -> i64 {
        available
    }

    fn is_multi_producer(&self) -> bool {
        false
    }
}

// ============================================================================
// Multi producer
// ============================================================================

pub(crate) struct MultiProducerSequencer {
    capacity: i64,
    cursor: Sequence,
    published: Sequence,
    gating_cache: Sequence,
    /// Bitfield tracking published slots. Each AtomicU64 tracks 64 slots.
    available: Box<[AtomicU64]>,
    index_mask: usize,
    index_shift: u32,
}

impl MultiProducerSequencer {
    pub(crate) fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(64);
        // All ones: nothing published yet, and round 0 expects a zero bit
        let available = (0..words)
            .map(|_| AtomicU64::new(!0))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            capacity: capacity as i64,
            cursor: Sequence::default(),
            published: Sequence::default(),
            gating_cache: Sequence::default(),
            available,
            index_mask: capacity - 1,
            index_shift: capacity.trailing_zeros(),
        }
    }

    fn calculate_indices(&self, sequence: i64) -> (usize, usize) {
        let slot_index = (sequence as usize) & self.index_mask;
        (slot_index >> 6, slot_index & 63)
    }

    /// Even (0) or odd (1) lap around the ring
    fn calculate_flag(&self, sequence: i64) -> u64 {
        ((sequence as u64) >> self.index_shift) & 1
    }

    fn is_available(&self, sequence: i64) -> bool {
        self.flag_matches(sequence, Ordering::Acquire)
    }

    fn flag_matches(&self, sequence: i64, order: Ordering) -> bool {
        let (word, bit) = self.calculate_indices(sequence);
        let bits = self.available[word].load(order);
        (bits >> bit) & 1 == self.calculate_flag(sequence)
    }

    /// Move the published watermark over every contiguous published slot.
    ///
    /// Bit flips and watermark moves are SeqCst: of two publishers closing
    /// adjacent gaps at once, at least one sees the other's flip.
    fn advance_published(&self) {
        loop {
            let current = self.published.get_seq_cst();
            let next = current + 1;
            if next > self.cursor.get() || !self.flag_matches(next, Ordering::SeqCst) {
                return;
            }
            // A lost race means another publisher moved it; re-read and go on
            self.published.compare_and_set_seq_cst(current, next);
        }
    }
}

impl Sequencer for MultiProducerSequencer {
    fn cursor(&self) -> &Sequence {
        &self.cursor
    }

    fn published(&self) -> &Sequence {
        &self.published
    }

    fn next(
        &self,
        gating: &GatingSequences,
        wait_strategy: &dyn WaitStrategy,
        deadline: Option<Instant>,
    ) -> Result<Option<Claim>> {
        let backoff = Backoff::new();
        let mut waited = false;

        loop {
            let current = self.cursor.get();
            let next = current + 1;
            let wrap_point = next - self.capacity;
            let cached = self.gating_cache.get();

            if wrap_point > cached || cached > current {
                // Unpublished claims gate too, consumers or not
                let min = gating.minimum(self.published.get());
                if wrap_point > min {
                    if deadline_passed(deadline) {
                        return Ok(None);
                    }
                    waited = true;
                    wait_strategy.signal_all_when_blocking();
                    backoff.snooze();
                    continue;
                }
                self.gating_cache.set(min);
            } else if self.cursor.compare_and_set(current, next) {
                return Ok(Some(Claim { sequence: next, waited }));
            } else {
                backoff.spin();
            }
        }
    }

    fn publish(&self, sequence: i64, wait_strategy: &dyn WaitStrategy) {
        let (word, bit) = self.calculate_indices(sequence);
        // XOR flips the bit - encoding even/odd round publication
        self.available[word].fetch_xor(1u64 << bit, Ordering::SeqCst);
        self.advance_published();
        wait_strategy.signal_all_when_blocking();
    }

    fn highest_published(&self, low: i64, available: i64) -> i64 {
        let mut sequence = low;
        while sequence <= available {
            if !self.is_available(sequence) {
                return sequence - 1;
            }
            sequence += 1;
        }
        available
    }

    fn is_multi_producer(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disruptor::BusySpinWaitStrategy;

    #[test]
    fn test_single_producer_claims_in_order() {
        let sequencer = SingleProducerSequencer::new(8);
        let gating = GatingSequences::default();
        let wait = BusySpinWaitStrategy::new();

        for expected in 0..20 {
            let claim = sequencer.next(&gating, &wait, None).unwrap().unwrap();
            assert_eq!(claim.sequence, expected);
            sequencer.publish(claim.sequence, &wait);
        }
        assert_eq!(sequencer.cursor().get(), 19);
    }

    #[test]
    fn test_single_producer_rejects_concurrent_entry() {
        let sequencer = SingleProducerSequencer::new(8);
        let gating = GatingSequences::default();
        let wait = BusySpinWaitStrategy::new();

        let first = sequencer.next(&gating, &wait, None).unwrap().unwrap();
        let second = sequencer.next(&gating, &wait, None);
        assert!(matches!(second, Err(TopicError::IllegalState { .. })));

        sequencer.publish(first.sequence, &wait);
        assert!(sequencer.next(&gating, &wait, None).unwrap().is_some());
    }

    #[test]
    fn test_gating_blocks_until_deadline() {
        let sequencer = SingleProducerSequencer::new(4);
        let gating = GatingSequences::default();
        let wait = BusySpinWaitStrategy::new();
        let consumer = Arc::new(Sequence::default());
        gating.add(&consumer, sequencer.cursor());

        for _ in 0..4 {
            let claim = sequencer.next(&gating, &wait, None).unwrap().unwrap();
            sequencer.publish(claim.sequence, &wait);
        }

        let deadline = Instant::now() + std::time::Duration::from_millis(5);
        assert_eq!(sequencer.next(&gating, &wait, Some(deadline)).unwrap(), None);

        consumer.set(0);
        let claim = sequencer.next(&gating, &wait, None).unwrap().unwrap();
        assert_eq!(claim.sequence, 4);
        assert!(!claim.waited);
    }

    #[test]
    fn test_multi_producer_availability_tracks_laps() {
        let sequencer = MultiProducerSequencer::new(4);
        let gating = GatingSequences::default();
        let wait = BusySpinWaitStrategy::new();

        let a = sequencer.next(&gating, &wait, None).unwrap().unwrap().sequence;
        let b = sequencer.next(&gating, &wait, None).unwrap().unwrap().sequence;
        assert_eq!((a, b), (0, 1));

        // b published before a: nothing contiguous yet
        sequencer.publish(b, &wait);
        assert_eq!(sequencer.highest_published(0, 1), -1);
        sequencer.publish(a, &wait);
        assert_eq!(sequencer.highest_published(0, 1), 1);

        // second lap over the same slots
        for _ in 2..6 {
            let seq = sequencer.next(&gating, &wait, None).unwrap().unwrap().sequence;
            sequencer.publish(seq, &wait);
        }
        let seq = sequencer.next(&gating, &wait, None).unwrap().unwrap().sequence;
        assert_eq!(seq, 6);
        assert_eq!(sequencer.highest_published(4, 6), 5);
        sequencer.publish(seq, &wait);
        assert_eq!(sequencer.highest_published(4, 6), 6);
    }

    #[test]
    fn test_multi_producer_gates_on_unpublished_claim() {
        let sequencer = MultiProducerSequencer::new(4);
        let gating = GatingSequences::default();
        let wait = BusySpinWaitStrategy::new();
        let deadline = || Some(Instant::now() + std::time::Duration::from_millis(50));

        // Slot 0 stays claimed but unwritten
        let stalled = sequencer.next(&gating, &wait, None).unwrap().unwrap().sequence;
        assert_eq!(stalled, 0);
        for expected in 1..4 {
            let claim = sequencer.next(&gating, &wait, deadline()).unwrap().unwrap();
            assert_eq!(claim.sequence, expected);
            sequencer.publish(claim.sequence, &wait);
        }

        // Sequence 4 shares slot 0 with the unpublished claim
        assert_eq!(sequencer.next(&gating, &wait, deadline()).unwrap(), None);
        assert_eq!(sequencer.published().get(), -1);

        sequencer.publish(stalled, &wait);
        assert_eq!(sequencer.published().get(), 3);
        let claim = sequencer.next(&gating, &wait, deadline()).unwrap().unwrap();
        assert_eq!(claim.sequence, 4);
    }

    #[test]
    fn test_new_consumer_starts_at_published_watermark() {
        let sequencer = MultiProducerSequencer::new(4);
        let gating = GatingSequences::default();
        let wait = BusySpinWaitStrategy::new();

        let stalled = sequencer.next(&gating, &wait, None).unwrap().unwrap().sequence;
        let consumer = Arc::new(Sequence::default());
        gating.add(&consumer, sequencer.published());
        assert_eq!(consumer.get(), -1);

        for _ in 1..4 {
            let claim = sequencer.next(&gating, &wait, None).unwrap().unwrap();
            sequencer.publish(claim.sequence, &wait);
        }
        let deadline = Instant::now() + std::time::Duration::from_millis(20);
        assert_eq!(sequencer.next(&gating, &wait, Some(deadline)).unwrap(), None);
        assert_eq!(sequencer.highest_published(0, 3), -1);

        sequencer.publish(stalled, &wait);
        assert_eq!(sequencer.highest_published(0, 3), 3);
    }

    #[test]
    fn test_published_watermark_with_concurrent_producers() {
        let sequencer = Arc::new(MultiProducerSequencer::new(8));
        let gating = Arc::new(GatingSequences::default());
        let wait = Arc::new(BusySpinWaitStrategy::new());

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let (sequencer, gating, wait) = (sequencer.clone(), gating.clone(), wait.clone());
                std::thread::spawn(move || {
                    for _ in 0..5_000 {
                        let claim = sequencer.next(&gating, wait.as_ref(), None).unwrap().unwrap();
                        sequencer.publish(claim.sequence, wait.as_ref());
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(sequencer.cursor().get(), 19_999);
        assert_eq!(sequencer.published().get(), 19_999);
    }

    #[test]
    fn test_gating_add_remove() {
        let gating = GatingSequences::default();
        let cursor = Sequence::new(10);
        let consumer = Arc::new(Sequence::default());

        gating.add(&consumer, &cursor);
        assert_eq!(consumer.get(), 10);
        assert_eq!(gating.minimum(99), 10);
        assert!(gating.remove(&consumer));
        assert!(!gating.remove(&consumer));
        assert_eq!(gating.minimum(99), 99);
        assert_eq!(gating.len(), 0);
    }
}
