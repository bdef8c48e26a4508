//! Fixed-capacity slot array shared by one producer side and many consumers.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::constants::{MAX_CAPACITY, MIN_CAPACITY};
use crate::disruptor::sequencer::{
    Claim, GatingSequences, MultiProducerSequencer, Sequencer, SingleProducerSequencer,
};
use crate::disruptor::{Sequence, WaitStrategy};
use crate::error::{Result, TopicError};

/// How many threads may publish into a ring at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerMode {
    /// Callers serialize publication themselves
    Single,
    /// Any number of threads publish concurrently (CAS claim)
    Multi,
}

pub struct RingBuffer<E> {
    slots: Box<[UnsafeCell<Option<E>>]>,
    mask: usize,
    sequencer: Box<dyn Sequencer>,
    gating: GatingSequences,
    wait_strategy: Arc<dyn WaitStrategy>,
}

// Slots are written only between claim and publish by the claiming producer,
// and read only after publish and before the reader's cursor passes them.
unsafe impl<E: Send> Send for RingBuffer<E> {}
unsafe impl<E: Send + Sync> Sync for RingBuffer<E> {}

impl<E> RingBuffer<E> {
    pub fn new(capacity: usize, mode: ProducerMode, wait_strategy: Arc<dyn WaitStrategy>) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(TopicError::config("Ring buffer capacity must be power of 2"));
        }
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(TopicError::config(format!(
                "Ring buffer capacity must be between {MIN_CAPACITY} and {MAX_CAPACITY}"
            )));
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let sequencer: Box<dyn Sequencer> = match mode {
            ProducerMode::Single => Box::new(SingleProducerSequencer::new(capacity)),
            ProducerMode::Multi => Box::new(MultiProducerSequencer::new(capacity)),
        };

        Ok(Self {
            slots,
            mask: capacity - 1,
            sequencer,
            gating: GatingSequences::default(),
            wait_strategy,
        })
    }

    pub fn new_single(capacity: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Result<Self> {
        Self::new(capacity, ProducerMode::Single, wait_strategy)
    }

    pub fn new_multi(capacity: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Result<Self> {
        Self::new(capacity, ProducerMode::Multi, wait_strategy)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn producer_mode(&self) -> ProducerMode {
        if self.sequencer.is_multi_producer() {
            ProducerMode::Multi
        } else {
            ProducerMode::Single
        }
    }

    /// The cursor consumers wait on (claimed sequence in multi-producer mode).
    pub fn cursor(&self) -> &Sequence {
        self.sequencer.cursor()
    }

    pub fn wait_strategy(&self) -> &Arc<dyn WaitStrategy> {
        &self.wait_strategy
    }

    /// Claim a slot, store `value` and publish it. Blocks while the ring is
    /// full.
    pub fn publish_event(&self, value: E) -> Result<Claim> {
        match self.claim_and_publish(value, None)? {
            Some(claim) => Ok(claim),
            None => Err(TopicError::Timeout),
        }
    }

    /// As [`publish_event`](Self::publish_event), but gives up once
    /// `deadline` passes without a free slot. `value` is dropped in that case.
    pub fn publish_event_until(&self, value: E, deadline: Instant) -> Result<Option<Claim>> {
        self.claim_and_publish(value, Some(deadline))
    }

    fn claim_and_publish(&self, value: E, deadline: Option<Instant>) -> Result<Option<Claim>> {
        let Some(claim) = self.sequencer.next(&self.gating, self.wait_strategy.as_ref(), deadline)? else {
            return Ok(None);
        };
        // SAFETY: the claim grants exclusive write access to this slot until
        // publish, and gating guarantees every consumer has moved past the
        // value being replaced.
        unsafe {
            *self.slots[(claim.sequence as usize) & self.mask].get() = Some(value);
        }
        self.sequencer.publish(claim.sequence, self.wait_strategy.as_ref());
        Ok(Some(claim))
    }

    /// Read the value stored at `sequence`.
    ///
    /// # Safety
    ///
    /// - `sequence` must be published (see [`highest_published`](Self::highest_published)).
    /// - The caller's gating cursor must still be below `sequence`, so the
    ///   slot cannot be overwritten while the reference is alive.
    pub unsafe fn get(&self, sequence: i64) -> Option<&E> {
        let idx = (sequence as usize) & self.mask;
        debug_assert!(idx < self.slots.len(), "RingBuffer::get: idx {} >= len {}", idx, self.slots.len());
        (*self.slots[idx].get()).as_ref()
    }

    /// Highest contiguous published sequence in `[low, available]`.
    pub fn highest_published(&self, low: i64, available: i64) -> i64 {
        self.sequencer.highest_published(low, available)
    }

    /// Highest sequence below which every slot has been published. Equal to
    /// [`cursor`](Self::cursor) in single-producer mode.
    pub fn published(&self) -> &Sequence {
        self.sequencer.published()
    }

    /// Register a consumer cursor, positioning it at the highest contiguous
    /// published sequence.
    pub fn add_gating_sequence(&self, sequence: &Arc<Sequence>) {
        self.gating.add(sequence, self.sequencer.published());
    }

    pub fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        let removed = self.gating.remove(sequence);
        // A producer parked on a full ring may now have room
        self.wait_strategy.signal_all_when_blocking();
        removed
    }

    pub fn gating_count(&self) -> usize {
        self.gating.len()
    }

    /// Slowest consumer cursor, or the producer cursor with no consumers.
    pub fn minimum_gating_sequence(&self) -> i64 {
        let cursor = self.cursor().get();
        self.gating.minimum(cursor)
    }

    /// Claimed but not yet consumed by the slowest consumer.
    pub fn backlog(&self) -> u64 {
        let cursor = self.cursor().get();
        (cursor - self.gating.minimum(cursor)).max(0) as u64
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity().saturating_sub(self.backlog() as usize)
    }
}

impl<E> fmt::Debug for RingBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("mode", &self.producer_mode())
            .field("cursor", &self.cursor().get())
            .field("consumers", &self.gating_count())
            .finish()
    }
}
