//! Lock-free ring buffer core (LMAX Disruptor pattern).
//!
//! - `RingBuffer<E>` - slot storage with single- or multi-producer claiming
//! - `Sequence` - cache-padded cursor shared between threads
//! - `WaitStrategy` - how consumers wait for the next published sequence

pub mod ring_buffer;
pub mod sequence;
pub mod sequencer;
pub mod wait_strategy;

pub use ring_buffer::{ProducerMode, RingBuffer};
pub use sequence::Sequence;
pub use sequencer::Claim;
pub use wait_strategy::{
    BlockingWaitStrategy, BusySpinWaitStrategy, PhasedBackoffWaitStrategy, SleepingWaitStrategy,
    WaitStrategy, WaitStrategyKind, YieldingWaitStrategy,
};

/// Round `backlog` up to a ring capacity: the next power of two, at least 2.
pub fn capacity_for(backlog: usize) -> usize {
    backlog.max(crate::constants::MIN_CAPACITY).next_power_of_two()
}
