//! Subscriber contract, ring slot signals and subscription tokens.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::disruptor::{Sequence, WaitStrategy};
use crate::error::BoxError;

/// Value stored in a ring slot: an item or a terminal marker.
pub(crate) enum Signal<T> {
    Next(T),
    Error(Arc<dyn Error + Send + Sync + 'static>),
    Complete,
}

/// Downstream side of a topic. Each subscriber runs on its own worker
/// thread and sees every item published after it subscribed, in order.
pub trait Subscriber<T>: Send + 'static {
    /// Called once on the worker thread before the first item.
    fn on_subscribe(&mut self, _subscription: &Subscription) {}

    /// Handle one item. An error is reported back through
    /// [`on_error`](Self::on_error) as a `HandlerFailure`; whether the
    /// consumer continues depends on the processor's `ErrorPolicy`.
    fn on_next(&mut self, item: &T) -> Result<(), BoxError>;

    /// Terminal error published by the producer, or a handler failure.
    fn on_error(&mut self, _error: &(dyn Error + Send + Sync + 'static)) {}

    /// The producer completed; no further items follow.
    fn on_complete(&mut self) {}
}

impl<T, F> Subscriber<T> for F
where
    F: FnMut(&T) + Send + 'static,
{
    fn on_next(&mut self, item: &T) -> Result<(), BoxError> {
        self(item);
        Ok(())
    }
}

const NO_DRAIN: i64 = i64::MIN;

/// Per-consumer coordination state: cursor, alert flag and drain target.
pub(crate) struct ConsumerBarrier {
    id: u64,
    pub(crate) cursor: Arc<Sequence>,
    pub(crate) alerted: AtomicBool,
    cancelled: AtomicBool,
    drain_to: AtomicI64,
}

impl ConsumerBarrier {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            cursor: Arc::new(Sequence::default()),
            alerted: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            drain_to: AtomicI64::new(NO_DRAIN),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Stop after the item in flight. Returns false if already cancelled.
    pub(crate) fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.drain_to.store(NO_DRAIN, Ordering::Release);
        self.alerted.store(true, Ordering::Release);
        true
    }

    /// Keep consuming up to `target`, then stop.
    pub(crate) fn drain_to(&self, target: i64) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        // Target must be visible before the alert that makes it relevant
        self.drain_to.store(target, Ordering::Release);
        self.alerted.store(true, Ordering::Release);
    }

    pub(crate) fn drain_target(&self) -> Option<i64> {
        if self.cancelled.load(Ordering::Acquire) {
            return None;
        }
        match self.drain_to.load(Ordering::Acquire) {
            NO_DRAIN => None,
            target => Some(target),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Handle to one consumer of a topic. Cancelling is the only way to end a
/// subscription from outside; it is idempotent, and the consumer stops
/// after the item it is currently handling.
#[derive(Clone)]
pub struct Subscription {
    barrier: Arc<ConsumerBarrier>,
    wait_strategy: Arc<dyn WaitStrategy>,
}

impl Subscription {
    pub(crate) fn new(barrier: Arc<ConsumerBarrier>, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        Self { barrier, wait_strategy }
    }

    pub fn id(&self) -> u64 {
        self.barrier.id()
    }

    /// Returns `true` if this call cancelled the subscription.
    pub fn cancel(&self) -> bool {
        let cancelled = self.barrier.cancel();
        if cancelled {
            self.wait_strategy.signal_all_when_blocking();
            tracing::debug!(consumer = self.id(), "subscription cancelled");
        }
        cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.barrier.is_cancelled()
    }

    /// Highest sequence this consumer has finished with.
    pub fn cursor(&self) -> i64 {
        self.barrier.cursor.get()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("cursor", &self.cursor())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
