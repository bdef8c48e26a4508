//! Consumer worker: one thread per subscriber walking the ring.

use std::sync::Arc;
use std::thread;

use tracing::{debug, error, warn};

use crate::config::ErrorPolicy;
use crate::disruptor::RingBuffer;
use crate::error::TopicError;
use crate::metrics::ProcessorMetrics;
use crate::processor::subscriber::{ConsumerBarrier, Signal, Subscriber, Subscription};
use crate::processor::ProcessorShared;

enum Flow {
    Continue,
    Stop,
}

/// Deregisters the consumer when its worker ends, however it ends.
pub(crate) struct WorkerGuard<T> {
    ring: Arc<RingBuffer<Signal<T>>>,
    barrier: Arc<ConsumerBarrier>,
    shared: Arc<ProcessorShared>,
}

impl<T> WorkerGuard<T> {
    pub(crate) fn new(
        ring: Arc<RingBuffer<Signal<T>>>,
        barrier: Arc<ConsumerBarrier>,
        shared: Arc<ProcessorShared>,
    ) -> Self {
        shared.worker_started();
        Self { ring, barrier, shared }
    }
}

impl<T> Drop for WorkerGuard<T> {
    fn drop(&mut self) {
        self.ring.remove_gating_sequence(&self.barrier.cursor);
        self.shared.worker_exited();
        if thread::panicking() {
            error!(consumer = self.barrier.id(), "consumer worker panicked");
        }
    }
}

pub(crate) struct TopicConsumer<T> {
    pub(crate) topic: Arc<str>,
    pub(crate) ring: Arc<RingBuffer<Signal<T>>>,
    pub(crate) barrier: Arc<ConsumerBarrier>,
    pub(crate) subscription: Subscription,
    pub(crate) subscriber: Box<dyn Subscriber<T>>,
    pub(crate) metrics: Arc<ProcessorMetrics>,
    pub(crate) error_policy: ErrorPolicy,
    pub(crate) _guard: WorkerGuard<T>,
}

impl<T: 'static> TopicConsumer<T> {
    pub(crate) fn run(mut self) {
        self.subscriber.on_subscribe(&self.subscription);

        let ring = Arc::clone(&self.ring);
        let wait_strategy = Arc::clone(ring.wait_strategy());
        let consumer = self.barrier.id();
        let mut next = self.barrier.cursor.get() + 1;

        debug!(topic = %self.topic, consumer, first = next, "consumer started");

        'run: loop {
            let available = match wait_strategy.wait_for(next, ring.cursor(), &self.barrier.alerted) {
                Ok(available) => available,
                Err(TopicError::Alerted) => match self.barrier.drain_target() {
                    Some(target) => target,
                    None => break,
                },
                Err(e) => {
                    warn!(topic = %self.topic, consumer, error = %e, "wait failed");
                    break;
                }
            };
            let available = match self.barrier.drain_target() {
                Some(target) if next > target => break,
                Some(target) => available.min(target),
                None => available,
            };

            let highest = ring.highest_published(next, available);
            if highest < next {
                // Claimed by a concurrent producer but not yet written
                thread::yield_now();
                continue;
            }

            for sequence in next..=highest {
                if self.barrier.is_cancelled() {
                    self.barrier.cursor.set(sequence - 1);
                    break 'run;
                }
                // SAFETY: `sequence` is published and our gating cursor is
                // still below it, so the slot cannot be overwritten.
                let signal = unsafe { ring.get(sequence) };
                if let Flow::Stop = self.dispatch(sequence, signal) {
                    self.barrier.cursor.set(sequence);
                    break 'run;
                }
            }

            self.barrier.cursor.set(highest);
            next = highest + 1;
        }

        debug!(topic = %self.topic, consumer, cursor = self.barrier.cursor.get(), "consumer stopped");
    }

    fn dispatch(&mut self, sequence: i64, signal: Option<&Signal<T>>) -> Flow {
        match signal {
            Some(Signal::Next(item)) => match self.subscriber.on_next(item) {
                Ok(()) => {
                    self.metrics.record_consume();
                    Flow::Continue
                }
                Err(source) => {
                    self.metrics.record_handler_failure();
                    let failure = TopicError::handler(sequence, source);
                    warn!(
                        topic = %self.topic,
                        consumer = self.barrier.id(),
                        sequence,
                        error = %failure,
                        "subscriber failed"
                    );
                    self.subscriber.on_error(&failure);
                    match self.error_policy {
                        ErrorPolicy::Continue => Flow::Continue,
                        ErrorPolicy::Halt => Flow::Stop,
                    }
                }
            },
            Some(Signal::Error(e)) => {
                self.subscriber.on_error(e.as_ref());
                Flow::Stop
            }
            Some(Signal::Complete) => {
                self.subscriber.on_complete();
                Flow::Stop
            }
            None => {
                error!(topic = %self.topic, sequence, "published slot is empty");
                Flow::Continue
            }
        }
    }
}
