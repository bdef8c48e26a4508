//! Topic processor: fans a stream of items out to every subscriber.
//!
//! One producer side (single- or multi-producer) publishes into a
//! [`RingBuffer`]; each subscriber gets a dedicated worker thread with its
//! own cursor. Slow subscribers apply back-pressure to the producers rather
//! than losing items.

mod consumer;
mod subscriber;

pub use subscriber::{Subscriber, Subscription};

use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::{ErrorPolicy, ProcessorConfig};
use crate::disruptor::{Claim, ProducerMode, RingBuffer, WaitStrategy, WaitStrategyKind};
use crate::error::{BoxError, Result, TopicError};
use crate::metrics::{MetricsSnapshot, ProcessorMetrics};

use consumer::{TopicConsumer, WorkerGuard};
use subscriber::{ConsumerBarrier, Signal};

/// Lifecycle of a processor. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Created = 0,
    Started = 1,
    Draining = 2,
    Terminated = 3,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Started,
            2 => Self::Draining,
            _ => Self::Terminated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Consumers finish everything published before the shutdown
    #[default]
    Drain,
    /// Consumers stop after the item they are handling
    Immediate,
}

/// State shared between the processor handle and its workers.
pub(crate) struct ProcessorShared {
    state: AtomicU8,
    live_workers: Mutex<usize>,
    changed: Condvar,
}

impl ProcessorShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ProcessorState::Created as u8),
            live_workers: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn start(&self) -> Result<bool> {
        let _live = self.live_workers.lock();
        match self.state() {
            ProcessorState::Created => {
                self.set_state(ProcessorState::Started);
                Ok(true)
            }
            ProcessorState::Started => Ok(false),
            state => Err(TopicError::illegal_state(format!("cannot start a {state:?} processor"))),
        }
    }

    fn begin_draining(&self) {
        let live = self.live_workers.lock();
        match self.state() {
            ProcessorState::Created | ProcessorState::Started => {
                if *live == 0 {
                    self.set_state(ProcessorState::Terminated);
                } else {
                    self.set_state(ProcessorState::Draining);
                }
                self.changed.notify_all();
            }
            ProcessorState::Draining | ProcessorState::Terminated => {}
        }
    }

    pub(crate) fn worker_started(&self) {
        *self.live_workers.lock() += 1;
    }

    pub(crate) fn worker_exited(&self) {
        let mut live = self.live_workers.lock();
        *live = live.saturating_sub(1);
        if *live == 0 && self.state() == ProcessorState::Draining {
            self.set_state(ProcessorState::Terminated);
        }
        self.changed.notify_all();
    }

    fn await_terminated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut live = self.live_workers.lock();
        while self.state() != ProcessorState::Terminated {
            if self.changed.wait_until(&mut live, deadline).timed_out() {
                return self.state() == ProcessorState::Terminated;
            }
        }
        true
    }
}

struct ConsumerEntry {
    barrier: Arc<ConsumerBarrier>,
    handle: Option<JoinHandle<()>>,
}

impl ConsumerEntry {
    /// Join the worker if it has finished. Returns true once joined.
    fn reap(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) if handle.is_finished() => {
                let _ = handle.join();
                true
            }
            Some(handle) => {
                self.handle = Some(handle);
                false
            }
            None => true,
        }
    }
}

/// Ring-buffer backed publish/subscribe processor.
///
/// ```no_run
/// use ringtopic::{TopicProcessor, WaitStrategyKind};
///
/// let topic = TopicProcessor::create("prices", 1024, WaitStrategyKind::Blocking)?;
/// topic.subscribe(|price: &u64| println!("{price}"))?;
/// topic.on_next(42)?;
/// topic.on_complete()?;
/// # Ok::<(), ringtopic::TopicError>(())
/// ```
pub struct TopicProcessor<T> {
    name: Arc<str>,
    ring: Arc<RingBuffer<Signal<T>>>,
    shared: Arc<ProcessorShared>,
    metrics: Arc<ProcessorMetrics>,
    error_policy: ErrorPolicy,
    consumers: Mutex<Vec<ConsumerEntry>>,
    next_consumer_id: AtomicU64,
    producer_closed: AtomicBool,
    // Last sequence consumers will see once closed; OPEN until then
    closed_at: AtomicI64,
}

const OPEN: i64 = i64::MAX;

impl<T> TopicProcessor<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn producer_mode(&self) -> ProducerMode {
        self.ring.producer_mode()
    }

    pub fn state(&self) -> ProcessorState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessorState::Started
    }

    /// Number of consumers currently gating the producer.
    pub fn subscriber_count(&self) -> usize {
        self.ring.gating_count()
    }

    /// Items published but not yet consumed by the slowest subscriber.
    pub fn backlog(&self) -> u64 {
        self.ring.backlog()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stable address identifying this processor, even if the handle moves.
    pub(crate) fn identity(&self) -> *const () {
        Arc::as_ptr(&self.ring) as *const ()
    }

    /// Move from `created` to `started`. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.shared.start()? {
            info!(topic = %self.name, capacity = self.capacity(), "topic processor started");
        }
        Ok(())
    }

    /// Close the producer side and stop every consumer.
    pub fn shutdown(&self, mode: ShutdownMode) {
        let consumers = self.consumers.lock();
        self.producer_closed.store(true, Ordering::Release);
        fence(Ordering::SeqCst);
        let target = self.ring.cursor().get();
        self.closed_at.fetch_min(target, Ordering::AcqRel);
        for entry in consumers.iter() {
            match mode {
                ShutdownMode::Drain => entry.barrier.drain_to(target),
                ShutdownMode::Immediate => {
                    entry.barrier.cancel();
                }
            }
        }
        drop(consumers);
        self.ring.wait_strategy().signal_all_when_blocking();
        if !matches!(self.state(), ProcessorState::Terminated) {
            info!(topic = %self.name, ?mode, cursor = target, "topic processor shutting down");
        }
        self.shared.begin_draining();
    }

    /// Wait until every worker has exited after a shutdown or terminal
    /// signal. Returns false on timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        if !self.shared.await_terminated(timeout) {
            return false;
        }
        let mut consumers = self.consumers.lock();
        consumers.retain_mut(|entry| !entry.reap());
        true
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.producer_closed.load(Ordering::Acquire) {
            return Err(TopicError::illegal_state(format!("topic {} is closed", self.name)));
        }
        match self.state() {
            ProcessorState::Started => Ok(()),
            state => Err(TopicError::illegal_state(format!(
                "topic {} is {state:?}, not accepting items",
                self.name
            ))),
        }
    }

    /// Check a claim made while the topic may have been closing. An item
    /// placed after the terminal slot or drain target is never delivered,
    /// so the producer is told instead of getting `Ok`.
    fn confirm_delivery(&self, claim: Claim) -> Result<()> {
        fence(Ordering::SeqCst);
        if !self.producer_closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let backoff = Backoff::new();
        loop {
            let closed_at = self.closed_at.load(Ordering::Acquire);
            if closed_at != OPEN {
                if claim.sequence > closed_at {
                    return Err(TopicError::illegal_state(format!(
                        "topic {} closed at {closed_at} while item {} was being published",
                        self.name, claim.sequence
                    )));
                }
                return Ok(());
            }
            // A failed terminal publish reopens the topic
            if !self.producer_closed.load(Ordering::Acquire) {
                return Ok(());
            }
            backoff.snooze();
        }
    }

    fn record_claim(&self, claim: Claim) {
        self.metrics.record_publish();
        if claim.waited {
            self.metrics.record_backpressure();
        }
    }
}

impl<T: Send + Sync + 'static> TopicProcessor<T> {
    /// Single-producer processor.
    pub fn create(name: impl Into<String>, backlog: usize, wait_strategy: WaitStrategyKind) -> Result<Self> {
        Self::with_config(&ProcessorConfig::new(name, backlog).with_wait_strategy(wait_strategy))
    }

    /// Multi-producer processor: `on_next` may be called from any thread.
    pub fn share(name: impl Into<String>, backlog: usize, wait_strategy: WaitStrategyKind) -> Result<Self> {
        Self::with_config(
            &ProcessorConfig::new(name, backlog)
                .with_shared(true)
                .with_wait_strategy(wait_strategy),
        )
    }

    pub fn with_config(config: &ProcessorConfig) -> Result<Self> {
        Self::with_wait_strategy(config, config.wait_strategy.build())
    }

    /// Build with a custom wait strategy; `config.wait_strategy` is ignored.
    pub fn with_wait_strategy(config: &ProcessorConfig, wait_strategy: Arc<dyn WaitStrategy>) -> Result<Self> {
        let capacity = config.capacity()?;
        let ring = RingBuffer::new(capacity, config.producer_mode(), wait_strategy)?;
        debug!(
            topic = %config.name,
            capacity,
            mode = ?config.producer_mode(),
            "topic processor created"
        );

        Ok(Self {
            name: Arc::from(config.name.as_str()),
            ring: Arc::new(ring),
            shared: Arc::new(ProcessorShared::new()),
            metrics: Arc::new(ProcessorMetrics::new()),
            error_policy: config.error_policy,
            consumers: Mutex::new(Vec::new()),
            next_consumer_id: AtomicU64::new(0),
            producer_closed: AtomicBool::new(false),
            closed_at: AtomicI64::new(OPEN),
        })
    }

    /// Attach a subscriber on a new worker thread. It sees items published
    /// after this call returns, never earlier ones. Starts the processor if
    /// it was still `created`.
    pub fn subscribe<S: Subscriber<T>>(&self, subscriber: S) -> Result<Subscription> {
        let mut consumers = self.consumers.lock();
        if self.producer_closed.load(Ordering::Acquire) {
            return Err(TopicError::illegal_state(format!("topic {} is closed", self.name)));
        }
        self.start()?;
        consumers.retain_mut(|entry| !entry.reap());

        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let barrier = Arc::new(ConsumerBarrier::new(id));
        self.ring.add_gating_sequence(&barrier.cursor);
        let subscription = Subscription::new(Arc::clone(&barrier), Arc::clone(self.ring.wait_strategy()));

        let worker = TopicConsumer {
            topic: Arc::clone(&self.name),
            ring: Arc::clone(&self.ring),
            barrier: Arc::clone(&barrier),
            subscription: subscription.clone(),
            subscriber: Box::new(subscriber),
            metrics: Arc::clone(&self.metrics),
            error_policy: self.error_policy,
            _guard: WorkerGuard::new(Arc::clone(&self.ring), Arc::clone(&barrier), Arc::clone(&self.shared)),
        };

        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, id))
            .spawn(move || worker.run())?;

        debug!(topic = %self.name, consumer = id, cursor = barrier.cursor.get(), "subscriber attached");
        consumers.push(ConsumerEntry { barrier, handle: Some(handle) });
        Ok(subscription)
    }

    /// Publish one item, waiting while the ring is full. Fails with
    /// `IllegalState` once the topic is closed, including when a concurrent
    /// `on_complete`/`shutdown` lands ahead of this item.
    pub fn on_next(&self, item: T) -> Result<()> {
        self.ensure_accepting()?;
        let claim = self.ring.publish_event(Signal::Next(item))?;
        self.confirm_delivery(claim)?;
        self.record_claim(claim);
        Ok(())
    }

    /// Publish one item unless the ring stays full for `timeout`.
    /// Returns false (and drops `item`) on timeout.
    pub fn try_on_next(&self, item: T, timeout: Duration) -> Result<bool> {
        self.ensure_accepting()?;
        match self.ring.publish_event_until(Signal::Next(item), Instant::now() + timeout)? {
            Some(claim) => {
                self.confirm_delivery(claim)?;
                self.record_claim(claim);
                Ok(true)
            }
            None => {
                self.metrics.record_backpressure();
                Ok(false)
            }
        }
    }

    /// Publish a terminal error. Subscribers receive it in order, after
    /// every item published before it, and then exit.
    pub fn on_error(&self, error: impl Into<BoxError>) -> Result<()> {
        let error: BoxError = error.into();
        self.publish_terminal(Signal::Error(Arc::from(error)))
    }

    /// Publish completion. Subscribers exit after receiving it.
    pub fn on_complete(&self) -> Result<()> {
        self.publish_terminal(Signal::Complete)
    }

    fn publish_terminal(&self, signal: Signal<T>) -> Result<()> {
        // Held so no subscriber can attach behind the terminal slot
        let _consumers = self.consumers.lock();
        if self.producer_closed.swap(true, Ordering::AcqRel) {
            return Err(TopicError::illegal_state(format!("topic {} is already closed", self.name)));
        }
        fence(Ordering::SeqCst);
        let claim = match self.ring.publish_event(signal) {
            Ok(claim) => claim,
            Err(e) => {
                // Nothing was published; the topic stays open
                self.producer_closed.store(false, Ordering::Release);
                warn!(topic = %self.name, error = %e, "terminal signal not published");
                return Err(e);
            }
        };
        self.closed_at.fetch_min(claim.sequence, Ordering::AcqRel);
        info!(topic = %self.name, sequence = claim.sequence, "terminal signal published");
        self.shared.begin_draining();
        Ok(())
    }
}

impl<T> Drop for TopicProcessor<T> {
    fn drop(&mut self) {
        if self.state() != ProcessorState::Terminated {
            self.shutdown(ShutdownMode::Immediate);
        }
    }
}

impl<T> fmt::Debug for TopicProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicProcessor")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("ring", &self.ring)
            .finish()
    }
}
