//! Batching decorator: collects items and hands them to a sink in batches.
//!
//! A batch is released when it reaches the batch size, when an idle
//! interval passes without a flush, on an explicit [`flush`](BatchingHandler::flush),
//! on a terminal signal, and when the handler is dropped. Releasing swaps
//! the buffer out under a short lock, so items keep accumulating while the
//! sink runs. Batches always reach the sink in the order they were cut.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::channel::{Message, MessageHandler};
use crate::clock::{default_clock, Clock};
use crate::constants::DEFAULT_FLUSH_INTERVAL_MILLIS;
use crate::error::BoxError;
use crate::processor::Subscriber;

type Sink<T> = Box<dyn FnMut(Vec<T>) + Send + 'static>;

struct BatchState<T> {
    buffer: Vec<T>,
    ready: VecDeque<Vec<T>>,
    last_flush: Duration,
}

struct BatchShared<T> {
    state: Mutex<BatchState<T>>,
    sink: Mutex<Sink<T>>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    flush_interval: Option<Duration>,
}

impl<T> BatchShared<T> {
    fn cut(&self, state: &mut BatchState<T>) {
        let batch = mem::replace(&mut state.buffer, Vec::with_capacity(self.batch_size));
        state.ready.push_back(batch);
        state.last_flush = self.clock.now();
    }

    /// Hand every cut batch to the sink, oldest first.
    fn drain_ready(&self) {
        let mut sink = self.sink.lock();
        loop {
            let Some(batch) = self.state.lock().ready.pop_front() else {
                break;
            };
            (*sink)(batch);
        }
    }

    fn flush(&self) {
        {
            let mut state = self.state.lock();
            if !state.buffer.is_empty() {
                self.cut(&mut state);
            }
        }
        self.drain_ready();
    }

    fn flush_if_idle(&self) -> bool {
        let Some(interval) = self.flush_interval else {
            return false;
        };
        {
            let mut state = self.state.lock();
            if state.buffer.is_empty() || self.clock.now().saturating_sub(state.last_flush) < interval {
                return false;
            }
            self.cut(&mut state);
        }
        self.drain_ready();
        true
    }
}

struct FlushTimer {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl FlushTimer {
    fn spawn<T: Send + 'static>(shared: Arc<BatchShared<T>>, interval: Duration) -> Option<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("batch-flush".to_string())
            .spawn(move || {
                let (stopped, wake) = &*signal;
                let mut stopped = stopped.lock();
                while !*stopped {
                    wake.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                    parking_lot::MutexGuard::unlocked(&mut stopped, || {
                        shared.flush_if_idle();
                    });
                }
            });

        match spawned {
            Ok(handle) => Some(Self { stop, handle: Some(handle) }),
            Err(e) => {
                warn!(error = %e, "could not start batch flush timer, idle flushing disabled");
                None
            }
        }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        let (stopped, wake) = &*self.stop;
        *stopped.lock() = true;
        wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Collects items into batches of `batch_size` for a sink.
pub struct BatchingHandler<T> {
    shared: Arc<BatchShared<T>>,
    timer: Option<FlushTimer>,
}

impl<T: Send + 'static> BatchingHandler<T> {
    /// Release on size, explicit flush, terminal signals and drop only.
    pub fn new(batch_size: usize, sink: impl FnMut(Vec<T>) + Send + 'static) -> Self {
        Self::build(batch_size, Box::new(sink), None, default_clock())
    }

    /// Also release a non-empty batch once `interval` passes without a
    /// flush, checked by a background timer thread.
    pub fn with_flush_interval(
        batch_size: usize,
        interval: Duration,
        sink: impl FnMut(Vec<T>) + Send + 'static,
    ) -> Self {
        let mut handler = Self::build(batch_size, Box::new(sink), Some(interval), default_clock());
        handler.timer = FlushTimer::spawn(Arc::clone(&handler.shared), interval);
        handler
    }

    /// Idle interval measured on `clock`, with no timer thread: the caller
    /// drives idle flushing through [`flush_if_idle`](Self::flush_if_idle).
    pub fn with_clock(
        batch_size: usize,
        interval: Duration,
        clock: Arc<dyn Clock>,
        sink: impl FnMut(Vec<T>) + Send + 'static,
    ) -> Self {
        Self::build(batch_size, Box::new(sink), Some(interval), clock)
    }

    fn build(batch_size: usize, sink: Sink<T>, flush_interval: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        let batch_size = batch_size.max(1);
        let last_flush = clock.now();
        Self {
            shared: Arc::new(BatchShared {
                state: Mutex::new(BatchState {
                    buffer: Vec::with_capacity(batch_size),
                    ready: VecDeque::new(),
                    last_flush,
                }),
                sink: Mutex::new(sink),
                clock,
                batch_size,
                flush_interval,
            }),
            timer: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.shared.batch_size
    }

    /// Items waiting for the next release.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    pub fn accept(&self, item: T) {
        let full = {
            let mut state = self.shared.state.lock();
            state.buffer.push(item);
            if state.buffer.len() >= self.shared.batch_size {
                self.shared.cut(&mut state);
                true
            } else {
                false
            }
        };
        if full {
            self.shared.drain_ready();
        }
    }

    /// Release whatever is buffered, even a partial batch.
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Release a partial batch if the flush interval has passed since the
    /// last release. Returns whether a batch was released.
    pub fn flush_if_idle(&self) -> bool {
        self.shared.flush_if_idle()
    }
}

impl<P: Send + Sync + 'static> BatchingHandler<P> {
    /// Batch message payloads and forward each batch to `handler` as one
    /// message, flushing idle batches after the default interval.
    pub fn forwarding_to(handler: Arc<dyn MessageHandler<Vec<P>>>, batch_size: usize) -> Self {
        Self::with_flush_interval(
            batch_size,
            Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MILLIS),
            move |batch: Vec<P>| {
                let size = batch.len();
                if let Err(e) = handler.handle_message(&Message::new(batch)) {
                    warn!(size, error = %e, "batch handler failed");
                }
            },
        )
    }
}

impl<T> Drop for BatchingHandler<T> {
    fn drop(&mut self) {
        // Stop the timer first so the final flush is the last sink call
        self.timer.take();
        self.shared.flush();
        debug!(batch_size = self.shared.batch_size, "batching handler closed");
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for BatchingHandler<T> {
    fn on_next(&mut self, item: &T) -> Result<(), BoxError> {
        self.accept(item.clone());
        Ok(())
    }

    fn on_error(&mut self, _error: &(dyn Error + Send + Sync + 'static)) {
        self.flush();
    }

    fn on_complete(&mut self) {
        self.flush();
    }
}

impl<P: Clone + Send + Sync + 'static> MessageHandler<P> for BatchingHandler<P> {
    fn handle_message(&self, message: &Message<P>) -> Result<(), BoxError> {
        self.accept(message.payload().clone());
        Ok(())
    }
}

impl<T> fmt::Debug for BatchingHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchingHandler")
            .field("batch_size", &self.shared.batch_size)
            .field("flush_interval", &self.shared.flush_interval)
            .field("timer", &self.timer.is_some())
            .finish()
    }
}
