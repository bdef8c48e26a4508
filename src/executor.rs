//! Task executor backed by a topic processor.
//!
//! Every submitted unit of work is published to the ring and run by the
//! single consumer worker, in submission order.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::ProcessorConfig;
use crate::disruptor::WaitStrategyKind;
use crate::error::{BoxError, Result, TopicError};
use crate::processor::{ShutdownMode, Subscriber, Subscription, TopicProcessor};

const DEFAULT_EXECUTOR_NAME: &str = "ring-buffer-executor";

type Work = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work stored in a ring slot. Slots are read by shared
/// reference, so the closure is taken out exactly once.
pub struct Task {
    work: Mutex<Option<Work>>,
}

impl Task {
    fn new(work: impl FnOnce() + Send + 'static) -> Self {
        Self { work: Mutex::new(Some(Box::new(work))) }
    }

    fn take(&self) -> Option<Work> {
        self.work.lock().take()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("pending", &self.work.lock().is_some()).finish()
    }
}

struct TaskRunner {
    executor: String,
}

impl Subscriber<Task> for TaskRunner {
    fn on_next(&mut self, task: &Task) -> std::result::Result<(), BoxError> {
        let Some(work) = task.take() else {
            return Ok(());
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
            error!(
                executor = %self.executor,
                panic = panic_message(payload.as_ref()),
                "task panicked"
            );
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Completion handle returned by [`RingBufferTaskExecutor::submit`].
pub struct TaskHandle<R> {
    result: Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Block until the task has run. `TaskCancelled` if it panicked or was
    /// discarded by a shutdown before running.
    pub fn wait(self) -> Result<R> {
        self.result.recv().map_err(|_| TopicError::TaskCancelled)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<R> {
        match self.result.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(TopicError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TopicError::TaskCancelled),
        }
    }
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("ready", &!self.result.is_empty()).finish()
    }
}

/// Asynchronous task executor running on exactly one worker thread.
///
/// Configure with the setters, then call [`init`](Self::init), or just
/// submit work: the first `execute`/`submit` initialises and starts the
/// executor. Settings changed after initialisation have no effect.
pub struct RingBufferTaskExecutor {
    config: ProcessorConfig,
    processor: OnceCell<TopicProcessor<Task>>,
    runner: OnceCell<Subscription>,
}

impl Default for RingBufferTaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBufferTaskExecutor {
    pub fn new() -> Self {
        Self::with_config(ProcessorConfig {
            name: DEFAULT_EXECUTOR_NAME.to_string(),
            ..ProcessorConfig::default()
        })
    }

    pub fn with_config(config: ProcessorConfig) -> Self {
        Self {
            config,
            processor: OnceCell::new(),
            runner: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.warn_if_initialized("name");
        self.config.name = name.into();
    }

    pub fn set_backlog(&mut self, backlog: usize) {
        self.warn_if_initialized("backlog");
        self.config.backlog = backlog;
    }

    pub fn set_auto_startup(&mut self, auto_startup: bool) {
        self.warn_if_initialized("auto_startup");
        self.config.auto_startup = auto_startup;
    }

    pub fn set_wait_strategy(&mut self, wait_strategy: WaitStrategyKind) {
        self.warn_if_initialized("wait_strategy");
        self.config.wait_strategy = wait_strategy;
    }

    /// Multi-producer ring, so `execute` may be called from several
    /// threads at once. With the default (false) callers must serialize.
    pub fn set_shared(&mut self, shared: bool) {
        self.warn_if_initialized("shared");
        self.config.shared = shared;
    }

    /// The executor always runs on one thread; any other count is rejected.
    pub fn set_threads(&mut self, threads: usize) -> Result<()> {
        if threads != 1 {
            warn!(
                executor = %self.config.name,
                threads,
                "task executor is always single-threaded, ignoring thread count"
            );
            return Err(TopicError::config(format!(
                "task executor is always single-threaded, requested {threads} threads"
            )));
        }
        Ok(())
    }

    pub fn threads(&self) -> usize {
        1
    }

    fn warn_if_initialized(&self, setting: &str) {
        if self.processor.get().is_some() {
            warn!(executor = %self.config.name, setting, "executor already initialised, setting has no effect");
        }
    }

    /// Build the processor, starting it when auto-startup is set.
    pub fn init(&self) -> Result<()> {
        self.processor()?;
        if self.config.auto_startup {
            self.start()?;
        }
        Ok(())
    }

    fn processor(&self) -> Result<&TopicProcessor<Task>> {
        self.processor.get_or_try_init(|| TopicProcessor::with_config(&self.config))
    }

    pub fn start(&self) -> Result<()> {
        let processor = self.processor()?;
        self.runner.get_or_try_init(|| {
            let subscription = processor.subscribe(TaskRunner { executor: self.config.name.clone() })?;
            info!(executor = %self.config.name, capacity = processor.capacity(), "task executor started");
            Ok::<_, TopicError>(subscription)
        })?;
        Ok(())
    }

    /// Stop accepting work; already submitted tasks still run.
    pub fn stop(&self) {
        if let Some(processor) = self.processor.get() {
            processor.shutdown(ShutdownMode::Drain);
            info!(executor = %self.config.name, "task executor stopping");
        }
    }

    /// Wait for the worker to finish after [`stop`](Self::stop).
    pub fn await_termination(&self, timeout: Duration) -> bool {
        match self.processor.get() {
            Some(processor) => processor.await_termination(timeout),
            None => true,
        }
    }

    pub fn is_running(&self) -> bool {
        self.runner.get().is_some() && self.processor.get().is_some_and(|p| p.is_running())
    }

    /// Queue `work` for the worker thread.
    pub fn execute(&self, work: impl FnOnce() + Send + 'static) -> Result<()> {
        self.start()?;
        self.processor()?.on_next(Task::new(work))
    }

    /// Queue `task` and get a handle to its result.
    pub fn submit<R, F>(&self, task: F) -> Result<TaskHandle<R>>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        self.execute(move || {
            let _ = tx.send(task());
        })?;
        Ok(TaskHandle { result: rx })
    }
}

impl fmt::Debug for RingBufferTaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBufferTaskExecutor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}
