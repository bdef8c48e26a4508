//! ringtopic - Ring-buffer topic processor with executor and channel adapters.
//!
//! A topic fans every published item out to all of its subscribers. Items
//! live in a fixed-size ring; each subscriber runs on its own worker thread
//! with its own cursor, and a slow subscriber holds producers back instead
//! of losing items.
//!
//! ```rust,no_run
//! use ringtopic::{TopicProcessor, WaitStrategyKind};
//!
//! let topic = TopicProcessor::share("events", 1024, WaitStrategyKind::Yielding).unwrap();
//! topic.subscribe(|event: &String| println!("a: {event}")).unwrap();
//! topic.subscribe(|event: &String| println!("b: {event}")).unwrap();
//!
//! topic.on_next("hello".to_string()).unwrap();
//! topic.on_complete().unwrap();
//! ```
//!
//! - [`RingBufferTaskExecutor`] - runs closures on a topic's worker thread
//! - [`TopicChannel`] - send/subscribe message channel
//! - [`BatchingHandler`] - groups items into batches for a sink

pub mod batching;
pub mod channel;
pub mod clock;
pub mod config;
pub mod constants;
pub mod disruptor;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod processor;

pub use batching::BatchingHandler;
pub use channel::{
    Message, MessageChannel, MessageHandler, MessageHeaders, SubscribableChannel, TopicChannel,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ErrorPolicy, ProcessorConfig};
pub use disruptor::{ProducerMode, RingBuffer, Sequence, WaitStrategy, WaitStrategyKind};
pub use error::{BoxError, Result, TopicError};
pub use executor::{RingBufferTaskExecutor, TaskHandle};
pub use metrics::{MetricsSnapshot, ProcessorMetrics};
pub use processor::{ProcessorState, ShutdownMode, Subscriber, Subscription, TopicProcessor};

static_assertions::assert_impl_all!(TopicProcessor<u64>: Send, Sync);
static_assertions::assert_impl_all!(RingBuffer<u64>: Send, Sync);
static_assertions::assert_impl_all!(Subscription: Send, Sync, Clone);
static_assertions::assert_impl_all!(RingBufferTaskExecutor: Send, Sync);
static_assertions::assert_impl_all!(TopicChannel<String>: Send, Sync);
static_assertions::assert_impl_all!(BatchingHandler<String>: Send, Sync);
static_assertions::assert_impl_all!(TopicError: Send, Sync);
