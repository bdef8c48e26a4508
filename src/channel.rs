//! Publish/subscribe message channel on top of a topic processor.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::ProcessorConfig;
use crate::constants::DEFAULT_BACKLOG;
use crate::error::{BoxError, Result};
use crate::processor::{Subscriber, Subscription, TopicProcessor};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeaders {
    id: u64,
    timestamp: u64,
    entries: HashMap<String, String>,
}

impl MessageHeaders {
    fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            timestamp,
            entries: HashMap::new(),
        }
    }

    /// Process-unique message id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Creation time, milliseconds since the UNIX epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Payload plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<P> {
    payload: P,
    headers: MessageHeaders,
}

impl<P> Message<P> {
    pub fn new(payload: P) -> Self {
        Self { payload, headers: MessageHeaders::new() }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}

pub trait MessageHandler<P>: Send + Sync + 'static {
    fn handle_message(&self, message: &Message<P>) -> std::result::Result<(), BoxError>;
}

impl<P, F> MessageHandler<P> for F
where
    F: Fn(&Message<P>) + Send + Sync + 'static,
{
    fn handle_message(&self, message: &Message<P>) -> std::result::Result<(), BoxError> {
        self(message);
        Ok(())
    }
}

pub trait MessageChannel<P> {
    /// Publish, waiting for room. `Ok(true)` once accepted.
    fn send(&self, message: Message<P>) -> Result<bool>;

    /// Publish unless no slot frees up within `timeout`; `Ok(false)` then.
    fn send_timeout(&self, message: Message<P>, timeout: Duration) -> Result<bool>;
}

pub trait SubscribableChannel<P>: MessageChannel<P> {
    /// Register `handler` on its own consumer. Subscribing a handler that
    /// is already live returns its existing subscription.
    fn subscribe(&self, handler: Arc<dyn MessageHandler<P>>) -> Result<Subscription>;

    /// Cancel the consumer bound to `handler`. False if it was not subscribed.
    fn unsubscribe(&self, handler: &Arc<dyn MessageHandler<P>>) -> bool;
}

struct HandlerSubscriber<P> {
    handler: Arc<dyn MessageHandler<P>>,
}

impl<P: Send + Sync + 'static> Subscriber<Message<P>> for HandlerSubscriber<P> {
    fn on_next(&mut self, message: &Message<P>) -> std::result::Result<(), BoxError> {
        self.handler.handle_message(message)
    }
}

/// Identity of a handler: the address of its shared allocation.
fn handler_key<P>(handler: &Arc<dyn MessageHandler<P>>) -> usize {
    Arc::as_ptr(handler) as *const () as usize
}

struct Registration<P> {
    // Keeps the allocation alive so its address cannot be reused by another handler
    _handler: Arc<dyn MessageHandler<P>>,
    subscription: Subscription,
}

/// [`SubscribableChannel`] publishing through a [`TopicProcessor`]. Every
/// subscribed handler receives every message sent after it subscribed.
pub struct TopicChannel<P> {
    name: RwLock<String>,
    processor: TopicProcessor<Message<P>>,
    handlers: Mutex<HashMap<usize, Registration<P>>>,
}

impl<P: Send + Sync + 'static> TopicChannel<P> {
    /// Multi-producer channel: any thread may send.
    pub fn new() -> Result<Self> {
        Self::with_config(&ProcessorConfig::new("topic-channel", DEFAULT_BACKLOG).with_shared(true))
    }

    /// Channel whose senders serialize themselves.
    pub fn single_producer() -> Result<Self> {
        Self::with_config(&ProcessorConfig::new("topic-channel", DEFAULT_BACKLOG))
    }

    pub fn with_config(config: &ProcessorConfig) -> Result<Self> {
        let processor = TopicProcessor::with_config(config)?;
        processor.start()?;
        Ok(Self {
            name: RwLock::new(format!("TopicChannel@{:p}", processor.identity())),
            processor,
            handlers: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn processor(&self) -> &TopicProcessor<Message<P>> {
        &self.processor
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Convenience for `send(Message::new(payload))`.
    pub fn send_payload(&self, payload: P) -> Result<bool> {
        self.send(Message::new(payload))
    }
}

impl<P: Send + Sync + 'static> MessageChannel<P> for TopicChannel<P> {
    fn send(&self, message: Message<P>) -> Result<bool> {
        self.processor.on_next(message)?;
        Ok(true)
    }

    fn send_timeout(&self, message: Message<P>, timeout: Duration) -> Result<bool> {
        self.processor.try_on_next(message, timeout)
    }
}

impl<P: Send + Sync + 'static> SubscribableChannel<P> for TopicChannel<P> {
    fn subscribe(&self, handler: Arc<dyn MessageHandler<P>>) -> Result<Subscription> {
        let key = handler_key(&handler);
        let mut handlers = self.handlers.lock();
        if let Some(existing) = handlers.get(&key) {
            if !existing.subscription.is_cancelled() {
                return Ok(existing.subscription.clone());
            }
        }

        let subscription = self.processor.subscribe(HandlerSubscriber { handler: Arc::clone(&handler) })?;
        debug!(channel = %self.name(), consumer = subscription.id(), "handler subscribed");
        handlers.insert(
            key,
            Registration {
                _handler: handler,
                subscription: subscription.clone(),
            },
        );
        Ok(subscription)
    }

    fn unsubscribe(&self, handler: &Arc<dyn MessageHandler<P>>) -> bool {
        let Some(registration) = self.handlers.lock().remove(&handler_key(handler)) else {
            return false;
        };
        registration.subscription.cancel();
        debug!(channel = %self.name(), consumer = registration.subscription.id(), "handler unsubscribed");
        true
    }
}

impl<P> fmt::Debug for TopicChannel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicChannel")
            .field("name", &*self.name.read())
            .field("processor", &self.processor)
            .finish()
    }
}
