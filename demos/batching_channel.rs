//! Batching Channel - group channel messages into batches
//!
//! A multi-producer channel delivers 5000 messages to a batching handler
//! that forwards batches of 1024 to a "writer". The residue goes out on the
//! idle timer.

use ringtopic::{BatchingHandler, Message, MessageChannel, MessageHandler, SubscribableChannel, TopicChannel};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MESSAGES: u64 = 5000;
const BATCH_SIZE: usize = 1024;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let channel = TopicChannel::<String>::new()?;
    channel.set_name("orders");

    let batches = Arc::new(AtomicU64::new(0));
    let written = Arc::new(AtomicU64::new(0));
    let writer: Arc<dyn MessageHandler<Vec<String>>> = {
        let batches = batches.clone();
        let written = written.clone();
        Arc::new(move |message: &Message<Vec<String>>| {
            batches.fetch_add(1, Ordering::Relaxed);
            written.fetch_add(message.payload().len() as u64, Ordering::Relaxed);
        })
    };
    let batcher: Arc<dyn MessageHandler<String>> = Arc::new(BatchingHandler::forwarding_to(writer, BATCH_SIZE));
    let subscription = channel.subscribe(batcher.clone())?;
    println!("  '{}' subscribed consumer {}", channel.name(), subscription.id());

    for i in 0..MESSAGES {
        channel.send(Message::new(format!("i={i}")).with_header("source", "demo"))?;
    }

    // Full batches are immediate; the last partial one waits for the idle timer
    for _ in 0..50 {
        if written.load(Ordering::Relaxed) == MESSAGES {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }

    println!("  Messages sent:    {}", MESSAGES);
    println!("  Batches written:  {}", batches.load(Ordering::Relaxed));
    println!("  Items written:    {}", written.load(Ordering::Relaxed));

    channel.unsubscribe(&batcher);
    Ok(())
}
