//! Price Ticker - one producer, four subscribers
//!
//! A single producer publishes 1M ticks; every subscriber sees all of them
//! in order. The slow auditor subscriber holds the producer back instead
//! of losing ticks.

use ringtopic::{BoxError, Subscriber, TopicProcessor, WaitStrategyKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BACKLOG: usize = 8192;
const TICKS: u64 = 1_000_000;

struct Summer {
    name: &'static str,
    sum: Arc<AtomicU64>,
    last: Option<u64>,
}

impl Subscriber<u64> for Summer {
    fn on_next(&mut self, tick: &u64) -> Result<(), BoxError> {
        if let Some(last) = self.last {
            if *tick != last + 1 {
                return Err(format!("{}: tick {} after {}", self.name, tick, last).into());
            }
        }
        self.last = Some(*tick);
        self.sum.fetch_add(*tick, Ordering::Relaxed);
        Ok(())
    }

    fn on_complete(&mut self) {
        println!("  {:<8} done, last tick {:?}", self.name, self.last);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  Price Ticker - fan-out to 4 subscribers               ║");
    println!("╚════════════════════════════════════════════════════════╝\n");

    let topic = TopicProcessor::<u64>::create("ticker", BACKLOG, WaitStrategyKind::Yielding)?;

    let sums: Vec<Arc<AtomicU64>> = (0..3).map(|_| Arc::new(AtomicU64::new(0))).collect();
    for (name, sum) in ["chart", "alerts", "risk"].into_iter().zip(&sums) {
        topic.subscribe(Summer { name, sum: sum.clone(), last: None })?;
    }
    let audited = Arc::new(AtomicU64::new(0));
    let auditor_count = audited.clone();
    topic.subscribe(move |_: &u64| {
        if auditor_count.fetch_add(1, Ordering::Relaxed) % 100_000 == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
    })?;

    let start = Instant::now();
    for tick in 0..TICKS {
        topic.on_next(tick)?;
    }
    topic.on_complete()?;
    if !topic.await_termination(Duration::from_secs(30)) {
        anyhow::bail!("subscribers did not finish within 30s");
    }
    let duration = start.elapsed();

    let expected = TICKS * (TICKS - 1) / 2;
    println!("\n  Ticks published:  {}", TICKS);
    println!("  Ticks audited:    {}", audited.load(Ordering::Relaxed));
    for sum in &sums {
        let sum = sum.load(Ordering::Relaxed);
        println!("  Sum: {} ({})", sum, if sum == expected { "✅" } else { "❌" });
    }
    println!("  Metrics:          {}", topic.metrics());
    println!(
        "\n  Performance: {:.2}M ticks/sec\n",
        TICKS as f64 / duration.as_secs_f64() / 1_000_000.0
    );
    Ok(())
}
