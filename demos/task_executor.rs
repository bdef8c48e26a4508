//! Task Executor - run closures on a topic's worker thread
//!
//! Submits work from the main thread, collects results through task
//! handles, and shows that a panicking task does not take the worker down.

use ringtopic::{RingBufferTaskExecutor, TopicError, WaitStrategyKind};
use std::time::Duration;

fn fib(n: u64) -> u64 {
    (0..n).fold((0u64, 1u64), |(a, b), _| (b, a.wrapping_add(b))).0
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut executor = RingBufferTaskExecutor::new();
    executor.set_name("fib-executor");
    executor.set_backlog(256);
    executor.set_wait_strategy(WaitStrategyKind::Blocking);
    if let Err(e) = executor.set_threads(4) {
        println!("  set_threads(4) rejected: {e}");
    }
    executor.init()?;
    println!("  Executor '{}' running on {} thread", executor.name(), executor.threads());

    let handles = (0..20u64)
        .map(|n| executor.submit(move || (n, fib(n * 4))))
        .collect::<Result<Vec<_>, _>>()?;
    for handle in handles {
        let (n, value) = handle.wait()?;
        println!("  fib({:>2}) = {}", n * 4, value);
    }

    let failing = executor.submit(|| -> u64 { panic!("deliberate failure") })?;
    match failing.wait() {
        Err(TopicError::TaskCancelled) => println!("  panicking task reported as cancelled"),
        other => println!("  unexpected outcome: {other:?}"),
    }

    let after = executor.submit(|| "worker still alive")?;
    println!("  {}", after.wait_timeout(Duration::from_secs(5))?);

    executor.stop();
    if !executor.await_termination(Duration::from_secs(5)) {
        anyhow::bail!("executor did not stop");
    }
    println!("  running after stop: {}", executor.is_running());
    Ok(())
}
