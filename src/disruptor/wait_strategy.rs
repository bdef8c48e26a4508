//! Wait strategies for ring buffer consumers
//!
//! A wait strategy decides how a consumer spends the time between asking for
//! a sequence and that sequence being published. Each strategy trades CPU
//! usage against wake-up latency. Every strategy re-checks the consumer's
//! alert flag on each iteration so cancellation and shutdown are observed
//! promptly.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::constants::{SLEEP_STEP_MICROS, SPIN_TRIES, YIELD_TRIES};
use crate::disruptor::Sequence;
use crate::error::{Result, TopicError};

/// Trait for wait strategies that determine how consumers wait for data
pub trait WaitStrategy: Send + Sync {
    /// Wait until `cursor` reaches `sequence`.
    ///
    /// # Arguments
    ///
    /// * `sequence` - The sequence number the consumer needs next
    /// * `cursor` - The producer cursor gating the consumer
    /// * `alert` - The consumer's cancel flag
    ///
    /// # Returns
    ///
    /// The highest sequence the cursor has reached, which is at least
    /// `sequence`, or `TopicError::Alerted` once `alert` is raised.
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AtomicBool) -> Result<i64>;

    /// Wake every thread parked inside `wait_for`
    fn signal_all_when_blocking(&self);
}

#[inline]
fn check_alert(alert: &AtomicBool) -> Result<()> {
    if alert.load(Ordering::Acquire) {
        Err(TopicError::Alerted)
    } else {
        Ok(())
    }
}

/// Busy spin wait strategy - lowest latency, highest CPU usage.
/// Burns a full core while waiting; only worth it when consumers have
/// dedicated cores.
#[derive(Debug, Default)]
pub struct BusySpinWaitStrategy;

impl BusySpinWaitStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl WaitStrategy for BusySpinWaitStrategy {
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AtomicBool) -> Result<i64> {
        loop {
            check_alert(alert)?;
            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            std::hint::spin_loop();
        }
    }

    fn signal_all_when_blocking(&self) {
        // No-op for busy spin - no blocking threads to signal
    }
}

/// Blocking wait strategy - balanced latency and CPU usage.
/// Parks the consumer on a condition variable; publishers signal it.
/// The default strategy.
#[derive(Default)]
pub struct BlockingWaitStrategy {
    mutex: parking_lot::Mutex<()>,
    condition: parking_lot::Condvar,
}

impl BlockingWaitStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AtomicBool) -> Result<i64> {
        let available = cursor.get();
        if available >= sequence {
            return Ok(available);
        }

        // Alert and cursor are re-read under the lock, and signallers take the
        // lock before notifying, so a wake-up cannot slip in between.
        let mut guard = self.mutex.lock();
        loop {
            check_alert(alert)?;
            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            self.condition.wait(&mut guard);
        }
    }

    fn signal_all_when_blocking(&self) {
        let _guard = self.mutex.lock();
        self.condition.notify_all();
    }
}

impl fmt::Debug for BlockingWaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingWaitStrategy").finish_non_exhaustive()
    }
}

/// Yielding wait strategy - spins for a while, then yields the CPU on each
/// further iteration. Low latency without pinning a core at 100%.
#[derive(Debug)]
pub struct YieldingWaitStrategy {
    spin_tries: u32,
}

impl YieldingWaitStrategy {
    pub fn new() -> Self {
        Self { spin_tries: SPIN_TRIES }
    }

    pub fn with_spin_tries(spin_tries: u32) -> Self {
        Self { spin_tries }
    }
}

impl Default for YieldingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AtomicBool) -> Result<i64> {
        let mut counter = 0u32;
        loop {
            check_alert(alert)?;
            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            if counter < self.spin_tries {
                counter += 1;
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    fn signal_all_when_blocking(&self) {
        // No-op for yielding - threads will wake up naturally
    }
}

/// Sleeping wait strategy - lowest CPU usage, higher latency.
/// Spins, then yields, then sleeps in fixed microsecond steps.
#[derive(Debug)]
pub struct SleepingWaitStrategy {
    spin_tries: u32,
    yield_tries: u32,
    sleep_step: Duration,
}

impl SleepingWaitStrategy {
    pub fn new(sleep_step: Duration) -> Self {
        Self {
            spin_tries: SPIN_TRIES,
            yield_tries: YIELD_TRIES,
            sleep_step,
        }
    }

    pub fn with_tries(spin_tries: u32, yield_tries: u32, sleep_step: Duration) -> Self {
        Self { spin_tries, yield_tries, sleep_step }
    }
}

impl Default for SleepingWaitStrategy {
    fn default() -> Self {
        Self::new(Duration::from_micros(SLEEP_STEP_MICROS))
    }
}

impl WaitStrategy for SleepingWaitStrategy {
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AtomicBool) -> Result<i64> {
        let mut counter = 0u32;
        loop {
            check_alert(alert)?;
            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            if counter < self.spin_tries {
                std::hint::spin_loop();
            } else if counter < self.spin_tries + self.yield_tries {
                thread::yield_now();
            } else {
                thread::sleep(self.sleep_step);
            }
            counter = counter.saturating_add(1);
        }
    }

    fn signal_all_when_blocking(&self) {
        // No-op for sleeping - threads will wake up naturally
    }
}

/// Phased back-off wait strategy - spins for `spin_timeout`, yields until
/// `yield_timeout`, then falls back to blocking.
pub struct PhasedBackoffWaitStrategy {
    spin_timeout: Duration,
    yield_timeout: Duration,
    fallback: BlockingWaitStrategy,
}

impl PhasedBackoffWaitStrategy {
    pub fn new(spin_timeout: Duration, yield_timeout: Duration) -> Self {
        Self {
            spin_timeout,
            yield_timeout: yield_timeout.max(spin_timeout),
            fallback: BlockingWaitStrategy::new(),
        }
    }
}

impl Default for PhasedBackoffWaitStrategy {
    fn default() -> Self {
        Self::new(Duration::from_micros(100), Duration::from_millis(1))
    }
}

impl WaitStrategy for PhasedBackoffWaitStrategy {
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AtomicBool) -> Result<i64> {
        let start = Instant::now();
        let mut counter = SPIN_TRIES;
        loop {
            check_alert(alert)?;
            let available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }

            counter -= 1;
            if counter == 0 {
                let elapsed = start.elapsed();
                if elapsed > self.yield_timeout {
                    return self.fallback.wait_for(sequence, cursor, alert);
                }
                if elapsed > self.spin_timeout {
                    thread::yield_now();
                }
                counter = SPIN_TRIES;
            }
            std::hint::spin_loop();
        }
    }

    fn signal_all_when_blocking(&self) {
        self.fallback.signal_all_when_blocking();
    }
}

impl fmt::Debug for PhasedBackoffWaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhasedBackoffWaitStrategy")
            .field("spin_timeout", &self.spin_timeout)
            .field("yield_timeout", &self.yield_timeout)
            .finish()
    }
}

/// Configuration-level selector for the built-in strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategyKind {
    #[default]
    Blocking,
    BusySpin,
    Yielding,
    Sleeping,
    Phased,
}

impl WaitStrategyKind {
    /// Build a fresh strategy instance with default tuning.
    pub fn build(self) -> Arc<dyn WaitStrategy> {
        match self {
            Self::Blocking => Arc::new(BlockingWaitStrategy::new()),
            Self::BusySpin => Arc::new(BusySpinWaitStrategy::new()),
            Self::Yielding => Arc::new(YieldingWaitStrategy::new()),
            Self::Sleeping => Arc::new(SleepingWaitStrategy::default()),
            Self::Phased => Arc::new(PhasedBackoffWaitStrategy::default()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocking => "blocking",
            Self::BusySpin => "busy-spin",
            Self::Yielding => "yielding",
            Self::Sleeping => "sleeping",
            Self::Phased => "phased",
        }
    }
}

impl FromStr for WaitStrategyKind {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blocking" => Ok(Self::Blocking),
            "busy-spin" | "busy_spin" | "busyspin" => Ok(Self::BusySpin),
            "yielding" => Ok(Self::Yielding),
            "sleeping" => Ok(Self::Sleeping),
            "phased" => Ok(Self::Phased),
            other => Err(TopicError::config(format!("unknown wait strategy '{other}'"))),
        }
    }
}

impl fmt::Display for WaitStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn all_strategies() -> Vec<Arc<dyn WaitStrategy>> {
        vec![
            WaitStrategyKind::Blocking.build(),
            WaitStrategyKind::BusySpin.build(),
            WaitStrategyKind::Yielding.build(),
            WaitStrategyKind::Sleeping.build(),
            WaitStrategyKind::Phased.build(),
        ]
    }

    #[test]
    fn test_returns_immediately_when_available() {
        for strategy in all_strategies() {
            let cursor = Sequence::new(10);
            let alert = AtomicBool::new(false);
            assert_eq!(strategy.wait_for(5, &cursor, &alert).unwrap(), 10);
        }
    }

    #[test]
    fn test_wakes_when_cursor_advances() {
        for strategy in all_strategies() {
            let cursor = Arc::new(Sequence::new(-1));
            let alert = Arc::new(AtomicBool::new(false));

            let s = strategy.clone();
            let c = cursor.clone();
            let handle = thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                c.set(3);
                s.signal_all_when_blocking();
            });

            let available = strategy.wait_for(2, &cursor, &alert).unwrap();
            assert!(available >= 2);
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_alert_interrupts_waiter() {
        for strategy in all_strategies() {
            let cursor = Arc::new(Sequence::new(-1));
            let alert = Arc::new(AtomicBool::new(false));

            let s = strategy.clone();
            let a = alert.clone();
            let handle = thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                a.store(true, Ordering::Release);
                s.signal_all_when_blocking();
            });

            let result = strategy.wait_for(0, &cursor, &alert);
            assert!(matches!(result, Err(TopicError::Alerted)));
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_phased_falls_back_to_blocking() {
        let strategy = Arc::new(PhasedBackoffWaitStrategy::new(
            Duration::from_micros(1),
            Duration::from_micros(10),
        ));
        let cursor = Arc::new(Sequence::new(-1));
        let alert = AtomicBool::new(false);

        let s = strategy.clone();
        let c = cursor.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c.set(0);
            s.signal_all_when_blocking();
        });

        assert_eq!(strategy.wait_for(0, &cursor, &alert).unwrap(), 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("blocking".parse::<WaitStrategyKind>().unwrap(), WaitStrategyKind::Blocking);
        assert_eq!("busy-spin".parse::<WaitStrategyKind>().unwrap(), WaitStrategyKind::BusySpin);
        assert_eq!("Yielding".parse::<WaitStrategyKind>().unwrap(), WaitStrategyKind::Yielding);
        assert_eq!("phased".parse::<WaitStrategyKind>().unwrap(), WaitStrategyKind::Phased);
        assert!("lazy".parse::<WaitStrategyKind>().is_err());
        assert_eq!(WaitStrategyKind::default(), WaitStrategyKind::Blocking);
        assert_eq!(WaitStrategyKind::Sleeping.to_string(), "sleeping");
    }
}
