//! Time-boxed topic runs: producers publish tagged values for a fixed
//! duration while every subscriber checks per-producer order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use rand::Rng;
use ringtopic::{BoxError, ProcessorConfig, Subscriber, TopicProcessor, WaitStrategyKind};

use crate::verify::{tag, PartitionedChecker};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shape of a stress run
#[derive(Debug, Clone)]
pub struct StressConfig {
    pub duration: Duration,
    /// More than one selects a shared topic
    pub producers: usize,
    pub subscribers: usize,
    pub backlog: usize,
    /// Upper bound of the random stall a subscriber takes now and then
    /// (zero = never stall)
    pub max_stall: Duration,
    pub report_interval: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            producers: 1,
            subscribers: 1,
            backlog: 1024,
            max_stall: Duration::ZERO,
            report_interval: Duration::from_secs(1),
        }
    }
}

impl StressConfig {
    pub fn new(duration_secs: u64) -> Self {
        Self {
            duration: Duration::from_secs(duration_secs),
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_producers(mut self, n: usize) -> Self {
        self.producers = n;
        self
    }

    pub fn with_subscribers(mut self, n: usize) -> Self {
        self.subscribers = n;
        self
    }

    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_max_stall(mut self, max_stall: Duration) -> Self {
        self.max_stall = max_stall;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }
}

/// Outcome of a stress run
#[derive(Debug, Clone, Default)]
pub struct StressMetrics {
    pub published: u64,
    /// Summed over subscribers
    pub delivered: u64,
    pub subscribers: u64,
    pub errors: u64,
    pub duration: Duration,
}

impl StressMetrics {
    /// Deliveries owed if every subscriber saw every item.
    pub fn expected_deliveries(&self) -> u64 {
        self.published * self.subscribers
    }

    pub fn publish_rate(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.published as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    errors: AtomicU64,
}

/// Subscriber that checks per-producer order and hands its checker back on
/// completion.
struct CheckingSubscriber {
    checker: PartitionedChecker,
    counters: Arc<Counters>,
    max_stall: Duration,
    done: Sender<PartitionedChecker>,
}

impl Subscriber<u64> for CheckingSubscriber {
    fn on_next(&mut self, value: &u64) -> Result<(), BoxError> {
        if !self.max_stall.is_zero() {
            let mut rng = rand::thread_rng();
            if rng.gen_ratio(1, 256) {
                let micros = rng.gen_range(0..=self.max_stall.as_micros() as u64);
                thread::sleep(Duration::from_micros(micros));
            }
        }
        if !self.checker.check(*value) {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_complete(&mut self) {
        let _ = self.done.send(self.checker.clone());
    }
}

pub struct StressRunner {
    config: StressConfig,
}

impl StressRunner {
    pub fn new(config: StressConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    /// Publish tagged values from every producer until the configured
    /// duration elapses, then complete the topic and wait for every
    /// subscriber to drain. Returns the run metrics and each subscriber's
    /// checker.
    pub fn run_topic(
        &self,
        wait_strategy: WaitStrategyKind,
    ) -> ringtopic::Result<(StressMetrics, Vec<PartitionedChecker>)> {
        let producers = self.config.producers.max(1);
        let config = ProcessorConfig::new("stress", self.config.backlog)
            .with_shared(producers > 1)
            .with_wait_strategy(wait_strategy);
        let topic = Arc::new(TopicProcessor::<u64>::with_config(&config)?);
        let counters = Arc::new(Counters::default());

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        for _ in 0..self.config.subscribers {
            topic.subscribe(CheckingSubscriber {
                checker: PartitionedChecker::new(producers),
                counters: counters.clone(),
                max_stall: self.config.max_stall,
                done: done_tx.clone(),
            })?;
        }
        drop(done_tx);

        let start = Instant::now();
        let running = Arc::new(AtomicBool::new(true));
        let handles: Vec<_> = (0..producers)
            .map(|producer| {
                let (topic, counters, running) = (topic.clone(), counters.clone(), running.clone());
                thread::spawn(move || -> ringtopic::Result<()> {
                    let mut seq = 0u64;
                    while running.load(Ordering::Relaxed) {
                        topic.on_next(tag(producer, seq))?;
                        counters.published.fetch_add(1, Ordering::Relaxed);
                        seq += 1;
                    }
                    Ok(())
                })
            })
            .collect();

        while start.elapsed() < self.config.duration {
            thread::sleep(self.config.report_interval.min(self.config.duration));
            eprintln!(
                "[{:>5.1}s] published: {:>10}, delivered: {:>10}, backlog: {:>6}, errors: {}",
                start.elapsed().as_secs_f64(),
                counters.published.load(Ordering::Relaxed),
                counters.delivered.load(Ordering::Relaxed),
                topic.backlog(),
                counters.errors.load(Ordering::Relaxed),
            );
        }
        running.store(false, Ordering::Relaxed);

        let mut outcome = Ok(());
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => outcome = Err(e),
                Err(_) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        outcome?;

        topic.on_complete()?;
        if !topic.await_termination(DRAIN_TIMEOUT) {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            eprintln!("subscribers did not drain within {DRAIN_TIMEOUT:?}");
        }

        let metrics = StressMetrics {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            subscribers: self.config.subscribers as u64,
            errors: counters.errors.load(Ordering::Relaxed),
            duration: start.elapsed(),
        };
        Ok((metrics, done_rx.try_iter().collect()))
    }
}

pub fn print_summary(metrics: &StressMetrics) {
    eprintln!(
        "stress: {} published in {:.2}s ({:.0}/s), {}/{} deliveries across {} subscribers, {} errors",
        metrics.published,
        metrics.duration.as_secs_f64(),
        metrics.publish_rate(),
        metrics.delivered,
        metrics.expected_deliveries(),
        metrics.subscribers,
        metrics.errors,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_deliveries_scale_with_subscribers() {
        let metrics = StressMetrics {
            published: 1000,
            delivered: 1980,
            subscribers: 2,
            duration: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(metrics.expected_deliveries(), 2000);
        assert!((metrics.publish_rate() - 100.0).abs() < 0.1);
    }

    #[test]
    fn test_short_run_checks_every_subscriber() {
        let config = StressConfig::default()
            .with_duration(Duration::from_millis(100))
            .with_report_interval(Duration::from_millis(50))
            .with_producers(2)
            .with_subscribers(2)
            .with_backlog(64);
        let (metrics, checkers) = StressRunner::new(config).run_topic(WaitStrategyKind::Yielding).unwrap();

        assert_eq!(metrics.errors, 0);
        assert_eq!(metrics.delivered, metrics.expected_deliveries());
        assert_eq!(checkers.len(), 2);
    }
}
