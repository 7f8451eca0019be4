//! Stack sampling of slow in-flight units.
//!
//! Runs on a randomized cadence: every cycle waits a fresh uniform draw from
//! `[min_interval, max_interval]` so sampling does not alias with periodic
//! application behaviour. On hosts without a usable sampler the collector is
//! created disabled and every operation is a no-op.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::StackTraceConfig;
use crate::error::SchedulerError;
use crate::export::HealthMetrics;
use crate::random::RandomSource;
use crate::scheduler::{ScheduledTask, SchedulerHandle, TaskHandle};
use crate::transaction::TransactionCollector;

/// Schedule name of the stack sampling task.
pub const STACK_TASK_NAME: &str = "stack-traces";

/// Frames captured from one thread at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackSample {
    pub timestamp_ms: u64,
    pub thread_id: i64,
    pub frames: Vec<String>,
}

/// Capability to capture the current frames of a thread.
pub trait StackSampler: Send + Sync {
    /// Whether the capability works on this host.
    fn is_available(&self) -> bool;

    fn sample(&self, thread_id: i64) -> Result<Vec<String>>;
}

/// Samples the kernel-visible state of a thread of this process from
/// `/proc/self/task/<tid>`: scheduler state, wait channel, and the kernel
/// stack when readable.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsThreadSampler;

impl StackSampler for ProcfsThreadSampler {
    fn is_available(&self) -> bool {
        cfg!(target_os = "linux") && Path::new("/proc/self/task").is_dir()
    }

    fn sample(&self, thread_id: i64) -> Result<Vec<String>> {
        let dir = format!("/proc/self/task/{thread_id}");
        let stat = fs::read_to_string(format!("{dir}/stat"))
            .with_context(|| format!("reading {dir}/stat"))?;

        let mut frames = Vec::new();
        if let Some(state) = parse_thread_state(&stat) {
            frames.push(format!("state {state}"));
        }

        if let Ok(wchan) = fs::read_to_string(format!("{dir}/wchan")) {
            let wchan = wchan.trim();
            if !wchan.is_empty() && wchan != "0" {
                frames.push(format!("wchan {wchan}"));
            }
        }

        // Requires elevated privileges on most hosts.
        if let Ok(stack) = fs::read_to_string(format!("{dir}/stack")) {
            frames.extend(
                stack
                    .lines()
                    .filter_map(|l| l.split_whitespace().nth(1))
                    .map(str::to_string),
            );
        }

        Ok(frames)
    }
}

/// Single-letter scheduler state following the comm field of a stat line.
fn parse_thread_state(stat: &str) -> Option<&str> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().next()
}

/// Stack-Trace Collector.
pub struct StackTraceCollector {
    enabled: bool,
    threshold: Duration,
    min_interval: Duration,
    max_interval: Duration,
    max_stack_samples: usize,
    sampler: Arc<dyn StackSampler>,
    random: Arc<dyn RandomSource>,
    transactions: Arc<TransactionCollector>,
    clock: Arc<dyn Clock>,
    scheduler: SchedulerHandle,
    metrics: Option<Arc<HealthMetrics>>,
    task: Mutex<Option<TaskHandle>>,
}

impl std::fmt::Debug for StackTraceCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackTraceCollector")
            .field("enabled", &self.enabled)
            .field("threshold", &self.threshold)
            .field("min_interval", &self.min_interval)
            .field("max_interval", &self.max_interval)
            .finish()
    }
}

impl StackTraceCollector {
    /// Builds the collector, disabled when configuration turns it off or the
    /// sampler is unavailable on this host.
    pub fn create(
        cfg: &StackTraceConfig,
        sampler: Arc<dyn StackSampler>,
        random: Arc<dyn RandomSource>,
        transactions: Arc<TransactionCollector>,
        clock: Arc<dyn Clock>,
        scheduler: SchedulerHandle,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Arc<Self> {
        let enabled = if !cfg.enabled {
            info!("stack sampling disabled by configuration");
            false
        } else if !sampler.is_available() {
            info!("stack sampling unavailable on this host, continuing without it");
            false
        } else {
            true
        };

        Arc::new(Self {
            enabled,
            threshold: cfg.threshold,
            min_interval: cfg.min_interval,
            max_interval: cfg.max_interval.max(cfg.min_interval),
            max_stack_samples: transactions.max_stack_samples(),
            sampler,
            random,
            transactions,
            clock,
            scheduler,
            metrics,
            task: Mutex::new(None),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Next cycle delay, drawn fresh from `[min_interval, max_interval]`.
    pub fn next_delay(&self) -> Duration {
        self.random
            .duration_between(self.min_interval, self.max_interval)
    }

    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        if !self.enabled {
            return Ok(());
        }

        let jitter = Arc::clone(self);
        let handle = self.scheduler.schedule_with_delays(
            Arc::clone(self),
            self.next_delay(),
            move || jitter.next_delay(),
        )?;
        *self.task.lock() = Some(handle);

        info!(
            threshold = ?self.threshold,
            min_interval = ?self.min_interval,
            max_interval = ?self.max_interval,
            "stack trace collector started",
        );
        Ok(())
    }

    /// Samples every in-flight unit older than the threshold.
    /// Returns the number of samples attached.
    pub fn sample_once(&self) -> usize {
        if !self.enabled {
            return 0;
        }

        let timestamp_ms = self.clock.now_millis();
        let mut captured = 0;

        for unit in self.transactions.in_flight() {
            if unit.elapsed() < self.threshold
                || unit.stack_sample_count() >= self.max_stack_samples
            {
                continue;
            }

            match self.sampler.sample(unit.thread_id()) {
                Ok(frames) => {
                    let sample = StackSample {
                        timestamp_ms,
                        thread_id: unit.thread_id(),
                        frames,
                    };
                    if unit.add_stack_sample(sample, self.max_stack_samples) {
                        captured += 1;
                    }
                }
                // The thread may have exited between snapshot and sample.
                Err(e) => debug!(unit_id = unit.id(), error = %e, "stack sample failed"),
            }
        }

        if captured > 0 {
            if let Some(metrics) = &self.metrics {
                metrics.stack_samples.inc_by(captured as f64);
            }
        }

        captured
    }

    /// Cancels the schedule. Idempotent; a no-op when disabled.
    pub fn close(&self) {
        if let Some(handle) = self.task.lock().as_ref() {
            handle.cancel();
        }
    }
}

impl ScheduledTask for StackTraceCollector {
    fn name(&self) -> &str {
        STACK_TASK_NAME
    }

    async fn run(&self) -> Result<()> {
        self.sample_once();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::aggregate::Aggregator;
    use crate::clock::ManualClock;
    use crate::config::TransactionConfig;
    use crate::random::FixedRandom;
    use crate::scheduler::Scheduler;
    use crate::sink::{RetryPolicy, Sink};

    struct FakeSampler {
        available: bool,
        calls: AtomicUsize,
    }

    impl StackSampler for FakeSampler {
        fn is_available(&self) -> bool {
            self.available
        }

        fn sample(&self, _thread_id: i64) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["state S".to_string()])
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        transactions: Arc<TransactionCollector>,
        sampler: Arc<FakeSampler>,
    }

    fn fixture(available: bool, max_stack_samples: usize) -> Fixture {
        let scheduler = Scheduler::new(1).expect("scheduler");
        let clock = Arc::new(ManualClock::new(0));
        let sink = Arc::new(Sink::new(Vec::new(), RetryPolicy::default()));
        let aggregator = Arc::new(Aggregator::new(
            Duration::from_secs(60),
            16,
            clock.clone(),
            Arc::clone(&sink),
            scheduler.handle(),
            None,
        ));
        let cfg = TransactionConfig {
            max_stack_samples,
            ..TransactionConfig::default()
        };
        let transactions = Arc::new(TransactionCollector::new(
            &cfg,
            aggregator,
            sink,
            clock,
            Arc::new(FixedRandom::new(0.0, Duration::ZERO)),
            scheduler.handle(),
            None,
        ));
        Fixture {
            scheduler,
            transactions,
            sampler: Arc::new(FakeSampler {
                available,
                calls: AtomicUsize::new(0),
            }),
        }
    }

    fn create(f: &Fixture, cfg: &StackTraceConfig, delay: Duration) -> Arc<StackTraceCollector> {
        StackTraceCollector::create(
            cfg,
            f.sampler.clone(),
            Arc::new(FixedRandom::new(0.0, delay)),
            Arc::clone(&f.transactions),
            Arc::new(ManualClock::new(1_000)),
            f.scheduler.handle(),
            None,
        )
    }

    fn cfg(threshold: Duration) -> StackTraceConfig {
        StackTraceConfig {
            enabled: true,
            threshold,
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(150),
        }
    }

    #[test]
    fn test_disabled_when_sampler_unavailable() {
        let f = fixture(false, 10);
        let stacks = create(&f, &cfg(Duration::ZERO), Duration::from_millis(80));
        assert!(!stacks.is_enabled());

        stacks.start().expect("start is a no-op");
        assert!(f.scheduler.handle().active_task_names().is_empty());

        let _unit = f.transactions.start_unit("Background", "job");
        assert_eq!(stacks.sample_once(), 0);
        stacks.close();
    }

    #[test]
    fn test_disabled_by_config() {
        let f = fixture(true, 10);
        let mut c = cfg(Duration::ZERO);
        c.enabled = false;
        assert!(!create(&f, &c, Duration::from_millis(80)).is_enabled());
    }

    #[test]
    fn test_no_eligible_units_is_noop() {
        let f = fixture(true, 10);
        let stacks = create(&f, &cfg(Duration::from_secs(3600)), Duration::from_millis(80));

        assert_eq!(stacks.sample_once(), 0);
        let _young = f.transactions.start_unit("Background", "job");
        assert_eq!(stacks.sample_once(), 0);
        assert_eq!(f.sampler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_samples_slow_units_up_to_cap() {
        let f = fixture(true, 2);
        let stacks = create(&f, &cfg(Duration::ZERO), Duration::from_millis(80));
        let unit = f.transactions.start_unit("Background", "job");

        assert_eq!(stacks.sample_once(), 1);
        assert_eq!(stacks.sample_once(), 1);
        assert_eq!(stacks.sample_once(), 0);

        let samples = unit.unit().stack_samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].timestamp_ms, 1_000);
        assert_eq!(samples[0].frames, vec!["state S".to_string()]);
    }

    struct CountingRandom {
        draws: AtomicUsize,
        delay: Duration,
    }

    impl RandomSource for CountingRandom {
        fn next_f64(&self) -> f64 {
            0.0
        }

        fn duration_between(&self, min: Duration, max: Duration) -> Duration {
            self.draws.fetch_add(1, Ordering::SeqCst);
            self.delay.clamp(min, max.max(min))
        }
    }

    #[test]
    fn test_next_delay_clamped_to_interval() {
        let f = fixture(true, 10);
        let stacks = create(&f, &cfg(Duration::ZERO), Duration::from_millis(500));
        assert_eq!(stacks.next_delay(), Duration::from_millis(150));
    }

    #[test]
    fn test_delay_redrawn_after_every_cycle() {
        let f = fixture(true, 1_000);
        let random = Arc::new(CountingRandom {
            draws: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let stacks = StackTraceCollector::create(
            &cfg(Duration::ZERO),
            f.sampler.clone(),
            random.clone(),
            Arc::clone(&f.transactions),
            Arc::new(ManualClock::new(1_000)),
            f.scheduler.handle(),
            None,
        );
        let unit = f.transactions.start_unit("Background", "job");
        assert_eq!(random.draws.load(Ordering::SeqCst), 0);

        stacks.start().expect("start");
        assert_eq!(random.draws.load(Ordering::SeqCst), 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while f.sampler.calls.load(Ordering::SeqCst) < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        stacks.close();
        assert!(f.scheduler.drain(Duration::from_secs(2)));

        // One draw for the first delay, then one after each executed cycle.
        let cycles = f.sampler.calls.load(Ordering::SeqCst);
        assert!(cycles >= 4);
        assert_eq!(random.draws.load(Ordering::SeqCst), cycles + 1);
        unit.complete();
    }

    #[test]
    fn test_scheduled_sampling_runs() {
        let f = fixture(true, 1_000);
        let stacks = create(&f, &cfg(Duration::ZERO), Duration::from_millis(50));
        let unit = f.transactions.start_unit("Background", "job");

        stacks.start().expect("start");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while unit.unit().stack_sample_count() < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(unit.unit().stack_sample_count() >= 3);

        stacks.close();
        stacks.close();
        unit.complete();
    }

    #[test]
    fn test_parse_thread_state() {
        assert_eq!(parse_thread_state("42 (vigil bg) S 1 2 3"), Some("S"));
        assert_eq!(parse_thread_state("nonsense"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_sampler_reads_own_thread() {
        let sampler = ProcfsThreadSampler;
        assert!(sampler.is_available());

        let tid = crate::transaction::current_thread_id();
        let frames = sampler.sample(tid).expect("sample");
        assert!(frames.iter().any(|f| f.starts_with("state ")));
    }
}
