//! Transaction collection.
//!
//! Owns the in-flight registry. Instrumentation calls [`TransactionCollector::start_unit`]
//! from arbitrary threads and completes the returned [`UnitHandle`]; completion
//! reports a summary to the aggregator and, when the sampling policy keeps the
//! unit, queues a full trace. Queued traces reach the sink from a scheduled
//! task, so the instrumentation path never waits on sink I/O.

pub mod registry;
pub mod sampling;

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::aggregate::{Aggregator, CompletedUnit};
use crate::clock::Clock;
use crate::config::TransactionConfig;
use crate::error::SchedulerError;
use crate::export::HealthMetrics;
use crate::random::RandomSource;
use crate::scheduler::{ScheduledTask, SchedulerHandle, TaskHandle};
use crate::sink::{Record, Sink};
use crate::stack::StackSample;

pub use registry::{current_thread_id, InFlightUnit, UnitRegistry, UnitSnapshot};
pub use sampling::{Decision, SamplingPolicy, StoreReason};

/// Schedule name of the pending-trace store task.
pub const STORE_TASK_NAME: &str = "trace-store";

/// A full trace handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    pub unit_id: u64,
    pub unit_type: String,
    pub name: String,
    pub start_time_ms: u64,
    pub capture_time_ms: u64,
    pub duration_nanos: u64,
    pub thread_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Captured while the unit was still running.
    pub partial: bool,
    pub reason: StoreReason,
    pub stack_samples: Vec<StackSample>,
}

impl TraceRecord {
    fn from_unit(
        unit: &InFlightUnit,
        capture_time_ms: u64,
        duration: Duration,
        error: Option<String>,
        reason: StoreReason,
    ) -> Self {
        Self {
            unit_id: unit.id(),
            unit_type: unit.unit_type().to_string(),
            name: unit.name().to_string(),
            start_time_ms: unit.start_time_ms(),
            capture_time_ms,
            duration_nanos: duration.as_nanos() as u64,
            thread_id: unit.thread_id(),
            error,
            partial: reason == StoreReason::Partial,
            reason,
            stack_samples: unit.stack_samples(),
        }
    }
}

/// Transaction Collector.
pub struct TransactionCollector {
    registry: UnitRegistry,
    aggregator: Arc<Aggregator>,
    sink: Arc<Sink>,
    clock: Arc<dyn Clock>,
    policy: SamplingPolicy,
    pending: Mutex<VecDeque<TraceRecord>>,
    pending_limit: usize,
    flush_lock: tokio::sync::Mutex<()>,
    store_interval: Duration,
    max_stack_samples: usize,
    scheduler: SchedulerHandle,
    metrics: Option<Arc<HealthMetrics>>,
    task: Mutex<Option<TaskHandle>>,
}

impl std::fmt::Debug for TransactionCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCollector")
            .field("in_flight", &self.registry.len())
            .field("pending", &self.pending.lock().len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl TransactionCollector {
    pub fn new(
        cfg: &TransactionConfig,
        aggregator: Arc<Aggregator>,
        sink: Arc<Sink>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        scheduler: SchedulerHandle,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            registry: UnitRegistry::new(),
            aggregator,
            sink,
            clock,
            policy: SamplingPolicy::new(
                cfg.slow_threshold,
                cfg.sampling_rate,
                cfg.max_traces_per_second,
                random,
            ),
            pending: Mutex::new(VecDeque::new()),
            pending_limit: cfg.pending_limit.max(1),
            flush_lock: tokio::sync::Mutex::new(()),
            store_interval: cfg.store_interval,
            max_stack_samples: cfg.max_stack_samples,
            scheduler,
            metrics,
            task: Mutex::new(None),
        }
    }

    /// Registers the pending-trace store schedule.
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let handle = self.scheduler.schedule_fixed_delay(
            Arc::clone(self),
            self.store_interval,
            self.store_interval,
        )?;
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Begins a unit of work on the calling thread.
    pub fn start_unit(self: &Arc<Self>, unit_type: &str, name: &str) -> UnitHandle {
        let unit = self.registry.register_start(
            unit_type,
            name,
            self.clock.now_millis(),
            current_thread_id(),
        );

        if let Some(metrics) = &self.metrics {
            metrics.units_started.inc();
            metrics.units_in_flight.inc();
        }

        UnitHandle {
            collector: Arc::clone(self),
            unit,
            finished: false,
        }
    }

    /// Snapshot of units currently in flight, ordered by id.
    pub fn in_flight(&self) -> Vec<Arc<InFlightUnit>> {
        self.registry.snapshot()
    }

    pub fn unit(&self, id: u64) -> Option<Arc<InFlightUnit>> {
        self.registry.get(id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.registry.len()
    }

    pub fn max_stack_samples(&self) -> usize {
        self.max_stack_samples
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queues a partial trace of a still-running unit. The unit stays registered.
    ///
    /// Returns `false` if the unit already completed or the queue was full.
    pub fn store_partial(&self, unit: &InFlightUnit) -> bool {
        if unit.is_completed() {
            return false;
        }

        let now = self.clock.now_millis();
        let trace = TraceRecord::from_unit(unit, now, unit.elapsed(), None, StoreReason::Partial);
        if !self.enqueue(trace) {
            return false;
        }

        unit.mark_partial_store(now);
        if let Some(metrics) = &self.metrics {
            metrics.partial_stores.inc();
        }
        debug!(unit_id = unit.id(), "partial trace queued");
        true
    }

    /// Hands every queued trace to the sink. Returns the number delivered.
    ///
    /// A trace leaves the queue only once the sink has answered for it, so a
    /// flush abandoned mid-delivery leaves it queued.
    pub async fn flush_pending(&self) -> Result<usize> {
        let _serial = self.flush_lock.lock().await;
        let mut delivered = 0;
        let mut failed = 0;

        loop {
            let next = self.pending.lock().front().cloned();
            let Some(trace) = next else {
                break;
            };

            let result = self.sink.submit(&Record::Trace(trace)).await;
            self.pending.lock().pop_front();

            match result {
                Ok(()) => {
                    delivered += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.traces_stored.inc();
                    }
                }
                // Sink already retried and logged.
                Err(_) => failed += 1,
            }
        }

        if failed > 0 {
            bail!("{failed} traces could not be delivered");
        }
        Ok(delivered)
    }

    /// Stops the store schedule and delivers whatever is still queued,
    /// giving up after `timeout`. Traces left undelivered are counted as dropped.
    ///
    /// Must be called from outside the scheduler's worker threads.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        if let Some(handle) = self.task.lock().as_ref() {
            handle.cancel();
        }

        let outcome = self
            .scheduler
            .block_on(async { tokio::time::timeout(timeout, self.flush_pending()).await });

        let delivered = match outcome {
            Ok(result) => result?,
            Err(_) => {
                let undelivered = self.pending_len();
                if let Some(metrics) = &self.metrics {
                    metrics.traces_dropped.inc_by(undelivered as f64);
                }
                error!(?timeout, undelivered, "final trace flush timed out");
                bail!("{undelivered} traces undelivered after {timeout:?}");
            }
        };
        info!(
            delivered,
            still_in_flight = self.registry.len(),
            "transaction collector closed",
        );
        Ok(())
    }

    fn complete(&self, unit: &InFlightUnit, error: Option<String>) {
        if !unit.mark_completed() || self.registry.register_complete(unit.id()).is_none() {
            return;
        }

        let duration = unit.elapsed();
        let now = self.clock.now_millis();

        self.aggregator.add(CompletedUnit {
            id: unit.id(),
            unit_type: unit.unit_type().to_string(),
            capture_time_ms: now,
            duration_nanos: duration.as_nanos() as u64,
            error: error.is_some(),
        });

        if let Some(metrics) = &self.metrics {
            metrics.units_completed.inc();
            metrics.units_in_flight.dec();
        }

        if let Decision::Store(reason) = self.policy.decide(duration, error.is_some(), now) {
            self.enqueue(TraceRecord::from_unit(unit, now, duration, error, reason));
        }
    }

    fn enqueue(&self, trace: TraceRecord) -> bool {
        let mut pending = self.pending.lock();
        if pending.len() >= self.pending_limit {
            drop(pending);
            warn!(
                unit_id = trace.unit_id,
                limit = self.pending_limit,
                "pending trace queue full, trace dropped",
            );
            if let Some(metrics) = &self.metrics {
                metrics.traces_dropped.inc();
            }
            return false;
        }
        pending.push_back(trace);
        true
    }
}

impl ScheduledTask for TransactionCollector {
    fn name(&self) -> &str {
        STORE_TASK_NAME
    }

    async fn run(&self) -> Result<()> {
        self.flush_pending().await.map(|_| ())
    }
}

/// Completion handle for one unit. Dropping it without completing records
/// the unit as failed.
pub struct UnitHandle {
    collector: Arc<TransactionCollector>,
    unit: Arc<InFlightUnit>,
    finished: bool,
}

impl std::fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitHandle")
            .field("unit_id", &self.unit.id())
            .field("finished", &self.finished)
            .finish()
    }
}

impl UnitHandle {
    pub fn id(&self) -> u64 {
        self.unit.id()
    }

    pub fn unit(&self) -> &Arc<InFlightUnit> {
        &self.unit
    }

    pub fn complete(mut self) {
        self.finish(None);
    }

    pub fn complete_with_error(mut self, message: impl Into<String>) {
        self.finish(Some(message.into()));
    }

    fn finish(&mut self, error: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let collector = &self.collector;
        let unit = &self.unit;
        let outcome = catch_unwind(AssertUnwindSafe(|| collector.complete(unit, error)));
        if outcome.is_err() {
            error!(unit_id = unit.id(), "unit completion panicked");
        }
    }
}

impl Drop for UnitHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Some("unit dropped without completion".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::clock::ManualClock;
    use crate::random::FixedRandom;
    use crate::scheduler::Scheduler;
    use crate::sink::{Exporter, MemoryExporter, RetryPolicy};

    struct Fixture {
        scheduler: Scheduler,
        clock: Arc<ManualClock>,
        collector: Arc<TransactionCollector>,
        aggregator: Arc<Aggregator>,
        memory: MemoryExporter,
    }

    fn fixture(cfg: TransactionConfig, draw: f64) -> Fixture {
        let scheduler = Scheduler::new(1).expect("scheduler");
        let memory = MemoryExporter::new();
        let sink = Arc::new(Sink::new(
            vec![Exporter::Memory(memory.clone())],
            RetryPolicy {
                max_attempts: 1,
                backoff: Duration::ZERO,
            },
        ));
        let clock = Arc::new(ManualClock::new(10_000));
        let aggregator = Arc::new(Aggregator::new(
            Duration::from_secs(60),
            64,
            clock.clone(),
            Arc::clone(&sink),
            scheduler.handle(),
            None,
        ));
        let collector = Arc::new(TransactionCollector::new(
            &cfg,
            Arc::clone(&aggregator),
            sink,
            clock.clone(),
            Arc::new(FixedRandom::new(draw, Duration::ZERO)),
            scheduler.handle(),
            None,
        ));
        Fixture {
            scheduler,
            clock,
            collector,
            aggregator,
            memory,
        }
    }

    fn summary_only() -> TransactionConfig {
        TransactionConfig {
            sampling_rate: 0.0,
            ..TransactionConfig::default()
        }
    }

    #[test]
    fn test_complete_reports_to_aggregator_and_removes_unit() {
        let f = fixture(summary_only(), 0.0);
        let unit = f.collector.start_unit("Background", "nightly-report");
        assert_eq!(f.collector.in_flight_count(), 1);

        unit.complete();
        assert_eq!(f.collector.in_flight_count(), 0);
        assert_eq!(f.collector.pending_len(), 0);

        f.scheduler
            .handle()
            .block_on(f.aggregator.flush_all())
            .expect("flush");
        let rollups = f.memory.rollups();
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].count, 1);
    }

    #[test]
    fn test_error_unit_always_stored() {
        let f = fixture(summary_only(), 0.0);
        f.collector
            .start_unit("Background", "import")
            .complete_with_error("disk full");

        assert_eq!(f.collector.pending_len(), 1);
        f.scheduler
            .handle()
            .block_on(f.collector.flush_pending())
            .expect("flush");

        let traces = f.memory.traces();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].error.as_deref(), Some("disk full"));
        assert_eq!(traces[0].reason, StoreReason::Error);
        assert!(!traces[0].partial);
    }

    #[test]
    fn test_dropped_handle_completes_with_error() {
        let f = fixture(summary_only(), 0.0);
        {
            let _unit = f.collector.start_unit("Web", "/checkout");
        }
        assert_eq!(f.collector.in_flight_count(), 0);
        assert_eq!(f.collector.pending_len(), 1);
    }

    #[test]
    fn test_pending_queue_bounded() {
        let cfg = TransactionConfig {
            pending_limit: 2,
            ..TransactionConfig::default()
        };
        let f = fixture(cfg, 0.0);
        for i in 0..5 {
            f.collector.start_unit("Web", &format!("req-{i}")).complete();
        }
        assert_eq!(f.collector.pending_len(), 2);
    }

    #[test]
    fn test_store_partial_keeps_unit_registered() {
        let f = fixture(summary_only(), 0.0);
        let unit = f.collector.start_unit("Background", "long-job");

        f.clock.advance(Duration::from_secs(5));
        assert!(f.collector.store_partial(unit.unit()));
        assert_eq!(f.collector.in_flight_count(), 1);
        assert_eq!(unit.unit().partial_stores(), 1);
        assert_eq!(unit.unit().last_partial_store_ms(), 15_000);

        f.scheduler
            .handle()
            .block_on(f.collector.flush_pending())
            .expect("flush");
        let traces = f.memory.traces();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].partial);
        assert_eq!(traces[0].reason, StoreReason::Partial);

        let inner = Arc::clone(unit.unit());
        unit.complete();
        assert!(!f.collector.store_partial(&inner));
    }

    #[test]
    fn test_concurrent_units_from_many_threads() {
        let f = fixture(summary_only(), 0.0);
        let mut workers = Vec::new();

        for t in 0..8 {
            let collector = Arc::clone(&f.collector);
            workers.push(thread::spawn(move || {
                let mut open = Vec::new();
                for i in 0..200 {
                    let unit = collector.start_unit("Web", &format!("t{t}-{i}"));
                    if i % 4 == 0 {
                        open.push(unit);
                    } else {
                        unit.complete();
                    }
                }
                open
            }));
        }

        let open: Vec<UnitHandle> = workers
            .into_iter()
            .flat_map(|w| w.join().expect("worker"))
            .collect();

        let mut expected: Vec<u64> = open.iter().map(UnitHandle::id).collect();
        expected.sort_unstable();
        let actual: Vec<u64> = f.collector.in_flight().iter().map(|u| u.id()).collect();
        assert_eq!(actual, expected);

        for unit in open {
            unit.complete();
        }
        assert_eq!(f.collector.in_flight_count(), 0);
    }

    #[test]
    fn test_close_flushes_pending_traces() {
        let f = fixture(TransactionConfig::default(), 0.0);
        f.collector.start().expect("start");
        f.collector.start_unit("Web", "/login").complete();

        f.collector.close(Duration::from_secs(5)).expect("close");
        assert_eq!(f.memory.traces().len(), 1);
        assert!(!f
            .scheduler
            .handle()
            .active_task_names()
            .contains(&STORE_TASK_NAME.to_string()));
    }

    #[test]
    fn test_close_gives_up_after_timeout() {
        let scheduler = Scheduler::new(1).expect("scheduler");
        let memory = MemoryExporter::new();
        let sink = Arc::new(Sink::new(
            vec![Exporter::Memory(memory.clone())],
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(500),
            },
        ));
        let clock = Arc::new(ManualClock::new(10_000));
        let aggregator = Arc::new(Aggregator::new(
            Duration::from_secs(60),
            64,
            clock.clone(),
            Arc::clone(&sink),
            scheduler.handle(),
            None,
        ));
        let collector = Arc::new(TransactionCollector::new(
            &TransactionConfig::default(),
            aggregator,
            sink,
            clock,
            Arc::new(FixedRandom::new(0.0, Duration::ZERO)),
            scheduler.handle(),
            None,
        ));
        for i in 0..3 {
            collector.start_unit("Web", &format!("/page/{i}")).complete();
        }
        memory.fail_next(u32::MAX);

        let started = std::time::Instant::now();
        let err = collector.close(Duration::from_millis(100)).unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(450));
        assert!(err.to_string().contains("3 traces undelivered"));
        assert_eq!(collector.pending_len(), 3);
    }
}
