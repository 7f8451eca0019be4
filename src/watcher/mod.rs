//! Long-running unit watcher.
//!
//! Scans in-flight units on a short fixed period and stores a partial trace of
//! any unit older than the threshold. Each watcher instance has its own epoch;
//! a unit is persisted once per epoch unless a repeat interval is configured.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::ImmediateStoreConfig;
use crate::error::SchedulerError;
use crate::scheduler::{ScheduledTask, SchedulerHandle, TaskHandle};
use crate::transaction::{InFlightUnit, TransactionCollector};

/// Schedule name of the watcher task.
pub const WATCHER_TASK_NAME: &str = "immediate-store-watcher";

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Long-Running-Unit Watcher.
pub struct ImmediateStoreWatcher {
    epoch: u64,
    threshold: Duration,
    period: Duration,
    repeat_interval: Option<Duration>,
    transactions: Arc<TransactionCollector>,
    clock: Arc<dyn Clock>,
    scheduler: SchedulerHandle,
    cancelled: AtomicBool,
    task: Mutex<Option<TaskHandle>>,
}

impl std::fmt::Debug for ImmediateStoreWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmediateStoreWatcher")
            .field("epoch", &self.epoch)
            .field("threshold", &self.threshold)
            .field("period", &self.period)
            .field("repeat_interval", &self.repeat_interval)
            .finish()
    }
}

impl ImmediateStoreWatcher {
    pub fn new(
        cfg: &ImmediateStoreConfig,
        transactions: Arc<TransactionCollector>,
        clock: Arc<dyn Clock>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
            threshold: cfg.threshold,
            period: cfg.period,
            repeat_interval: cfg.repeat_interval,
            transactions,
            clock,
            scheduler,
            cancelled: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let handle =
            self.scheduler
                .schedule_fixed_delay(Arc::clone(self), Duration::ZERO, self.period)?;
        *self.task.lock() = Some(handle);

        info!(
            epoch = self.epoch,
            threshold = ?self.threshold,
            period = ?self.period,
            "immediate store watcher started",
        );
        Ok(())
    }

    /// One pass over the in-flight units. Returns the number of partial
    /// stores issued.
    pub fn scan(&self) -> usize {
        if self.cancelled.load(Ordering::Acquire) {
            return 0;
        }

        let now_ms = self.clock.now_millis();
        let mut stored = 0;

        for unit in self.transactions.in_flight() {
            if !self.is_due(&unit, now_ms) {
                continue;
            }
            if self.transactions.store_partial(&unit) {
                unit.set_watcher_epoch(self.epoch);
                stored += 1;
                debug!(
                    unit_id = unit.id(),
                    epoch = self.epoch,
                    elapsed = ?unit.elapsed(),
                    "long-running unit persisted",
                );
            }
        }

        stored
    }

    /// Stops future scans. Partial stores already issued stay issued.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(handle) = self.task.lock().as_ref() {
            handle.cancel();
        }
    }

    fn is_due(&self, unit: &InFlightUnit, now_ms: u64) -> bool {
        if unit.elapsed() < self.threshold {
            return false;
        }
        if unit.watcher_epoch() != self.epoch {
            return true;
        }
        match self.repeat_interval {
            Some(repeat) => {
                now_ms.saturating_sub(unit.last_partial_store_ms()) >= repeat.as_millis() as u64
            }
            None => false,
        }
    }
}

impl ScheduledTask for ImmediateStoreWatcher {
    fn name(&self) -> &str {
        WATCHER_TASK_NAME
    }

    async fn run(&self) -> Result<()> {
        self.scan();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregator;
    use crate::clock::ManualClock;
    use crate::config::TransactionConfig;
    use crate::random::FixedRandom;
    use crate::scheduler::Scheduler;
    use crate::sink::{RetryPolicy, Sink};

    struct Fixture {
        scheduler: Scheduler,
        clock: Arc<ManualClock>,
        transactions: Arc<TransactionCollector>,
    }

    fn fixture() -> Fixture {
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
        let transactions = Arc::new(TransactionCollector::new(
            &TransactionConfig {
                sampling_rate: 0.0,
                ..TransactionConfig::default()
            },
            aggregator,
            sink,
            clock.clone(),
            Arc::new(FixedRandom::new(0.0, Duration::ZERO)),
            scheduler.handle(),
            None,
        ));
        Fixture {
            scheduler,
            clock,
            transactions,
        }
    }

    fn watcher(f: &Fixture, repeat_interval: Option<Duration>) -> Arc<ImmediateStoreWatcher> {
        Arc::new(ImmediateStoreWatcher::new(
            &ImmediateStoreConfig {
                threshold: Duration::ZERO,
                period: Duration::from_millis(10),
                repeat_interval,
            },
            Arc::clone(&f.transactions),
            f.clock.clone(),
            f.scheduler.handle(),
        ))
    }

    #[test]
    fn test_long_running_unit_persisted_exactly_once() {
        let f = fixture();
        let w = watcher(&f, None);
        let unit = f.transactions.start_unit("Background", "export");

        assert_eq!(w.scan(), 1);
        for _ in 0..5 {
            f.clock.advance(Duration::from_secs(1));
            assert_eq!(w.scan(), 0);
        }

        assert_eq!(unit.unit().partial_stores(), 1);
        assert_eq!(f.transactions.pending_len(), 1);
        assert_eq!(f.transactions.in_flight_count(), 1);
    }

    #[test]
    fn test_young_units_not_persisted() {
        let f = fixture();
        let w = Arc::new(ImmediateStoreWatcher::new(
            &ImmediateStoreConfig {
                threshold: Duration::from_secs(3600),
                period: Duration::from_millis(10),
                repeat_interval: None,
            },
            Arc::clone(&f.transactions),
            f.clock.clone(),
            f.scheduler.handle(),
        ));
        let _unit = f.transactions.start_unit("Background", "export");
        assert_eq!(w.scan(), 0);
    }

    #[test]
    fn test_repeat_interval_allows_periodic_persistence() {
        let f = fixture();
        let w = watcher(&f, Some(Duration::from_secs(30)));
        let unit = f.transactions.start_unit("Background", "export");

        f.clock.set(1_000);
        assert_eq!(w.scan(), 1);
        f.clock.set(20_000);
        assert_eq!(w.scan(), 0);
        f.clock.set(31_000);
        assert_eq!(w.scan(), 1);
        assert_eq!(unit.unit().partial_stores(), 2);
    }

    #[test]
    fn test_new_epoch_persists_again() {
        let f = fixture();
        let first = watcher(&f, None);
        let second = watcher(&f, None);
        assert_ne!(first.epoch(), second.epoch());

        let _unit = f.transactions.start_unit("Background", "export");
        assert_eq!(first.scan(), 1);
        assert_eq!(second.scan(), 1);
    }

    #[test]
    fn test_cancel_stops_scans_and_keeps_issued_stores() {
        let f = fixture();
        let w = watcher(&f, Some(Duration::ZERO));
        let _unit = f.transactions.start_unit("Background", "export");

        w.start().expect("start");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while f.transactions.pending_len() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(f.transactions.pending_len() >= 1);

        w.cancel();
        w.cancel();
        // Let a scan that was already running finish.
        std::thread::sleep(Duration::from_millis(50));
        let issued = f.transactions.pending_len();
        assert_eq!(w.scan(), 0);
        assert_eq!(f.transactions.pending_len(), issued);
        assert!(!f
            .scheduler
            .handle()
            .active_task_names()
            .contains(&WATCHER_TASK_NAME.to_string()));
    }
}
