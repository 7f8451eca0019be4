//! Rollup aggregation.
//!
//! Completed units are accumulated into fixed-width windows keyed by window
//! start and unit type. A fixed-delay task whose period equals the rollup width
//! seals every window whose end has passed and hands it to the sink. Sealed
//! windows are delivered strictly in window order; a window whose delivery
//! fails stays at the head of the queue and is retried on the next tick.

pub mod histogram;
pub mod stats;
pub mod window;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::clock::{delay_to_next_boundary, window_start, Clock};
use crate::error::SchedulerError;
use crate::export::HealthMetrics;
use crate::scheduler::{ScheduledTask, SchedulerHandle, TaskHandle};
use crate::sink::{Record, Sink};

pub use stats::TypeSummary;
use window::Window;

/// Schedule name of the rollup flush task.
pub const FLUSH_TASK_NAME: &str = "rollup-flush";

/// Delivered windows whose unit ids are still remembered for deduplication.
pub const DEFAULT_DEDUP_WINDOWS: usize = 16;

/// Summary of one completed unit, as reported by the transaction collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUnit {
    pub id: u64,
    pub unit_type: String,
    /// Wall-clock completion time; decides the window.
    pub capture_time_ms: u64,
    pub duration_nanos: u64,
    pub error: bool,
}

/// A flushed rollup window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollupRecord {
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    pub count: u64,
    pub unit_types: Vec<TypeSummary>,
}

impl RollupRecord {
    pub fn unit_type(&self, unit_type: &str) -> Option<&TypeSummary> {
        self.unit_types.iter().find(|s| s.unit_type == unit_type)
    }
}

#[derive(Debug, Default)]
struct State {
    /// Open windows by start time.
    open: BTreeMap<u64, Window>,
    /// Sealed windows awaiting delivery, oldest first.
    sealed: VecDeque<Window>,
    /// Every window starting before this has been sealed.
    sealed_until_ms: u64,
    /// Unit ids held by open or sealed windows.
    pending_ids: HashSet<u64>,
    /// Unit ids of recently delivered windows, oldest first.
    delivered: VecDeque<HashSet<u64>>,
}

impl State {
    fn holds(&self, id: u64) -> bool {
        self.pending_ids.contains(&id) || self.delivered.iter().any(|ids| ids.contains(&id))
    }
}

/// Rollup Aggregator.
pub struct Aggregator {
    rollup: Duration,
    rollup_ms: u64,
    max_raw_durations: usize,
    dedup_windows: usize,
    clock: Arc<dyn Clock>,
    sink: Arc<Sink>,
    scheduler: SchedulerHandle,
    metrics: Option<Arc<HealthMetrics>>,
    state: Mutex<State>,
    flush_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<TaskHandle>>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Aggregator")
            .field("rollup", &self.rollup)
            .field("open_windows", &state.open.len())
            .field("sealed_windows", &state.sealed.len())
            .finish()
    }
}

impl Aggregator {
    pub fn new(
        rollup: Duration,
        max_raw_durations: usize,
        clock: Arc<dyn Clock>,
        sink: Arc<Sink>,
        scheduler: SchedulerHandle,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            rollup,
            rollup_ms: (rollup.as_millis() as u64).max(1),
            max_raw_durations,
            dedup_windows: DEFAULT_DEDUP_WINDOWS,
            clock,
            sink,
            scheduler,
            metrics,
            state: Mutex::new(State::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    /// Remember unit ids of the last `windows` delivered windows (at least one).
    pub fn with_dedup_windows(mut self, windows: usize) -> Self {
        self.dedup_windows = windows.max(1);
        self
    }

    /// Registers the flush schedule, first aligned to the next rollup boundary.
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let initial = delay_to_next_boundary(self.clock.now_millis(), self.rollup);
        let handle =
            self.scheduler
                .schedule_fixed_delay(Arc::clone(self), initial, self.rollup)?;
        *self.task.lock() = Some(handle);

        info!(rollup = ?self.rollup, ?initial, "rollup aggregator started");
        Ok(())
    }

    /// Accumulates one completed unit. A unit id that is open, sealed, or in
    /// one of the last `dedup_windows` delivered windows is ignored.
    ///
    /// Units whose window has already been sealed count toward the oldest
    /// window still open.
    pub fn add(&self, unit: CompletedUnit) {
        let mut state = self.state.lock();

        if state.holds(unit.id) {
            debug!(unit_id = unit.id, "duplicate completed unit ignored");
            return;
        }

        let start = window_start(unit.capture_time_ms, self.rollup).max(state.sealed_until_ms);
        state.pending_ids.insert(unit.id);
        state
            .open
            .entry(start)
            .or_insert_with(|| Window::new(start, self.rollup_ms))
            .record(&unit, self.max_raw_durations);
    }

    /// Seals every window ending at or before `now_ms` and delivers all sealed
    /// windows in order. Returns the number delivered.
    ///
    /// Stops at the first delivery failure; that window and the ones after it
    /// stay queued for the next call.
    pub async fn flush_until(&self, now_ms: u64) -> Result<usize> {
        let _serial = self.flush_lock.lock().await;

        self.seal_until(now_ms);

        let mut delivered = 0;
        loop {
            let record = {
                let state = self.state.lock();
                match state.sealed.front() {
                    Some(window) => window.to_record(),
                    None => break,
                }
            };

            if let Err(e) = self.sink.submit(&Record::Rollup(record.clone())).await {
                if let Some(metrics) = &self.metrics {
                    metrics.rollup_flush_failures.inc();
                }
                error!(
                    window_start_ms = record.window_start_ms,
                    error = %e,
                    "rollup flush failed, window kept for retry",
                );
                return Err(e.context(format!(
                    "flushing rollup window starting at {}",
                    record.window_start_ms
                )));
            }

            {
                let mut state = self.state.lock();
                if let Some(window) = state.sealed.pop_front() {
                    for id in window.unit_ids() {
                        state.pending_ids.remove(id);
                    }
                    state.delivered.push_back(window.unit_ids().clone());
                    while state.delivered.len() > self.dedup_windows {
                        state.delivered.pop_front();
                    }
                }
            }

            if let Some(metrics) = &self.metrics {
                metrics.rollups_flushed.inc();
            }
            debug!(
                window_start_ms = record.window_start_ms,
                count = record.count,
                "rollup window flushed",
            );
            delivered += 1;
        }

        Ok(delivered)
    }

    /// Seals and delivers every window, including ones still open.
    pub async fn flush_all(&self) -> Result<usize> {
        self.flush_until(u64::MAX).await
    }

    /// Forced flush of every window, abandoned after `timeout`.
    ///
    /// Windows not delivered in time stay queued and are counted as flush
    /// failures. Must be called from outside the scheduler's worker threads.
    pub fn flush_all_within(&self, timeout: Duration) -> Result<usize> {
        let outcome = self
            .scheduler
            .block_on(async { tokio::time::timeout(timeout, self.flush_all()).await });

        match outcome {
            Ok(result) => result,
            Err(_) => {
                let (open, sealed) = {
                    let state = self.state.lock();
                    (state.open.len(), state.sealed.len())
                };
                if let Some(metrics) = &self.metrics {
                    metrics.rollup_flush_failures.inc();
                }
                error!(?timeout, open, sealed, "forced rollup flush timed out, windows undelivered");
                bail!("forced rollup flush did not finish within {timeout:?}");
            }
        }
    }

    /// Final forced flush bounded by `timeout`, then releases the schedule.
    ///
    /// Must be called from outside the scheduler's worker threads.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        let result = self.flush_all_within(timeout);
        self.cancel();

        let delivered = result?;
        info!(delivered, "rollup aggregator closed");
        Ok(())
    }

    /// Whether any window is still waiting to be delivered.
    pub fn has_undelivered(&self) -> bool {
        let state = self.state.lock();
        !state.open.is_empty() || !state.sealed.is_empty()
    }

    /// Cancels the flush schedule. Idempotent.
    pub fn cancel(&self) {
        if let Some(handle) = self.task.lock().as_ref() {
            handle.cancel();
        }
    }

    pub fn open_windows(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn sealed_windows(&self) -> usize {
        self.state.lock().sealed.len()
    }

    fn seal_until(&self, now_ms: u64) {
        let mut state = self.state.lock();

        // u64::MAX is the forced flush: everything still open is sealed.
        let due: Vec<u64> = state
            .open
            .values()
            .take_while(|w| now_ms == u64::MAX || w.end_ms() <= now_ms)
            .map(Window::start_ms)
            .collect();

        for start in due {
            if let Some(window) = state.open.remove(&start) {
                state.sealed_until_ms = state.sealed_until_ms.max(window.end_ms());
                state.sealed.push_back(window);
            }
        }

        if now_ms != u64::MAX {
            let boundary = window_start(now_ms, self.rollup);
            state.sealed_until_ms = state.sealed_until_ms.max(boundary);
        }
    }
}

impl ScheduledTask for Aggregator {
    fn name(&self) -> &str {
        FLUSH_TASK_NAME
    }

    async fn run(&self) -> Result<()> {
        self.flush_until(self.clock.now_millis()).await.map(|_| ())
    }
}
