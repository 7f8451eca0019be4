//! Shared background scheduler.
//!
//! A fixed pool of worker threads (a dedicated multi-thread tokio runtime)
//! services every periodic collector. Each invocation of a task runs in its own
//! spawned future so an error or panic is isolated to that invocation: it is
//! logged and the next scheduled run still happens.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Runtime;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;

/// Callback invoked with the task name whenever an invocation fails.
pub type TaskFailureFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Unit of periodic work.
pub trait ScheduledTask: Send + Sync + 'static {
    /// Unique schedule name.
    fn name(&self) -> &str;

    /// One invocation. Errors are logged by the scheduler and never stop the schedule.
    fn run(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Owner of the worker pool. Only the orchestrator holds this; collectors get a
/// [`SchedulerHandle`].
pub struct Scheduler {
    runtime: parking_lot::Mutex<Option<Runtime>>,
    handle: SchedulerHandle,
    workers: usize,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers)
            .field("active_tasks", &self.handle.active_task_names())
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}

impl Scheduler {
    /// Builds a scheduler with `workers` background threads.
    pub fn new(workers: usize) -> Result<Self> {
        Self::with_failure_hook(workers, None)
    }

    /// Builds a scheduler that reports task failures to `on_failure`.
    pub fn with_failure_hook(workers: usize, on_failure: Option<TaskFailureFn>) -> Result<Self> {
        let thread_seq = Arc::new(AtomicU64::new(0));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name_fn(move || {
                let n = thread_seq.fetch_add(1, Ordering::Relaxed);
                format!("vigil-background-{n}")
            })
            .enable_all()
            .build()
            .context("building scheduler runtime")?;

        let handle = SchedulerHandle {
            rt: runtime.handle().clone(),
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            active: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
            on_failure,
        };

        info!(workers, "scheduler started");

        Ok(Self {
            runtime: parking_lot::Mutex::new(Some(runtime)),
            handle,
            workers,
        })
    }

    /// Returns a shareable handle for registering work.
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stops accepting work, cancels all schedules, and waits up to `timeout`
    /// for in-flight invocations to finish.
    ///
    /// Returns `false` on timeout. Must be called from outside the scheduler's
    /// own worker threads. A second call after a completed drain returns `true`.
    pub fn drain(&self, timeout: Duration) -> bool {
        self.handle.closed.store(true, Ordering::SeqCst);
        self.handle.root.cancel();
        self.handle.tracker.close();

        let Some(runtime) = self.runtime.lock().take() else {
            return self.handle.tracker.is_empty();
        };

        let tracker = self.handle.tracker.clone();
        let finished = runtime.block_on(async move {
            tokio::time::timeout(timeout, tracker.wait()).await.is_ok()
        });

        if finished {
            runtime.shutdown_timeout(Duration::from_millis(100));
            info!("scheduler drained");
        } else {
            warn!(
                ?timeout,
                remaining = self.handle.tracker.len(),
                "scheduler drain timed out"
            );
            runtime.shutdown_background();
        }

        finished
    }
}

impl Drop for Scheduler {
    // Undrained schedulers are torn down without waiting; this is also the
    // only shutdown that is legal from inside an async context.
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            self.handle.root.cancel();
            runtime.shutdown_background();
        }
    }
}

/// Cheap, cloneable view of the scheduler shared by all collectors.
#[derive(Clone)]
pub struct SchedulerHandle {
    rt: tokio::runtime::Handle,
    root: CancellationToken,
    tracker: TaskTracker,
    active: Arc<DashMap<String, u64>>,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    on_failure: Option<TaskFailureFn>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("active_tasks", &self.active.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SchedulerHandle {
    /// Runs `task` after `initial_delay`, then `period` after each completion.
    pub fn schedule_fixed_delay<T: ScheduledTask>(
        &self,
        task: Arc<T>,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<TaskHandle, SchedulerError> {
        if period.is_zero() {
            return Err(SchedulerError::ZeroPeriod(task.name().to_string()));
        }
        self.schedule_with_delays(task, initial_delay, move || period)
    }

    /// Runs `task` first at `phase_aligned_delay`, then every `period` measured
    /// from the previous scheduled time. Late ticks are caught up.
    pub fn schedule_fixed_rate<T: ScheduledTask>(
        &self,
        task: Arc<T>,
        phase_aligned_delay: Duration,
        period: Duration,
    ) -> Result<TaskHandle, SchedulerError> {
        if period.is_zero() {
            return Err(SchedulerError::ZeroPeriod(task.name().to_string()));
        }
        let (id, token) = self.register(task.name())?;
        let name: Arc<str> = Arc::from(task.name());

        let active = Arc::clone(&self.active);
        let on_failure = self.on_failure.clone();
        let loop_token = token.clone();
        let loop_name = Arc::clone(&name);

        self.tracker.spawn_on(
            async move {
                let start = Instant::now() + phase_aligned_delay;
                let mut ticker = tokio::time::interval_at(start, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

                loop {
                    tokio::select! {
                        biased;
                        _ = loop_token.cancelled() => break,
                        _ = ticker.tick() => {
                            run_once(&task, on_failure.as_ref()).await;
                        }
                    }
                }

                active.remove_if(loop_name.as_ref(), |_, v| *v == id);
                debug!(task = %loop_name, "fixed-rate schedule stopped");
            },
            &self.rt,
        );

        debug!(task = %name, ?phase_aligned_delay, ?period, "fixed-rate task scheduled");

        Ok(TaskHandle {
            name,
            id,
            token,
            active: Arc::clone(&self.active),
        })
    }

    /// Runs `task` after `initial_delay`, then waits `next_delay()` after each
    /// completion. `next_delay` is called fresh every cycle, which lets callers
    /// jitter the cadence.
    pub fn schedule_with_delays<T, F>(
        &self,
        task: Arc<T>,
        initial_delay: Duration,
        next_delay: F,
    ) -> Result<TaskHandle, SchedulerError>
    where
        T: ScheduledTask,
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        let (id, token) = self.register(task.name())?;
        let name: Arc<str> = Arc::from(task.name());

        let active = Arc::clone(&self.active);
        let on_failure = self.on_failure.clone();
        let loop_token = token.clone();
        let loop_name = Arc::clone(&name);

        self.tracker.spawn_on(
            async move {
                let mut delay = initial_delay;
                while sleep_unless_cancelled(&loop_token, delay).await {
                    run_once(&task, on_failure.as_ref()).await;
                    delay = next_delay();
                }

                active.remove_if(loop_name.as_ref(), |_, v| *v == id);
                debug!(task = %loop_name, "fixed-delay schedule stopped");
            },
            &self.rt,
        );

        debug!(task = %name, ?initial_delay, "fixed-delay task scheduled");

        Ok(TaskHandle {
            name,
            id,
            token,
            active: Arc::clone(&self.active),
        })
    }

    /// Spawns a long-lived future that counts as scheduler work for drain.
    ///
    /// The future should watch [`SchedulerHandle::shutdown_token`] and exit.
    pub fn spawn<F>(&self, name: &str, fut: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }
        self.tracker.spawn_on(fut, &self.rt);
        debug!(task = name, "background future spawned");
        Ok(())
    }

    /// Drives `fut` to completion on the scheduler runtime from a non-worker thread.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.rt.block_on(fut)
    }

    /// Token cancelled when drain begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Names of schedules that are currently active.
    pub fn active_task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn register(&self, name: &str) -> Result<(u64, CancellationToken), SchedulerError> {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.active.entry(name.to_string()) {
            Entry::Occupied(_) => Err(SchedulerError::DuplicateTask(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok((id, self.root.child_token()))
            }
        }
    }
}

/// Cancel handle for one schedule. Cancelling is idempotent and does not
/// interrupt an invocation that is already running.
#[derive(Clone)]
pub struct TaskHandle {
    name: Arc<str>,
    id: u64,
    token: CancellationToken,
    active: Arc<DashMap<String, u64>>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!(task = %self.name, "cancelling schedule");
        }
        self.token.cancel();
        self.active.remove_if(self.name.as_ref(), |_, v| *v == self.id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Sleeps for `delay`; returns `false` if cancelled first.
async fn sleep_unless_cancelled(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn run_once<T: ScheduledTask>(task: &Arc<T>, on_failure: Option<&TaskFailureFn>) {
    let invocation = Arc::clone(task);
    match tokio::spawn(async move { invocation.run().await }).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(task = task.name(), error = %e, "scheduled task failed");
            if let Some(hook) = on_failure {
                hook(task.name());
            }
        }
        Err(e) => {
            error!(task = task.name(), error = %e, "scheduled task panicked");
            if let Some(hook) = on_failure {
                hook(task.name());
            }
        }
    }
}
