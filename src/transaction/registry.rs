use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::stack::StackSample;

/// A unit of traced work that has started and not yet completed.
#[derive(Debug)]
pub struct InFlightUnit {
    id: u64,
    unit_type: String,
    name: String,
    start_time_ms: u64,
    started: Instant,
    thread_id: i64,
    completed: AtomicBool,
    stack_samples: Mutex<Vec<StackSample>>,
    stack_samples_dropped: AtomicU32,
    partial_stores: AtomicU32,
    last_partial_store_ms: AtomicU64,
    watcher_epoch: AtomicU64,
}

impl InFlightUnit {
    pub(crate) fn new(
        id: u64,
        unit_type: &str,
        name: &str,
        start_time_ms: u64,
        thread_id: i64,
    ) -> Self {
        Self {
            id,
            unit_type: unit_type.to_string(),
            name: name.to_string(),
            start_time_ms,
            started: Instant::now(),
            thread_id,
            completed: AtomicBool::new(false),
            stack_samples: Mutex::new(Vec::new()),
            stack_samples_dropped: AtomicU32::new(0),
            partial_stores: AtomicU32::new(0),
            last_partial_store_ms: AtomicU64::new(0),
            watcher_epoch: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unit_type(&self) -> &str {
        &self.unit_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wall-clock start time in milliseconds since the epoch.
    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    /// Monotonic time since the unit started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// OS thread id of the thread that started the unit.
    pub fn thread_id(&self) -> i64 {
        self.thread_id
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Attaches a stack sample, keeping at most `max` per unit.
    ///
    /// Returns `false` when the sample was discarded because the cap was reached.
    pub fn add_stack_sample(&self, sample: StackSample, max: usize) -> bool {
        let mut samples = self.stack_samples.lock();
        if samples.len() >= max {
            self.stack_samples_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        samples.push(sample);
        true
    }

    pub fn stack_samples(&self) -> Vec<StackSample> {
        self.stack_samples.lock().clone()
    }

    pub fn stack_sample_count(&self) -> usize {
        self.stack_samples.lock().len()
    }

    pub fn partial_stores(&self) -> u32 {
        self.partial_stores.load(Ordering::Relaxed)
    }

    /// Wall-clock time of the last partial store, 0 if none.
    pub fn last_partial_store_ms(&self) -> u64 {
        self.last_partial_store_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_partial_store(&self, at_ms: u64) {
        self.partial_stores.fetch_add(1, Ordering::Relaxed);
        self.last_partial_store_ms.store(at_ms, Ordering::Relaxed);
    }

    /// Epoch of the watcher that last persisted this unit, 0 if none.
    pub fn watcher_epoch(&self) -> u64 {
        self.watcher_epoch.load(Ordering::Relaxed)
    }

    pub(crate) fn set_watcher_epoch(&self, epoch: u64) {
        self.watcher_epoch.store(epoch, Ordering::Relaxed);
    }

    /// Returns `true` only for the caller that performs the transition.
    pub(crate) fn mark_completed(&self) -> bool {
        !self.completed.swap(true, Ordering::AcqRel)
    }

    /// Serializable point-in-time view.
    pub fn snapshot(&self) -> UnitSnapshot {
        UnitSnapshot {
            id: self.id,
            unit_type: self.unit_type.clone(),
            name: self.name.clone(),
            start_time_ms: self.start_time_ms,
            elapsed_ms: self.elapsed().as_millis() as u64,
            thread_id: self.thread_id,
            stack_samples: self.stack_sample_count(),
            stack_samples_dropped: self.stack_samples_dropped.load(Ordering::Relaxed),
            partial_stores: self.partial_stores(),
        }
    }
}

/// Read-only view of an in-flight unit for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSnapshot {
    pub id: u64,
    pub unit_type: String,
    pub name: String,
    pub start_time_ms: u64,
    pub elapsed_ms: u64,
    pub thread_id: i64,
    pub stack_samples: usize,
    pub stack_samples_dropped: u32,
    pub partial_stores: u32,
}

/// Internally synchronized set of in-flight units.
///
/// Only exposes register-start, register-complete and snapshot operations.
#[derive(Debug)]
pub struct UnitRegistry {
    units: DashMap<u64, Arc<InFlightUnit>>,
    next_id: AtomicU64,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self {
            units: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates an id and registers a new unit.
    pub fn register_start(
        &self,
        unit_type: &str,
        name: &str,
        start_time_ms: u64,
        thread_id: i64,
    ) -> Arc<InFlightUnit> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let unit = Arc::new(InFlightUnit::new(id, unit_type, name, start_time_ms, thread_id));
        self.units.insert(id, Arc::clone(&unit));
        unit
    }

    /// Removes a unit. Returns it only for the first caller.
    pub fn register_complete(&self, id: u64) -> Option<Arc<InFlightUnit>> {
        self.units.remove(&id).map(|(_, unit)| unit)
    }

    pub fn get(&self, id: u64) -> Option<Arc<InFlightUnit>> {
        self.units.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of current units ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<InFlightUnit>> {
        let mut units: Vec<Arc<InFlightUnit>> =
            self.units.iter().map(|e| Arc::clone(e.value())).collect();
        units.sort_by_key(|u| u.id());
        units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// OS thread id of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_thread_id() -> i64 {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

/// OS thread id of the calling thread.
#[cfg(not(target_os = "linux"))]
pub fn current_thread_id() -> i64 {
    0
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;

    #[test]
    fn test_register_and_complete() {
        let registry = UnitRegistry::new();
        let a = registry.register_start("Background", "job-a", 1_000, 1);
        let b = registry.register_start("Background", "job-b", 1_000, 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);

        assert!(registry.register_complete(a.id()).is_some());
        assert!(registry.register_complete(a.id()).is_none());

        let ids: Vec<u64> = registry.snapshot().iter().map(|u| u.id()).collect();
        assert_eq!(ids, vec![b.id()]);
    }

    #[test]
    fn test_concurrent_start_complete_leaves_exactly_open_units() {
        let registry = Arc::new(UnitRegistry::new());
        let mut workers = Vec::new();

        for t in 0..8 {
            let registry = Arc::clone(&registry);
            workers.push(thread::spawn(move || {
                let mut kept = Vec::new();
                for i in 0..500 {
                    let unit = registry.register_start("Web", "req", 0, t);
                    if i % 3 == 0 {
                        kept.push(unit.id());
                    } else {
                        assert!(registry.register_complete(unit.id()).is_some());
                    }
                }
                kept
            }));
        }

        let mut expected = HashSet::new();
        for w in workers {
            expected.extend(w.join().expect("worker"));
        }

        let actual: HashSet<u64> = registry.snapshot().iter().map(|u| u.id()).collect();
        assert_eq!(actual, expected);
        assert_eq!(registry.len(), expected.len());
    }

    #[test]
    fn test_stack_samples_capped() {
        let unit = InFlightUnit::new(1, "Background", "job", 0, 1);
        let sample = StackSample {
            timestamp_ms: 10,
            thread_id: 1,
            frames: vec!["S (sleeping) futex_wait".to_string()],
        };

        assert!(unit.add_stack_sample(sample.clone(), 2));
        assert!(unit.add_stack_sample(sample.clone(), 2));
        assert!(!unit.add_stack_sample(sample, 2));

        let snap = unit.snapshot();
        assert_eq!(snap.stack_samples, 2);
        assert_eq!(snap.stack_samples_dropped, 1);
    }

    #[test]
    fn test_mark_completed_once() {
        let unit = InFlightUnit::new(1, "Background", "job", 0, 1);
        assert!(unit.mark_completed());
        assert!(!unit.mark_completed());
        assert!(unit.is_completed());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_current_thread_id_differs_across_threads() {
        let main = current_thread_id();
        let other = thread::spawn(current_thread_id).join().expect("thread");
        assert!(main > 0);
        assert_ne!(main, other);
    }
}
