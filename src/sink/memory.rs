use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use super::Record;
use crate::aggregate::RollupRecord;
use crate::gauge::GaugeSample;
use crate::transaction::TraceRecord;

/// Keeps delivered records in memory. Clones share the same buffer.
///
/// `fail_next(n)` makes the next `n` exports fail, which is how sink-side
/// retry and aggregator re-flush are exercised.
#[derive(Debug, Clone, Default)]
pub struct MemoryExporter {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    records: Mutex<Vec<Record>>,
    fail_next: AtomicU32,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &'static str {
        "memory"
    }

    pub async fn export(&self, record: &Record) -> Result<()> {
        let pending = self.inner.fail_next.load(Ordering::SeqCst);
        if pending > 0
            && self
                .inner
                .fail_next
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            bail!("injected export failure");
        }

        self.inner.records.lock().push(record.clone());
        Ok(())
    }

    /// Fail the next `n` exports.
    pub fn fail_next(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<Record> {
        self.inner.records.lock().clone()
    }

    pub fn rollups(&self) -> Vec<RollupRecord> {
        self.inner
            .records
            .lock()
            .iter()
            .filter_map(|r| match r {
                Record::Rollup(rollup) => Some(rollup.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn traces(&self) -> Vec<TraceRecord> {
        self.inner
            .records
            .lock()
            .iter()
            .filter_map(|r| match r {
                Record::Trace(trace) => Some(trace.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn gauges(&self) -> Vec<GaugeSample> {
        self.inner
            .records
            .lock()
            .iter()
            .filter_map(|r| match r {
                Record::Gauge(sample) => Some(sample.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.inner.records.lock().clear();
    }
}
