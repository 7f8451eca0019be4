use serde::Serialize;

use super::histogram::{HistogramSnapshot, LazyHistogram};

/// Tracks duration and error statistics for one unit type within one window.
#[derive(Debug, Clone)]
pub struct UnitTypeAggregate {
    count: u64,
    error_count: u64,
    total_nanos: u64,
    min_nanos: u64,
    max_nanos: u64,
    histogram: LazyHistogram,
}

impl UnitTypeAggregate {
    pub fn new(max_raw_durations: usize) -> Self {
        Self {
            count: 0,
            error_count: 0,
            total_nanos: 0,
            min_nanos: u64::MAX,
            max_nanos: 0,
            histogram: LazyHistogram::new(max_raw_durations),
        }
    }

    /// Records one completed unit.
    pub fn record(&mut self, duration_nanos: u64, error: bool) {
        self.count += 1;
        if error {
            self.error_count += 1;
        }
        self.total_nanos = self.total_nanos.saturating_add(duration_nanos);
        self.min_nanos = self.min_nanos.min(duration_nanos);
        self.max_nanos = self.max_nanos.max(duration_nanos);
        self.histogram.record(duration_nanos);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn snapshot(&self, unit_type: &str) -> TypeSummary {
        TypeSummary {
            unit_type: unit_type.to_string(),
            count: self.count,
            error_count: self.error_count,
            total_nanos: self.total_nanos,
            min_nanos: if self.count == 0 { 0 } else { self.min_nanos },
            max_nanos: self.max_nanos,
            histogram: self.histogram.snapshot(),
        }
    }
}

/// Statistics for one unit type in a flushed window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeSummary {
    pub unit_type: String,
    pub count: u64,
    pub error_count: u64,
    pub total_nanos: u64,
    pub min_nanos: u64,
    pub max_nanos: u64,
    pub histogram: HistogramSnapshot,
}
