use std::collections::{BTreeMap, HashSet};

use super::stats::{TypeSummary, UnitTypeAggregate};
use super::{CompletedUnit, RollupRecord};

/// Accumulator for one rollup window, keyed by unit type.
#[derive(Debug)]
pub struct Window {
    start_ms: u64,
    end_ms: u64,
    by_type: BTreeMap<String, UnitTypeAggregate>,
    unit_ids: HashSet<u64>,
}

impl Window {
    pub fn new(start_ms: u64, width_ms: u64) -> Self {
        Self {
            start_ms,
            end_ms: start_ms + width_ms,
            by_type: BTreeMap::new(),
            unit_ids: HashSet::new(),
        }
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    pub fn end_ms(&self) -> u64 {
        self.end_ms
    }

    pub fn unit_ids(&self) -> &HashSet<u64> {
        &self.unit_ids
    }

    pub fn record(&mut self, unit: &CompletedUnit, max_raw_durations: usize) {
        self.unit_ids.insert(unit.id);
        self.by_type
            .entry(unit.unit_type.clone())
            .or_insert_with(|| UnitTypeAggregate::new(max_raw_durations))
            .record(unit.duration_nanos, unit.error);
    }

    pub fn count(&self) -> u64 {
        self.by_type.values().map(UnitTypeAggregate::count).sum()
    }

    pub fn to_record(&self) -> RollupRecord {
        let unit_types: Vec<TypeSummary> = self
            .by_type
            .iter()
            .map(|(unit_type, agg)| agg.snapshot(unit_type))
            .collect();

        RollupRecord {
            window_start_ms: self.start_ms,
            window_end_ms: self.end_ms,
            count: self.count(),
            unit_types,
        }
    }
}
