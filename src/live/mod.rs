//! Read-only introspection over agent state, safe to call concurrently with
//! collection.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::gauge::{GaugeSource, ProcessGauges};
use crate::instrumentation::{Activation, MatchingRule};
use crate::transaction::{TransactionCollector, UnitSnapshot};

/// The three live services, as handed to the management surface.
#[derive(Debug)]
pub struct LiveServices {
    pub traces: LiveTraceRepository,
    pub instrumentation: LiveInstrumentationService,
    pub process: LiveProcessService,
}

/// In-flight unit queries.
#[derive(Debug)]
pub struct LiveTraceRepository {
    transactions: Arc<TransactionCollector>,
}

impl LiveTraceRepository {
    pub fn new(transactions: Arc<TransactionCollector>) -> Self {
        Self { transactions }
    }

    pub fn in_flight(&self) -> Vec<UnitSnapshot> {
        self.transactions
            .in_flight()
            .iter()
            .map(|u| u.snapshot())
            .collect()
    }

    pub fn unit(&self, id: u64) -> Option<UnitSnapshot> {
        self.transactions.unit(id).map(|u| u.snapshot())
    }
}

/// Current instrumentation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstrumentationState {
    pub retransform_supported: bool,
    pub rules: Vec<MatchingRule>,
    pub loaded_adapters: Vec<String>,
    pub failed_adapters: Vec<String>,
}

#[derive(Debug)]
pub struct LiveInstrumentationService {
    state: RwLock<InstrumentationState>,
}

impl LiveInstrumentationService {
    pub fn new(activation: &Activation) -> Self {
        Self {
            state: RwLock::new(InstrumentationState {
                retransform_supported: activation.retransform_supported,
                rules: activation.active_rules.clone(),
                loaded_adapters: Vec::new(),
                failed_adapters: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> InstrumentationState {
        self.state.read().clone()
    }

    pub(crate) fn record_adapter(&self, name: &str, loaded: bool) {
        let mut state = self.state.write();
        if loaded {
            state.loaded_adapters.push(name.to_string());
        } else {
            state.failed_adapters.push(name.to_string());
        }
    }
}

/// Process-level facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessFacts {
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u64>,
    pub uptime_ms: u64,
    pub agent_version: String,
    pub scheduler_workers: usize,
    pub stack_sampling_available: bool,
}

#[derive(Debug)]
pub struct LiveProcessService {
    started: Instant,
    scheduler_workers: usize,
    stack_sampling_available: bool,
}

impl LiveProcessService {
    pub fn new(scheduler_workers: usize, stack_sampling_available: bool) -> Self {
        Self {
            started: Instant::now(),
            scheduler_workers,
            stack_sampling_available,
        }
    }

    pub fn facts(&self) -> ProcessFacts {
        ProcessFacts {
            pid: std::process::id(),
            threads: ProcessGauges::default()
                .read("process.threads")
                .ok()
                .map(|v| v as u64),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            scheduler_workers: self.scheduler_workers,
            stack_sampling_available: self.stack_sampling_available,
        }
    }
}
