//! Telemetry sink.
//!
//! Every finalized record (rollup window, trace, gauge sample) goes through
//! [`Sink::submit`], which fans it out to the configured exporters and retries
//! each one according to the [`RetryPolicy`]. Failures are logged and counted
//! here; callers on the telemetry path only see a `Result` they may ignore.

pub mod exporter;
pub mod log;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, error};

use crate::aggregate::RollupRecord;
use crate::config::{ExporterKind, RetryConfig, SinkConfig};
use crate::export::HealthMetrics;
use crate::gauge::GaugeSample;
use crate::transaction::TraceRecord;

pub use exporter::Exporter;
pub use log::LogExporter;
pub use memory::MemoryExporter;

/// A finalized telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Rollup(RollupRecord),
    Trace(TraceRecord),
    Gauge(GaugeSample),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rollup(_) => "rollup",
            Self::Trace(_) => "trace",
            Self::Gauge(_) => "gauge",
        }
    }
}

/// Per-exporter retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff: cfg.backoff,
        }
    }
}

/// Fan-out dispatcher with retry.
pub struct Sink {
    exporters: Vec<Exporter>,
    retry: RetryPolicy,
    metrics: Option<Arc<HealthMetrics>>,
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.exporters.iter().map(Exporter::name).collect();
        f.debug_struct("Sink")
            .field("exporters", &names)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Sink {
    pub fn new(exporters: Vec<Exporter>, retry: RetryPolicy) -> Self {
        Self {
            exporters,
            retry,
            metrics: None,
        }
    }

    /// Builds the exporters named in the configuration.
    pub fn from_config(cfg: &SinkConfig) -> Self {
        let exporters = cfg
            .exporters
            .iter()
            .map(|kind| match kind {
                ExporterKind::Log => Exporter::Log(LogExporter::new()),
                ExporterKind::Memory => Exporter::Memory(MemoryExporter::new()),
            })
            .collect();

        Self::new(exporters, RetryPolicy::from(&cfg.retry))
    }

    /// Attaches self-metrics for exporter error counting.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn exporter_names(&self) -> Vec<&str> {
        self.exporters.iter().map(Exporter::name).collect()
    }

    /// First in-memory exporter, if one is configured.
    pub fn memory(&self) -> Option<&MemoryExporter> {
        self.exporters.iter().find_map(|e| match e {
            Exporter::Memory(m) => Some(m),
            _ => None,
        })
    }

    /// Delivers `record` to every exporter.
    ///
    /// Returns an error if any exporter exhausted its retries. The failure has
    /// already been logged when this returns.
    pub async fn submit(&self, record: &Record) -> Result<()> {
        let mut failed = Vec::new();

        for exporter in &self.exporters {
            if let Err(e) = self.export_with_retry(exporter, record).await {
                error!(
                    exporter = exporter.name(),
                    kind = record.kind(),
                    error = %e,
                    "sink delivery failed",
                );
                if let Some(metrics) = &self.metrics {
                    metrics
                        .exporter_errors
                        .with_label_values(&[exporter.name()])
                        .inc();
                }
                failed.push(exporter.name());
            }
        }

        if !failed.is_empty() {
            bail!(
                "{} record not delivered to: {}",
                record.kind(),
                failed.join(", ")
            );
        }

        Ok(())
    }

    async fn export_with_retry(&self, exporter: &Exporter, record: &Record) -> Result<()> {
        let mut attempt = 1;
        loop {
            match exporter.export(record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_attempts => {
                    debug!(
                        exporter = exporter.name(),
                        attempt,
                        error = %e,
                        "export attempt failed, retrying",
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(e) => {
                    return Err(e.context(format!("after {attempt} attempts")));
                }
            }
        }
    }
}
