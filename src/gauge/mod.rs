//! Gauge sampling.
//!
//! The first sample lands on the next wall-clock multiple of the interval;
//! later samples use fixed-delay scheduling from there. Each sample carries
//! its own timestamp, rounded to the interval, and is forwarded immediately.

pub mod source;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{delay_to_next_boundary, round_to_interval, Clock};
use crate::config::GaugeConfig;
use crate::error::SchedulerError;
use crate::export::HealthMetrics;
use crate::scheduler::{ScheduledTask, SchedulerHandle, TaskHandle};
use crate::sink::{Record, Sink};

pub use source::{GaugeSource, ProcessGauges, StaticGauges, ALL_GAUGE_NAMES};

/// Schedule name of the gauge task.
pub const GAUGE_TASK_NAME: &str = "gauges";

/// One named measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GaugeSample {
    pub name: String,
    pub value: f64,
    pub timestamp_ms: u64,
}

/// Gauge Collector.
pub struct GaugeCollector {
    interval: Duration,
    names: Vec<String>,
    source: Arc<dyn GaugeSource>,
    clock: Arc<dyn Clock>,
    sink: Arc<Sink>,
    scheduler: SchedulerHandle,
    metrics: Option<Arc<HealthMetrics>>,
    task: Mutex<Option<TaskHandle>>,
}

impl std::fmt::Debug for GaugeCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaugeCollector")
            .field("interval", &self.interval)
            .field("names", &self.names)
            .finish()
    }
}

impl GaugeCollector {
    pub fn new(
        cfg: &GaugeConfig,
        source: Arc<dyn GaugeSource>,
        clock: Arc<dyn Clock>,
        sink: Arc<Sink>,
        scheduler: SchedulerHandle,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            interval: cfg.interval,
            names: cfg.names.clone(),
            source,
            clock,
            sink,
            scheduler,
            metrics,
            task: Mutex::new(None),
        }
    }

    /// Delay before the first sample: up to the next interval boundary.
    pub fn initial_delay(&self) -> Duration {
        delay_to_next_boundary(self.clock.now_millis(), self.interval)
    }

    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let initial = self.initial_delay();
        let handle =
            self.scheduler
                .schedule_fixed_delay(Arc::clone(self), initial, self.interval)?;
        *self.task.lock() = Some(handle);

        info!(interval = ?self.interval, ?initial, gauges = self.names.len(), "gauge collector started");
        Ok(())
    }

    /// Reads every configured gauge. Unreadable gauges are logged and skipped.
    ///
    /// Returns the samples and the number of gauges that could not be read.
    pub fn sample_once(&self) -> (Vec<GaugeSample>, usize) {
        let timestamp_ms = round_to_interval(self.clock.now_millis(), self.interval);
        let mut samples = Vec::with_capacity(self.names.len());
        let mut failed = 0;

        for name in &self.names {
            match self.source.read(name) {
                Ok(value) => samples.push(GaugeSample {
                    name: name.clone(),
                    value,
                    timestamp_ms,
                }),
                Err(e) => {
                    warn!(gauge = %name, error = %e, "gauge read failed");
                    failed += 1;
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.gauge_samples.inc_by(samples.len() as f64);
        }

        (samples, failed)
    }

    /// Cancels the schedule. Samples are forwarded as they are taken, so
    /// nothing is left to flush.
    pub fn close(&self) {
        if let Some(handle) = self.task.lock().as_ref() {
            handle.cancel();
        }
    }
}

impl ScheduledTask for GaugeCollector {
    fn name(&self) -> &str {
        GAUGE_TASK_NAME
    }

    async fn run(&self) -> Result<()> {
        let (samples, failed) = self.sample_once();

        for sample in samples {
            // Delivery failures are logged and counted by the sink.
            let _ = self.sink.submit(&Record::Gauge(sample)).await;
        }

        if failed > 0 {
            bail!("{failed} of {} gauges could not be read", self.names.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::Scheduler;
    use crate::sink::{Exporter, MemoryExporter, RetryPolicy};

    fn collector(
        now_ms: u64,
        source: Arc<StaticGauges>,
        names: &[&str],
    ) -> (Scheduler, Arc<GaugeCollector>, MemoryExporter) {
        let scheduler = Scheduler::new(1).expect("scheduler");
        let memory = MemoryExporter::new();
        let sink = Arc::new(Sink::new(
            vec![Exporter::Memory(memory.clone())],
            RetryPolicy::default(),
        ));
        let cfg = GaugeConfig {
            interval: Duration::from_secs(5),
            names: names.iter().map(|s| s.to_string()).collect(),
        };
        let gauges = Arc::new(GaugeCollector::new(
            &cfg,
            source,
            Arc::new(ManualClock::new(now_ms)),
            sink,
            scheduler.handle(),
            None,
        ));
        (scheduler, gauges, memory)
    }

    #[test]
    fn test_initial_delay_aligns_to_boundary() {
        let source = Arc::new(StaticGauges::new());
        let (_s, gauges, _m) = collector(12_300, source, &["process.threads"]);
        assert_eq!(gauges.initial_delay(), Duration::from_millis(2_700));
    }

    #[test]
    fn test_initial_delay_zero_on_boundary() {
        let source = Arc::new(StaticGauges::new());
        let (_s, gauges, _m) = collector(15_000, source, &["process.threads"]);
        assert_eq!(gauges.initial_delay(), Duration::ZERO);
    }

    #[test]
    fn test_sample_once_rounds_timestamp_and_skips_unreadable() {
        let source = Arc::new(StaticGauges::new());
        source.set("process.threads", 9.0);
        let (_s, gauges, _m) =
            collector(15_012, source, &["process.threads", "process.rss_bytes"]);

        let (samples, failed) = gauges.sample_once();
        assert_eq!(failed, 1);
        assert_eq!(
            samples,
            vec![GaugeSample {
                name: "process.threads".to_string(),
                value: 9.0,
                timestamp_ms: 15_000,
            }]
        );
    }

    #[test]
    fn test_run_forwards_samples_and_reports_read_failures() {
        let source = Arc::new(StaticGauges::new());
        source.set("process.threads", 3.0);
        let (scheduler, gauges, memory) =
            collector(20_000, source, &["process.threads", "process.open_fds"]);

        let result = scheduler.handle().block_on(gauges.run());
        assert!(result.is_err());
        assert_eq!(memory.gauges().len(), 1);
    }

    #[test]
    fn test_removed_gauge_fails_next_cycle() {
        let source = Arc::new(StaticGauges::new());
        source.set("process.threads", 3.0);
        source.set("process.open_fds", 12.0);
        let (_s, gauges, _m) = collector(
            20_000,
            Arc::clone(&source),
            &["process.threads", "process.open_fds"],
        );

        let (samples, failed) = gauges.sample_once();
        assert_eq!((samples.len(), failed), (2, 0));

        source.remove("process.open_fds");
        let (samples, failed) = gauges.sample_once();
        assert_eq!(failed, 1);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "process.threads");
    }

    #[test]
    fn test_close_is_idempotent() {
        let source = Arc::new(StaticGauges::new());
        source.set("process.threads", 1.0);
        let (scheduler, gauges, _m) = collector(0, source, &["process.threads"]);

        gauges.start().expect("start");
        gauges.close();
        gauges.close();
        assert!(scheduler.handle().active_task_names().is_empty());
    }
}
