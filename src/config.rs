use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::gauge::ALL_GAUGE_NAMES;
use crate::instrumentation::{ConflictPolicy, MatchingRule};

/// Top-level configuration for the vigil agent. Read once at construction.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Number of background scheduler threads. Default: 2.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum wait for background work during shutdown. Default: 10s.
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Rollup aggregation configuration.
    #[serde(default)]
    pub rollup: RollupConfig,

    /// Transaction capture configuration.
    #[serde(default)]
    pub transactions: TransactionConfig,

    /// Gauge sampling configuration.
    #[serde(default)]
    pub gauges: GaugeConfig,

    /// Stack sampling configuration.
    #[serde(default)]
    pub stack_traces: StackTraceConfig,

    /// Long-running unit persistence configuration.
    #[serde(default)]
    pub immediate_store: ImmediateStoreConfig,

    /// Telemetry sink configuration.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Instrumentation rules handed to the activator.
    #[serde(default)]
    pub instrumentation: InstrumentationConfig,

    /// Plugin adapters to activate by name.
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Self-metrics HTTP server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Rollup aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    /// Width of one rollup window. Default: 60s.
    #[serde(default = "default_rollup_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Raw durations kept per unit type before falling back to buckets. Default: 1024.
    #[serde(default = "default_max_raw_durations")]
    pub max_raw_durations: usize,

    /// Delivered windows whose unit ids are remembered to drop repeated
    /// reports. Default: 16.
    #[serde(default = "default_dedup_windows")]
    pub dedup_windows: usize,
}

/// Transaction capture configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionConfig {
    /// Units at least this slow are always stored. Default: 2s.
    #[serde(default = "default_slow_threshold", with = "humantime_serde")]
    pub slow_threshold: Duration,

    /// Probability of storing a fast, successful unit. Default: 1.0.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// Upper bound on sampled (non-error, non-slow) traces per second. 0 = unlimited.
    #[serde(default)]
    pub max_traces_per_second: u32,

    /// Maximum traces waiting for the sink. Default: 100.
    #[serde(default = "default_pending_limit")]
    pub pending_limit: usize,

    /// How often pending traces are handed to the sink. Default: 1s.
    #[serde(default = "default_store_interval", with = "humantime_serde")]
    pub store_interval: Duration,

    /// Stack samples retained per unit. Default: 1000.
    #[serde(default = "default_max_stack_samples")]
    pub max_stack_samples: usize,
}

/// Gauge sampling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GaugeConfig {
    /// Sampling interval; samples align to multiples of it. Default: 5s.
    #[serde(default = "default_gauge_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Gauge names to sample.
    #[serde(default = "default_gauge_names")]
    pub names: Vec<String>,
}

/// Stack sampling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StackTraceConfig {
    /// Enable stack sampling. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Only units running longer than this are sampled. Default: 1s.
    #[serde(default = "default_stack_threshold", with = "humantime_serde")]
    pub threshold: Duration,

    /// Lower bound of the randomized cycle delay. Default: 50ms.
    #[serde(default = "default_stack_min_interval", with = "humantime_serde")]
    pub min_interval: Duration,

    /// Upper bound of the randomized cycle delay. Default: 150ms.
    #[serde(default = "default_stack_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,
}

/// Long-running unit persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ImmediateStoreConfig {
    /// Units older than this get a partial trace stored. Default: 60s.
    #[serde(default = "default_immediate_threshold", with = "humantime_serde")]
    pub threshold: Duration,

    /// Scan period. Default: 1s.
    #[serde(default = "default_immediate_period", with = "humantime_serde")]
    pub period: Duration,

    /// Store another partial trace this long after the previous one.
    /// Absent: one partial trace per unit.
    #[serde(default, with = "humantime_serde")]
    pub repeat_interval: Option<Duration>,
}

/// Telemetry sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Exporters receiving every record. Default: [log].
    #[serde(default = "default_exporters")]
    pub exporters: Vec<ExporterKind>,

    /// Per-record retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Exporter backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExporterKind {
    /// Emit records as JSON log lines.
    Log,
    /// Keep records in memory (tests, embedding).
    Memory,
}

/// Sink-side retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts per exporter per record. Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts. Default: 100ms.
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,
}

/// Instrumentation rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstrumentationConfig {
    #[serde(default)]
    pub rules: Vec<MatchingRule>,

    #[serde(default)]
    pub on_conflict: ConflictPolicy,
}

/// Self-metrics HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics, /healthz and /live/*. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_rollup_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_raw_durations() -> usize {
    1024
}

fn default_dedup_windows() -> usize {
    crate::aggregate::DEFAULT_DEDUP_WINDOWS
}

fn default_slow_threshold() -> Duration {
    Duration::from_secs(2)
}

fn default_sampling_rate() -> f64 {
    1.0
}

fn default_pending_limit() -> usize {
    100
}

fn default_store_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_stack_samples() -> usize {
    1000
}

fn default_gauge_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_gauge_names() -> Vec<String> {
    [
        "process.rss_bytes",
        "process.threads",
        "process.open_fds",
        "process.cpu_seconds",
        "agent.in_flight_units",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_true() -> bool {
    true
}

fn default_stack_threshold() -> Duration {
    Duration::from_secs(1)
}

fn default_stack_min_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_stack_max_interval() -> Duration {
    Duration::from_millis(150)
}

fn default_immediate_threshold() -> Duration {
    Duration::from_secs(60)
}

fn default_immediate_period() -> Duration {
    Duration::from_secs(1)
}

fn default_exporters() -> Vec<ExporterKind> {
    vec![ExporterKind::Log]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            workers: default_workers(),
            drain_timeout: default_drain_timeout(),
            rollup: RollupConfig::default(),
            transactions: TransactionConfig::default(),
            gauges: GaugeConfig::default(),
            stack_traces: StackTraceConfig::default(),
            immediate_store: ImmediateStoreConfig::default(),
            sink: SinkConfig::default(),
            instrumentation: InstrumentationConfig::default(),
            plugins: Vec::new(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            interval: default_rollup_interval(),
            max_raw_durations: default_max_raw_durations(),
            dedup_windows: default_dedup_windows(),
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            slow_threshold: default_slow_threshold(),
            sampling_rate: default_sampling_rate(),
            max_traces_per_second: 0,
            pending_limit: default_pending_limit(),
            store_interval: default_store_interval(),
            max_stack_samples: default_max_stack_samples(),
        }
    }
}

impl Default for GaugeConfig {
    fn default() -> Self {
        Self {
            interval: default_gauge_interval(),
            names: default_gauge_names(),
        }
    }
}

impl Default for StackTraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_stack_threshold(),
            min_interval: default_stack_min_interval(),
            max_interval: default_stack_max_interval(),
        }
    }
}

impl Default for ImmediateStoreConfig {
    fn default() -> Self {
        Self {
            threshold: default_immediate_threshold(),
            period: default_immediate_period(),
            repeat_interval: None,
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            exporters: default_exporters(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be positive");
        }

        if self.drain_timeout.is_zero() {
            bail!("drain_timeout must be positive");
        }

        if self.rollup.interval.as_millis() == 0 {
            bail!("rollup.interval must be at least 1ms");
        }

        if self.rollup.dedup_windows == 0 {
            bail!("rollup.dedup_windows must be positive");
        }

        let rate = self.transactions.sampling_rate;
        if !(0.0..=1.0).contains(&rate) {
            bail!("transactions.sampling_rate must be within [0, 1], got {rate}");
        }

        if self.transactions.pending_limit == 0 {
            bail!("transactions.pending_limit must be positive");
        }

        if self.transactions.store_interval.is_zero() {
            bail!("transactions.store_interval must be positive");
        }

        if self.gauges.interval.as_millis() == 0 {
            bail!("gauges.interval must be at least 1ms");
        }

        let known: HashSet<&str> = ALL_GAUGE_NAMES.iter().copied().collect();
        let mut seen = HashSet::new();
        for name in &self.gauges.names {
            if !known.contains(name.as_str()) {
                bail!("unknown gauge: {name}");
            }
            if !seen.insert(name.as_str()) {
                bail!("gauge listed more than once: {name}");
            }
        }

        if self.stack_traces.min_interval.is_zero() {
            bail!("stack_traces.min_interval must be positive");
        }

        if self.stack_traces.min_interval > self.stack_traces.max_interval {
            bail!(
                "stack_traces.min_interval {:?} exceeds max_interval {:?}",
                self.stack_traces.min_interval,
                self.stack_traces.max_interval
            );
        }

        if self.immediate_store.period.is_zero() {
            bail!("immediate_store.period must be positive");
        }

        if let Some(repeat) = self.immediate_store.repeat_interval {
            if repeat.is_zero() {
                bail!("immediate_store.repeat_interval must be positive when set");
            }
        }

        if self.sink.retry.max_attempts == 0 {
            bail!("sink.retry.max_attempts must be positive");
        }

        for rule in &self.instrumentation.rules {
            if rule.class_name.is_empty() || rule.method_name.is_empty() {
                bail!("instrumentation rule requires class_name and method_name");
            }
            if rule.unit_type.is_empty() {
                bail!(
                    "instrumentation rule {}.{} requires unit_type",
                    rule.class_name,
                    rule.method_name
                );
            }
        }

        let mut plugins = HashSet::new();
        for name in &self.plugins {
            if name.is_empty() {
                bail!("plugin names must not be empty");
            }
            if !plugins.insert(name.as_str()) {
                bail!("plugin listed more than once: {name}");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.drain_timeout, Duration::from_secs(10));
        assert_eq!(cfg.rollup.interval, Duration::from_secs(60));
        assert_eq!(cfg.rollup.dedup_windows, 16);
        assert_eq!(cfg.gauges.interval, Duration::from_secs(5));
        assert_eq!(cfg.sink.exporters, vec![ExporterKind::Log]);
        assert!(cfg.immediate_store.repeat_interval.is_none());
        assert!(!cfg.health.enabled);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn test_parse_yaml_with_durations() {
        let yaml = r#"
workers: 3
drain_timeout: 5s
rollup:
  interval: 30s
transactions:
  slow_threshold: 500ms
  sampling_rate: 0.25
gauges:
  interval: 1s
  names: [process.threads]
stack_traces:
  threshold: 200ms
  min_interval: 10ms
  max_interval: 20ms
immediate_store:
  threshold: 5s
  repeat_interval: 30s
sink:
  exporters: [memory, log]
  retry:
    max_attempts: 5
    backoff: 10ms
instrumentation:
  on_conflict: first_wins
  rules:
    - unit_type: Background
      class_name: org.quartz.Job
      method_name: execute
plugins: [quartz]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.drain_timeout, Duration::from_secs(5));
        assert_eq!(cfg.rollup.interval, Duration::from_secs(30));
        assert_eq!(cfg.transactions.slow_threshold, Duration::from_millis(500));
        assert_eq!(cfg.gauges.names, vec!["process.threads".to_string()]);
        assert_eq!(cfg.immediate_store.repeat_interval, Some(Duration::from_secs(30)));
        assert_eq!(cfg.sink.exporters, vec![ExporterKind::Memory, ExporterKind::Log]);
        assert_eq!(cfg.instrumentation.on_conflict, ConflictPolicy::FirstWins);
        assert_eq!(cfg.instrumentation.rules.len(), 1);
        assert_eq!(cfg.plugins, vec!["quartz".to_string()]);
        // Unspecified sections keep defaults.
        assert_eq!(cfg.immediate_store.period, Duration::from_secs(1));
        cfg.validate().expect("valid");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "workers: 4\ngauges:\n  interval: 2s").expect("write");

        let cfg = Config::load(file.path()).expect("load");
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.gauges.interval, Duration::from_secs(2));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "workers: 0").expect("write");

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_validation_sampling_rate_out_of_range() {
        let mut cfg = Config::default();
        cfg.transactions.sampling_rate = 1.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sampling_rate"));
    }

    #[test]
    fn test_validation_zero_dedup_windows() {
        let mut cfg = Config::default();
        cfg.rollup.dedup_windows = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("dedup_windows"));
    }

    #[test]
    fn test_validation_unknown_gauge() {
        let mut cfg = Config::default();
        cfg.gauges.names = vec!["process.bogus".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown gauge"));
    }

    #[test]
    fn test_validation_duplicate_gauge() {
        let mut cfg = Config::default();
        cfg.gauges.names = vec!["process.threads".to_string(), "process.threads".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validation_stack_interval_order() {
        let mut cfg = Config::default();
        cfg.stack_traces.min_interval = Duration::from_millis(200);
        cfg.stack_traces.max_interval = Duration::from_millis(100);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds max_interval"));
    }

    #[test]
    fn test_validation_zero_retry_attempts() {
        let mut cfg = Config::default();
        cfg.sink.retry.max_attempts = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_validation_rule_requires_unit_type() {
        let mut cfg = Config::default();
        cfg.instrumentation.rules.push(MatchingRule {
            unit_type: String::new(),
            class_name: "org.quartz.Job".to_string(),
            method_name: "execute".to_string(),
        });
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unit_type"));
    }

    #[test]
    fn test_validation_duplicate_plugin() {
        let mut cfg = Config::default();
        cfg.plugins = vec!["quartz".to_string(), "quartz".to_string()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("plugin listed more than once"));
    }
}
