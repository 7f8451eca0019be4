use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;

use crate::transaction::TransactionCollector;

/// Every gauge name the agent knows how to read.
pub const ALL_GAUGE_NAMES: &[&str] = &[
    "process.rss_bytes",
    "process.threads",
    "process.open_fds",
    "process.cpu_seconds",
    "agent.in_flight_units",
];

/// Reads the current value of a named gauge.
pub trait GaugeSource: Send + Sync {
    fn read(&self, name: &str) -> Result<f64>;
}

/// Gauges of the current process from procfs, plus agent-internal gauges.
#[derive(Debug, Default)]
pub struct ProcessGauges {
    transactions: Option<Arc<TransactionCollector>>,
}

impl ProcessGauges {
    pub fn new(transactions: Option<Arc<TransactionCollector>>) -> Self {
        Self { transactions }
    }
}

impl GaugeSource for ProcessGauges {
    fn read(&self, name: &str) -> Result<f64> {
        match name {
            "process.rss_bytes" => {
                let status = read_proc_self("status")?;
                parse_proc_status_kb_bytes(&status, "VmRSS:")
                    .map(|v| v as f64)
                    .ok_or_else(|| anyhow!("VmRSS missing from /proc/self/status"))
            }
            "process.threads" => {
                let status = read_proc_self("status")?;
                parse_proc_status_u64(&status, "Threads:")
                    .map(|v| v as f64)
                    .ok_or_else(|| anyhow!("Threads missing from /proc/self/status"))
            }
            "process.open_fds" => read_proc_fd_count().map(|v| v as f64),
            "process.cpu_seconds" => {
                let stat = read_proc_self("stat")?;
                let ticks = parse_proc_stat_cpu_ticks(&stat)
                    .ok_or_else(|| anyhow!("malformed /proc/self/stat"))?;
                Ok(ticks as f64 / clock_ticks_per_second())
            }
            "agent.in_flight_units" => Ok(self
                .transactions
                .as_ref()
                .map_or(0, |t| t.in_flight_count()) as f64),
            other => bail!("unknown gauge: {other}"),
        }
    }
}

/// Fixed values for tests. Names without a value fail to read.
#[derive(Debug, Default)]
pub struct StaticGauges {
    values: Mutex<HashMap<String, f64>>,
}

impl StaticGauges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: f64) {
        self.values.lock().insert(name.to_string(), value);
    }

    pub fn remove(&self, name: &str) {
        self.values.lock().remove(name);
    }
}

impl GaugeSource for StaticGauges {
    fn read(&self, name: &str) -> Result<f64> {
        self.values
            .lock()
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("gauge {name} unavailable"))
    }
}

fn read_proc_self(file: &str) -> Result<String> {
    let path = format!("/proc/self/{file}");
    fs::read_to_string(&path).with_context(|| format!("reading {path}"))
}

fn read_proc_fd_count() -> Result<u64> {
    let entries = fs::read_dir("/proc/self/fd").context("reading /proc/self/fd")?;
    Ok(entries.filter(|e| e.is_ok()).count() as u64)
}

fn clock_ticks_per_second() -> f64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

fn parse_proc_status_kb_bytes(status: &str, key: &str) -> Option<u64> {
    parse_proc_status_u64(status, key).map(|v| v.saturating_mul(1024))
}

fn parse_proc_status_u64(status: &str, key: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            let mut parts = rest.split_whitespace();
            return parts.next()?.parse::<u64>().ok();
        }
    }
    None
}

/// utime + stime from a stat line. The comm field may contain spaces, so
/// fields are counted after the closing parenthesis.
pub(crate) fn parse_proc_stat_cpu_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Field 3 (state) is index 0 here; utime is field 14, stime field 15.
    let utime = fields.get(11)?.parse::<u64>().ok()?;
    let stime = fields.get(12)?.parse::<u64>().ok()?;
    Some(utime + stime)
}
