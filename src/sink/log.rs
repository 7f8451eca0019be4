use anyhow::{Context, Result};

use super::Record;

/// Writes each record as a JSON log line under the `vigil::telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExporter;

impl LogExporter {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &'static str {
        "log"
    }

    pub async fn export(&self, record: &Record) -> Result<()> {
        let json = serde_json::to_string(record)
            .with_context(|| format!("serializing {} record", record.kind()))?;

        tracing::info!(
            target: "vigil::telemetry",
            kind = record.kind(),
            record = %json,
            "telemetry",
        );

        Ok(())
    }
}
