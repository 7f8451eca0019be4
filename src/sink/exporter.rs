use anyhow::Result;

use super::log::LogExporter;
use super::memory::MemoryExporter;
use super::Record;

/// Exporter dispatches records to a concrete backend.
///
/// Uses enum dispatch rather than trait objects so the async export call
/// needs no boxed future.
#[derive(Debug, Clone)]
pub enum Exporter {
    Log(LogExporter),
    Memory(MemoryExporter),
}

impl Exporter {
    /// Returns the exporter name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Log(e) => e.name(),
            Self::Memory(e) => e.name(),
        }
    }

    /// Export one record.
    pub async fn export(&self, record: &Record) -> Result<()> {
        match self {
            Self::Log(e) => e.export(record).await,
            Self::Memory(e) => e.export(record).await,
        }
    }
}
