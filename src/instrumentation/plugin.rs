use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use crate::error::LoadError;
use crate::transaction::TransactionCollector;

/// What an adapter gets when it is activated.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub transactions: Arc<TransactionCollector>,
}

/// Framework-specific instrumentation loaded by name.
pub trait InstrumentationAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Hooks the adapter into the running agent.
    fn activate(&self, ctx: &AdapterContext) -> Result<()>;
}

/// Builds an adapter instance.
pub type AdapterFactory = Box<dyn Fn() -> Result<Box<dyn InstrumentationAdapter>> + Send + Sync>;

/// Name-keyed table of adapter factories.
#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn InstrumentationAdapter>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn load_by_name(&self, name: &str) -> Result<Box<dyn InstrumentationAdapter>, LoadError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;

        factory().map_err(|source| LoadError::Failed {
            name: name.to_string(),
            source,
        })
    }
}
