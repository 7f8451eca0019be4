use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentState;

/// Errors that fail an agent lifecycle operation.
///
/// Only activation and drain timeout are allowed to fail the operation they
/// belong to; everything else is logged and absorbed by the collector that hit it.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Instrumentation could not be activated; startup aborts.
    #[error("instrumentation activation failed: {0}")]
    Activation(#[from] ActivationError),

    /// Configuration rejected at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Scheduler refused a registration during startup.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Background tasks did not finish within the drain timeout.
    #[error("could not terminate agent scheduler within {timeout:?}")]
    DrainTimeout { timeout: Duration },

    /// Operation not allowed in the current lifecycle state.
    #[error("operation not allowed in state {0:?}")]
    InvalidState(AgentState),

    /// Startup step failed outside the activation path.
    #[error("startup failed: {0:#}")]
    Startup(#[source] anyhow::Error),
}

/// Instrumentation activation failures.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// The interception capability is not present on this host.
    #[error("instrumentation capability unavailable: {0}")]
    Unavailable(String),

    /// Two rules claim the same code path for different unit types.
    #[error("conflicting instrumentation rules for {target}: {first} vs {second}")]
    Conflict {
        target: String,
        first: String,
        second: String,
    },
}

/// Scheduler registration failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Drain has started; no new work is accepted.
    #[error("scheduler is closed")]
    Closed,

    /// A schedule with this name is already active.
    #[error("task '{0}' is already scheduled")]
    DuplicateTask(String),

    /// Period must be non-zero.
    #[error("task '{0}' has a zero period")]
    ZeroPeriod(String),
}

/// Plugin adapter load failures. Never fatal to the agent.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("adapter '{0}' not found")]
    NotFound(String),

    #[error("adapter '{name}' failed to initialize: {source:#}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}
