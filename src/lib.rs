//! In-process monitoring agent.
//!
//! Activates instrumentation, runs the telemetry collectors on a small shared
//! background scheduler and shuts them down in a fixed order.

pub mod agent;
pub mod aggregate;
pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod gauge;
pub mod instrumentation;
pub mod live;
pub mod random;
pub mod scheduler;
pub mod sink;
pub mod stack;
pub mod transaction;
pub mod watcher;

pub use agent::{Agent, AgentState, Collaborators, ShutdownHook, ShutdownStep};
pub use config::Config;
pub use error::{ActivationError, AgentError, LoadError, SchedulerError};
