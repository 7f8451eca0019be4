//! Agent orchestrator.
//!
//! Owns the scheduler and every collector. Startup and shutdown run in a
//! fixed order so that each component only ever sees fully initialized
//! collaborators.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, error, info, warn};

use crate::aggregate::Aggregator;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{AgentError, LoadError};
use crate::export::{health, HealthMetrics};
use crate::gauge::{GaugeCollector, GaugeSource, ProcessGauges};
use crate::instrumentation::{
    AdapterContext, InstrumentationActivator, InstrumentationAdapter, PluginRegistry,
    StaticActivator,
};
use crate::live::{
    LiveInstrumentationService, LiveProcessService, LiveServices, LiveTraceRepository,
};
use crate::random::{RandomSource, ThreadRandom};
use crate::scheduler::{Scheduler, SchedulerHandle, TaskFailureFn};
use crate::sink::Sink;
use crate::stack::{ProcfsThreadSampler, StackSampler, StackTraceCollector};
use crate::transaction::TransactionCollector;
use crate::watcher::ImmediateStoreWatcher;

/// Lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialized,
    Running,
    Stopping,
    Stopped,
}

/// Shutdown steps, in the order [`Agent::close`] runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    Watcher,
    Aggregator,
    StackTraces,
    Gauges,
    Transactions,
    Drain,
}

/// Invoked on the closing thread after each step completes. `Drain` fires
/// right before the scheduler drain begins.
pub type ShutdownHook = Arc<dyn Fn(ShutdownStep) + Send + Sync>;

/// External capabilities the agent is wired with.
pub struct Collaborators {
    pub activator: Arc<dyn InstrumentationActivator>,
    pub plugins: PluginRegistry,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
    pub stack_sampler: Arc<dyn StackSampler>,
    /// Replaces the process gauge catalog when set.
    pub gauge_source: Option<Arc<dyn GaugeSource>>,
    /// Replaces the configured sink when set.
    pub sink: Option<Sink>,
    pub shutdown_hook: Option<ShutdownHook>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            activator: Arc::new(StaticActivator::default()),
            plugins: PluginRegistry::new(),
            clock: Arc::new(SystemClock),
            random: Arc::new(ThreadRandom),
            stack_sampler: Arc::new(ProcfsThreadSampler),
            gauge_source: None,
            sink: None,
            shutdown_hook: None,
        }
    }
}

/// Everything that exists only while the agent runs.
struct Components {
    scheduler: Scheduler,
    sink: Arc<Sink>,
    aggregator: Arc<Aggregator>,
    transactions: Arc<TransactionCollector>,
    gauges: Arc<GaugeCollector>,
    stacks: Arc<StackTraceCollector>,
    watcher: Arc<ImmediateStoreWatcher>,
    live: Arc<LiveServices>,
    _adapters: Vec<Box<dyn InstrumentationAdapter>>,
}

/// Orchestrates all agent components.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    state: AgentState,
    activator: Arc<dyn InstrumentationActivator>,
    plugins: PluginRegistry,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    stack_sampler: Arc<dyn StackSampler>,
    gauge_source: Option<Arc<dyn GaugeSource>>,
    sink_override: Option<Sink>,
    shutdown_hook: Option<ShutdownHook>,
    components: Option<Components>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("state", &self.state)
            .field("plugins", &self.plugins)
            .finish()
    }
}

impl Agent {
    /// Creates a new agent. Nothing runs until [`Agent::start`].
    pub fn new(cfg: Config, collaborators: Collaborators) -> Result<Self, AgentError> {
        cfg.validate()
            .map_err(|e| AgentError::Config(format!("{e:#}")))?;

        let health = Arc::new(
            HealthMetrics::new()
                .context("creating health metrics")
                .map_err(AgentError::Startup)?,
        );

        Ok(Self {
            cfg,
            health,
            state: AgentState::Uninitialized,
            activator: collaborators.activator,
            plugins: collaborators.plugins,
            clock: collaborators.clock,
            random: collaborators.random,
            stack_sampler: collaborators.stack_sampler,
            gauge_source: collaborators.gauge_source,
            sink_override: collaborators.sink,
            shutdown_hook: collaborators.shutdown_hook,
            components: None,
        })
    }

    /// Brings the agent up.
    ///
    /// Only activation failure is specific to this step; any failure leaves
    /// the agent `Uninitialized` with its scheduler drained. Must be called
    /// from outside an async context.
    pub fn start(&mut self) -> Result<(), AgentError> {
        if self.state != AgentState::Uninitialized {
            return Err(AgentError::InvalidState(self.state));
        }

        // 1. Activate instrumentation. Nothing else starts without it.
        let activation = self
            .activator
            .activate(
                &self.cfg.instrumentation.rules,
                self.cfg.instrumentation.on_conflict,
            )
            .inspect_err(|e| error!(error = %e, "instrumentation activation failed"))?;

        info!(
            rules = activation.active_rules.len(),
            retransform_supported = activation.retransform_supported,
            "instrumentation activated",
        );

        // 2. Construct the shared scheduler.
        let failures = Arc::clone(&self.health);
        let on_failure: TaskFailureFn = Arc::new(move |task: &str| {
            failures.task_failures.with_label_values(&[task]).inc();
        });
        let scheduler = Scheduler::with_failure_hook(self.cfg.workers, Some(on_failure))
            .map_err(AgentError::Startup)?;

        match self.assemble(scheduler, &activation) {
            Ok(components) => {
                self.components = Some(components);
                self.state = AgentState::Running;
                info!("agent fully started");
                Ok(())
            }
            Err((scheduler, e)) => {
                error!(error = %e, "agent startup failed");
                if !scheduler.drain(self.cfg.drain_timeout) {
                    warn!("scheduler did not drain after failed startup");
                }
                Err(e)
            }
        }
    }

    /// Steps 3 through 6 of startup. Hands the scheduler back on failure so the
    /// caller can drain it.
    fn assemble(
        &mut self,
        scheduler: Scheduler,
        activation: &crate::instrumentation::Activation,
    ) -> Result<Components, (Scheduler, AgentError)> {
        let handle = scheduler.handle();
        let metrics = Some(Arc::clone(&self.health));

        // 3. Sink, then the aggregator the transaction collector reports into.
        let sink = match self.sink_override.take() {
            Some(sink) => sink,
            None => Sink::from_config(&self.cfg.sink),
        };
        let sink = Arc::new(sink.with_metrics(Arc::clone(&self.health)));
        info!(exporters = ?sink.exporter_names(), "sink configured");

        let aggregator = Arc::new(
            Aggregator::new(
                self.cfg.rollup.interval,
                self.cfg.rollup.max_raw_durations,
                Arc::clone(&self.clock),
                Arc::clone(&sink),
                handle.clone(),
                metrics.clone(),
            )
            .with_dedup_windows(self.cfg.rollup.dedup_windows),
        );
        if let Err(e) = aggregator.start() {
            return Err((scheduler, e.into()));
        }

        let transactions = Arc::new(TransactionCollector::new(
            &self.cfg.transactions,
            Arc::clone(&aggregator),
            Arc::clone(&sink),
            Arc::clone(&self.clock),
            Arc::clone(&self.random),
            handle.clone(),
            metrics.clone(),
        ));
        if let Err(e) = transactions.start() {
            return Err((scheduler, e.into()));
        }

        // 4. Periodic collectors.
        let source = match &self.gauge_source {
            Some(source) => Arc::clone(source),
            None => Arc::new(ProcessGauges::new(Some(Arc::clone(&transactions)))),
        };
        let gauges = Arc::new(GaugeCollector::new(
            &self.cfg.gauges,
            source,
            Arc::clone(&self.clock),
            Arc::clone(&sink),
            handle.clone(),
            metrics.clone(),
        ));

        let stacks = StackTraceCollector::create(
            &self.cfg.stack_traces,
            Arc::clone(&self.stack_sampler),
            Arc::clone(&self.random),
            Arc::clone(&transactions),
            Arc::clone(&self.clock),
            handle.clone(),
            metrics,
        );

        let watcher = Arc::new(ImmediateStoreWatcher::new(
            &self.cfg.immediate_store,
            Arc::clone(&transactions),
            Arc::clone(&self.clock),
            handle.clone(),
        ));

        let started = gauges
            .start()
            .and_then(|()| stacks.start())
            .and_then(|()| watcher.start());
        if let Err(e) = started {
            return Err((scheduler, e.into()));
        }

        // 5. Live introspection over the initialized collectors.
        let live = Arc::new(LiveServices {
            traces: LiveTraceRepository::new(Arc::clone(&transactions)),
            instrumentation: LiveInstrumentationService::new(activation),
            process: LiveProcessService::new(scheduler.workers(), stacks.is_enabled()),
        });

        if self.cfg.health.enabled {
            if let Err(e) = self.start_health_server(&handle, &live) {
                return Err((scheduler, AgentError::Startup(e)));
            }
        }

        // 6. Plugin adapters, best effort.
        let adapters = self.activate_plugins(&transactions, &live);

        Ok(Components {
            scheduler,
            sink,
            aggregator,
            transactions,
            gauges,
            stacks,
            watcher,
            live,
            _adapters: adapters,
        })
    }

    fn start_health_server(
        &self,
        handle: &SchedulerHandle,
        live: &Arc<LiveServices>,
    ) -> anyhow::Result<()> {
        let listener = handle
            .block_on(health::bind(&self.cfg.health.addr))
            .context("starting health server")?;

        handle.spawn(
            "health-server",
            health::serve(
                listener,
                Arc::clone(&self.health),
                Arc::clone(live),
                handle.shutdown_token(),
            ),
        )?;
        Ok(())
    }

    fn activate_plugins(
        &self,
        transactions: &Arc<TransactionCollector>,
        live: &LiveServices,
    ) -> Vec<Box<dyn InstrumentationAdapter>> {
        let ctx = AdapterContext {
            transactions: Arc::clone(transactions),
        };
        let mut adapters = Vec::with_capacity(self.cfg.plugins.len());

        for name in &self.cfg.plugins {
            let adapter = match self.plugins.load_by_name(name) {
                Ok(adapter) => adapter,
                Err(LoadError::NotFound(name)) => {
                    debug!(adapter = %name, "instrumentation adapter not found, skipping");
                    live.instrumentation.record_adapter(&name, false);
                    continue;
                }
                Err(e) => {
                    warn!(adapter = %name, error = %e, "failed to load instrumentation adapter");
                    live.instrumentation.record_adapter(name, false);
                    continue;
                }
            };

            match adapter.activate(&ctx) {
                Ok(()) => {
                    live.instrumentation.record_adapter(name, true);
                    adapters.push(adapter);
                }
                Err(e) => {
                    warn!(adapter = %name, error = %e, "failed to activate instrumentation adapter");
                    live.instrumentation.record_adapter(name, false);
                }
            }
        }

        if !adapters.is_empty() {
            let names: Vec<&str> = adapters.iter().map(|a| a.name()).collect();
            info!("plugins loaded: {}", names.join(", "));
        }

        adapters
    }

    /// Shuts the agent down.
    ///
    /// Cancels the watcher, aggregator, stack collector and gauge collector in
    /// that order, flushes pending traces, then drains the scheduler. The whole
    /// sequence shares one `drain_timeout` budget: forced flushes are abandoned
    /// when it runs out and their records stay undelivered. A drain timeout is
    /// returned as an error and leaves the agent `Stopping`.
    pub fn close(&mut self) -> Result<(), AgentError> {
        if self.state != AgentState::Running {
            return Err(AgentError::InvalidState(self.state));
        }
        self.state = AgentState::Stopping;
        info!("agent stopping");

        let Some(components) = self.components.as_ref() else {
            return Err(AgentError::InvalidState(self.state));
        };

        let timeout = self.cfg.drain_timeout;
        let deadline = Instant::now() + timeout;

        components.watcher.cancel();
        self.notify(ShutdownStep::Watcher);

        if let Err(e) = components.aggregator.close(remaining(deadline)) {
            error!(error = %e, "final rollup flush failed");
        }
        self.notify(ShutdownStep::Aggregator);

        components.stacks.close();
        self.notify(ShutdownStep::StackTraces);

        components.gauges.close();
        self.notify(ShutdownStep::Gauges);

        if let Err(e) = components.transactions.close(remaining(deadline)) {
            error!(error = %e, "final trace flush failed");
        }
        self.notify(ShutdownStep::Transactions);

        // Units completed while the collectors were closing.
        if components.aggregator.has_undelivered() {
            match components.aggregator.flush_all_within(remaining(deadline)) {
                Ok(delivered) => info!(delivered, "late rollup windows flushed"),
                Err(e) => error!(error = %e, "late rollup flush failed"),
            }
        }

        self.notify(ShutdownStep::Drain);
        if !components.scheduler.drain(remaining(deadline)) {
            error!(?timeout, "could not terminate agent scheduler");
            return Err(AgentError::DrainTimeout { timeout });
        }

        self.state = AgentState::Stopped;
        info!("agent stopped");
        Ok(())
    }

    fn notify(&self, step: ShutdownStep) {
        debug!(?step, "shutdown step complete");
        if let Some(hook) = &self.shutdown_hook {
            hook(step);
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn metrics(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Live introspection services, once started.
    pub fn live(&self) -> Option<&Arc<LiveServices>> {
        self.components.as_ref().map(|c| &c.live)
    }

    pub fn transactions(&self) -> Option<&Arc<TransactionCollector>> {
        self.components.as_ref().map(|c| &c.transactions)
    }

    pub fn aggregator(&self) -> Option<&Arc<Aggregator>> {
        self.components.as_ref().map(|c| &c.aggregator)
    }

    pub fn sink(&self) -> Option<&Arc<Sink>> {
        self.components.as_ref().map(|c| &c.sink)
    }

    pub fn scheduler_handle(&self) -> Option<SchedulerHandle> {
        self.components.as_ref().map(|c| c.scheduler.handle())
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
