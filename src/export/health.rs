use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::live::LiveServices;

const NAMESPACE: &str = "vigil";

/// Prometheus metrics describing the agent's own behaviour.
///
/// All metrics use the "vigil" namespace and live in a private registry so
/// several agents can coexist in one process (tests).
pub struct HealthMetrics {
    registry: Registry,

    /// Units started by instrumentation.
    pub units_started: Counter,
    /// Units completed (successfully or with error).
    pub units_completed: Counter,
    /// Units currently in flight.
    pub units_in_flight: Gauge,
    /// Full traces handed to the sink.
    pub traces_stored: Counter,
    /// Traces dropped because the pending queue was full.
    pub traces_dropped: Counter,
    /// Partial traces persisted for long-running units.
    pub partial_stores: Counter,
    /// Rollup windows delivered to the sink.
    pub rollups_flushed: Counter,
    /// Rollup flush attempts that failed and will be retried.
    pub rollup_flush_failures: Counter,
    /// Gauge samples produced.
    pub gauge_samples: Counter,
    /// Stack samples attached to units.
    pub stack_samples: Counter,
    /// Scheduled task invocations that failed or panicked, by task.
    pub task_failures: CounterVec,
    /// Records an exporter failed to deliver after retries, by exporter.
    pub exporter_errors: CounterVec,
}

impl std::fmt::Debug for HealthMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMetrics").finish_non_exhaustive()
    }
}

impl HealthMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let units_started = Counter::with_opts(
            Opts::new("units_started_total", "Total units of work started.").namespace(NAMESPACE),
        )?;
        let units_completed = Counter::with_opts(
            Opts::new("units_completed_total", "Total units of work completed.")
                .namespace(NAMESPACE),
        )?;
        let units_in_flight = Gauge::with_opts(
            Opts::new("units_in_flight", "Units of work currently in flight.").namespace(NAMESPACE),
        )?;
        let traces_stored = Counter::with_opts(
            Opts::new("traces_stored_total", "Total full traces handed to the sink.")
                .namespace(NAMESPACE),
        )?;
        let traces_dropped = Counter::with_opts(
            Opts::new(
                "traces_dropped_total",
                "Total traces dropped because the pending queue was full.",
            )
            .namespace(NAMESPACE),
        )?;
        let partial_stores = Counter::with_opts(
            Opts::new(
                "partial_stores_total",
                "Total partial traces persisted for long-running units.",
            )
            .namespace(NAMESPACE),
        )?;
        let rollups_flushed = Counter::with_opts(
            Opts::new("rollups_flushed_total", "Total rollup windows delivered.")
                .namespace(NAMESPACE),
        )?;
        let rollup_flush_failures = Counter::with_opts(
            Opts::new(
                "rollup_flush_failures_total",
                "Total failed rollup flush attempts.",
            )
            .namespace(NAMESPACE),
        )?;
        let gauge_samples = Counter::with_opts(
            Opts::new("gauge_samples_total", "Total gauge samples produced.").namespace(NAMESPACE),
        )?;
        let stack_samples = Counter::with_opts(
            Opts::new("stack_samples_total", "Total stack samples captured.").namespace(NAMESPACE),
        )?;
        let task_failures = CounterVec::new(
            Opts::new(
                "task_failures_total",
                "Total failed scheduled task invocations by task.",
            )
            .namespace(NAMESPACE),
            &["task"],
        )?;
        let exporter_errors = CounterVec::new(
            Opts::new(
                "exporter_errors_total",
                "Total records an exporter failed to deliver by exporter.",
            )
            .namespace(NAMESPACE),
            &["exporter"],
        )?;

        registry.register(Box::new(units_started.clone()))?;
        registry.register(Box::new(units_completed.clone()))?;
        registry.register(Box::new(units_in_flight.clone()))?;
        registry.register(Box::new(traces_stored.clone()))?;
        registry.register(Box::new(traces_dropped.clone()))?;
        registry.register(Box::new(partial_stores.clone()))?;
        registry.register(Box::new(rollups_flushed.clone()))?;
        registry.register(Box::new(rollup_flush_failures.clone()))?;
        registry.register(Box::new(gauge_samples.clone()))?;
        registry.register(Box::new(stack_samples.clone()))?;
        registry.register(Box::new(task_failures.clone()))?;
        registry.register(Box::new(exporter_errors.clone()))?;

        Ok(Self {
            registry,
            units_started,
            units_completed,
            units_in_flight,
            traces_stored,
            traces_dropped,
            partial_stores,
            rollups_flushed,
            rollup_flush_failures,
            gauge_samples,
            stack_samples,
            task_failures,
            exporter_errors,
        })
    }

    /// Renders all metrics in the prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }
}

/// Normalizes the ":port" shorthand to a bindable address.
pub fn bind_address(addr: &str) -> String {
    let addr = if addr.is_empty() { ":9090" } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Binds the health listener. Split from [`serve`] so bind errors surface at startup.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let bind_addr = bind_address(addr);
    TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("listening on {bind_addr}"))
}

/// Serves /metrics, /healthz and the /live/* views until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<HealthMetrics>,
    live: Arc<LiveServices>,
    shutdown: CancellationToken,
) {
    let app = router(metrics, live);

    let local_addr = listener.local_addr().ok();
    tracing::info!(addr = ?local_addr, "health server started");

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.cancelled().await;
    })
    .await;

    if let Err(e) = result {
        tracing::error!(error = %e, "health server error");
    }
}

/// Builds the health router.
pub fn router(metrics: Arc<HealthMetrics>, live: Arc<LiveServices>) -> Router {
    let state = Arc::new(AppState { metrics, live });

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/live/units", get(units_handler))
        .route("/live/instrumentation", get(instrumentation_handler))
        .route("/live/process", get(process_handler))
        .with_state(state)
}

/// Shared state for axum handlers.
struct AppState {
    metrics: Arc<HealthMetrics>,
    live: Arc<LiveServices>,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /live/units - in-flight units.
async fn units_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.live.traces.in_flight())
}

/// GET /live/instrumentation - activation state.
async fn instrumentation_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.live.instrumentation.state())
}

/// GET /live/process - process facts.
async fn process_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.live.process.facts())
}
