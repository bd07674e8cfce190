//! Health server for Kubernetes probes, Prometheus metrics and recent errors.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (returns 200 once the webhook listener is up)
//! - `/metrics` - Prometheus metrics endpoint
//! - `/errors` - The most recent request errors, newest last

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Entries kept by [`RecentErrors`]
pub const RECENT_ERRORS_CAPACITY: usize = 64;

/// How an admission request ended.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Outcome {
    /// Decision made, change allowed
    Allowed,
    /// Decision made, change denied
    Denied,
    /// Reserved namespace, policy skipped
    Bypassed,
    /// Transport-level failure, no decision
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Denied => "denied",
            Outcome::Bypassed => "bypassed",
            Outcome::Rejected => "rejected",
        }
    }
}

/// Labels for admission metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

impl EncodeLabelSet for OutcomeLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for reconcile publish metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PublishLabels {
    pub result: &'static str,
}

impl EncodeLabelSet for PublishLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("result", self.result).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the webhook
pub struct Metrics {
    /// Admission requests by outcome
    pub admission_requests_total: Family<OutcomeLabels, Counter>,
    /// Admission handling duration histogram
    pub admission_duration_seconds: Histogram,
    /// Reconcile publish attempts by result
    pub reconcile_publish_total: Family<PublishLabels, Counter>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let admission_requests_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "heimdall_admission_requests",
            "Total number of admission requests by outcome",
            admission_requests_total.clone(),
        );

        let admission_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 15));
        registry.register(
            "heimdall_admission_duration_seconds",
            "Duration of admission request handling in seconds",
            admission_duration_seconds.clone(),
        );

        let reconcile_publish_total = Family::<PublishLabels, Counter>::default();
        registry.register(
            "heimdall_reconcile_publish",
            "Total number of reconcile publish attempts by result",
            reconcile_publish_total.clone(),
        );

        Self {
            admission_requests_total,
            admission_duration_seconds,
            reconcile_publish_total,
            registry,
        }
    }

    /// Record a finished admission request
    pub fn record_admission(&self, outcome: Outcome, duration_secs: f64) {
        self.admission_requests_total
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
        self.admission_duration_seconds.observe(duration_secs);
    }

    /// Record a reconcile publish attempt
    pub fn record_publish(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.reconcile_publish_total
            .get_or_create(&PublishLabels { result })
            .inc();
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Bounded log of recent request error strings.
///
/// Written after a request finishes; decision logic never reads it.
pub struct RecentErrors {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for RecentErrors {
    fn default() -> Self {
        Self::with_capacity(RECENT_ERRORS_CAPACITY)
    }
}

impl RecentErrors {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append errors, evicting the oldest past capacity
    pub async fn extend<I: IntoIterator<Item = String>>(&self, errors: I) {
        let mut entries = self.entries.lock().await;
        for error in errors {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(error);
        }
    }

    /// Copy of the current entries, oldest first
    pub async fn snapshot(&self) -> Vec<String> {
        self.entries.lock().await.iter().cloned().collect()
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the webhook listener is serving
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Recent request errors
    pub recent_errors: RecentErrors,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            recent_errors: RecentErrors::default(),
        }
    }

    /// Mark the webhook as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the webhook is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the webhook listener is up.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Recent errors, one per line
async fn errors_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let mut body = state.recent_errors.snapshot().await.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    (StatusCode::OK, body)
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .route("/errors", get(errors_handler))
        .with_state(state)
}

/// Run the health server on the given port (plain HTTP).
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
