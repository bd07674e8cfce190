//! Admission webhook server.
//!
//! Provides the HTTPS endpoint the control plane posts admission reviews to.
//!
//! To enable the webhook:
//! 1. Issue a serving certificate (e.g. with cert-manager)
//! 2. Mount it at /run/secrets/tls/ (or point `--cert-path`/`--key-path` at it)
//! 3. Register a MutatingWebhookConfiguration for UPDATE and DELETE on the guarded resources

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Router, routing::any};
use axum_server::tls_rustls::RustlsConfig;
use tracing::{error, info, warn};

use crate::config::WebhookConfig;
use crate::error::{ServerError, TransportError};
use crate::health::{HealthState, Outcome};
use crate::webhooks::codec::{
    self, AdmissionResponse, JSON_CONTENT_TYPE, decode_review, encode_review,
};
use crate::webhooks::policies::{OwnerIdentity, OwnershipEngine, RequesterIdentity};

/// Shared state for webhook handlers. Read-only after startup.
pub struct WebhookState {
    pub engine: OwnershipEngine,
    pub health: Arc<HealthState>,
    pub max_body_bytes: usize,
}

impl WebhookState {
    pub fn new(engine: OwnershipEngine, health: Arc<HealthState>, max_body_bytes: usize) -> Self {
        Self {
            engine,
            health,
            max_body_bytes,
        }
    }
}

/// Error strings collected while serving one request.
///
/// Lives for a single request; flushed to the log and the shared recent-error
/// list when the request finishes.
#[derive(Debug, Default)]
pub struct RequestErrors(Vec<String>);

impl RequestErrors {
    pub fn push(&mut self, error: impl ToString) {
        self.0.push(error.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    fn into_inner(self) -> Vec<String> {
        self.0
    }
}

/// Create the webhook router.
///
/// The path accepts every method so non-POST requests get a 405 from the
/// handler rather than from routing.
pub fn create_webhook_router(state: Arc<WebhookState>, path: &str) -> Router {
    Router::new().route(path, any(admit)).with_state(state)
}

async fn admit(
    State(state): State<Arc<WebhookState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let started = Instant::now();
    let mut errors = RequestErrors::default();
    let (parts, body) = request.into_parts();

    let result = serve_admission(
        &state,
        &parts.method,
        &parts.headers,
        body,
        peer,
        &mut errors,
    )
    .await;

    let (outcome, response) = match result {
        Ok((outcome, bytes)) => {
            info!("Webhook request handled successfully");
            (
                outcome,
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
                    bytes,
                )
                    .into_response(),
            )
        }
        Err(e) => {
            errors.push(&e);
            error!(status = %e.status_code(), error = %e, "Error handling webhook request");
            (Outcome::Rejected, e.into_response())
        }
    };

    for (i, e) in errors.as_slice().iter().enumerate() {
        warn!(index = i, error = %e, "Request error");
    }
    state.health.recent_errors.extend(errors.into_inner()).await;
    state
        .health
        .metrics
        .record_admission(outcome, started.elapsed().as_secs_f64());

    response
}

/// Handle one admission request end to end.
///
/// Returns the encoded response envelope, or the transport failure that
/// prevented a decision. Decision errors are not failures here: they become a
/// denial inside a successful envelope.
pub async fn serve_admission(
    state: &WebhookState,
    method: &Method,
    headers: &HeaderMap,
    body: Body,
    peer: SocketAddr,
    errors: &mut RequestErrors,
) -> Result<(Outcome, Vec<u8>), TransportError> {
    info!(method = %method, "Processing request");

    if *method != Method::POST {
        return Err(TransportError::MethodNotAllowed(method.to_string()));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != JSON_CONTENT_TYPE {
        return Err(TransportError::UnsupportedContentType {
            found: content_type.to_string(),
            expected: JSON_CONTENT_TYPE,
        });
    }

    let body = to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| TransportError::BodyRead(e.to_string()))?;

    let (types, request) = decode_review(&body)?;
    info!(
        uid = %request.uid,
        kind = %request.kind.kind,
        namespace = %request.namespace(),
        name = %request.name,
        operation = ?request.operation,
        dry_run = request.dry_run,
        "Admission review decoded"
    );

    let requester = RequesterIdentity::from_peer(peer);
    let policy = state.engine.policy();
    let owner = codec::owner_label(request.old_object.as_deref(), &policy.owner_label)
        .map(OwnerIdentity::new);

    let (outcome, response) = if policy.is_reserved_namespace(request.namespace()) {
        info!(
            uid = %request.uid,
            namespace = %request.namespace(),
            "Reserved namespace, skipping ownership policy"
        );
        (Outcome::Bypassed, AdmissionResponse::allow(&request))
    } else if request.is_create() {
        info!(
            uid = %request.uid,
            "Create has no existing owner, allowing"
        );
        (Outcome::Allowed, AdmissionResponse::allow(&request))
    } else {
        match state.engine.decide(&request, &requester, owner.as_ref()).await {
            Ok(decision) => (
                Outcome::Allowed,
                AdmissionResponse::allow(&request).with_patch(&decision.patch)?,
            ),
            Err(e) => {
                errors.push(&e);
                (Outcome::Denied, AdmissionResponse::allow(&request).deny(&e))
            }
        }
    };

    let bytes = encode_review(types, response)?;
    info!(outcome = outcome.as_str(), "Response encoded");
    Ok((outcome, bytes))
}

/// Run the webhook server with TLS
///
/// TLS material is loaded once here and shared read-only by every
/// connection. Marks the health state ready once the certificate is loaded.
pub async fn run_webhook_server(
    config: &WebhookConfig,
    state: Arc<WebhookState>,
) -> Result<(), ServerError> {
    let health = state.health.clone();
    let app = create_webhook_router(state, &config.admission_path);

    let tls = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path)
        .await
        .map_err(|e| ServerError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.webhook_port));
    info!(
        port = config.webhook_port,
        path = %config.admission_path,
        "Webhook server listening with TLS"
    );
    health.set_ready(true).await;

    axum_server::bind_rustls(addr, tls)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| ServerError::Server(e.to_string()))?;

    Ok(())
}
