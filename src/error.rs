//! Error types for the webhook.
//!
//! Four tiers, matching how far a failure is allowed to travel:
//! - [`TransportError`]: the HTTP request itself is unusable; no decision is made.
//! - [`DecisionError`]: the ownership gate denied the change; surfaced verbatim
//!   inside a 200 admission response.
//! - [`PublishError`]: queueing a reconcile failed; folded into the enclosing
//!   [`DecisionError`], never escalated.
//! - [`ServerError`]: startup and listener failures.

use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Request-level failures rejected before any decision logic runs.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Only POST carries admission reviews
    #[error("invalid method {0}, only POST requests are allowed")]
    MethodNotAllowed(String),

    /// Content-Type header missing or not exactly `application/json`
    #[error("unsupported content type {found}, only {expected} is supported")]
    UnsupportedContentType { found: String, expected: &'static str },

    /// The body could not be read (closed early or over the size cap)
    #[error("could not read request body: {0}")]
    BodyRead(String),

    /// The body is not an admission review envelope
    #[error("could not deserialize request: {0}")]
    MalformedReview(#[source] serde_json::Error),

    /// The envelope has no `request` object
    #[error("malformed admission review: request is nil")]
    MissingRequest,

    /// The response envelope or patch could not be encoded
    #[error("marshaling response: {0}")]
    Serialization(#[source] serde_json::Error),
}

impl TransportError {
    /// HTTP status the control plane sees for this failure
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransportError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            TransportError::UnsupportedContentType { .. }
            | TransportError::BodyRead(_)
            | TransportError::MalformedReview(_)
            | TransportError::MissingRequest => StatusCode::BAD_REQUEST,
            TransportError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Which side of an UPDATE a decode failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectSide {
    Existing,
    New,
}

impl fmt::Display for ObjectSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectSide::Existing => write!(f, "existing"),
            ObjectSide::New => write!(f, "new"),
        }
    }
}

/// Why the ownership gate refused a change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// Old or new object bytes are not a decodable object
    #[error("DENIED: admission controller failed decoding {side} object: {reason}")]
    Decode { side: ObjectSide, reason: String },

    /// A non-owner changed `spec`
    #[error("DENIED: non-owner {requester} cannot change spec")]
    SpecChange { requester: String },

    /// A non-owner changed a label outside the exempt set
    #[error(
        "DENIED: non-owner {requester} cannot change non-exempt label ({key}: {value})"
    )]
    LabelChange {
        requester: String,
        key: String,
        value: String,
    },

    /// A non-owner tried to delete an owned resource
    #[error("DENIED: non-owner {requester} cannot delete owned resource")]
    Delete { requester: String },
}

impl DenialReason {
    /// Whether the denial stems from an actual policy violation (as opposed to bad input)
    pub fn is_violation(&self) -> bool {
        !matches!(self, DenialReason::Decode { .. })
    }
}

/// A denial plus the outcome of queueing it for reconciliation.
///
/// The `Display` output is the user-visible admission message: the denial
/// reason, followed by the publish failure when the reconcile could not be
/// queued.
#[derive(Debug)]
pub struct DecisionError {
    pub reason: DenialReason,
    pub publish_failure: Option<PublishError>,
}

impl DecisionError {
    pub fn new(reason: DenialReason) -> Self {
        Self {
            reason,
            publish_failure: None,
        }
    }

    pub fn with_publish_failure(mut self, err: PublishError) -> Self {
        self.publish_failure = Some(err);
        self
    }
}

impl fmt::Display for DecisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(err) = &self.publish_failure {
            write!(f, "; reconciliation not queued: {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for DecisionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.reason)
    }
}

/// Failures while discovering brokers or publishing a reconcile event.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Listing broker services from the cluster failed
    #[error("broker discovery failed: {0}")]
    Discovery(#[from] kube::Error),

    /// Discovery succeeded but found no usable bootstrap service
    #[error("no bootstrap brokers found for cluster {cluster} in namespace {namespace}")]
    NoBrokers { cluster: String, namespace: String },

    /// Could not open a client against the brokers
    #[error("failed to connect to brokers {brokers}: {source}")]
    Connect {
        brokers: String,
        #[source]
        source: rskafka::client::error::Error,
    },

    /// Topic metadata lookup or creation failed
    #[error("failed to ensure topic {topic}: {source}")]
    Topic {
        topic: String,
        #[source]
        source: rskafka::client::error::Error,
    },

    /// The broker rejected or never acknowledged the record
    #[error("failed to send message to topic {topic}: {source}")]
    Send {
        topic: String,
        #[source]
        source: rskafka::client::error::Error,
    },

    /// The resource identity could not be serialized
    #[error("failed to encode resource details: {0}")]
    Encode(#[from] serde_json::Error),

    /// A network step exceeded the configured bound
    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },
}

impl PublishError {
    /// Check if a later attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Discovery(e) => {
                matches!(e, kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429)
                    || matches!(e, kube::Error::Service(_))
            }
            PublishError::NoBrokers { .. }
            | PublishError::Connect { .. }
            | PublishError::Topic { .. }
            | PublishError::Send { .. }
            | PublishError::Timeout { .. } => true,
            PublishError::Encode(_) => false,
        }
    }
}

/// Errors that can occur when starting or running the servers
#[derive(Error, Debug)]
pub enum ServerError {
    /// TLS material could not be loaded
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// The listener failed
    #[error("Webhook server error: {0}")]
    Server(String),

    /// Configuration is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),
}
