//! Admission webhook for the ownership gate.
//!
//! - [`codec`] reads and writes the admission review wire format
//! - [`policies`] decides whether a change is allowed
//! - the server wires both behind a TLS endpoint

pub mod codec;
pub mod policies;
mod server;

pub use codec::{AdmissionRequest, AdmissionResponse, decode_review, encode_review};
pub use policies::{
    AllowReason, Decision, OwnerIdentity, OwnershipEngine, RequesterIdentity, Verdict,
};
pub use server::{
    RequestErrors, WebhookState, create_webhook_router, run_webhook_server, serve_admission,
};

// Re-export kube-rs admission operation for callers building requests
pub use kube::core::admission::Operation;
