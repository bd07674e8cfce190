//! Admission policies.
//!
//! [`ownership::evaluate`] is the pure decision; [`OwnershipEngine`] wraps it
//! with the side effect of queueing denied changes for reconciliation.

pub mod ownership;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use json_patch::PatchOperation;
use tracing::{info, warn};

use crate::config::OwnershipPolicy;
use crate::error::{DecisionError, DenialReason};
use crate::reconcile::{ReconcileQueue, ResourceIdentity};
use crate::webhooks::codec::AdmissionRequest;

/// Address the current request was observed to come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequesterIdentity(String);

impl RequesterIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// The peer IP without its port
    pub fn from_peer(peer: SocketAddr) -> Self {
        Self(peer.ip().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequesterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value of the owner label on the existing object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerIdentity(String);

impl OwnerIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a change was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    /// Old and new objects are structurally equal
    NoChange,
    /// The requester is the owner
    Owner,
    /// The existing object carries no owner label
    Unowned,
    /// Only exempt labels (or non-spec fields) changed
    ExemptChangesOnly,
}

impl fmt::Display for AllowReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllowReason::NoChange => write!(f, "no changes detected"),
            AllowReason::Owner => write!(f, "requester is the owner"),
            AllowReason::Unowned => write!(f, "resource has no owner"),
            AllowReason::ExemptChangesOnly => write!(f, "only exempt fields changed"),
        }
    }
}

/// Outcome of evaluating the ownership rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow(AllowReason),
    Deny(DenialReason),
}

/// An allowed decision and the patch to apply with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub reason: AllowReason,
    pub patch: Vec<PatchOperation>,
}

/// Decides UPDATE requests and queues denied changes for reconciliation.
pub struct OwnershipEngine {
    policy: OwnershipPolicy,
    queue: Arc<dyn ReconcileQueue>,
}

impl OwnershipEngine {
    pub fn new(policy: OwnershipPolicy, queue: Arc<dyn ReconcileQueue>) -> Self {
        Self { policy, queue }
    }

    pub fn policy(&self) -> &OwnershipPolicy {
        &self.policy
    }

    /// Decide one request. DELETE is checked by ownership alone, everything
    /// else by the full rules.
    ///
    /// Policy violations always attempt exactly one publish; decode failures
    /// publish only when configured to. A failed publish is appended to the
    /// denial, it never turns a denial into an allow.
    pub async fn decide(
        &self,
        request: &AdmissionRequest,
        requester: &RequesterIdentity,
        owner: Option<&OwnerIdentity>,
    ) -> Result<Decision, DecisionError> {
        info!(
            uid = %request.uid,
            namespace = %request.namespace(),
            name = %request.name,
            "Request is valid, validating contents"
        );

        let old_raw = request.old_object.as_deref().map(|raw| raw.get().as_bytes());
        let verdict = if request.is_delete() {
            ownership::evaluate_delete(old_raw, requester, owner)
        } else {
            ownership::evaluate(
                old_raw,
                request.object.as_deref().map(|raw| raw.get().as_bytes()),
                requester,
                owner,
                &self.policy,
            )
        };

        let reason = match verdict {
            Verdict::Allow(reason) => {
                info!(
                    uid = %request.uid,
                    requester = %requester,
                    owner = ?owner.map(OwnerIdentity::as_str),
                    "ALLOWED: {}",
                    reason
                );
                return Ok(Decision {
                    reason,
                    patch: Vec::new(),
                });
            }
            Verdict::Deny(reason) => reason,
        };

        let mut error = DecisionError::new(reason);
        if error.reason.is_violation() || self.policy.publish_on_decode_failure {
            let resource = ResourceIdentity::from_request(request);
            match self.queue.publish(&resource).await {
                Ok(()) => info!(
                    uid = %request.uid,
                    message_id = %resource.message_id,
                    "Resource queued for reconcile"
                ),
                Err(e) => error = error.with_publish_failure(e),
            }
        }

        warn!(
            uid = %request.uid,
            requester = %requester,
            owner = ?owner.map(OwnerIdentity::as_str),
            "{}",
            error
        );
        Err(error)
    }
}
