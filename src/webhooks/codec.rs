//! Admission-review wire codec.
//!
//! Decodes the envelope the control plane posts and encodes the envelope
//! returned to it. The old and new objects are kept as raw JSON so the
//! policy engine decides from exactly the bytes the control plane sent.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use json_patch::{Patch, PatchOperation};
use kube::core::GroupVersionKind;
use kube::core::admission::Operation;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::error::TransportError;

/// The only request media type accepted
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// `kind` of the envelope in both directions
pub const META_KIND: &str = "AdmissionReview";
/// `apiVersion` used when the request did not carry one
pub const META_API_VERSION_V1: &str = "admission.k8s.io/v1";

/// `apiVersion`/`kind` of the envelope, echoed back in the response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewTypes {
    pub api_version: String,
    pub kind: String,
}

impl Default for ReviewTypes {
    fn default() -> Self {
        Self {
            api_version: META_API_VERSION_V1.to_string(),
            kind: META_KIND.to_string(),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AdmissionReviewEnvelope {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    request: Option<AdmissionRequest>,
}

/// Inbound admission request, as much of it as the ownership gate reads.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// Correlation ID; must be echoed in the response
    pub uid: String,
    /// Kind, group and version of the object under change
    pub kind: GroupVersionKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub operation: Option<Operation>,
    /// New object state, verbatim
    #[serde(default)]
    pub object: Option<Box<RawValue>>,
    /// Existing object state, verbatim; only set for UPDATE and DELETE
    #[serde(default)]
    pub old_object: Option<Box<RawValue>>,
    #[serde(default)]
    pub dry_run: bool,
}

impl AdmissionRequest {
    /// Namespace of the target, empty for cluster-scoped resources
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    /// CREATE has no existing object, so nothing is owned yet
    pub fn is_create(&self) -> bool {
        matches!(self.operation, Some(Operation::Create))
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.operation, Some(Operation::Delete))
    }
}

/// Decode an admission review body into its envelope types and inner request.
pub fn decode_review(body: &[u8]) -> Result<(ReviewTypes, AdmissionRequest), TransportError> {
    let envelope: AdmissionReviewEnvelope =
        serde_json::from_slice(body).map_err(TransportError::MalformedReview)?;

    let request = envelope.request.ok_or(TransportError::MissingRequest)?;
    let defaults = ReviewTypes::default();
    let types = ReviewTypes {
        api_version: envelope.api_version.unwrap_or(defaults.api_version),
        kind: envelope.kind.unwrap_or(defaults.kind),
    };
    Ok((types, request))
}

/// Patch type tag carried next to a patch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    #[serde(rename = "JSONPatch")]
    JsonPatch,
}

/// Human-readable result attached to a denial.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub message: String,
}

/// Outbound admission decision.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<Status>,
    /// Base64 of the JSON Patch document
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub patch_type: Option<PatchType>,
}

impl AdmissionResponse {
    /// An allowed response without a patch for the given request
    pub fn allow(request: &AdmissionRequest) -> Self {
        Self {
            uid: request.uid.clone(),
            allowed: true,
            status: None,
            patch: None,
            patch_type: None,
        }
    }

    /// Attach patch operations. An empty operation list leaves the response
    /// without a patch.
    pub fn with_patch(mut self, operations: &[PatchOperation]) -> Result<Self, TransportError> {
        if operations.is_empty() {
            return Ok(self);
        }
        let bytes = serde_json::to_vec(&Patch(operations.to_vec()))
            .map_err(TransportError::Serialization)?;
        self.patch = Some(STANDARD.encode(bytes));
        self.patch_type = Some(PatchType::JsonPatch);
        Ok(self)
    }

    /// Deny with a message shown to the original caller. Drops any patch.
    #[must_use]
    pub fn deny(mut self, message: impl ToString) -> Self {
        self.allowed = false;
        self.status = Some(Status {
            message: message.to_string(),
        });
        self.patch = None;
        self.patch_type = None;
        self
    }

    /// Decode the attached patch back into operations
    pub fn patch_operations(&self) -> Option<Vec<PatchOperation>> {
        let encoded = self.patch.as_ref()?;
        let bytes = STANDARD.decode(encoded).ok()?;
        serde_json::from_slice::<Patch>(&bytes).ok().map(|p| p.0)
    }
}

/// Outbound envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    #[serde(flatten)]
    pub types: ReviewTypes,
    pub response: AdmissionResponse,
}

/// Serialize the response envelope.
pub fn encode_review(
    types: ReviewTypes,
    response: AdmissionResponse,
) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(&AdmissionReviewResponse { types, response })
        .map_err(TransportError::Serialization)
}

/// A decoded object document (old or new state).
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectState(Map<String, Value>);

impl ObjectState {
    /// Decode raw object bytes. The document must be a JSON object carrying a
    /// non-empty `kind`.
    pub fn decode(raw: &[u8]) -> Result<Self, String> {
        let value: Value = serde_json::from_slice(raw).map_err(|e| e.to_string())?;
        let Value::Object(map) = value else {
            return Err("object is not a JSON object".to_string());
        };
        match map.get("kind") {
            Some(Value::String(kind)) if !kind.is_empty() => Ok(Self(map)),
            _ => Err("Object 'Kind' is missing".to_string()),
        }
    }

    /// The `spec` substructure, if present
    pub fn spec(&self) -> Option<&Value> {
        self.0.get("spec")
    }

    /// `metadata.labels`, keyed and ordered by label name
    pub fn labels(&self) -> BTreeMap<&str, &Value> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(Value::as_object)
            .map(|labels| labels.iter().map(|(k, v)| (k.as_str(), v)).collect())
            .unwrap_or_default()
    }

    /// A single label value as a string
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels().get(key).and_then(|v| v.as_str())
    }
}

/// Read the owner label from the existing object without failing the request.
///
/// Undecodable or unlabeled objects yield `None`; the policy engine reports
/// decode problems itself.
pub fn owner_label(old_object: Option<&RawValue>, label: &str) -> Option<String> {
    let state = ObjectState::decode(old_object?.get().as_bytes()).ok()?;
    state
        .label(label)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
