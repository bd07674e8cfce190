//! Ownership policy.
//!
//! Once a resource carries an owner label, only the owner may change its
//! `spec` or any label outside the exempt set. Rules run in fixed order and
//! the first match wins:
//! 1. both objects must decode
//! 2. identical objects pass
//! 3. the owner (or anyone, on an unowned object) passes
//! 4. a `spec` change is denied
//! 5. a change to a non-exempt label is denied
//! 6. anything else passes
//!
//! A delete is checked by ownership alone: only the owner (or anyone, on an
//! unowned object) may remove it.
//!
//! Evaluation is pure: the same bytes and identities always give the same
//! verdict.

use std::collections::BTreeSet;

use serde_json::Value;

use super::{AllowReason, OwnerIdentity, RequesterIdentity, Verdict};
use crate::config::OwnershipPolicy;
use crate::error::{DenialReason, ObjectSide};
use crate::webhooks::codec::ObjectState;

/// Shown as the value of a label the change removed
const REMOVED_LABEL: &str = "<removed>";

/// Evaluate an UPDATE from its raw old and new object bytes.
pub fn evaluate(
    old_raw: Option<&[u8]>,
    new_raw: Option<&[u8]>,
    requester: &RequesterIdentity,
    owner: Option<&OwnerIdentity>,
    policy: &OwnershipPolicy,
) -> Verdict {
    let existing = match decode(old_raw, ObjectSide::Existing) {
        Ok(state) => state,
        Err(reason) => return Verdict::Deny(reason),
    };
    let updated = match decode(new_raw, ObjectSide::New) {
        Ok(state) => state,
        Err(reason) => return Verdict::Deny(reason),
    };

    if existing == updated {
        return Verdict::Allow(AllowReason::NoChange);
    }

    match owner {
        None => return Verdict::Allow(AllowReason::Unowned),
        Some(owner) if owner.as_str() == requester.as_str() => {
            return Verdict::Allow(AllowReason::Owner);
        }
        Some(_) => {}
    }

    if existing.spec() != updated.spec() {
        return Verdict::Deny(DenialReason::SpecChange {
            requester: requester.to_string(),
        });
    }

    if let Some((key, value)) = first_protected_label_change(&existing, &updated, policy) {
        return Verdict::Deny(DenialReason::LabelChange {
            requester: requester.to_string(),
            key,
            value,
        });
    }

    Verdict::Allow(AllowReason::ExemptChangesOnly)
}

/// Evaluate a DELETE from the raw bytes of the object being removed.
pub fn evaluate_delete(
    old_raw: Option<&[u8]>,
    requester: &RequesterIdentity,
    owner: Option<&OwnerIdentity>,
) -> Verdict {
    if let Err(reason) = decode(old_raw, ObjectSide::Existing) {
        return Verdict::Deny(reason);
    }

    match owner {
        None => Verdict::Allow(AllowReason::Unowned),
        Some(owner) if owner.as_str() == requester.as_str() => Verdict::Allow(AllowReason::Owner),
        Some(_) => Verdict::Deny(DenialReason::Delete {
            requester: requester.to_string(),
        }),
    }
}

fn decode(raw: Option<&[u8]>, side: ObjectSide) -> Result<ObjectState, DenialReason> {
    let raw = raw.ok_or_else(|| DenialReason::Decode {
        side,
        reason: "object is missing".to_string(),
    })?;
    ObjectState::decode(raw).map_err(|reason| DenialReason::Decode { side, reason })
}

/// First non-exempt label (in key order) whose value differs, with the new
/// value rendered for the denial message. Absent counts as its own value.
fn first_protected_label_change(
    existing: &ObjectState,
    updated: &ObjectState,
    policy: &OwnershipPolicy,
) -> Option<(String, String)> {
    let old_labels = existing.labels();
    let new_labels = updated.labels();
    let keys: BTreeSet<&str> = old_labels.keys().chain(new_labels.keys()).copied().collect();

    keys.into_iter()
        .filter(|key| !policy.is_exempt_label(key))
        .find(|key| old_labels.get(key) != new_labels.get(key))
        .map(|key| {
            let value = match new_labels.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => REMOVED_LABEL.to_string(),
            };
            (key.to_string(), value)
        })
}
