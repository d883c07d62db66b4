//! API types shared by every managed resource, claim and class kind
//!
//! Concrete kinds embed these structs in their `kube::CustomResource` specs
//! and statuses and expose them through the traits in [`crate::resource`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a bindable object
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BindingPhase {
    /// The phase has not been set yet
    #[default]
    Unset,
    /// Available to be bound
    Unbound,
    /// Bound to a claim or managed resource
    Bound,
    /// Was bound, its claim has since been deleted
    Released,
    /// Cannot be bound, for example because it is still provisioning
    Unbindable,
}

impl fmt::Display for BindingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BindingPhase::Unset => "Unset",
            BindingPhase::Unbound => "Unbound",
            BindingPhase::Bound => "Bound",
            BindingPhase::Released => "Released",
            BindingPhase::Unbindable => "Unbindable",
        };
        f.write_str(s)
    }
}

/// What happens to the external resource when its managed resource is released
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Delete the external resource
    Delete,
    /// Leave the external resource in place
    Retain,
}

/// Status condition following Kubernetes API conventions
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Synced")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    /// Equal in everything but transition time
    pub fn equal(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Binding phase and conditions, shared by managed resources and claims
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default)]
    pub binding_phase: BindingPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ResourceStatus {
    /// Set conditions, replacing any existing condition of the same type.
    ///
    /// The transition time of a replaced condition only changes when its
    /// status changes.
    pub fn set_conditions(&mut self, conditions: impl IntoIterator<Item = Condition>) {
        for new in conditions {
            match self.conditions.iter_mut().find(|c| c.type_ == new.type_) {
                Some(existing) if existing.equal(&new) => {}
                Some(existing) => {
                    let keep_time = existing.status == new.status;
                    let time = existing.last_transition_time.clone();
                    *existing = new;
                    if keep_time {
                        existing.last_transition_time = time;
                    }
                }
                None => self.conditions.push(new),
            }
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Move to `Unbound` unless already `Bound` or `Released`
    pub fn set_bindable(&mut self) {
        if matches!(
            self.binding_phase,
            BindingPhase::Bound | BindingPhase::Released
        ) {
            return;
        }
        self.binding_phase = BindingPhase::Unbound;
    }
}

/// Reference to another API object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Reference to a secret in any namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretReference {
    pub name: String,
    pub namespace: String,
}

/// Reference to a secret in the referrer's namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalSecretReference {
    pub name: String,
}

/// Label query selecting candidate classes for a claim
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClassSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl ClassSelector {
    /// Render as a Kubernetes label selector string
    pub fn to_label_selector(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Fields common to every managed resource spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// Secret the managed resource writes its connection details to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_connection_secret_to_ref: Option<SecretReference>,

    /// Claim this managed resource is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ObjectReference>,

    /// Class this managed resource was provisioned from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_ref: Option<ObjectReference>,

    /// Provider configuration used to connect to the external system
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaim_policy: Option<ReclaimPolicy>,
}

/// Fields common to every claim spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_selector: Option<ClassSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_ref: Option<ObjectReference>,

    /// Managed resource this claim is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_connection_secret_to_ref: Option<LocalSecretReference>,
}

/// Provisioning template carried by every class
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClassSpecTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaim_policy: Option<ReclaimPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<ObjectReference>,

    /// Namespace managed resources provisioned from this class write secrets to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_connection_secrets_to_namespace: Option<String>,
}
