//! Object metadata helpers: annotations, references and ownership

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use super::Object;
use crate::crd::ObjectReference;

/// Name of the resource in the external system
pub const EXTERNAL_NAME_ANNOTATION: &str = "managed-runtime.io/external-name";

/// Marks a class as the default for claims without a class selector
pub const DEFAULT_CLASS_ANNOTATION: &str = "managed-runtime.io/default-class";

/// Prefix of the annotation a propagation source records per destination
pub const PROPAGATE_TO_PREFIX: &str = "to.propagate.managed-runtime.io";
pub const PROPAGATE_FROM_NAMESPACE: &str = "from.propagate.managed-runtime.io/namespace";
pub const PROPAGATE_FROM_NAME: &str = "from.propagate.managed-runtime.io/name";
pub const PROPAGATE_FROM_UID: &str = "from.propagate.managed-runtime.io/uid";

pub fn external_name<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(EXTERNAL_NAME_ANNOTATION))
        .map(String::as_str)
        .filter(|name| !name.is_empty())
}

pub fn set_external_name<K: Resource>(obj: &mut K, name: &str) {
    obj.annotations_mut()
        .insert(EXTERNAL_NAME_ANNOTATION.to_string(), name.to_string());
}

pub fn is_default_class<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(DEFAULT_CLASS_ANNOTATION))
        .is_some_and(|v| v == "true")
}

/// Build a reference pointing at `obj`
pub fn reference_to<K: Object>(obj: &K) -> ObjectReference {
    ObjectReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        namespace: obj.namespace(),
        name: obj.name_any(),
        uid: obj.uid(),
    }
}

/// Whether a reference points at `obj`, comparing UIDs when both are known
pub fn refers_to<K: Object>(reference: &ObjectReference, obj: &K) -> bool {
    if let (Some(a), Some(b)) = (reference.uid.as_deref(), obj.uid()) {
        return a == b;
    }
    reference.name == obj.name_any() && reference.namespace == obj.namespace()
}

/// Create a controlling OwnerReference for garbage collection
pub fn controller_reference<K: Object>(obj: &K) -> OwnerReference {
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
        uid: obj.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// UID of the controlling owner, if any
pub fn controller_uid<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller == Some(true))
        .map(|o| o.uid.as_str())
}

/// Annotation key a propagation source uses to record the destination with `uid`
pub fn propagate_to_key(uid: &str) -> String {
    format!("{PROPAGATE_TO_PREFIX}/{uid}")
}
