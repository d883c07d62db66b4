//! Finalizer bookkeeping for managed resources and claims
//!
//! Finalizers ensure that:
//! 1. A managed resource is not removed from the store until its external
//!    resource has been deleted (or retained) and its secrets unpublished
//! 2. A claim is not removed until its managed resource has been unbound
//!
//! These helpers only edit object metadata; callers persist the change.

use kube::{Resource, ResourceExt};

/// Finalizer protecting managed resources
pub const MANAGED_FINALIZER: &str = "finalizer.managedresource.managed-runtime.io";

/// Finalizer protecting claims
pub const CLAIM_FINALIZER: &str = "finalizer.resourceclaim.managed-runtime.io";

/// Add a finalizer if not present. Returns whether the object changed.
pub fn add_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.finalizers_mut().push(finalizer.to_string());
    true
}

/// Remove a finalizer. Returns whether the object changed.
pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    let finalizers = obj.finalizers_mut();
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

/// A deletion timestamp means deletion was requested and finalizers are holding it
pub fn is_being_deleted<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}
