//! Capabilities the reconcilers need from concrete resource kinds
//!
//! Provider kinds are ordinary `kube::CustomResource` types. They embed the
//! shared structs from [`crate::crd`] and implement [`Managed`], [`Claim`] or
//! [`Class`] to expose them to the engine.

pub mod conditions;
mod finalizers;
mod meta;

use std::collections::BTreeMap;
use std::fmt::Debug;

use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};

use crate::crd::{
    BindingPhase, ClaimSpec, ClassSpecTemplate, Condition, ReclaimPolicy, ResourceSpec,
    ResourceStatus,
};

pub use finalizers::{
    add_finalizer, has_finalizer, is_being_deleted, remove_finalizer, CLAIM_FINALIZER,
    MANAGED_FINALIZER,
};
pub use meta::*;

/// Named credentials and endpoints produced by managing a resource
pub type ConnectionDetails = BTreeMap<String, Vec<u8>>;

/// Any API object the engine reads and writes through a [`crate::store::Store`]
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Objects carrying a binding phase and conditions
pub trait Conditioned {
    fn resource_status(&self) -> Option<&ResourceStatus>;

    /// Mutable status, created on first use
    fn resource_status_mut(&mut self) -> &mut ResourceStatus;

    fn binding_phase(&self) -> BindingPhase {
        self.resource_status()
            .map(|s| s.binding_phase)
            .unwrap_or_default()
    }

    fn set_binding_phase(&mut self, phase: BindingPhase) {
        self.resource_status_mut().binding_phase = phase;
    }

    fn set_conditions<I>(&mut self, conditions: I)
    where
        I: IntoIterator<Item = Condition>,
        Self: Sized,
    {
        self.resource_status_mut().set_conditions(conditions);
    }

    fn condition(&self, type_: &str) -> Option<&Condition> {
        self.resource_status().and_then(|s| s.condition(type_))
    }
}

/// A managed resource: the declarative proxy for one external resource
pub trait Managed: Object + Conditioned {
    fn resource_spec(&self) -> &ResourceSpec;
    fn resource_spec_mut(&mut self) -> &mut ResourceSpec;

    /// Reclaim policy, defaulting to `Delete` when unset
    fn reclaim_policy(&self) -> ReclaimPolicy {
        self.resource_spec()
            .reclaim_policy
            .unwrap_or(ReclaimPolicy::Delete)
    }
}

/// A claim: an abstract request satisfied by binding a managed resource
pub trait Claim: Object + Conditioned {
    fn claim_spec(&self) -> &ClaimSpec;
    fn claim_spec_mut(&mut self) -> &mut ClaimSpec;
}

/// A class: the template a managed resource is provisioned from
pub trait Class: Object {
    fn template(&self) -> &ClassSpecTemplate;
}

/// Whether the object is waiting to be bound
pub fn is_bindable<T: Conditioned>(obj: &T) -> bool {
    obj.binding_phase() == BindingPhase::Unbound
}

pub fn is_bound<T: Conditioned>(obj: &T) -> bool {
    obj.binding_phase() == BindingPhase::Bound
}

/// Mark the object ready to be bound. External clients call this from
/// `observe` once the external resource is usable; it never moves an object
/// out of `Bound` or `Released`.
pub fn set_bindable<T: Conditioned>(obj: &mut T) {
    obj.resource_status_mut().set_bindable();
}
