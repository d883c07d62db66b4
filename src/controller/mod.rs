//! Reconcilers for managed resources, claims and claim scheduling, and the
//! collaborators they are assembled from.

pub mod claim;
pub mod connection;
pub mod managed;
pub mod reference;
#[cfg(test)]
mod reference_test;
pub mod runtime;
pub mod scheduling;

pub use claim::{
    configure_reclaim_policy, ensure_claimable, ApiBinder, ApiClaimFinalizer, ApiManagedCreator,
    Binder, ClaimFinalizer, ClaimReconciler, ClassTemplateConfigurator, Configurator,
    ManagedCreator, ManagedFactory, ObjectMetaConfigurator, ReclaimPolicyConfigurator,
};
pub use connection::{
    ConnectionPropagator, ConnectionPublisher, SecretPropagator, SecretPublisher,
    SECRET_TYPE_CONNECTION,
};
pub use managed::{
    ApiFinalizer, ExternalClient, ExternalConnecter, ExternalCreation, ExternalObservation,
    ExternalUpdate, Initializer, ManagedFinalizer, ManagedReconciler, NameAsExternalName,
};
pub use reference::{
    ApiReferenceResolver, NopReferenceResolver, ObjectReferencer, ReferenceResolver,
    ReferenceState, ReferenceStatus, Referencer,
};
pub use runtime::{run_controller, ControllerState, Reconciler};
pub use scheduling::{select_class, ClassScheduler, SchedulingMode};
