//! Managed resource reconciler
//!
//! Drives one external resource towards the state declared by its managed
//! resource. Each reconcile:
//! 1. Fetches the managed resource (not found means deletion finished)
//! 2. Connects to the external system and runs the initializer chain
//! 3. Resolves cross-resource references until they are marked resolved
//! 4. Observes the external resource
//! 5. Deletes it, or unpublishes and finalizes, when deletion was requested
//! 6. Otherwise publishes connection details and creates or updates it
//!
//! Conditions are persisted before every requeue decision, so a failed status
//! write is itself the returned error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::connection::ConnectionPublisher;
use super::reference::{NopReferenceResolver, ReferenceResolver};
use super::runtime::Reconciler;
use crate::config::ReconcilerConfig;
use crate::crd::{Condition, ReclaimPolicy};
use crate::error::{ignore_not_found, Result, ResultExt};
use crate::resource::{
    add_finalizer, conditions, external_name, is_being_deleted, remove_finalizer,
    set_external_name, ConnectionDetails, Managed, MANAGED_FINALIZER,
};
use crate::store::{Request, Store};

/// Result of observing an external resource
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalObservation {
    pub resource_exists: bool,
    pub resource_up_to_date: bool,
    /// Observe filled in unset spec fields from the external resource
    pub resource_late_initialized: bool,
    pub connection_details: ConnectionDetails,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalCreation {
    pub connection_details: ConnectionDetails,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalUpdate {
    pub connection_details: ConnectionDetails,
}

/// Produces a client for the external system a managed resource lives in
#[async_trait]
pub trait ExternalConnecter<M>: Send + Sync {
    async fn connect(&self, mr: &M) -> Result<Box<dyn ExternalClient<M>>>;
}

/// Operations on one external resource.
///
/// Implementations must not block waiting for the external system to settle
/// and must be idempotent: creating a resource that already exists and
/// deleting one that is already gone are not failures. `observe` must not
/// change the external resource, though it may late-initialize `mr`.
#[async_trait]
pub trait ExternalClient<M>: Send + Sync {
    async fn observe(&self, mr: &mut M) -> Result<ExternalObservation>;
    async fn create(&self, mr: &mut M) -> Result<ExternalCreation>;
    async fn update(&self, mr: &mut M) -> Result<ExternalUpdate>;
    async fn delete(&self, mr: &mut M) -> Result<()>;
}

/// One step of the chain run before a managed resource is observed
#[async_trait]
pub trait Initializer<M>: Send + Sync {
    async fn initialize(&self, mr: &mut M) -> Result<()>;
}

/// Releases a managed resource once its external resource is gone
#[async_trait]
pub trait ManagedFinalizer<M>: Send + Sync {
    async fn finalize(&self, mr: &mut M) -> Result<()>;
}

/// Uses the managed resource's name as its external name when none is set
pub struct NameAsExternalName<M> {
    store: Arc<dyn Store<M>>,
}

impl<M> NameAsExternalName<M> {
    pub fn new(store: Arc<dyn Store<M>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<M: Managed> Initializer<M> for NameAsExternalName<M> {
    async fn initialize(&self, mr: &mut M) -> Result<()> {
        if external_name(&*mr).is_some() {
            return Ok(());
        }
        let name = mr.name_any();
        set_external_name(mr, &name);
        *mr = self
            .store
            .update(mr)
            .await
            .wrap_err("cannot set external name")?;
        Ok(())
    }
}

/// Adds the managed finalizer on initialization and removes it on finalization
pub struct ApiFinalizer<M> {
    store: Arc<dyn Store<M>>,
    finalizer: String,
}

impl<M> ApiFinalizer<M> {
    pub fn new(store: Arc<dyn Store<M>>, finalizer: &str) -> Self {
        Self {
            store,
            finalizer: finalizer.to_string(),
        }
    }
}

#[async_trait]
impl<M: Managed> Initializer<M> for ApiFinalizer<M> {
    async fn initialize(&self, mr: &mut M) -> Result<()> {
        if !add_finalizer(mr, &self.finalizer) {
            return Ok(());
        }
        *mr = self
            .store
            .update(mr)
            .await
            .wrap_err("cannot add finalizer")?;
        Ok(())
    }
}

#[async_trait]
impl<M: Managed> ManagedFinalizer<M> for ApiFinalizer<M> {
    async fn finalize(&self, mr: &mut M) -> Result<()> {
        if !remove_finalizer(mr, &self.finalizer) {
            return Ok(());
        }
        *mr = self
            .store
            .update(mr)
            .await
            .wrap_err("cannot remove finalizer")?;
        Ok(())
    }
}

/// Reconciles managed resources of kind `M` with their external resources
pub struct ManagedReconciler<M: Managed> {
    store: Arc<dyn Store<M>>,
    connecter: Arc<dyn ExternalConnecter<M>>,
    initializers: Vec<Arc<dyn Initializer<M>>>,
    resolver: Arc<dyn ReferenceResolver<M>>,
    publisher: Arc<dyn ConnectionPublisher<M>>,
    finalizer: Arc<dyn ManagedFinalizer<M>>,
    short_wait: Duration,
    long_wait: Duration,
}

impl<M: Managed> ManagedReconciler<M> {
    /// Build a reconciler with the default initializers and finalizer and no
    /// reference resolution
    pub fn new(
        store: Arc<dyn Store<M>>,
        connecter: Arc<dyn ExternalConnecter<M>>,
        publisher: Arc<dyn ConnectionPublisher<M>>,
        config: &ReconcilerConfig,
    ) -> Self {
        let finalizer = Arc::new(ApiFinalizer::new(store.clone(), MANAGED_FINALIZER));
        let initializers: Vec<Arc<dyn Initializer<M>>> = vec![
            Arc::new(NameAsExternalName::new(store.clone())) as Arc<dyn Initializer<M>>,
            finalizer.clone() as Arc<dyn Initializer<M>>,
        ];
        Self {
            initializers,
            finalizer,
            store,
            connecter,
            resolver: Arc::new(NopReferenceResolver),
            publisher,
            short_wait: config.short_wait(),
            long_wait: config.long_wait(),
        }
    }

    /// Replace the initializer chain
    pub fn with_initializers(mut self, initializers: Vec<Arc<dyn Initializer<M>>>) -> Self {
        self.initializers = initializers;
        self
    }

    pub fn with_reference_resolver(mut self, resolver: Arc<dyn ReferenceResolver<M>>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_finalizer(mut self, finalizer: Arc<dyn ManagedFinalizer<M>>) -> Self {
        self.finalizer = finalizer;
        self
    }

    /// Persist `conditions` and requeue after `wait`
    async fn requeue_with(
        &self,
        mr: &mut M,
        conditions: impl IntoIterator<Item = Condition> + Send,
        wait: Duration,
    ) -> Result<Action> {
        mr.set_conditions(conditions);
        self.store
            .update_status(mr)
            .await
            .wrap_err("cannot update managed resource status")?;
        Ok(Action::requeue(wait))
    }

    /// As `requeue_with`, ignoring a record that vanished mid-deletion
    async fn requeue_deleting(
        &self,
        mr: &mut M,
        synced: Condition,
        wait: Duration,
    ) -> Result<Action> {
        mr.set_conditions([conditions::deleting(), synced]);
        ignore_not_found(self.store.update_status(mr).await.map(|_| ()))
            .wrap_err("cannot update managed resource status")?;
        Ok(Action::requeue(wait))
    }

    fn references_resolved(mr: &M) -> bool {
        conditions::is_condition_true(
            mr.condition(conditions::CONDITION_TYPE_REFERENCES_RESOLVED),
        )
    }

    async fn reconcile_deletion(
        &self,
        mr: &mut M,
        external: &dyn ExternalClient<M>,
        observation: &ExternalObservation,
    ) -> Result<Action> {
        let name = mr.name_any();

        if observation.resource_exists && mr.reclaim_policy() == ReclaimPolicy::Delete {
            if let Err(e) = external.delete(mr).await {
                let e = e.wrap("cannot delete external resource");
                warn!("Failed to delete external resource for {}: {}", name, e);
                return self
                    .requeue_deleting(mr, conditions::reconcile_error(&e), self.short_wait)
                    .await;
            }
            info!("Requested deletion of external resource for {}", name);
            // The next observe confirms the external resource is gone
            return self
                .requeue_deleting(mr, conditions::reconcile_success(), self.short_wait)
                .await;
        }

        let unpublished = self
            .publisher
            .unpublish_connection(mr, &observation.connection_details)
            .await;
        if let Err(e) = ignore_not_found(unpublished) {
            let e = e.wrap("cannot unpublish connection details");
            return self
                .requeue_deleting(mr, conditions::reconcile_error(&e), self.short_wait)
                .await;
        }

        if let Err(e) = ignore_not_found(self.finalizer.finalize(mr).await) {
            let e = e.wrap("cannot finalize managed resource");
            return self
                .requeue_deleting(mr, conditions::reconcile_error(&e), self.short_wait)
                .await;
        }

        info!("Finalized managed resource {}", name);
        Ok(Action::await_change())
    }
}

#[async_trait]
impl<M: Managed> Reconciler for ManagedReconciler<M> {
    #[instrument(skip(self, request), fields(kind = %M::kind(&()), request = %request))]
    async fn reconcile(&self, request: &Request) -> Result<Action> {
        let mut mr = match self
            .store
            .get(request.namespace.as_deref(), &request.name)
            .await
        {
            Ok(mr) => mr,
            Err(e) if e.is_not_found() => {
                debug!("Managed resource {} no longer exists", request);
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.wrap("cannot get managed resource")),
        };

        let external = match self.connecter.connect(&mr).await {
            Ok(external) => external,
            Err(e) => {
                let e = e.wrap("cannot connect to provider");
                warn!("{}", e);
                return self
                    .requeue_with(&mut mr, [conditions::reconcile_error(&e)], self.short_wait)
                    .await;
            }
        };

        for initializer in &self.initializers {
            if let Err(e) = initializer.initialize(&mut mr).await {
                let e = e.wrap("cannot initialize managed resource");
                warn!("{}", e);
                return self
                    .requeue_with(&mut mr, [conditions::reconcile_error(&e)], self.short_wait)
                    .await;
            }
        }

        if !is_being_deleted(&mr) && !Self::references_resolved(&mr) {
            match self.resolver.resolve_references(&mut mr).await {
                Ok(()) => {
                    mr.set_conditions([conditions::reference_resolution_success()]);
                }
                Err(e) if e.is_references_not_ready() => {
                    info!("Waiting on references of {}: {}", request, e);
                    return self
                        .requeue_with(
                            &mut mr,
                            [conditions::reference_resolution_blocked(&e)],
                            self.long_wait,
                        )
                        .await;
                }
                Err(e) if e.is_wiring() => {
                    error!("Reference wiring defect for {}: {}", request, e);
                    self.requeue_with(&mut mr, [conditions::reconcile_error(&e)], self.long_wait)
                        .await?;
                    return Ok(Action::await_change());
                }
                Err(e) => {
                    let e = e.wrap("cannot resolve references");
                    warn!("{}", e);
                    return self
                        .requeue_with(&mut mr, [conditions::reconcile_error(&e)], self.short_wait)
                        .await;
                }
            }
        }

        let observation = match external.observe(&mut mr).await {
            Ok(observation) => observation,
            Err(e) => {
                let e = e.wrap("cannot observe external resource");
                warn!("{}", e);
                return self
                    .requeue_with(&mut mr, [conditions::reconcile_error(&e)], self.short_wait)
                    .await;
            }
        };
        debug!(
            exists = observation.resource_exists,
            up_to_date = observation.resource_up_to_date,
            "Observed external resource"
        );

        if is_being_deleted(&mr) {
            return self
                .reconcile_deletion(&mut mr, external.as_ref(), &observation)
                .await;
        }

        if let Err(e) = self
            .publisher
            .publish_connection(&mr, &observation.connection_details)
            .await
        {
            warn!("{}", e);
            return self
                .requeue_with(&mut mr, [conditions::reconcile_error(&e)], self.short_wait)
                .await;
        }

        if observation.resource_late_initialized {
            let status = mr.resource_status().cloned();
            match self.store.update(&mr).await {
                Ok(updated) => {
                    mr = updated;
                    if let Some(status) = status {
                        *mr.resource_status_mut() = status;
                    }
                }
                Err(e) => {
                    let e = e.wrap("cannot persist late-initialized spec");
                    warn!("{}", e);
                    return self
                        .requeue_with(&mut mr, [conditions::reconcile_error(&e)], self.short_wait)
                        .await;
                }
            }
        }

        if !observation.resource_exists {
            let creation = match external.create(&mut mr).await {
                Ok(creation) => creation,
                Err(e) => {
                    let e = e.wrap("cannot create external resource");
                    warn!("{}", e);
                    return self
                        .requeue_with(&mut mr, [conditions::reconcile_error(&e)], self.short_wait)
                        .await;
                }
            };
            if let Err(e) = self
                .publisher
                .publish_connection(&mr, &creation.connection_details)
                .await
            {
                warn!("{}", e);
                return self
                    .requeue_with(&mut mr, [conditions::reconcile_error(&e)], self.short_wait)
                    .await;
            }
            info!("Created external resource for {}", request);
            // Re-observe once the external system has finished provisioning
            return self
                .requeue_with(&mut mr, [conditions::reconcile_success()], self.short_wait)
                .await;
        }

        if observation.resource_up_to_date {
            // No push notifications from the external system; poll for drift
            return self
                .requeue_with(&mut mr, [conditions::reconcile_success()], self.long_wait)
                .await;
        }

        let update = match external.update(&mut mr).await {
            Ok(update) => update,
            Err(e) => {
                let e = e.wrap("cannot update external resource");
                warn!("{}", e);
                return self
                    .requeue_with(&mut mr, [conditions::reconcile_error(&e)], self.short_wait)
                    .await;
            }
        };
        if let Err(e) = self
            .publisher
            .publish_connection(&mr, &update.connection_details)
            .await
        {
            warn!("{}", e);
            return self
                .requeue_with(&mut mr, [conditions::reconcile_error(&e)], self.short_wait)
                .await;
        }

        info!("Updated external resource for {}", request);
        self.requeue_with(&mut mr, [conditions::reconcile_success()], self.long_wait)
            .await
    }
}
