//! Claim reconciler
//!
//! Binds a claim to a managed resource, provisioning one from the claim's
//! class when the claim does not name an existing resource. The binding
//! state machine runs on the managed resource's binding phase:
//!
//! - Unset: the resource is not ready yet, so the claim waits in `Binding`
//! - Unbound: propagate connection details, add the claim finalizer, bind
//! - Bound: the claim is `Available`
//!
//! Deleting a claim unbinds the resource, which releases it and deletes it
//! when its reclaim policy is `Delete`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::connection::ConnectionPropagator;
use super::runtime::Reconciler;
use crate::config::ReconcilerConfig;
use crate::crd::{BindingPhase, Condition, ObjectReference, ReclaimPolicy, SecretReference};
use crate::error::{ignore_not_found, Error, Result, ResultExt};
use crate::resource::{
    add_finalizer, conditions, external_name, is_being_deleted, is_bindable, is_bound,
    reference_to, refers_to, remove_finalizer, set_external_name, Claim, Class, Managed,
    CLAIM_FINALIZER,
};
use crate::store::{Request, Store};

/// Builds an empty managed resource of kind `M` from a class of kind `K`.
///
/// This is the only kind-specific step of provisioning; the configurator
/// chain fills in everything the engine knows about.
pub type ManagedFactory<K, M> = Arc<dyn Fn(&K) -> M + Send + Sync>;

/// One step of the chain that configures a new managed resource
pub trait Configurator<C, K, M>: Send + Sync {
    fn configure(&self, claim: &C, class: &K, mr: &mut M) -> Result<()>;
}

/// Creates the managed resource for a claim and records it on the claim
#[async_trait]
pub trait ManagedCreator<C, K, M>: Send + Sync {
    async fn create(&self, claim: &mut C, class: &K, mr: M) -> Result<M>;
}

/// Binds and unbinds claims and managed resources
#[async_trait]
pub trait Binder<C, M>: Send + Sync {
    async fn bind(&self, claim: &mut C, mr: &mut M) -> Result<()>;
    async fn unbind(&self, claim: &C, mr: &mut M) -> Result<()>;
}

#[async_trait]
pub trait ClaimFinalizer<C>: Send + Sync {
    async fn add_finalizer(&self, claim: &mut C) -> Result<()>;
    async fn finalize(&self, claim: &mut C) -> Result<()>;
}

/// Names the managed resource after its claim and points it at the claim
/// and class
pub struct ObjectMetaConfigurator;

impl<C: Claim, K: Class, M: Managed> Configurator<C, K, M> for ObjectMetaConfigurator {
    fn configure(&self, claim: &C, class: &K, mr: &mut M) -> Result<()> {
        let namespace = claim.namespace().unwrap_or_default();
        mr.meta_mut().generate_name = Some(format!("{}-{}-", namespace, claim.name_any()));

        let spec = mr.resource_spec_mut();
        spec.claim_ref = Some(reference_to(claim));
        spec.class_ref = Some(reference_to(class));

        if let Some(name) = external_name(claim) {
            set_external_name(mr, name);
        }
        Ok(())
    }
}

/// Copies the provider and connection secret settings of the class
pub struct ClassTemplateConfigurator;

impl<C: Claim, K: Class, M: Managed> Configurator<C, K, M> for ClassTemplateConfigurator {
    fn configure(&self, claim: &C, class: &K, mr: &mut M) -> Result<()> {
        let template = class.template();
        let spec = mr.resource_spec_mut();
        spec.provider_ref = template.provider_ref.clone();

        // Claims are namespaced but managed resources are not, so the class
        // decides where connection secrets live. The claim UID keeps the
        // secret name unique within that namespace.
        if let Some(namespace) = template.write_connection_secrets_to_namespace.as_ref() {
            let uid = claim.uid().ok_or_else(|| {
                Error::ConfigError(format!("claim {} has no UID", claim.name_any()))
            })?;
            spec.write_connection_secret_to_ref = Some(SecretReference {
                namespace: namespace.clone(),
                name: uid,
            });
        }
        Ok(())
    }
}

/// Reclaim policy for a new managed resource: the value it already has,
/// else the class value, else `Delete`
pub fn configure_reclaim_policy(
    managed: Option<ReclaimPolicy>,
    class: Option<ReclaimPolicy>,
) -> ReclaimPolicy {
    managed.or(class).unwrap_or(ReclaimPolicy::Delete)
}

pub struct ReclaimPolicyConfigurator;

impl<C: Claim, K: Class, M: Managed> Configurator<C, K, M> for ReclaimPolicyConfigurator {
    fn configure(&self, _claim: &C, class: &K, mr: &mut M) -> Result<()> {
        let policy = configure_reclaim_policy(
            mr.resource_spec().reclaim_policy,
            class.template().reclaim_policy,
        );
        mr.resource_spec_mut().reclaim_policy = Some(policy);
        Ok(())
    }
}

/// Creates managed resources through the store
pub struct ApiManagedCreator<C, M> {
    claims: Arc<dyn Store<C>>,
    managed: Arc<dyn Store<M>>,
}

impl<C, M> ApiManagedCreator<C, M> {
    pub fn new(claims: Arc<dyn Store<C>>, managed: Arc<dyn Store<M>>) -> Self {
        Self { claims, managed }
    }
}

#[async_trait]
impl<C: Claim, K: Class, M: Managed> ManagedCreator<C, K, M> for ApiManagedCreator<C, M> {
    async fn create(&self, claim: &mut C, _class: &K, mr: M) -> Result<M> {
        let mr = self
            .managed
            .create(&mr)
            .await
            .wrap_err("cannot create managed resource")?;

        claim.claim_spec_mut().resource_ref = Some(reference_to(&mr));
        *claim = self
            .claims
            .update(claim)
            .await
            .wrap_err("cannot set resource reference on claim")?;
        Ok(mr)
    }
}

/// Fails with [`Error::BindingError`] when `mr` is claimed by a claim other
/// than `claim`
pub fn ensure_claimable<C: Claim, M: Managed>(claim: &C, mr: &M) -> Result<()> {
    match mr.resource_spec().claim_ref.as_ref() {
        Some(existing) if !refers_to(existing, claim) => Err(Error::BindingError(format!(
            "managed resource {} is already claimed by {}",
            mr.name_any(),
            existing.name
        ))),
        _ => Ok(()),
    }
}

/// Binds through the store
pub struct ApiBinder<C, M> {
    claims: Arc<dyn Store<C>>,
    managed: Arc<dyn Store<M>>,
}

impl<C, M> ApiBinder<C, M> {
    pub fn new(claims: Arc<dyn Store<C>>, managed: Arc<dyn Store<M>>) -> Self {
        Self { claims, managed }
    }
}

#[async_trait]
impl<C: Claim, M: Managed> Binder<C, M> for ApiBinder<C, M> {
    async fn bind(&self, claim: &mut C, mr: &mut M) -> Result<()> {
        ensure_claimable(&*claim, &*mr)?;

        claim.claim_spec_mut().resource_ref = Some(reference_to(&*mr));
        if let Some(name) = external_name(&*mr) {
            let name = name.to_string();
            set_external_name(claim, &name);
        }
        *claim = self
            .claims
            .update(claim)
            .await
            .wrap_err("cannot update claim")?;

        mr.resource_spec_mut().claim_ref = Some(reference_to(&*claim));
        *mr = self
            .managed
            .update(mr)
            .await
            .wrap_err("cannot update managed resource")?;

        mr.set_binding_phase(BindingPhase::Bound);
        *mr = self
            .managed
            .update_status(mr)
            .await
            .wrap_err("cannot update managed resource status")?;

        claim.set_binding_phase(BindingPhase::Bound);
        *claim = self
            .claims
            .update_status(claim)
            .await
            .wrap_err("cannot update claim status")?;
        Ok(())
    }

    async fn unbind(&self, claim: &C, mr: &mut M) -> Result<()> {
        // Leave resources bound to some other claim alone
        match mr.resource_spec().claim_ref.as_ref() {
            Some(existing) if refers_to(existing, claim) => {}
            _ => return Ok(()),
        }

        mr.resource_spec_mut().claim_ref = None;
        match self.managed.update(mr).await {
            Ok(updated) => *mr = updated,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.wrap("cannot clear claim reference")),
        }

        mr.set_binding_phase(BindingPhase::Released);
        match self.managed.update_status(mr).await {
            Ok(updated) => *mr = updated,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.wrap("cannot update managed resource status")),
        }

        if mr.reclaim_policy() != ReclaimPolicy::Delete {
            return Ok(());
        }
        ignore_not_found(self.managed.delete(mr).await).wrap_err("cannot delete managed resource")
    }
}

/// Adds and removes the claim finalizer through the store
pub struct ApiClaimFinalizer<C> {
    claims: Arc<dyn Store<C>>,
    finalizer: String,
}

impl<C> ApiClaimFinalizer<C> {
    pub fn new(claims: Arc<dyn Store<C>>, finalizer: &str) -> Self {
        Self {
            claims,
            finalizer: finalizer.to_string(),
        }
    }
}

#[async_trait]
impl<C: Claim> ClaimFinalizer<C> for ApiClaimFinalizer<C> {
    async fn add_finalizer(&self, claim: &mut C) -> Result<()> {
        if !add_finalizer(claim, &self.finalizer) {
            return Ok(());
        }
        *claim = self
            .claims
            .update(claim)
            .await
            .wrap_err("cannot add claim finalizer")?;
        Ok(())
    }

    async fn finalize(&self, claim: &mut C) -> Result<()> {
        if !remove_finalizer(claim, &self.finalizer) {
            return Ok(());
        }
        match self.claims.update(claim).await {
            Ok(updated) => *claim = updated,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.wrap("cannot remove claim finalizer")),
        }
        Ok(())
    }
}

/// Reconciles claims of kind `C` against managed resources of kind `M`
/// provisioned from classes of kind `K`
pub struct ClaimReconciler<C: Claim, K: Class, M: Managed> {
    claims: Arc<dyn Store<C>>,
    classes: Arc<dyn Store<K>>,
    managed: Arc<dyn Store<M>>,
    new_managed: ManagedFactory<K, M>,
    configurators: Vec<Arc<dyn Configurator<C, K, M>>>,
    creator: Arc<dyn ManagedCreator<C, K, M>>,
    propagator: Arc<dyn ConnectionPropagator<C, M>>,
    binder: Arc<dyn Binder<C, M>>,
    finalizer: Arc<dyn ClaimFinalizer<C>>,
    short_wait: Duration,
}

impl<C: Claim, K: Class, M: Managed> ClaimReconciler<C, K, M> {
    /// Build a reconciler with the default configurators, creator, binder and
    /// finalizer
    pub fn new(
        claims: Arc<dyn Store<C>>,
        classes: Arc<dyn Store<K>>,
        managed: Arc<dyn Store<M>>,
        new_managed: ManagedFactory<K, M>,
        propagator: Arc<dyn ConnectionPropagator<C, M>>,
        config: &ReconcilerConfig,
    ) -> Self {
        let configurators: Vec<Arc<dyn Configurator<C, K, M>>> = vec![
            Arc::new(ObjectMetaConfigurator) as Arc<dyn Configurator<C, K, M>>,
            Arc::new(ClassTemplateConfigurator) as Arc<dyn Configurator<C, K, M>>,
            Arc::new(ReclaimPolicyConfigurator) as Arc<dyn Configurator<C, K, M>>,
        ];
        Self {
            creator: Arc::new(ApiManagedCreator::new(claims.clone(), managed.clone())),
            binder: Arc::new(ApiBinder::new(claims.clone(), managed.clone())),
            finalizer: Arc::new(ApiClaimFinalizer::new(claims.clone(), CLAIM_FINALIZER)),
            configurators,
            claims,
            classes,
            managed,
            new_managed,
            propagator,
            short_wait: config.short_wait(),
        }
    }

    /// Replace the configurator chain
    pub fn with_configurators(
        mut self,
        configurators: Vec<Arc<dyn Configurator<C, K, M>>>,
    ) -> Self {
        self.configurators = configurators;
        self
    }

    pub fn with_creator(mut self, creator: Arc<dyn ManagedCreator<C, K, M>>) -> Self {
        self.creator = creator;
        self
    }

    pub fn with_binder(mut self, binder: Arc<dyn Binder<C, M>>) -> Self {
        self.binder = binder;
        self
    }

    pub fn with_finalizer(mut self, finalizer: Arc<dyn ClaimFinalizer<C>>) -> Self {
        self.finalizer = finalizer;
        self
    }

    /// Persist `conditions` and requeue after `wait`, or wait for a change
    /// when `wait` is `None`
    async fn set_status(
        &self,
        claim: &mut C,
        conditions: impl IntoIterator<Item = Condition> + Send,
        wait: Option<Duration>,
    ) -> Result<Action> {
        claim.set_conditions(conditions);
        ignore_not_found(self.claims.update_status(claim).await.map(|_| ()))
            .wrap_err("cannot update claim status")?;
        Ok(wait.map_or_else(Action::await_change, Action::requeue))
    }

    async fn failed(&self, claim: &mut C, phase: Condition, err: &Error) -> Result<Action> {
        warn!("{}", err);
        self.set_status(
            claim,
            [phase, conditions::reconcile_error(err)],
            Some(self.short_wait),
        )
        .await
    }

    async fn reconcile_deletion(&self, claim: &mut C, managed: Option<&mut M>) -> Result<Action> {
        if let Some(mr) = managed {
            if let Err(e) = self.binder.unbind(claim, mr).await {
                let e = e.wrap("cannot unbind managed resource");
                return self.failed(claim, conditions::deleting(), &e).await;
            }
        }

        if let Err(e) = self.finalizer.finalize(claim).await {
            let e = e.wrap("cannot finalize claim");
            return self.failed(claim, conditions::deleting(), &e).await;
        }

        info!("Finalized claim {}", claim.name_any());
        Ok(Action::await_change())
    }

    /// Provision a managed resource from the claim's class
    async fn provision(&self, claim: &mut C, class_ref: &ObjectReference) -> Result<M> {
        let class = self
            .classes
            .get(class_ref.namespace.as_deref(), &class_ref.name)
            .await
            .wrap_err("cannot get resource class")?;

        let mut mr = (self.new_managed)(&class);
        for configurator in &self.configurators {
            configurator
                .configure(claim, &class, &mut mr)
                .wrap_err("cannot configure managed resource")?;
        }

        self.creator.create(claim, &class, mr).await
    }
}

#[async_trait]
impl<C: Claim, K: Class, M: Managed> Reconciler for ClaimReconciler<C, K, M> {
    #[instrument(skip(self, request), fields(kind = %C::kind(&()), request = %request))]
    async fn reconcile(&self, request: &Request) -> Result<Action> {
        let mut claim = match self
            .claims
            .get(request.namespace.as_deref(), &request.name)
            .await
        {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => {
                debug!("Claim {} no longer exists", request);
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.wrap("cannot get claim")),
        };

        let mut managed = None;
        if let Some(resource_ref) = claim.claim_spec().resource_ref.clone() {
            match self
                .managed
                .get(resource_ref.namespace.as_deref(), &resource_ref.name)
                .await
            {
                Ok(mr) => managed = Some(mr),
                // A deleted claim has nothing left to unbind
                Err(e) if e.is_not_found() && is_being_deleted(&claim) => {}
                Err(e) if e.is_not_found() => {
                    // The resource may be created shortly
                    debug!("Managed resource {} not found", resource_ref.name);
                    return self
                        .set_status(
                            &mut claim,
                            [conditions::binding(), conditions::reconcile_success()],
                            Some(self.short_wait),
                        )
                        .await;
                }
                Err(e) => {
                    let e = e.wrap("cannot get managed resource");
                    warn!("{}", e);
                    return self
                        .set_status(
                            &mut claim,
                            [conditions::reconcile_error(&e)],
                            Some(self.short_wait),
                        )
                        .await;
                }
            }
        }

        if is_being_deleted(&claim) {
            return self.reconcile_deletion(&mut claim, managed.as_mut()).await;
        }

        let mut mr = match managed {
            Some(mr) => mr,
            None => {
                let Some(class_ref) = claim.claim_spec().class_ref.clone() else {
                    debug!("Claim {} is waiting to be scheduled to a class", request);
                    return Ok(Action::await_change());
                };
                match self.provision(&mut claim, &class_ref).await {
                    Ok(mr) => {
                        info!(
                            "Created managed resource {} for claim {}",
                            mr.name_any(),
                            request
                        );
                        mr
                    }
                    Err(e) => return self.failed(&mut claim, conditions::creating(), &e).await,
                }
            }
        };

        if !is_bindable(&mr) && !is_bound(&mr) {
            // A statically provisioned resource has no claim reference to
            // trigger a watch on, so poll until it becomes bindable.
            let wait = mr
                .resource_spec()
                .claim_ref
                .is_none()
                .then_some(self.short_wait);
            debug!("Managed resource {} is not yet bindable", mr.name_any());
            return self
                .set_status(
                    &mut claim,
                    [conditions::binding(), conditions::reconcile_success()],
                    wait,
                )
                .await;
        }

        // Checked before propagation so no connection details reach a
        // claim that does not own the resource
        if let Err(e) = ensure_claimable(&claim, &mr) {
            return self.failed(&mut claim, conditions::binding(), &e).await;
        }

        if is_bindable(&mr) {
            if let Err(e) = self.propagator.propagate_connection(&claim, &mr).await {
                let e = e.wrap("cannot propagate connection details");
                return self.failed(&mut claim, conditions::binding(), &e).await;
            }

            if let Err(e) = self.finalizer.add_finalizer(&mut claim).await {
                let e = e.wrap("cannot add claim finalizer");
                return self.failed(&mut claim, conditions::binding(), &e).await;
            }

            if let Err(e) = self.binder.bind(&mut claim, &mut mr).await {
                let e = e.wrap("cannot bind managed resource");
                return self.failed(&mut claim, conditions::binding(), &e).await;
            }
            info!("Bound claim {} to managed resource {}", request, mr.name_any());
        }

        self.set_status(
            &mut claim,
            [conditions::available(), conditions::reconcile_success()],
            None,
        )
        .await
    }
}
