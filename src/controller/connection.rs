//! Connection secret publication and propagation
//!
//! A managed resource publishes its connection details to a secret it
//! controls. When a claim binds it, those details are propagated into a
//! secret in the claim's namespace.
//!
//! # Security guarantees
//!
//! - A secret is only modified when it is controlled by the writing object, or
//!   when it is uncontrolled and carries the connection secret type.
//! - Propagation only reads a source secret that is controlled by the managed
//!   resource, so propagation cannot be used to copy a secret the caller does
//!   not control.
//! - Secret values are never logged.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::error::{Error, Result, ResultExt};
use crate::resource::{
    controller_reference, controller_uid, propagate_to_key, Claim, ConnectionDetails, Managed,
    Object, PROPAGATE_FROM_NAME, PROPAGATE_FROM_NAMESPACE, PROPAGATE_FROM_UID,
};
use crate::store::Store;

/// Type of secrets created to hold connection details
pub const SECRET_TYPE_CONNECTION: &str = "connection.managed-runtime.io/v1alpha1";

/// Publishes connection details of a managed resource
#[async_trait]
pub trait ConnectionPublisher<M>: Send + Sync {
    async fn publish_connection(&self, mr: &M, details: &ConnectionDetails) -> Result<()>;
    async fn unpublish_connection(&self, mr: &M, details: &ConnectionDetails) -> Result<()>;
}

/// Propagates connection details from a managed resource to its claim
#[async_trait]
pub trait ConnectionPropagator<C, M>: Send + Sync {
    async fn propagate_connection(&self, to: &C, from: &M) -> Result<()>;
}

/// Connection secret for `owner`, controlled by it
fn connection_secret_for<K: Object>(
    owner: &K,
    namespace: &str,
    name: &str,
    data: BTreeMap<String, ByteString>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![controller_reference(owner)]),
            ..Default::default()
        },
        type_: Some(SECRET_TYPE_CONNECTION.to_string()),
        data: Some(data),
        ..Default::default()
    }
}

fn to_secret_data(details: &ConnectionDetails) -> BTreeMap<String, ByteString> {
    details
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.clone())))
        .collect()
}

/// Refuse to write a secret someone else controls
fn must_be_controllable_by(current: &Secret, uid: &str) -> Result<()> {
    match controller_uid(current) {
        None if current.type_.as_deref() != Some(SECRET_TYPE_CONNECTION) => {
            Err(Error::SecretConflict(format!(
                "refusing to modify uncontrolled secret {} of type {:?}",
                current.name_any(),
                current.type_.as_deref().unwrap_or_default()
            )))
        }
        None => Ok(()),
        Some(controller) if controller != uid => Err(Error::SecretConflict(format!(
            "existing secret {} is not controlled by UID {uid}",
            current.name_any()
        ))),
        Some(_) => Ok(()),
    }
}

/// Create the secret, or merge `desired` into the existing one.
///
/// Existing keys absent from `desired` are kept, colliding keys are
/// overwritten, and desired annotations are added.
async fn apply_secret(secrets: &dyn Store<Secret>, desired: Secret, owner_uid: &str) -> Result<Secret> {
    let namespace = desired.namespace();
    let name = desired.name_any();
    let mut current = match secrets.get(namespace.as_deref(), &name).await {
        Ok(current) => current,
        Err(e) if e.is_not_found() => {
            return secrets.create(&desired).await.wrap_err("cannot create secret");
        }
        Err(e) => return Err(e.wrap("cannot get secret")),
    };

    must_be_controllable_by(&current, owner_uid)?;

    current
        .data
        .get_or_insert_with(Default::default)
        .extend(desired.data.unwrap_or_default());
    current
        .annotations_mut()
        .extend(desired.metadata.annotations.unwrap_or_default());
    if controller_uid(&current).is_none() {
        current.metadata.owner_references = desired.metadata.owner_references;
    }

    secrets.update(&current).await.wrap_err("cannot update secret")
}

/// Writes connection details to the secret named by the managed resource's
/// `writeConnectionSecretToRef`.
///
/// Unpublishing is a no-op: the secret is owned by the managed resource and
/// garbage collected with it.
pub struct SecretPublisher {
    secrets: Arc<dyn Store<Secret>>,
}

impl SecretPublisher {
    pub fn new(secrets: Arc<dyn Store<Secret>>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl<M: Managed> ConnectionPublisher<M> for SecretPublisher {
    async fn publish_connection(&self, mr: &M, details: &ConnectionDetails) -> Result<()> {
        let Some(target) = mr.resource_spec().write_connection_secret_to_ref.as_ref() else {
            return Ok(());
        };
        let desired =
            connection_secret_for(mr, &target.namespace, &target.name, to_secret_data(details));
        apply_secret(self.secrets.as_ref(), desired, &mr.uid().unwrap_or_default())
            .await
            .wrap_err("cannot publish connection details")?;
        debug!(
            secret = %format!("{}/{}", target.namespace, target.name),
            keys = details.len(),
            "Published connection details"
        );
        Ok(())
    }

    async fn unpublish_connection(&self, _mr: &M, _details: &ConnectionDetails) -> Result<()> {
        Ok(())
    }
}

/// Copies a managed resource's connection secret into its claim's namespace
pub struct SecretPropagator {
    secrets: Arc<dyn Store<Secret>>,
}

impl SecretPropagator {
    pub fn new(secrets: Arc<dyn Store<Secret>>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl<C: Claim, M: Managed> ConnectionPropagator<C, M> for SecretPropagator {
    async fn propagate_connection(&self, to: &C, from: &M) -> Result<()> {
        // Either the resource exposes no secret or the claim does not want one
        let (Some(source_ref), Some(dest_ref)) = (
            from.resource_spec().write_connection_secret_to_ref.as_ref(),
            to.claim_spec().write_connection_secret_to_ref.as_ref(),
        ) else {
            return Ok(());
        };
        let dest_namespace = to.namespace().ok_or_else(|| {
            Error::ConfigError(format!("claim {} has no namespace", to.name_any()))
        })?;

        let mut source = self
            .secrets
            .get(Some(&source_ref.namespace), &source_ref.name)
            .await
            .wrap_err("cannot get managed resource's connection secret")?;

        let managed_uid = from.uid().unwrap_or_default();
        if controller_uid(&source) != Some(managed_uid.as_str()) {
            return Err(Error::SecretConflict(format!(
                "connection secret {}/{} is not controlled by managed resource {}",
                source_ref.namespace,
                source_ref.name,
                from.name_any()
            )));
        }

        let mut desired = connection_secret_for(
            to,
            &dest_namespace,
            &dest_ref.name,
            source.data.clone().unwrap_or_default(),
        );
        desired.annotations_mut().extend([
            (
                PROPAGATE_FROM_NAMESPACE.to_string(),
                source_ref.namespace.clone(),
            ),
            (PROPAGATE_FROM_NAME.to_string(), source_ref.name.clone()),
            (
                PROPAGATE_FROM_UID.to_string(),
                source.uid().unwrap_or_default(),
            ),
        ]);

        let dest = apply_secret(self.secrets.as_ref(), desired, &to.uid().unwrap_or_default())
            .await
            .wrap_err("cannot apply claim's connection secret")?;

        source.annotations_mut().insert(
            propagate_to_key(&dest.uid().unwrap_or_default()),
            format!("{}/{}", dest_namespace, dest_ref.name),
        );
        self.secrets
            .update(&source)
            .await
            .wrap_err("cannot record propagation on managed resource's connection secret")?;

        info!(
            from = %format!("{}/{}", source_ref.namespace, source_ref.name),
            to = %format!("{}/{}", dest_namespace, dest_ref.name),
            "Propagated connection secret"
        );
        Ok(())
    }
}
