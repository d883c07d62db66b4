//! Controller wiring
//!
//! Runs any [`Reconciler`] under the kube-rs runtime. The watch stream and
//! work queue come from `kube::runtime::Controller`, which deduplicates
//! requests per object; this module adds the per-reconcile deadline and the
//! error policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{error, info};

use crate::config::ReconcilerConfig;
use crate::error::{Error, Result};
use crate::resource::Object;
use crate::store::Request;

/// Drives the object identified by a request towards its desired state
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, request: &Request) -> Result<Action>;
}

/// Shared state for a running controller
pub struct ControllerState<R> {
    pub reconciler: R,
    pub timeout: Duration,
    pub short_wait: Duration,
    pub long_wait: Duration,
}

impl<R: Reconciler> ControllerState<R> {
    pub fn new(reconciler: R, config: &ReconcilerConfig) -> Self {
        Self {
            reconciler,
            timeout: config.reconcile_timeout(),
            short_wait: config.short_wait(),
            long_wait: config.long_wait(),
        }
    }

    /// Reconcile one request, aborting it when the deadline passes
    pub async fn reconcile_with_deadline(&self, request: &Request) -> Result<Action> {
        match tokio::time::timeout(self.timeout, self.reconciler.reconcile(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.timeout)),
        }
    }

    /// Requeue delay after a failed reconcile
    pub fn retry_after(&self, error: &Error) -> Duration {
        if error.is_retriable() {
            self.short_wait
        } else {
            self.long_wait
        }
    }
}

/// Watch objects of kind `K` and reconcile them until a shutdown signal
pub async fn run_controller<K, R>(api: Api<K>, state: Arc<ControllerState<R>>)
where
    K: Object,
    R: Reconciler,
{
    info!("Starting {} controller", K::kind(&()));

    Controller::new(api, Config::default())
        .shutdown_on_signal()
        .run(reconcile::<K, R>, error_policy::<K, R>, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    info!("{} controller stopped", K::kind(&()));
}

async fn reconcile<K, R>(obj: Arc<K>, ctx: Arc<ControllerState<R>>) -> Result<Action>
where
    K: Object,
    R: Reconciler,
{
    let request = Request::for_object(obj.as_ref());
    ctx.reconcile_with_deadline(&request).await
}

/// Error policy determines how to handle reconciliation errors
fn error_policy<K, R>(obj: Arc<K>, error: &Error, ctx: Arc<ControllerState<R>>) -> Action
where
    K: Object,
    R: Reconciler,
{
    error!("Reconciliation error for {}: {:?}", obj.name_any(), error);
    Action::requeue(ctx.retry_after(error))
}
