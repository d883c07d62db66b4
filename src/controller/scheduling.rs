//! Claim scheduling and defaulting
//!
//! Several controller replicas (often one per provider) may race to assign a
//! class to the same claim. Each replica lists its candidate classes, picks
//! one at random, sleeps for a random jitter and then writes the class
//! reference with optimistic concurrency. The replica whose write lands first
//! wins; the others hit a conflict, or find the reference set on their next
//! reconcile, and stop quietly. The jitter keeps the replica with the fewest
//! classes (and so the fastest list) from winning predictably.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use super::runtime::Reconciler;
use crate::config::ReconcilerConfig;
use crate::error::Result;
use crate::resource::{is_default_class, reference_to, Claim, Class};
use crate::store::{Request, Store};

/// How a replica finds candidate classes for a claim
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulingMode {
    /// Claims with a class selector: classes matching its labels
    Selector,
    /// Claims without a selector: classes annotated as the default
    Default,
}

/// Assigns a class to claims that do not have one yet.
///
/// One type serves both the scheduling and the defaulting controller; the
/// [`SchedulingMode`] picked by [`ClassScheduler::scheduling`] or
/// [`ClassScheduler::defaulting`] decides which claims it acts on.
pub struct ClassScheduler<C, K> {
    claims: Arc<dyn Store<C>>,
    classes: Arc<dyn Store<K>>,
    mode: SchedulingMode,
    max_jitter: Duration,
    short_wait: Duration,
    long_wait: Duration,
}

impl<C: Claim, K: Class> ClassScheduler<C, K> {
    pub fn new(
        claims: Arc<dyn Store<C>>,
        classes: Arc<dyn Store<K>>,
        mode: SchedulingMode,
        config: &ReconcilerConfig,
    ) -> Self {
        Self {
            claims,
            classes,
            mode,
            max_jitter: config.max_jitter(),
            short_wait: config.short_wait(),
            long_wait: config.long_wait(),
        }
    }

    pub fn scheduling(
        claims: Arc<dyn Store<C>>,
        classes: Arc<dyn Store<K>>,
        config: &ReconcilerConfig,
    ) -> Self {
        Self::new(claims, classes, SchedulingMode::Selector, config)
    }

    pub fn defaulting(
        claims: Arc<dyn Store<C>>,
        classes: Arc<dyn Store<K>>,
        config: &ReconcilerConfig,
    ) -> Self {
        Self::new(claims, classes, SchedulingMode::Default, config)
    }

    /// Whether this replica should act on the claim at all
    fn wants(&self, claim: &C) -> bool {
        let spec = claim.claim_spec();
        if spec.class_ref.is_some() || spec.resource_ref.is_some() {
            return false;
        }
        match self.mode {
            SchedulingMode::Selector => spec.class_selector.is_some(),
            SchedulingMode::Default => spec.class_selector.is_none(),
        }
    }

    async fn candidates(&self, claim: &C) -> Result<Vec<K>> {
        match self.mode {
            SchedulingMode::Selector => {
                let selector = claim
                    .claim_spec()
                    .class_selector
                    .as_ref()
                    .map(|s| s.to_label_selector())
                    .unwrap_or_default();
                self.classes.list(None, &selector).await
            }
            SchedulingMode::Default => Ok(self
                .classes
                .list(None, "")
                .await?
                .into_iter()
                .filter(|class| is_default_class(class))
                .collect()),
        }
    }

    fn jitter(&self) -> Duration {
        let millis = self.max_jitter.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..millis))
    }
}

/// Pick one class uniformly at random
pub fn select_class<K: Clone>(candidates: &[K]) -> Option<K> {
    candidates.choose(&mut rand::thread_rng()).cloned()
}

#[async_trait]
impl<C: Claim, K: Class> Reconciler for ClassScheduler<C, K> {
    #[instrument(skip(self, request), fields(mode = ?self.mode, request = %request))]
    async fn reconcile(&self, request: &Request) -> Result<Action> {
        let mut claim = match self
            .claims
            .get(request.namespace.as_deref(), &request.name)
            .await
        {
            Ok(claim) => claim,
            Err(e) if e.is_not_found() => return Ok(Action::await_change()),
            Err(e) => return Err(e.wrap("cannot get claim")),
        };

        // Another replica may have scheduled the claim since it was queued
        if !self.wants(&claim) {
            debug!("Claim {} needs no class", request);
            return Ok(Action::await_change());
        }

        // No single replica sees every class, so a failed list is not
        // reported on the claim's status.
        let candidates = match self.candidates(&claim).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Cannot list classes for claim {}: {}", request, e);
                return Ok(Action::requeue(self.short_wait));
            }
        };

        // Another replica may own a matching class; check back later
        let Some(class) = select_class(&candidates) else {
            debug!("No candidate classes for claim {}", request);
            return Ok(Action::requeue(self.long_wait));
        };

        claim.claim_spec_mut().class_ref = Some(reference_to(&class));

        tokio::time::sleep(self.jitter()).await;

        match self.claims.update(&claim).await {
            Ok(_) => {
                info!(
                    "Scheduled claim {} to class {}",
                    request,
                    claim
                        .claim_spec()
                        .class_ref
                        .as_ref()
                        .map(|r| r.name.as_str())
                        .unwrap_or_default()
                );
                Ok(Action::await_change())
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!("Lost the race to schedule claim {}", request);
                Ok(Action::await_change())
            }
            Err(e) => Err(e.wrap("cannot update claim")),
        }
    }
}
