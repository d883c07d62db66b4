//! Cross-resource reference resolution
//!
//! A managed resource may name other objects (a network, a subnet, a key)
//! whose values it needs before the external resource can be created. Each
//! such field is described by a [`Referencer`] registered with the
//! [`ApiReferenceResolver`] when the reconciler is built.
//!
//! Resolution is all-or-nothing: the status of every set reference is checked
//! first, and only when all of them are ready are values built, assigned and
//! the record persisted. Panics raised by a referencer are caught here and
//! reported as [`Error::ResolverFault`] so one bad descriptor cannot take the
//! controller down.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::resource::{conditions, Conditioned, Managed, Object};
use crate::store::Store;

/// Readiness of one referenced object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceState {
    NotFound,
    NotReady,
    Ready,
}

impl fmt::Display for ReferenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReferenceState::NotFound => "NotFound",
            ReferenceState::NotReady => "NotReady",
            ReferenceState::Ready => "Ready",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceStatus {
    pub name: String,
    pub state: ReferenceState,
}

impl fmt::Display for ReferenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{reference:{} status:{}}}", self.name, self.state)
    }
}

/// One cross-resource reference field of a managed resource kind
#[async_trait]
pub trait Referencer<M>: Send + Sync {
    /// Stable name used in status messages
    fn name(&self) -> &str;

    /// Whether the reference field is set on this record
    fn is_set(&self, mr: &M) -> bool;

    /// Look up the referenced objects and report their readiness
    async fn get_status(&self, mr: &M) -> Result<Vec<ReferenceStatus>>;

    /// Compute the value to assign from the referenced object
    async fn build(&self, mr: &M) -> Result<String>;

    /// Write a built value onto the record
    fn assign(&self, mr: &mut M, value: String) -> Result<()>;
}

/// Resolves the references of a managed resource, persisting the result
#[async_trait]
pub trait ReferenceResolver<M>: Send + Sync {
    async fn resolve_references(&self, mr: &mut M) -> Result<()>;
}

/// Run a referencer call, converting a panic into a resolver fault
async fn supervised<T, F>(referencer: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::ResolverFault(format!(
            "referencer {referencer} panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

/// Synchronous counterpart of [`supervised`]
fn guarded<T>(referencer: &str, call: impl FnOnce() -> T) -> Result<T> {
    std::panic::catch_unwind(AssertUnwindSafe(call)).map_err(|panic| {
        Error::ResolverFault(format!(
            "referencer {referencer} panicked: {}",
            panic_message(panic.as_ref())
        ))
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolver over a statically registered list of referencers
pub struct ApiReferenceResolver<M> {
    store: Arc<dyn Store<M>>,
    referencers: Vec<Arc<dyn Referencer<M>>>,
}

impl<M: Managed> ApiReferenceResolver<M> {
    /// Register referencers. Empty or duplicate names are wiring defects.
    pub fn new(store: Arc<dyn Store<M>>, referencers: Vec<Arc<dyn Referencer<M>>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for r in &referencers {
            if r.name().is_empty() {
                return Err(Error::Wiring("referencer registered without a name".to_string()));
            }
            if !seen.insert(r.name().to_string()) {
                return Err(Error::Wiring(format!(
                    "referencer {} registered more than once",
                    r.name()
                )));
            }
        }
        Ok(Self { store, referencers })
    }
}

#[async_trait]
impl<M: Managed> ReferenceResolver<M> for ApiReferenceResolver<M> {
    async fn resolve_references(&self, mr: &mut M) -> Result<()> {
        let mut active = Vec::new();
        for r in &self.referencers {
            if guarded(r.name(), || r.is_set(mr))? {
                active.push(r);
            }
        }
        if active.is_empty() {
            return Ok(());
        }

        let mut not_ready = Vec::new();
        for r in &active {
            let statuses = supervised(r.name(), r.get_status(mr)).await?;
            not_ready.extend(
                statuses
                    .into_iter()
                    .filter(|s| s.state != ReferenceState::Ready),
            );
        }
        if !not_ready.is_empty() {
            return Err(Error::ReferencesNotReady(not_ready));
        }

        for r in &active {
            let value = supervised(r.name(), r.build(mr)).await?;
            guarded(r.name(), || r.assign(mr, value))??;
            debug!(referencer = r.name(), "Assigned resolved reference");
        }

        *mr = self
            .store
            .update(mr)
            .await
            .wrap_err("cannot update managed resource with resolved references")?;
        Ok(())
    }
}

/// Resolver for kinds without references
pub struct NopReferenceResolver;

#[async_trait]
impl<M: Managed> ReferenceResolver<M> for NopReferenceResolver {
    async fn resolve_references(&self, _mr: &mut M) -> Result<()> {
        Ok(())
    }
}

/// A reference to another object by name; once that object reports
/// `Ready=True`, a value extracted from it is assigned onto the referrer.
pub struct ObjectReferencer<M, T> {
    name: String,
    store: Arc<dyn Store<T>>,
    /// Namespace and name of the referenced object, if the field is set
    target: fn(&M) -> Option<(Option<String>, String)>,
    extract: fn(&T) -> Option<String>,
    assign: fn(&mut M, String),
}

impl<M, T> ObjectReferencer<M, T> {
    pub fn new(
        name: &str,
        store: Arc<dyn Store<T>>,
        target: fn(&M) -> Option<(Option<String>, String)>,
        extract: fn(&T) -> Option<String>,
        assign: fn(&mut M, String),
    ) -> Self {
        Self {
            name: name.to_string(),
            store,
            target,
            extract,
            assign,
        }
    }

    fn target_of(&self, mr: &M) -> Result<(Option<String>, String)> {
        (self.target)(mr).ok_or_else(|| {
            Error::ResolverFault(format!("reference {} is not set", self.name))
        })
    }
}

#[async_trait]
impl<M, T> Referencer<M> for ObjectReferencer<M, T>
where
    M: Send + Sync + 'static,
    T: Object + Conditioned,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_set(&self, mr: &M) -> bool {
        (self.target)(mr).is_some()
    }

    async fn get_status(&self, mr: &M) -> Result<Vec<ReferenceStatus>> {
        let (namespace, name) = self.target_of(mr)?;
        let state = match self.store.get(namespace.as_deref(), &name).await {
            Ok(obj) => {
                if conditions::is_condition_true(obj.condition(conditions::CONDITION_TYPE_READY)) {
                    ReferenceState::Ready
                } else {
                    ReferenceState::NotReady
                }
            }
            Err(e) if e.is_not_found() => ReferenceState::NotFound,
            Err(e) => return Err(e.wrap(format!("cannot get referenced {name}"))),
        };
        Ok(vec![ReferenceStatus {
            name: name.clone(),
            state,
        }])
    }

    async fn build(&self, mr: &M) -> Result<String> {
        let (namespace, name) = self.target_of(mr)?;
        let obj = self
            .store
            .get(namespace.as_deref(), &name)
            .await
            .map_err(|e| e.wrap(format!("cannot get referenced {name}")))?;
        (self.extract)(&obj).ok_or_else(|| {
            Error::ResolverFault(format!(
                "referenced {name} has no value for {}",
                self.name
            ))
        })
    }

    fn assign(&self, mr: &mut M, value: String) -> Result<()> {
        (self.assign)(mr, value);
        Ok(())
    }
}
