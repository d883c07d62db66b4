//! managed-runtime: a reconciliation engine for Kubernetes-style managed
//! resources.
//!
//! A *managed resource* is the declarative proxy for one resource in an
//! external system. [`controller::ManagedReconciler`] drives the external
//! resource towards the managed resource's spec and publishes its connection
//! details. A *claim* asks for a managed resource by naming a *class*;
//! [`controller::ClaimReconciler`] provisions or binds one and propagates its
//! connection details into the claim's namespace, and the scheduling
//! reconcilers pick a class for claims that do not name one.
//!
//! Providers plug in their kinds by implementing [`resource::Managed`],
//! [`resource::Claim`] and [`resource::Class`], and their external systems by
//! implementing [`controller::ExternalConnecter`].

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod resource;
pub mod store;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::error::{Error, Result};
