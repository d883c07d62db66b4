//! Shared API types for managed resources, claims and classes
//!
//! These are embedded by the custom resource kinds of each provider.

pub mod types;


pub use types::*;
