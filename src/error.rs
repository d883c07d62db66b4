//! Error types for the reconciliation engine

use std::time::Duration;

use thiserror::Error;

use crate::controller::reference::ReferenceStatus;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error that is neither a not-found nor a conflict
    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),

    /// The requested object does not exist in the store
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Optimistic concurrency conflict: the object changed since it was read
    #[error("conflict writing {kind} {name}: object was modified")]
    Conflict { kind: String, name: String },

    /// One or more cross-resource references are not yet usable
    #[error("references not accessible: {}", join_statuses(.0))]
    ReferencesNotReady(Vec<ReferenceStatus>),

    /// Referencers were registered incorrectly; retrying cannot fix this
    #[error("invalid reference wiring: {0}")]
    Wiring(String),

    /// A referencer failed unexpectedly while resolving references
    #[error("reference resolution fault: {0}")]
    ResolverFault(String),

    /// A connection secret is owned by someone else
    #[error("connection secret conflict: {0}")]
    SecretConflict(String),

    /// A managed resource cannot be bound to the requesting claim
    #[error("cannot bind: {0}")]
    BindingError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("reconcile did not finish within {0:?}")]
    Timeout(Duration),

    /// An error annotated with what the engine was doing when it happened
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// Failure reported by an external client implementation
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn join_statuses(statuses: &[ReferenceStatus]) -> String {
    statuses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Classify a kube client error, splitting out not-found and conflict responses
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            _ => Error::KubeError(err),
        }
    }

    /// Wrap this error with a description of the failed operation
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through any context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict { .. })
    }

    pub fn is_references_not_ready(&self) -> bool {
        matches!(self.root(), Error::ReferencesNotReady(_))
    }

    pub fn is_wiring(&self) -> bool {
        matches!(self.root(), Error::Wiring(_))
    }

    /// Whether retrying soon is likely to help
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self.root(),
            Error::Wiring(_) | Error::ConfigError(_) | Error::SerializationError(_)
        )
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::from_kube(err, "object", "unknown")
    }
}

/// Extension for attaching context to fallible results
pub trait ResultExt<T> {
    fn wrap_err(self, context: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn wrap_err(self, context: &str) -> Result<T> {
        self.map_err(|e| e.wrap(context))
    }
}

/// Treat a not-found error as success
pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found() -> Error {
        Error::NotFound {
            kind: "Secret".to_string(),
            name: "db".to_string(),
        }
    }

    #[test]
    fn test_classification_looks_through_context() {
        let err = not_found().wrap("cannot get secret").wrap("cannot publish");
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        assert_eq!(
            err.to_string(),
            "cannot publish: cannot get secret: Secret db not found"
        );
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(not_found())).is_ok());
        let conflict = Error::Conflict {
            kind: "Secret".to_string(),
            name: "db".to_string(),
        };
        assert!(ignore_not_found(Err(conflict)).is_err());
    }

    #[test]
    fn test_wiring_errors_are_not_retriable() {
        assert!(!Error::Wiring("duplicate referencer".to_string()).is_retriable());
        assert!(Error::ResolverFault("boom".to_string()).is_retriable());
        assert!(not_found().wrap("x").is_retriable());
    }

    #[test]
    fn test_kube_status_codes_are_classified() {
        let resp = |code| {
            kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "Reason".to_string(),
                code,
            })
        };
        assert!(Error::from_kube(resp(404), "Secret", "a").is_not_found());
        assert!(Error::from_kube(resp(409), "Secret", "a").is_conflict());
        assert!(matches!(
            Error::from_kube(resp(500), "Secret", "a"),
            Error::KubeError(_)
        ));
    }
}
