//! Condition constructors used by the reconcilers

use crate::crd::Condition;
use crate::Error;

/// Whether the resource is usable
pub const CONDITION_TYPE_READY: &str = "Ready";
/// Whether the last reconcile succeeded
pub const CONDITION_TYPE_SYNCED: &str = "Synced";
/// Whether cross-resource references have been resolved
pub const CONDITION_TYPE_REFERENCES_RESOLVED: &str = "ReferencesResolved";

pub const REASON_AVAILABLE: &str = "Available";
pub const REASON_CREATING: &str = "Creating";
pub const REASON_DELETING: &str = "Deleting";
pub const REASON_BINDING: &str = "Binding";
pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub const REASON_RESOLUTION_SUCCESS: &str = "ReferenceResolutionSuccess";
pub const REASON_RESOLUTION_BLOCKED: &str = "ReferenceResolutionBlocked";

/// Ready=True: the resource is available for use
pub fn available() -> Condition {
    Condition::new(CONDITION_TYPE_READY, true, REASON_AVAILABLE, "")
}

pub fn creating() -> Condition {
    Condition::new(CONDITION_TYPE_READY, false, REASON_CREATING, "")
}

pub fn deleting() -> Condition {
    Condition::new(CONDITION_TYPE_READY, false, REASON_DELETING, "")
}

/// Ready=False: a claim is waiting for its managed resource to become bindable
pub fn binding() -> Condition {
    Condition::new(CONDITION_TYPE_READY, false, REASON_BINDING, "")
}

pub fn reconcile_success() -> Condition {
    Condition::new(CONDITION_TYPE_SYNCED, true, REASON_RECONCILE_SUCCESS, "")
}

pub fn reconcile_error(err: &Error) -> Condition {
    Condition::new(
        CONDITION_TYPE_SYNCED,
        false,
        REASON_RECONCILE_ERROR,
        err.to_string(),
    )
}

pub fn reference_resolution_success() -> Condition {
    Condition::new(
        CONDITION_TYPE_REFERENCES_RESOLVED,
        true,
        REASON_RESOLUTION_SUCCESS,
        "",
    )
}

/// ReferencesResolved=False: blocked on dependencies that are not ready yet
pub fn reference_resolution_blocked(err: &Error) -> Condition {
    Condition::new(
        CONDITION_TYPE_REFERENCES_RESOLVED,
        false,
        REASON_RESOLUTION_BLOCKED,
        err.to_string(),
    )
}

/// Check if a condition is present and true
pub fn is_condition_true(condition: Option<&Condition>) -> bool {
    condition.map(|c| c.status == "True").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_error_carries_message() {
        let err = Error::ConfigError("bad provider".to_string());
        let c = reconcile_error(&err);

        assert_eq!(c.type_, CONDITION_TYPE_SYNCED);
        assert_eq!(c.status, "False");
        assert_eq!(c.reason, REASON_RECONCILE_ERROR);
        assert_eq!(c.message, "Configuration error: bad provider");
    }

    #[test]
    fn test_ready_reasons_share_one_type() {
        for c in [available(), creating(), deleting(), binding()] {
            assert_eq!(c.type_, CONDITION_TYPE_READY);
        }
        assert!(is_condition_true(Some(&available())));
        assert!(!is_condition_true(Some(&binding())));
        assert!(!is_condition_true(None));
    }
}
