//! Reconciler tuning knobs
//!
//! Provider binaries flatten [`ReconcilerConfig`] into their own clap CLI so the
//! same flags and environment variables work across every operator built on
//! this crate.

use std::time::Duration;

use clap::Args;

/// Requeue intervals, reconcile deadline and scheduling jitter
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Requeue delay while waiting on an external operation or after a transient error
    #[arg(long, env = "SHORT_WAIT_SECONDS", default_value_t = 30)]
    pub short_wait_seconds: u64,

    /// Polling interval for resources that are in their desired state
    #[arg(long, env = "LONG_WAIT_SECONDS", default_value_t = 60)]
    pub long_wait_seconds: u64,

    /// Deadline for a single reconcile
    #[arg(long, env = "RECONCILE_TIMEOUT_SECONDS", default_value_t = 60)]
    pub reconcile_timeout_seconds: u64,

    /// Upper bound of the random delay before a scheduler writes a class reference
    #[arg(long, env = "MAX_JITTER_MILLIS", default_value_t = 1500)]
    pub max_jitter_millis: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            short_wait_seconds: 30,
            long_wait_seconds: 60,
            reconcile_timeout_seconds: 60,
            max_jitter_millis: 1500,
        }
    }
}

impl ReconcilerConfig {
    pub fn short_wait(&self) -> Duration {
        Duration::from_secs(self.short_wait_seconds)
    }

    pub fn long_wait(&self) -> Duration {
        Duration::from_secs(self.long_wait_seconds)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_seconds)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_millis)
    }
}
