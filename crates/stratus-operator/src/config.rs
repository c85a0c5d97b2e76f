//! Operator Configuration
//!
//! Reconciliation timings and commit settings with environment variable
//! overrides. Unparseable values are ignored and the default is kept.

use crate::scope::{RetryPolicy, COMMIT_TIMEOUT};
use std::time::Duration;

/// Operator configuration with sensible defaults
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Field manager recorded on every patch (env: FIELD_MANAGER)
    pub field_manager: String,

    /// Requeue interval of a healthy machine (env: RESYNC_INTERVAL_SECS)
    pub resync_interval: Duration,

    /// Requeue interval while waiting for bootstrap data (env: BOOTSTRAP_REQUEUE_SECS)
    pub bootstrap_requeue: Duration,

    /// Requeue interval after a failed pass (env: ERROR_REQUEUE_SECS)
    pub error_requeue: Duration,

    /// Deadline for a single commit (env: COMMIT_TIMEOUT_SECS)
    pub commit_timeout: Duration,

    // Finalize retry settings
    /// Backoff used when finalizing a scope
    /// (env: FINALIZE_RETRY_INITIAL_MS, FINALIZE_RETRY_MULTIPLIER, FINALIZE_RETRY_STEPS)
    pub finalize_retry: RetryPolicy,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            field_manager: "stratus-operator".to_string(),
            resync_interval: Duration::from_secs(300),
            bootstrap_requeue: Duration::from_secs(30),
            error_requeue: Duration::from_secs(60),
            commit_timeout: COMMIT_TIMEOUT,
            finalize_retry: RetryPolicy::default(),
        }
    }
}

impl OperatorConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|value| value.trim().parse::<u64>().ok());

        if let Some(manager) = lookup("FIELD_MANAGER").filter(|m| !m.is_empty()) {
            config.field_manager = manager;
        }
        if let Some(secs) = parsed("RESYNC_INTERVAL_SECS") {
            config.resync_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed("BOOTSTRAP_REQUEUE_SECS") {
            config.bootstrap_requeue = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed("ERROR_REQUEUE_SECS") {
            config.error_requeue = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed("COMMIT_TIMEOUT_SECS").filter(|secs| *secs > 0) {
            config.commit_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = parsed("FINALIZE_RETRY_INITIAL_MS") {
            config.finalize_retry.initial_interval = Duration::from_millis(ms);
        }
        if let Some(multiplier) = lookup("FINALIZE_RETRY_MULTIPLIER")
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|m| *m >= 1.0)
        {
            config.finalize_retry.multiplier = multiplier;
        }
        if let Some(steps) = parsed("FINALIZE_RETRY_STEPS").filter(|steps| *steps > 0) {
            config.finalize_retry.steps = u32::try_from(steps).unwrap_or(u32::MAX);
        }

        config
    }
}
