//! Scope errors

use crate::store::{ObjectKey, StoreError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScopeError {
    /// A required constructor input is missing or malformed.
    #[error("invalid machine scope params: {0}")]
    InvalidParams(String),

    /// The owning Machine has no bootstrap data yet. Requeue and try later.
    #[error("machine {machine} has no bootstrap data yet")]
    NoBootstrapData { machine: ObjectKey },

    /// Store failures are passed through unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("condition {condition} on {key} was changed concurrently")]
    ConditionConflict { key: ObjectKey, condition: String },

    #[error("patching {key} did not finish within {timeout:?}")]
    CommitTimeout { key: ObjectKey, timeout: Duration },

    #[error("commit task for {key} was aborted: {source}")]
    CommitAborted {
        key: ObjectKey,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("failed to serialize {key}: {source}")]
    Serialize {
        key: ObjectKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("finalizing {key} failed after {attempts} attempts: {last}")]
    RetryExhausted {
        key: ObjectKey,
        attempts: u32,
        #[source]
        last: Box<ScopeError>,
    },
}

impl ScopeError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ScopeError::InvalidParams(reason.into())
    }

    /// Whether the error reports a lost optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        match self {
            ScopeError::Store(err) => err.is_conflict(),
            ScopeError::ConditionConflict { .. } => true,
            ScopeError::RetryExhausted { last, .. } => last.is_conflict(),
            _ => false,
        }
    }

    /// Expected, transient states that only need a later requeue.
    pub fn is_waiting(&self) -> bool {
        matches!(self, ScopeError::NoBootstrapData { .. })
    }
}
