//! Reconciliation scopes
//!
//! A scope bundles the objects one reconciliation pass works on together
//! with the store access needed to read related objects and persist changes.

mod cluster;
mod error;
mod machine;
mod patch;
mod retry;

pub use cluster::{ClusterScope, MachineLister};
pub use error::ScopeError;
pub use machine::{MachineScope, MachineScopeBuilder};
pub use patch::{merge_diff, Changes, ConditionChange, PatchHelper, PatchOptions, COMMIT_TIMEOUT};
pub use retry::{RetryError, RetryPolicy};
