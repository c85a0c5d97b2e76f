//! Kubernetes controllers
//!
//! Reconcilers that watch the provider's CRDs and drive them through a
//! machine scope.

mod context;
mod machine;

pub use context::Context;
pub use machine::{ReconcileError, StratusMachineController};
