//! Custom Resource Definitions
//!
//! The provider's own CRD plus typed views of the Cluster API resources it reads.

pub mod capi;
pub mod machine;

pub use machine::{StratusMachine, StratusMachineSpec, StratusMachineStatus};
