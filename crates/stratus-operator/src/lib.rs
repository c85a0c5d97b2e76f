//! Stratus Cluster API Provider
//!
//! Infrastructure provider that backs Cluster API machines with servers in
//! a Stratus datacenter. The [`scope`] module holds the per-reconciliation
//! context controllers work through; [`store`] abstracts the Kubernetes API.

pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crds;
pub mod scope;
pub mod store;
pub mod telemetry;

pub use crds::{StratusMachine, StratusMachineSpec, StratusMachineStatus};
