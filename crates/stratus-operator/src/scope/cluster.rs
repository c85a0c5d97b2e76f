//! Cluster scope
//!
//! Read-only view of the machines belonging to one workload cluster.

use super::error::ScopeError;
use crate::crds::capi::CLUSTER_NAME_LABEL;
use crate::crds::StratusMachine;
use crate::store::{Labels, ResourceStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

/// Lists the StratusMachines of a single cluster.
#[async_trait]
pub trait MachineLister: Send + Sync {
    /// Namespace all listed machines live in.
    fn namespace(&self) -> &str;

    /// Machines of the cluster that also match `labels`.
    async fn list_machines(&self, labels: &Labels) -> Result<Vec<StratusMachine>, StoreError>;
}

/// Scope of a workload cluster: its namespace and name plus store access.
pub struct ClusterScope {
    store: Arc<dyn ResourceStore>,
    namespace: String,
    name: String,
}

impl ClusterScope {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, ScopeError> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.is_empty() {
            return Err(ScopeError::invalid("cluster scope params lack a namespace"));
        }
        if name.is_empty() {
            return Err(ScopeError::invalid("cluster scope params lack a cluster name"));
        }
        Ok(Self {
            store,
            namespace,
            name,
        })
    }

    /// `labels` restricted to this cluster. The cluster label always wins.
    pub fn machine_selector(&self, labels: &Labels) -> Labels {
        let mut selector = labels.clone();
        selector.insert(CLUSTER_NAME_LABEL.to_string(), self.name.clone());
        selector
    }
}

#[async_trait]
impl MachineLister for ClusterScope {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn list_machines(&self, labels: &Labels) -> Result<Vec<StratusMachine>, StoreError> {
        let selector = self.machine_selector(labels);
        trace!(cluster = %self.name, namespace = %self.namespace, ?selector, "Listing machines");
        self.store.list_machines(&self.namespace, &selector).await
    }
}
