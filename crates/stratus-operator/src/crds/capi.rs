//! Cluster API types
//!
//! Minimal typed views of the `cluster.x-k8s.io/v1beta1` resources this
//! provider reads. Only the fields the scope layer consumes are modelled;
//! unknown fields are ignored on deserialization.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the owning cluster's name on every machine object.
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Cluster API machine, the provider-agnostic counterpart of a StratusMachine.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced,
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the cluster this machine belongs to.
    pub cluster_name: String,

    /// Bootstrap configuration reference and its generated data secret.
    #[serde(default)]
    pub bootstrap: Bootstrap,
}

/// Bootstrap section of a Cluster API machine.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Name of the secret holding the bootstrap data, filled in by the
    /// bootstrap provider once the data is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

impl Machine {
    /// Name of the bootstrap data secret, if the bootstrap provider produced one.
    pub fn bootstrap_data_secret_name(&self) -> Option<&str> {
        self.spec
            .bootstrap
            .data_secret_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }
}
