//! StratusMachine CRD
//!
//! Defines the provider-specific machine resource backing a Cluster API
//! `Machine`. The spec carries placement and identity; the status carries
//! failure information and the condition set maintained by the scope layer.

use crate::conditions::{Condition, Conditions};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scheme prefix of provider IDs written to `StratusMachine.spec.providerId`.
pub const PROVIDER_ID_SCHEME: &str = "stratus://";

/// StratusMachine is the infrastructure counterpart of a Cluster API machine.
///
/// One StratusMachine exists per `Machine`; it is owned by that machine via an
/// owner reference and labelled with the owning cluster's name.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "StratusMachine",
    namespaced,
    status = "StratusMachineStatus",
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Datacenter", "type":"string", "jsonPath":".spec.datacenterId"}"#,
    printcolumn = r#"{"name":"Provider ID", "type":"string", "jsonPath":".spec.providerId"}"#,
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StratusMachineSpec {
    /// Data center the machine is placed in.
    pub datacenter_id: String,

    /// Provider ID in the form `stratus://<server-id>`, set once the server exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Arbitrary labels for filtering and organization.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Observed state of a StratusMachine.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StratusMachineStatus {
    /// Whether the infrastructure is ready to host a node.
    #[serde(default)]
    pub ready: bool,

    /// Terminal problem reason. Set by provisioning logic, never cleared here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Human readable terminal problem description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Conditions for StratusMachine {
    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|status| status.conditions.as_slice())
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

impl StratusMachineStatus {
    /// Whether a terminal failure has been recorded.
    pub fn has_failed(&self) -> bool {
        let is_set = |field: &Option<String>| field.as_deref().is_some_and(|v| !v.is_empty());
        is_set(&self.failure_reason) || is_set(&self.failure_message)
    }
}

/// Canonicalize a raw server identifier into provider-ID form.
pub fn provider_id(raw: &str) -> String {
    let id = raw.strip_prefix(PROVIDER_ID_SCHEME).unwrap_or(raw);
    format!("{PROVIDER_ID_SCHEME}{id}")
}
