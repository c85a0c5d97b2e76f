//! Resource store access
//!
//! The scope layer reads and writes Kubernetes objects only through the
//! [`ResourceStore`] trait so that reconciliation logic can be exercised
//! against mocks and in-memory stores. [`KubeStore`] is the production
//! implementation on top of `kube::Api`.

use crate::crds::StratusMachine;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client, Resource,
};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Equality-based label selector. All pairs must match.
pub type Labels = BTreeMap<String, String>;

/// Namespace/name pair identifying a namespaced object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced object, `None` if it lacks a name or namespace.
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        match (&meta.namespace, &meta.name) {
            (Some(namespace), Some(name)) if !namespace.is_empty() && !name.is_empty() => {
                Some(Self::new(namespace.clone(), name.clone()))
            }
            _ => None,
        }
    }

    /// Whether `obj` is the object this key identifies.
    pub fn matches<K: Resource>(&self, obj: &K) -> bool {
        let meta = obj.meta();
        meta.name.as_deref() == Some(self.name.as_str())
            && meta.namespace.as_deref() == Some(self.namespace.as_str())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectKey },

    #[error("conflict writing {key}: the object has been modified")]
    Conflict { key: ObjectKey },

    #[error("Kubernetes error on {kind} {key}: {source}")]
    Kube {
        kind: &'static str,
        key: ObjectKey,
        #[source]
        source: kube::Error,
    },

    #[error("listing StratusMachines in {namespace} with selector {selector:?} failed: {source}")]
    List {
        namespace: String,
        selector: String,
        #[source]
        source: kube::Error,
    },
}

impl StoreError {
    fn from_kube(err: kube::Error, kind: &'static str, key: &ObjectKey) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound {
                kind,
                key: key.clone(),
            },
            kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict { key: key.clone() },
            source => StoreError::Kube {
                kind,
                key: key.clone(),
                source,
            },
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Which endpoint of an object a patch targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subresource {
    Main,
    Status,
}

/// JSON merge patch addressed at an object or its status subresource.
#[derive(Clone, Debug, PartialEq)]
pub struct MachinePatch {
    pub subresource: Subresource,
    pub body: serde_json::Value,
}

impl MachinePatch {
    pub fn main(body: serde_json::Value) -> Self {
        Self {
            subresource: Subresource::Main,
            body,
        }
    }

    pub fn status(body: serde_json::Value) -> Self {
        Self {
            subresource: Subresource::Status,
            body,
        }
    }
}

/// Store operations needed by the machine scope.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Point lookup of a secret.
    async fn get_secret(&self, key: &ObjectKey) -> Result<Secret, StoreError>;

    /// Point lookup of a StratusMachine.
    async fn get_machine(&self, key: &ObjectKey) -> Result<StratusMachine, StoreError>;

    /// List StratusMachines in `namespace` matching every label in `selector`.
    async fn list_machines(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<StratusMachine>, StoreError>;

    /// Apply a merge patch. A `metadata.resourceVersion` in the body acts
    /// as a precondition and yields [`StoreError::Conflict`] when stale.
    async fn patch_machine(
        &self,
        key: &ObjectKey,
        patch: &MachinePatch,
    ) -> Result<StratusMachine, StoreError>;
}

/// Render a selector in `k=v,k2=v2` form.
pub fn selector_string(selector: &Labels) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// [`ResourceStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_secret(&self, key: &ObjectKey) -> Result<Secret, StoreError> {
        Api::<Secret>::namespaced(self.client.clone(), &key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(e, "Secret", key))
    }

    async fn get_machine(&self, key: &ObjectKey) -> Result<StratusMachine, StoreError> {
        Api::<StratusMachine>::namespaced(self.client.clone(), &key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| StoreError::from_kube(e, "StratusMachine", key))
    }

    async fn list_machines(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<StratusMachine>, StoreError> {
        let api = Api::<StratusMachine>::namespaced(self.client.clone(), namespace);
        let selector = selector_string(selector);
        let params = ListParams::default().labels(&selector);
        let list = api
            .list(&params)
            .await
            .map_err(|source| StoreError::List {
                namespace: namespace.to_string(),
                selector,
                source,
            })?;
        Ok(list.items)
    }

    async fn patch_machine(
        &self,
        key: &ObjectKey,
        patch: &MachinePatch,
    ) -> Result<StratusMachine, StoreError> {
        let api = Api::<StratusMachine>::namespaced(self.client.clone(), &key.namespace);
        let params = self.patch_params();
        let body = Patch::Merge(&patch.body);
        let result = match patch.subresource {
            Subresource::Main => api.patch(&key.name, &params, &body).await,
            Subresource::Status => api.patch_status(&key.name, &params, &body).await,
        };
        result.map_err(|e| StoreError::from_kube(e, "StratusMachine", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::StratusMachineSpec;

    #[test]
    fn test_selector_string() {
        let mut selector = Labels::new();
        assert_eq!(selector_string(&selector), "");

        selector.insert("b".to_string(), "2".to_string());
        selector.insert("a".to_string(), "1".to_string());
        assert_eq!(selector_string(&selector), "a=1,b=2");
    }

    #[test]
    fn test_object_key_of() {
        let mut machine = StratusMachine::new("m1", StratusMachineSpec::default());
        assert!(ObjectKey::of(&machine).is_none());

        machine.metadata.namespace = Some("default".to_string());
        let key = ObjectKey::of(&machine).unwrap();
        assert_eq!(key, ObjectKey::new("default", "m1"));
        assert_eq!(key.to_string(), "default/m1");
        assert!(key.matches(&machine));
    }

    #[test]
    fn test_kube_api_errors_are_classified() {
        let key = ObjectKey::new("default", "m1");
        let api_error = |code| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "Whatever".to_string(),
                code,
            })
        };

        assert!(matches!(
            StoreError::from_kube(api_error(404), "StratusMachine", &key),
            StoreError::NotFound { .. }
        ));
        assert!(StoreError::from_kube(api_error(409), "StratusMachine", &key).is_conflict());
        let err = StoreError::from_kube(api_error(500), "StratusMachine", &key);
        assert!(matches!(err, StoreError::Kube { kind: "StratusMachine", .. }));
        assert!(err.to_string().contains("StratusMachine default/m1"));
    }

    #[test]
    fn test_list_error_names_namespace_and_selector() {
        let mut selector = Labels::new();
        selector.insert("cluster.x-k8s.io/cluster-name".to_string(), "prod".to_string());
        let err = StoreError::List {
            namespace: "default".to_string(),
            selector: selector_string(&selector),
            source: kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            }),
        };

        let message = err.to_string();
        assert!(message.contains("in default"));
        assert!(message.contains("cluster.x-k8s.io/cluster-name=prod"));
        assert!(!err.is_conflict());
    }
}
