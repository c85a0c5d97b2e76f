//! Machine scope lifecycle against an in-memory, versioned resource store.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stratus_operator::conditions::{
    reasons, Condition, ConditionSeverity, ConditionStatus, Conditions, MACHINE_PROVISIONED, READY,
};
use stratus_operator::crds::capi::{Machine, MachineSpec, CLUSTER_NAME_LABEL};
use stratus_operator::crds::{StratusMachine, StratusMachineSpec};
use stratus_operator::scope::{ClusterScope, MachineScope, RetryPolicy, ScopeError};
use stratus_operator::store::{
    Labels, MachinePatch, ObjectKey, ResourceStore, StoreError, Subresource,
};

#[derive(Default)]
struct State {
    machines: Vec<StratusMachine>,
    secrets: Vec<Secret>,
    version: u64,
    /// Patches rejected with a conflict before anything is applied.
    failing_patches: usize,
    /// Status patches preceded by a simulated write from another client.
    interleaved_writes: usize,
    /// Time each patch takes before it is applied.
    patch_delay: Duration,
    patches: Vec<MachinePatch>,
    secret_lookups: usize,
}

/// Resource store keeping objects in memory with optimistic locking on
/// `metadata.resourceVersion`.
#[derive(Default)]
struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    fn insert_machine(&self, mut machine: StratusMachine) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        machine.metadata.resource_version = Some(state.version.to_string());
        state.machines.push(machine);
    }

    fn insert_secret(&self, namespace: &str, name: &str) {
        let mut secret = Secret::default();
        secret.metadata.namespace = Some(namespace.to_string());
        secret.metadata.name = Some(name.to_string());
        self.state.lock().unwrap().secrets.push(secret);
    }

    /// Simulate another client updating the stored object.
    fn write_remote(&self, key: &ObjectKey, update: impl FnOnce(&mut StratusMachine)) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        let version = state.version.to_string();
        let machine = state
            .machines
            .iter_mut()
            .find(|m| key.matches(&**m))
            .unwrap();
        update(machine);
        machine.metadata.resource_version = Some(version);
    }

    fn machine(&self, key: &ObjectKey) -> StratusMachine {
        let state = self.state.lock().unwrap();
        state.machines.iter().find(|m| key.matches(*m)).unwrap().clone()
    }

    fn fail_next_patches(&self, count: usize) {
        self.state.lock().unwrap().failing_patches = count;
    }

    fn interleave_writes(&self, count: usize) {
        self.state.lock().unwrap().interleaved_writes = count;
    }

    fn delay_patches(&self, delay: Duration) {
        self.state.lock().unwrap().patch_delay = delay;
    }

    fn patches(&self) -> Vec<MachinePatch> {
        self.state.lock().unwrap().patches.clone()
    }

    fn secret_lookups(&self) -> usize {
        self.state.lock().unwrap().secret_lookups
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_secret(&self, key: &ObjectKey) -> Result<Secret, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.secret_lookups += 1;
        state
            .secrets
            .iter()
            .find(|s| key.matches(*s))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Secret",
                key: key.clone(),
            })
    }

    async fn get_machine(&self, key: &ObjectKey) -> Result<StratusMachine, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .machines
            .iter()
            .find(|m| key.matches(*m))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "StratusMachine",
                key: key.clone(),
            })
    }

    async fn list_machines(
        &self,
        namespace: &str,
        selector: &Labels,
    ) -> Result<Vec<StratusMachine>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .machines
            .iter()
            .filter(|m| m.namespace().as_deref() == Some(namespace))
            .filter(|m| {
                selector
                    .iter()
                    .all(|(k, v)| m.labels().get(k).map(String::as_str) == Some(v.as_str()))
            })
            .cloned()
            .collect())
    }

    async fn patch_machine(
        &self,
        key: &ObjectKey,
        patch: &MachinePatch,
    ) -> Result<StratusMachine, StoreError> {
        let delay = self.state.lock().unwrap().patch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.patches.push(patch.clone());

        if state.failing_patches > 0 {
            state.failing_patches -= 1;
            return Err(StoreError::Conflict { key: key.clone() });
        }

        if patch.subresource == Subresource::Status && state.interleaved_writes > 0 {
            state.interleaved_writes -= 1;
            state.version += 1;
            let version = state.version.to_string();
            if let Some(machine) = state.machines.iter_mut().find(|m| key.matches(&**m)) {
                machine.metadata.resource_version = Some(version);
            }
        }

        let index = state
            .machines
            .iter()
            .position(|m| key.matches(m))
            .ok_or_else(|| StoreError::NotFound {
                kind: "StratusMachine",
                key: key.clone(),
            })?;
        let current = &state.machines[index];

        if let Some(pinned) = patch
            .body
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            if current.resource_version().as_deref() != Some(pinned) {
                return Err(StoreError::Conflict { key: key.clone() });
            }
        }

        let mut body = patch.body.clone();
        if let Some(fields) = body.as_object_mut() {
            match patch.subresource {
                Subresource::Main => {
                    fields.remove("status");
                }
                Subresource::Status => fields.retain(|field, _| field == "status"),
            }
        }

        let mut value = serde_json::to_value(current).unwrap();
        json_patch::merge(&mut value, &body);
        let mut updated: StratusMachine = serde_json::from_value(value).unwrap();

        state.version += 1;
        updated.metadata.resource_version = Some(state.version.to_string());
        state.machines[index] = updated.clone();
        Ok(updated)
    }
}

fn stratus_machine(name: &str, cluster: &str, created_secs: i64) -> StratusMachine {
    let mut machine = StratusMachine::new(
        name,
        StratusMachineSpec {
            datacenter_id: "dc-fra-1".to_string(),
            ..Default::default()
        },
    );
    machine.metadata.namespace = Some("default".to_string());
    machine.metadata.creation_timestamp = Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap()));
    machine
        .labels_mut()
        .insert(CLUSTER_NAME_LABEL.to_string(), cluster.to_string());
    machine
}

fn capi_machine(name: &str, secret: Option<&str>) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            cluster_name: "prod".to_string(),
            ..Default::default()
        },
    );
    machine.metadata.namespace = Some("default".to_string());
    machine.spec.bootstrap.data_secret_name = secret.map(str::to_string);
    machine
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new("default", name)
}

fn scope(store: &Arc<MemoryStore>, name: &str, secret: Option<&str>) -> MachineScope {
    let handle: Arc<dyn ResourceStore> = store.clone();
    let cluster = ClusterScope::new(handle.clone(), "default", "prod").unwrap();
    MachineScope::builder()
        .store(handle)
        .machine(capi_machine(name, secret))
        .stratus_machine(store.machine(&key(name)))
        .cluster(Arc::new(cluster))
        .retry_policy(RetryPolicy::default().without_jitter())
        .build()
        .unwrap()
}

fn seeded() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::default());
    store.insert_machine(stratus_machine("m1", "prod", 0));
    store
}

#[tokio::test]
async fn failure_is_committed_with_not_ready_summary() {
    let store = seeded();
    let mut scope = scope(&store, "m1", None);

    assert!(!scope.has_failed());
    let status = scope
        .stratus_machine_mut()
        .status
        .get_or_insert_with(Default::default);
    status.failure_reason = Some("CreateError".to_string());
    status.failure_message = Some("server quota exceeded".to_string());
    assert!(scope.has_failed());

    scope.patch_object().await.unwrap();

    let patches = store.patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].subresource, Subresource::Status);

    let stored = store.machine(&key("m1"));
    let status = stored.status.as_ref().unwrap();
    assert_eq!(status.failure_reason.as_deref(), Some("CreateError"));
    assert_eq!(status.failure_message.as_deref(), Some("server quota exceeded"));
    let ready = stored.get_condition(READY).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason.as_deref(), Some(reasons::WAITING_FOR_PROVISIONING));
}

#[tokio::test]
async fn provider_id_is_committed_to_the_main_resource() {
    let store = seeded();
    let mut scope = scope(&store, "m1", None);

    scope.set_provider_id("abc");
    scope.finalize().await.unwrap();

    let stored = store.machine(&key("m1"));
    assert_eq!(stored.spec.provider_id.as_deref(), Some("stratus://abc"));
    let subresources: Vec<Subresource> = store.patches().iter().map(|p| p.subresource).collect();
    assert_eq!(subresources, vec![Subresource::Main, Subresource::Status]);
}

#[tokio::test]
async fn second_commit_without_changes_is_a_noop() {
    let store = seeded();
    let mut scope = scope(&store, "m1", None);

    scope.stratus_machine_mut().mark_false(
        MACHINE_PROVISIONED,
        reasons::WAITING_FOR_BOOTSTRAP_DATA,
        ConditionSeverity::Info,
        "",
    );
    scope.patch_object().await.unwrap();
    let committed = store.patches().len();

    scope.patch_object().await.unwrap();
    assert_eq!(store.patches().len(), committed);
}

#[tokio::test]
async fn latest_sibling_in_the_same_cluster() {
    let store = seeded();
    store.insert_machine(stratus_machine("m2", "prod", 10));
    store.insert_machine(stratus_machine("m3", "staging", 20));
    let scope = scope(&store, "m1", None);

    assert_eq!(scope.count_machines(&Labels::new()).await.unwrap(), 2);
    let latest = scope.find_latest_machine(&Labels::new()).await.unwrap();
    assert_eq!(latest.unwrap().name_any(), "m2");
}

#[tokio::test]
async fn no_sibling_when_alone_in_the_cluster() {
    let store = seeded();
    store.insert_machine(stratus_machine("m3", "staging", 20));
    let scope = scope(&store, "m1", None);

    assert!(scope
        .find_latest_machine(&Labels::new())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn bootstrap_secret_lookup() {
    let store = seeded();
    store.insert_secret("default", "m1-bootstrap");

    let waiting = scope(&store, "m1", None);
    let err = waiting.bootstrap_data_secret().await.unwrap_err();
    assert!(matches!(err, ScopeError::NoBootstrapData { .. }));
    assert_eq!(store.secret_lookups(), 0);

    let ready = scope(&store, "m1", Some("m1-bootstrap"));
    let secret = ready.bootstrap_data_secret().await.unwrap();
    assert_eq!(secret.name_any(), "m1-bootstrap");
    assert_eq!(store.secret_lookups(), 1);

    let missing = scope(&store, "m1", Some("gone"));
    let err = missing.bootstrap_data_secret().await.unwrap_err();
    assert!(matches!(err, ScopeError::Store(StoreError::NotFound { .. })));
    assert_eq!(store.secret_lookups(), 2);
}

#[tokio::test]
async fn remote_conditions_survive_the_commit() {
    let store = seeded();
    let mut scope = scope(&store, "m1", None);

    store.write_remote(&key("m1"), |machine| {
        machine.set_condition(Condition::true_("ExternalCheck"));
    });

    scope.stratus_machine_mut().mark_true(MACHINE_PROVISIONED);
    scope.finalize().await.unwrap();

    let stored = store.machine(&key("m1"));
    assert!(stored.is_condition_true("ExternalCheck"));
    assert!(stored.is_condition_true(MACHINE_PROVISIONED));
    assert!(stored.is_condition_true(READY));
    assert_eq!(stored.conditions()[0].type_, READY);
}

#[tokio::test(start_paused = true)]
async fn finalize_succeeds_on_third_attempt() {
    let store = seeded();
    let mut scope = scope(&store, "m1", None);
    store.fail_next_patches(2);

    let start = tokio::time::Instant::now();
    scope.finalize().await.unwrap();

    assert_eq!(store.patches().len(), 3);
    assert!(start.elapsed() >= Duration::from_millis(60));
    assert!(store.machine(&key("m1")).get_condition(READY).is_some());
}

#[tokio::test(start_paused = true)]
async fn finalize_refetches_after_concurrent_write() {
    let store = seeded();
    let mut scope = scope(&store, "m1", None);
    store.interleave_writes(1);

    scope.finalize().await.unwrap();

    let patches = store.patches();
    assert_eq!(patches.len(), 2);
    assert_ne!(
        patches[0].body["metadata"]["resourceVersion"],
        patches[1].body["metadata"]["resourceVersion"]
    );
    assert!(store.machine(&key("m1")).get_condition(READY).is_some());
}

#[tokio::test(start_paused = true)]
async fn finalize_reports_exhaustion() {
    let store = seeded();
    let mut scope = scope(&store, "m1", None);
    store.fail_next_patches(usize::MAX);

    let err = scope.finalize().await.unwrap_err();
    assert!(matches!(
        err,
        ScopeError::RetryExhausted { attempts: 4, .. }
    ));
    assert!(err.is_conflict());
    assert_eq!(store.patches().len(), 4);
    assert!(store.machine(&key("m1")).get_condition(READY).is_none());
}

#[tokio::test]
async fn unowned_condition_committed_twice_in_one_scope() {
    let store = seeded();
    let mut scope = scope(&store, "m1", None);

    scope.stratus_machine_mut().mark_true("ServerReachable");
    scope.patch_object().await.unwrap();

    scope.stratus_machine_mut().mark_false(
        "ServerReachable",
        "Timeout",
        ConditionSeverity::Warning,
        "no response from server",
    );
    scope.finalize().await.unwrap();

    let stored = store.machine(&key("m1"));
    let reachable = stored.get_condition("ServerReachable").unwrap();
    assert_eq!(reachable.status, ConditionStatus::False);
    assert_eq!(reachable.reason.as_deref(), Some("Timeout"));
}

#[tokio::test(start_paused = true)]
async fn commit_outlives_a_dropped_caller() {
    let store = seeded();
    let mut scope = scope(&store, "m1", None);
    store.delay_patches(Duration::from_millis(500));

    scope.set_provider_id("abc");
    let abandoned = tokio::time::timeout(Duration::from_millis(10), scope.patch_object()).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_secs(3)).await;

    let stored = store.machine(&key("m1"));
    assert_eq!(stored.spec.provider_id.as_deref(), Some("stratus://abc"));
    assert!(stored.get_condition(READY).is_some());
}
