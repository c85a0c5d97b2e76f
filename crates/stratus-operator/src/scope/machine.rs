//! Machine scope
//!
//! Per-reconciliation context for one StratusMachine and its Cluster API
//! machine. Reconciliation logic reads and mutates the records through the
//! scope and persists everything at the end of the pass with
//! [`MachineScope::finalize`].

use super::cluster::MachineLister;
use super::error::ScopeError;
use super::patch::{PatchHelper, PatchOptions, COMMIT_TIMEOUT};
use super::retry::{RetryError, RetryPolicy};
use crate::conditions::{Conditions, OWNED_CONDITIONS, SUMMARY_SOURCES};
use crate::crds::capi::Machine;
use crate::crds::{machine::provider_id, StratusMachine};
use crate::store::{Labels, ObjectKey, ResourceStore};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Builder for [`MachineScope`]. Every input is checked by [`build`](Self::build).
#[derive(Default)]
pub struct MachineScopeBuilder {
    store: Option<Arc<dyn ResourceStore>>,
    machine: Option<Machine>,
    stratus_machine: Option<StratusMachine>,
    cluster: Option<Arc<dyn MachineLister>>,
    retry: Option<RetryPolicy>,
    commit_timeout: Option<Duration>,
}

impl MachineScopeBuilder {
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The Cluster API machine owning the StratusMachine.
    pub fn machine(mut self, machine: Machine) -> Self {
        self.machine = Some(machine);
        self
    }

    pub fn stratus_machine(mut self, stratus_machine: StratusMachine) -> Self {
        self.stratus_machine = Some(stratus_machine);
        self
    }

    pub fn cluster(mut self, cluster: Arc<dyn MachineLister>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Retry schedule used by [`MachineScope::finalize`].
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Deadline of a single commit. Defaults to [`COMMIT_TIMEOUT`].
    pub fn commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<MachineScope, ScopeError> {
        let store = self
            .store
            .ok_or_else(|| ScopeError::invalid("machine scope params lack a client"))?;
        let machine = self
            .machine
            .ok_or_else(|| ScopeError::invalid("machine scope params lack a Cluster API machine"))?;
        let stratus_machine = self
            .stratus_machine
            .ok_or_else(|| ScopeError::invalid("machine scope params lack a StratusMachine"))?;
        let cluster = self
            .cluster
            .ok_or_else(|| ScopeError::invalid("machine scope params need a cluster scope"))?;

        let patch_helper = PatchHelper::new(&stratus_machine)?;
        if patch_helper.key().namespace != cluster.namespace() {
            return Err(ScopeError::invalid(format!(
                "StratusMachine {} is outside the cluster namespace {}",
                patch_helper.key(),
                cluster.namespace()
            )));
        }

        let patch_options = PatchOptions::default()
            .with_owned_conditions(OWNED_CONDITIONS)
            .with_timeout(self.commit_timeout.unwrap_or(COMMIT_TIMEOUT));

        Ok(MachineScope {
            store,
            cluster,
            patch_helper,
            patch_options,
            retry: self.retry.unwrap_or_default(),
            machine,
            stratus_machine,
        })
    }
}

/// Reconciliation context of a single StratusMachine.
///
/// A scope is created for one reconciliation pass and used by that pass
/// only. Mutations stay in memory until [`patch_object`](Self::patch_object)
/// or [`finalize`](Self::finalize) persists them.
pub struct MachineScope {
    store: Arc<dyn ResourceStore>,
    cluster: Arc<dyn MachineLister>,
    patch_helper: PatchHelper,
    patch_options: PatchOptions,
    retry: RetryPolicy,
    machine: Machine,
    stratus_machine: StratusMachine,
}

impl MachineScope {
    pub fn builder() -> MachineScopeBuilder {
        MachineScopeBuilder::default()
    }

    /// Namespace and name of the StratusMachine.
    pub fn key(&self) -> &ObjectKey {
        self.patch_helper.key()
    }

    /// The Cluster API machine.
    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn stratus_machine(&self) -> &StratusMachine {
        &self.stratus_machine
    }

    pub fn stratus_machine_mut(&mut self) -> &mut StratusMachine {
        &mut self.stratus_machine
    }

    /// Secret with the bootstrap data generated by the bootstrap provider.
    ///
    /// Returns [`ScopeError::NoBootstrapData`] until the owning machine
    /// references a secret. Store errors are returned unchanged.
    pub async fn bootstrap_data_secret(&self) -> Result<Secret, ScopeError> {
        let name = self.machine.bootstrap_data_secret_name().ok_or_else(|| {
            ScopeError::NoBootstrapData {
                machine: self.key().clone(),
            }
        })?;
        let key = ObjectKey::new(self.key().namespace.clone(), name);

        debug!(machine = %self.key(), secret = %key, "Searching for bootstrap data");
        Ok(self.store.get_secret(&key).await?)
    }

    pub fn datacenter_id(&self) -> &str {
        &self.stratus_machine.spec.datacenter_id
    }

    /// Record the server identifier as `stratus://<id>`.
    pub fn set_provider_id(&mut self, id: &str) {
        self.stratus_machine.spec.provider_id = Some(provider_id(id));
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.stratus_machine.spec.provider_id.as_deref()
    }

    /// StratusMachines in the same namespace and cluster, further filtered by `labels`.
    pub async fn list_machines(&self, labels: &Labels) -> Result<Vec<StratusMachine>, ScopeError> {
        Ok(self.cluster.list_machines(labels).await?)
    }

    pub async fn count_machines(&self, labels: &Labels) -> Result<usize, ScopeError> {
        Ok(self.list_machines(labels).await?.len())
    }

    /// The most recently created sibling matching `labels`.
    ///
    /// This machine itself is never returned. `None` when no other machine
    /// matches.
    pub async fn find_latest_machine(
        &self,
        labels: &Labels,
    ) -> Result<Option<StratusMachine>, ScopeError> {
        let machines = self.list_machines(labels).await?;
        Ok(latest_sibling(machines, self.key()))
    }

    /// Whether a terminal failure was recorded on the StratusMachine.
    pub fn has_failed(&self) -> bool {
        self.stratus_machine
            .status
            .as_ref()
            .is_some_and(|status| status.has_failed())
    }

    /// Persist the in-memory StratusMachine, status included.
    ///
    /// The `Ready` summary is recomputed first. The commit runs with its own
    /// deadline and is not cancelled when the caller gives up waiting on it.
    /// Conflicts are returned as-is.
    pub async fn patch_object(&mut self) -> Result<(), ScopeError> {
        self.stratus_machine.set_summary(SUMMARY_SOURCES);
        self.patch_helper
            .patch(
                self.store.clone(),
                &self.stratus_machine,
                &self.patch_options,
            )
            .await
    }

    /// [`patch_object`](Self::patch_object) retried on any error with the
    /// scope's backoff. Reconciliation logic still has to cope with
    /// outdated objects; retrying only lowers the failure rate.
    pub async fn finalize(&mut self) -> Result<(), ScopeError> {
        let policy = self.retry.clone();
        let result = policy
            .run(self, |scope| Box::pin(scope.patch_object()), |_| true)
            .await;

        result.map_err(|err| match err {
            RetryError::Exhausted { attempts, last } => ScopeError::RetryExhausted {
                key: self.key().clone(),
                attempts,
                last: Box::new(last),
            },
            RetryError::Permanent(err) => err,
        })
    }
}

fn created_at(machine: &StratusMachine) -> Option<DateTime<Utc>> {
    machine.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// Pick the newest machine other than `own`, scanning in list order.
///
/// A later element replaces the candidate when it was not created earlier,
/// so equal timestamps resolve to the element listed last.
fn latest_sibling(machines: Vec<StratusMachine>, own: &ObjectKey) -> Option<StratusMachine> {
    if machines.len() <= 1 {
        return None;
    }

    let mut machines = machines.into_iter();
    let mut latest = machines.next()?;
    for machine in machines {
        if created_at(&machine) >= created_at(&latest) && !own.matches(&machine) {
            latest = machine;
        }
    }

    (!own.matches(&latest)).then_some(latest)
}
