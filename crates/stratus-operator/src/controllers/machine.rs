//! StratusMachine controller

use super::Context;
use crate::conditions::{reasons, ConditionSeverity, Conditions, MACHINE_PROVISIONED};
use crate::config::OperatorConfig;
use crate::crds::capi::{Machine, CLUSTER_NAME_LABEL};
use crate::crds::StratusMachine;
use crate::scope::{ClusterScope, MachineScope, ScopeError};
use crate::store::ObjectKey;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Client, ResourceExt,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

const CAPI_GROUP: &str = "cluster.x-k8s.io";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("StratusMachine {0} has no namespace")]
    MissingNamespace(String),
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),
    #[error(transparent)]
    Scope(#[from] ScopeError),
}

pub struct StratusMachineController;

impl StratusMachineController {
    pub async fn run(client: Client, ctx: Arc<Context>) {
        let api: Api<StratusMachine> = Api::all(client);

        Controller::new(api, Config::default())
            .run(reconcile, error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => info!(name = %obj.name, "Reconciled StratusMachine"),
                    Err(e) => error!(error = %e, "Reconcile error"),
                }
            })
            .await;
    }
}

#[instrument(skip(ctx), fields(name = %stratus_machine.name_any()))]
async fn reconcile(
    stratus_machine: Arc<StratusMachine>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = stratus_machine.name_any();
    let ns = stratus_machine
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;

    let Some(owner) = owner_machine_ref(&stratus_machine) else {
        info!(name = %name, "Waiting for the Machine controller to set an owner reference");
        return Ok(Action::await_change());
    };

    let machines: Api<Machine> = Api::namespaced(ctx.client.clone(), &ns);
    let Some(machine) = machines
        .get_opt(&owner.name)
        .await
        .map_err(ReconcileError::Kube)?
    else {
        info!(name = %name, machine = %owner.name, "Owning Machine not found");
        return Ok(Action::await_change());
    };

    let Some(cluster_name) = cluster_name(&machine) else {
        info!(name = %name, machine = %owner.name, "Machine is missing the cluster label");
        return Ok(Action::await_change());
    };

    let cluster = ClusterScope::new(ctx.store.clone(), ns, cluster_name)?;
    let mut scope = MachineScope::builder()
        .store(ctx.store.clone())
        .machine(machine)
        .stratus_machine(stratus_machine.as_ref().clone())
        .cluster(Arc::new(cluster))
        .retry_policy(ctx.config.finalize_retry.clone())
        .commit_timeout(ctx.config.commit_timeout)
        .build()?;

    let result = reconcile_scope(&mut scope, &ctx.config).await;
    let finalized = scope.finalize().await;
    settle(scope.key(), result, finalized)
}

/// Outcome of a pass. The pass error wins; a finalize error is still logged.
fn settle(
    key: &ObjectKey,
    result: Result<Action, ReconcileError>,
    finalized: Result<(), ScopeError>,
) -> Result<Action, ReconcileError> {
    match (result, finalized) {
        (Ok(action), Ok(())) => Ok(action),
        (Ok(_), Err(err)) => Err(err.into()),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(finalize_err)) => {
            error!(machine = %key, error = %finalize_err, "Failed to persist StratusMachine");
            Err(err)
        }
    }
}

/// One pass over an established scope. Changes are persisted by the caller.
async fn reconcile_scope(
    scope: &mut MachineScope,
    config: &OperatorConfig,
) -> Result<Action, ReconcileError> {
    if scope.has_failed() {
        info!(machine = %scope.key(), "Machine has failed, skipping reconciliation");
        return Ok(Action::await_change());
    }

    match scope.bootstrap_data_secret().await {
        Ok(_) => {
            debug!(machine = %scope.key(), "Bootstrap data available");
            Ok(Action::requeue(config.resync_interval))
        }
        Err(err) if err.is_waiting() => {
            info!(machine = %scope.key(), "Waiting for bootstrap data");
            scope.stratus_machine_mut().mark_false(
                MACHINE_PROVISIONED,
                reasons::WAITING_FOR_BOOTSTRAP_DATA,
                ConditionSeverity::Info,
                "",
            );
            Ok(Action::requeue(config.bootstrap_requeue))
        }
        Err(err) => Err(err.into()),
    }
}

/// Owner reference pointing at the Cluster API machine.
fn owner_machine_ref(stratus_machine: &StratusMachine) -> Option<&OwnerReference> {
    stratus_machine.owner_references().iter().find(|owner| {
        owner.kind == "Machine"
            && owner
                .api_version
                .split('/')
                .next()
                .is_some_and(|group| group == CAPI_GROUP)
    })
}

fn cluster_name(machine: &Machine) -> Option<String> {
    machine
        .labels()
        .get(CLUSTER_NAME_LABEL)
        .filter(|name| !name.is_empty())
        .cloned()
        .or_else(|| Some(machine.spec.cluster_name.clone()).filter(|name| !name.is_empty()))
}

fn error_policy(
    _stratus_machine: Arc<StratusMachine>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    error!(error = %error, "Reconcile failed");
    Action::requeue(ctx.config.error_requeue)
}
