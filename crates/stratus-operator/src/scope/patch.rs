//! Patch helper
//!
//! Snapshots a StratusMachine when a scope is created and later persists
//! whatever changed since, as JSON merge patches against the main resource
//! and the status subresource.
//!
//! Conditions are not diffed as a list. Each condition type that changed
//! locally is applied on top of the latest stored object, and the status
//! patch pins that object's `resourceVersion` so a concurrent writer makes
//! the commit fail with a conflict instead of being overwritten.

use super::error::ScopeError;
use crate::conditions::{sort_conditions, Condition, Conditions};
use crate::crds::StratusMachine;
use crate::store::{MachinePatch, ObjectKey, ResourceStore};
use kube::ResourceExt;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Deadline for a single commit, independent of the calling reconciliation.
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PatchOptions {
    /// Condition types whose local value wins over concurrent remote changes.
    pub owned_conditions: Vec<String>,
    /// Deadline for one commit attempt.
    pub timeout: Duration,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            owned_conditions: Vec::new(),
            timeout: COMMIT_TIMEOUT,
        }
    }
}

impl PatchOptions {
    pub fn with_owned_conditions(mut self, conditions: &[&str]) -> Self {
        self.owned_conditions = conditions.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A condition type whose value differs between snapshot and current object.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionChange {
    pub type_: String,
    pub before: Option<Condition>,
    pub after: Option<Condition>,
}

/// Everything that differs between the snapshot and the current object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    /// Merge patch for metadata and spec.
    pub main: Option<Value>,
    /// Merge patch for status fields other than conditions.
    pub status: Option<Value>,
    pub conditions: Vec<ConditionChange>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.main.is_none() && self.status.is_none() && self.conditions.is_empty()
    }

    async fn apply(
        self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
        owned: &[String],
    ) -> Result<(), ScopeError> {
        if let Some(main) = self.main {
            debug!(machine = %key, "Patching machine");
            store.patch_machine(key, &MachinePatch::main(main)).await?;
        }

        if self.status.is_none() && self.conditions.is_empty() {
            return Ok(());
        }

        let mut status = self.status.unwrap_or_else(|| json!({}));
        let mut body = json!({});

        if !self.conditions.is_empty() {
            let latest = store.get_machine(key).await?;
            let merged = merge_conditions(latest.conditions(), &self.conditions, owned).map_err(
                |condition| ScopeError::ConditionConflict {
                    key: key.clone(),
                    condition,
                },
            )?;
            status["conditions"] = serde_json::to_value(merged).map_err(|source| {
                ScopeError::Serialize {
                    key: key.clone(),
                    source,
                }
            })?;
            if let Some(version) = latest.resource_version() {
                body["metadata"] = json!({ "resourceVersion": version });
            }
        }

        body["status"] = status;
        debug!(machine = %key, "Patching machine status");
        store.patch_machine(key, &MachinePatch::status(body)).await?;
        Ok(())
    }
}

/// Captures an object at scope creation and persists later changes to it.
#[derive(Debug, Clone)]
pub struct PatchHelper {
    key: ObjectKey,
    before: StratusMachine,
}

impl PatchHelper {
    pub fn new(obj: &StratusMachine) -> Result<Self, ScopeError> {
        let key = ObjectKey::of(obj)
            .ok_or_else(|| ScopeError::invalid("StratusMachine lacks a name or namespace"))?;
        Ok(Self {
            key,
            before: obj.clone(),
        })
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Compute the difference between the snapshot and `after`.
    pub fn changes(&self, after: &StratusMachine) -> Result<Changes, ScopeError> {
        let serialize = |obj: &StratusMachine| {
            serde_json::to_value(obj).map_err(|source| ScopeError::Serialize {
                key: self.key.clone(),
                source,
            })
        };
        let status_fields = |obj: &StratusMachine| {
            let mut value = serde_json::to_value(obj.status.clone().unwrap_or_default())
                .map_err(|source| ScopeError::Serialize {
                    key: self.key.clone(),
                    source,
                })?;
            if let Some(fields) = value.as_object_mut() {
                fields.remove("conditions");
            }
            Ok::<_, ScopeError>(value)
        };

        let mut before = serialize(&self.before)?;
        let mut current = serialize(after)?;
        for value in [&mut before, &mut current] {
            if let Some(fields) = value.as_object_mut() {
                fields.remove("status");
            }
        }

        Ok(Changes {
            main: merge_diff(&before, &current),
            status: merge_diff(&status_fields(&self.before)?, &status_fields(after)?),
            conditions: condition_changes(self.before.conditions(), after.conditions()),
        })
    }

    /// Persist all changes made to `obj` since the snapshot.
    ///
    /// The store calls run on a separate task bounded by `options.timeout`.
    /// Dropping the returned future does not cancel a commit in flight.
    /// On success the snapshot moves forward to `obj`.
    pub async fn patch(
        &mut self,
        store: Arc<dyn ResourceStore>,
        obj: &StratusMachine,
        options: &PatchOptions,
    ) -> Result<(), ScopeError> {
        let changes = self.changes(obj)?;
        if changes.is_empty() {
            debug!(machine = %self.key, "Nothing to patch");
            return Ok(());
        }

        let key = self.key.clone();
        let owned = options.owned_conditions.clone();
        let timeout = options.timeout;
        let task = tokio::spawn(async move {
            tokio::time::timeout(timeout, changes.apply(store.as_ref(), &key, &owned)).await
        });

        match task.await {
            Ok(Ok(Ok(()))) => {
                self.before = obj.clone();
                Ok(())
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_elapsed)) => Err(ScopeError::CommitTimeout {
                key: self.key.clone(),
                timeout,
            }),
            Err(source) => Err(ScopeError::CommitAborted {
                key: self.key.clone(),
                source,
            }),
        }
    }
}

/// JSON merge patch (RFC 7386) turning `before` into `after`.
/// `None` when both are equal.
pub fn merge_diff(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(before), Value::Object(after)) => {
            let mut patch = Map::new();
            for (field, value) in after {
                match before.get(field) {
                    Some(old) => {
                        if let Some(diff) = merge_diff(old, value) {
                            patch.insert(field.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(field.clone(), value.clone());
                    }
                }
            }
            for field in before.keys() {
                if !after.contains_key(field) {
                    patch.insert(field.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        (before, after) if before == after => None,
        (_, after) => Some(after.clone()),
    }
}

fn condition_changes(before: &[Condition], after: &[Condition]) -> Vec<ConditionChange> {
    let find = |list: &[Condition], type_: &str| list.iter().find(|c| c.type_ == type_).cloned();
    let types: BTreeSet<&str> = before
        .iter()
        .chain(after.iter())
        .map(|c| c.type_.as_str())
        .collect();

    types
        .into_iter()
        .filter_map(|type_| {
            let old = find(before, type_);
            let new = find(after, type_);
            (old != new).then(|| ConditionChange {
                type_: type_.to_string(),
                before: old,
                after: new,
            })
        })
        .collect()
}

fn same_state(a: &Option<Condition>, b: &Option<Condition>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_state(b),
        (None, None) => true,
        _ => false,
    }
}

/// Apply local condition changes on top of `latest`.
///
/// Fails with the condition type when a non-owned condition was changed
/// remotely to something other than the local value.
fn merge_conditions(
    latest: &[Condition],
    changes: &[ConditionChange],
    owned: &[String],
) -> Result<Vec<Condition>, String> {
    let mut merged = latest.to_vec();
    for change in changes {
        let remote = merged.iter().find(|c| c.type_ == change.type_).cloned();
        let remote_changed =
            !same_state(&remote, &change.before) && !same_state(&remote, &change.after);
        if remote_changed && !owned.contains(&change.type_) {
            return Err(change.type_.clone());
        }
        merged.retain(|c| c.type_ != change.type_);
        if let Some(after) = &change.after {
            merged.push(after.clone());
        }
    }
    sort_conditions(&mut merged);
    Ok(merged)
}
