//! Status conditions
//!
//! Cluster API style conditions: a named status flag with severity, reason
//! and message. Conditions are kept sorted with `Ready` first so that the
//! serialized list is stable across reconciliations.

use chrono::{SubsecRound, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use strum::Display;
use tracing::debug;

/// Summary condition derived from the other conditions before every commit.
pub const READY: &str = "Ready";

/// Whether the machine's server has been provisioned.
pub const MACHINE_PROVISIONED: &str = "MachineProvisioned";

/// Conditions feeding the `Ready` summary.
pub const SUMMARY_SOURCES: &[&str] = &[MACHINE_PROVISIONED];

/// Conditions this provider owns. On a conflicting commit, the local value
/// of an owned condition wins over a concurrent remote change.
pub const OWNED_CONDITIONS: &[&str] = &[READY, MACHINE_PROVISIONED];

pub mod reasons {
    /// The owning `Machine` has no bootstrap data secret yet.
    pub const WAITING_FOR_BOOTSTRAP_DATA: &str = "WaitingForBootstrapData";
    /// None of the summary sources has been reported yet.
    pub const WAITING_FOR_PROVISIONING: &str = "WaitingForProvisioning";
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Display,
)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// How bad a non-true condition is. Only meaningful when status is not `True`.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Display,
)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    #[schemars(with = "Option<String>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn true_(type_: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::True,
            severity: None,
            last_transition_time: None,
            reason: None,
            message: None,
        }
    }

    pub fn false_(
        type_: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::False,
            severity: Some(severity),
            last_transition_time: None,
            reason: Some(reason.to_string()),
            message: (!message.is_empty()).then_some(message),
        }
    }

    /// Same state, ignoring the transition timestamp.
    pub(crate) fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }

    /// Lower is worse. Used to pick the condition a summary reports.
    fn merge_priority(&self) -> u8 {
        match (self.status, self.severity) {
            (ConditionStatus::False, Some(ConditionSeverity::Error)) => 0,
            (ConditionStatus::False, Some(ConditionSeverity::Warning)) => 1,
            (ConditionStatus::False, _) => 2,
            (ConditionStatus::Unknown, _) => 3,
            (ConditionStatus::True, _) => 4,
        }
    }
}

/// Ready first, then alphabetical.
fn condition_order(a: &Condition, b: &Condition) -> Ordering {
    match (a.type_ == READY, b.type_ == READY) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.type_.cmp(&b.type_),
    }
}

/// Current time at the precision the API server stores, whole seconds.
fn transition_time() -> Time {
    Time(Utc::now().trunc_subsecs(0))
}

/// Sort conditions into their canonical order.
pub fn sort_conditions(conditions: &mut [Condition]) {
    conditions.sort_by(condition_order);
}

/// Objects carrying a condition list.
pub trait Conditions {
    fn conditions(&self) -> &[Condition];

    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions().iter().find(|c| c.type_ == type_)
    }

    fn is_condition_true(&self, type_: &str) -> bool {
        self.get_condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Add or replace a condition. The transition time is kept when the
    /// state did not change, and stamped with the current time otherwise.
    fn set_condition(&mut self, mut condition: Condition) {
        let conditions = self.conditions_mut();
        match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) if existing.same_state(&condition) => {}
            Some(existing) => {
                debug!(
                    condition = %condition.type_,
                    from = %existing.status,
                    to = %condition.status,
                    "Condition transitioned"
                );
                condition.last_transition_time.get_or_insert_with(transition_time);
                *existing = condition;
            }
            None => {
                debug!(condition = %condition.type_, to = %condition.status, "Condition added");
                condition.last_transition_time.get_or_insert_with(transition_time);
                conditions.push(condition);
                sort_conditions(conditions);
            }
        }
    }

    fn mark_true(&mut self, type_: &str) {
        self.set_condition(Condition::true_(type_));
    }

    fn mark_false(
        &mut self,
        type_: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) {
        self.set_condition(Condition::false_(type_, reason, severity, message));
    }

    /// Recompute `Ready` from `sources`.
    fn set_summary(&mut self, sources: &[&str]) {
        let summary = summarize(self.conditions(), sources);
        self.set_condition(summary);
    }
}

/// Ready is true when every source is present and true. Otherwise it mirrors
/// the status, severity, reason and message of the worst source.
pub fn summarize(conditions: &[Condition], sources: &[&str]) -> Condition {
    let in_scope: Vec<&Condition> = sources
        .iter()
        .filter_map(|source| conditions.iter().find(|c| c.type_ == *source))
        .collect();

    let complete = in_scope.len() == sources.len();
    if in_scope.is_empty() {
        return Condition::false_(
            READY,
            reasons::WAITING_FOR_PROVISIONING,
            ConditionSeverity::Info,
            "",
        );
    }

    match in_scope
        .into_iter()
        .filter(|c| c.status != ConditionStatus::True)
        .min_by_key(|c| c.merge_priority())
    {
        None if complete => Condition::true_(READY),
        None => Condition::false_(
            READY,
            reasons::WAITING_FOR_PROVISIONING,
            ConditionSeverity::Info,
            "",
        ),
        Some(worst) => Condition {
            type_: READY.to_string(),
            status: worst.status,
            severity: worst.severity,
            last_transition_time: None,
            reason: worst.reason.clone(),
            message: worst.message.clone(),
        },
    }
}
