//! RuleGate core types: the RuleSet resource, its status model and the
//! per-stage evaluation result exchanged with rule evaluators.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

pub mod ownership;
pub mod selector;

/// Finalizer held on a RuleSet until its targets have been released.
pub const CLEANUP_FINALIZER: &str = "ruleset.rulegate.io/need-clean-up";

/// Label that lets a terminating RuleSet skip the running-target check.
pub const TERMINATING_LABEL: &str = "ruleset.rulegate.io/terminating";

/// Annotation on a target listing the RuleSets that claim it (JSON array of names).
pub const OWNERSHIP_ANNOTATION: &str = "ruleset.rulegate.io/rulesets";

/// Declares which pods are selected and which rules run against them.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "apps.rulegate.io",
    version = "v1alpha1",
    kind = "RuleSet",
    namespaced,
    status = "RuleSetStatus",
    shortname = "rset",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetSpec {
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    pub name: String,
    pub stage: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetStatus {
    /// Names of the currently selected targets, sorted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    #[serde(default)]
    pub observed_generation: i64,
    /// Per-target outcome, sorted by target name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<Detail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_states: Vec<RuleState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<Time>,
}

impl RuleSetStatus {
    /// Field-wise comparison that ignores `update_time`.
    pub fn same_content(&self, other: &RuleSetStatus) -> bool {
        self.targets == other.targets
            && self.details == other.details
            && self.rule_states == other.rule_states
            && self.observed_generation == other.observed_generation
    }
}

/// Outcome of the most recent pass for one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detail {
    pub name: String,
    pub stage: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passed_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reject_info: Vec<RejectInfo>,
}

impl Detail {
    pub fn new(name: impl Into<String>, stage: impl Into<String>) -> Self {
        Self { name: name.into(), stage: stage.into(), passed: true, ..Default::default() }
    }

    pub fn push_passed<I: IntoIterator<Item = String>>(&mut self, rules: I) {
        self.passed_rules.extend(rules);
    }

    pub fn push_reject(&mut self, reject: RejectInfo) {
        self.reject_info.push(reject);
        self.passed = self.reject_info.is_empty();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectInfo {
    pub rule_name: String,
    pub reason: String,
}

/// Aggregate state of one rule, as reported by its stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleState {
    pub stage: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// What one stage evaluation reports back. Consumed once per pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageResult {
    /// Advisory delay before the next evaluation.
    pub interval: Option<Duration>,
    pub rule_states: Vec<RuleState>,
    pub retry: bool,
    /// target name -> rules it passed in this stage
    pub pass_rules: BTreeMap<String, BTreeSet<String>>,
    /// target name -> the rule that rejected it
    pub rejected: BTreeMap<String, RejectInfo>,
}

/// Namespace/name identity of a namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        Self { namespace: obj.namespace().unwrap_or_default(), name: obj.name_any() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl RuleSet {
    pub fn key(&self) -> ObjectKey { ObjectKey::of(self) }

    pub fn is_terminating(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    pub fn force_terminate(&self) -> bool { self.labels().contains_key(TERMINATING_LABEL) }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Stored status, or an empty one before the first write.
    pub fn current_status(&self) -> RuleSetStatus { self.status.clone().unwrap_or_default() }
}

pub mod prelude {
    pub use super::{
        Detail, ObjectKey, RejectInfo, RuleSet, RuleSetSpec, RuleSetStatus, RuleSpec, RuleState, StageResult,
        CLEANUP_FINALIZER, OWNERSHIP_ANNOTATION, TERMINATING_LABEL,
    };
}
