//! RuleGate collaborator seams.
//!
//! The reconcile core only talks to the outside world through the traits
//! defined here: object storage, the stale-view expectation guard, the stage
//! provider and rule evaluator, notification sinks and the event recorder.
//! Kubernetes-backed implementations live in `rulegate-kubehub`; the
//! in-memory guard and queue live in `rulegate-store`.

#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};

use rulegate_core::{ObjectKey, RuleSet, StageResult};

/// Store errors, classified the way the reconcile core reacts to them.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreError {
    /// Object vanished; always benign for the core.
    #[error("not_found: {0}")]
    NotFound(String),
    /// Concurrent modification; retried under the optimistic loop.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Anything else; surfaced to the caller for requeue.
    #[error("transient: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read/write access to RuleSets and their targets.
///
/// Writes return the object as persisted (with its new resource version).
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_rule_set(&self, key: &ObjectKey) -> StoreResult<RuleSet>;
    async fn update_rule_set(&self, rs: &RuleSet) -> StoreResult<RuleSet>;
    async fn update_rule_set_status(&self, rs: &RuleSet) -> StoreResult<RuleSet>;

    async fn list_targets(&self, namespace: &str, selector: &LabelSelector) -> StoreResult<Vec<Pod>>;
    async fn get_target(&self, key: &ObjectKey) -> StoreResult<Pod>;
    async fn update_target(&self, pod: &Pod) -> StoreResult<Pod>;
}

/// Gate that keeps a pass from acting on a view older than its own last write.
pub trait ExpectationGuard: Send + Sync {
    /// False while a write issued from an earlier version has not been observed yet.
    fn satisfied(&self, key: &ObjectKey, observed_version: &str) -> bool;
    /// Record that a write was just issued from `base_version`.
    fn expect_update(&self, key: &ObjectKey, base_version: &str);
    /// Forget a pending expectation (the write failed).
    fn delete(&self, key: &ObjectKey);
}

/// Ordered list of stage names configured for this process.
pub trait StageProvider: Send + Sync {
    fn stages(&self) -> Vec<String>;
}

/// Evaluates one stage of rules against the selected targets.
///
/// Failures inside a stage are encoded in the returned result; there is no error channel.
#[async_trait::async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn evaluate(&self, stage: &str, rule_set: &RuleSet, targets: &[Pod]) -> StageResult;
}

/// Downstream consumer of changed target keys. Must not block.
pub trait NotificationSink: Send + Sync {
    fn is_shutting_down(&self) -> bool;
    fn add(&self, key: ObjectKey);
}

/// Best-effort Kubernetes Event emission for a RuleSet.
#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    async fn warning(&self, rule_set: &RuleSet, reason: &str, note: &str);
}

/// Recorder that drops everything.
pub struct NoopRecorder;

#[async_trait::async_trait]
impl EventRecorder for NoopRecorder {
    async fn warning(&self, _rule_set: &RuleSet, _reason: &str, _note: &str) {}
}

/// Stage list fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticStages(pub Vec<String>);

impl StaticStages {
    /// Parse a comma separated list, dropping blanks.
    pub fn parse(s: &str) -> Self {
        Self(s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
    }
}

impl StageProvider for StaticStages {
    fn stages(&self) -> Vec<String> { self.0.clone() }
}

/// Placeholder evaluator: every rule declared for the stage passes for every target.
pub struct DeclaredRuleEvaluator;

#[async_trait::async_trait]
impl RuleEvaluator for DeclaredRuleEvaluator {
    async fn evaluate(&self, stage: &str, rule_set: &RuleSet, targets: &[Pod]) -> StageResult {
        let rules: Vec<&str> = rule_set.spec.rules.iter().filter(|r| r.stage == stage).map(|r| r.name.as_str()).collect();
        let mut res = StageResult::default();
        if rules.is_empty() {
            return res;
        }
        for pod in targets {
            let name = pod.metadata.name.clone().unwrap_or_default();
            res.pass_rules.insert(name, rules.iter().map(|r| r.to_string()).collect());
        }
        res.rule_states = rules
            .iter()
            .map(|r| rulegate_core::RuleState { stage: stage.to_string(), name: r.to_string(), message: None })
            .collect();
        res
    }
}
