//! Concurrent stage evaluation and result merging.
//!
//! Every configured stage runs as its own task. Each task evaluates without
//! holding any lock, then folds its result into a shared [`Aggregate`] under
//! a short mutex. The orchestrator joins all tasks before returning; a stage
//! that panics contributes nothing but does not abort the others.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use rulegate_api::RuleEvaluator;
use rulegate_core::{Detail, RejectInfo, RuleSet, RuleState, StageResult};
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Merged outcome of all stages for one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedResult {
    /// Earliest retry delay any stage asked for.
    pub interval: Option<Duration>,
    pub retry: bool,
    pub rule_states: Vec<RuleState>,
    /// Keyed (and therefore ordered) by target name.
    pub details: BTreeMap<String, Detail>,
}

/// Accumulator shared by the stage tasks.
#[derive(Debug, Default)]
pub struct Aggregate {
    interval: Option<Duration>,
    retry: bool,
    rule_states: Vec<RuleState>,
    // pipeline index of the stage that last named each detail
    details: BTreeMap<String, (usize, Detail)>,
}

impl Aggregate {
    /// Fold one stage's result in. `order` is the stage's position in the pipeline.
    pub fn merge(&mut self, order: usize, stage: &str, res: StageResult) {
        if let Some(iv) = res.interval {
            self.interval = Some(self.interval.map_or(iv, |cur| cur.min(iv)));
        }
        self.retry |= res.retry;
        self.rule_states.extend(res.rule_states);

        let StageResult { pass_rules, mut rejected, .. } = res;
        let mut touch = |target: String, passed: Vec<String>, reject: Option<RejectInfo>| {
            let (at, detail) = self.details.entry(target.clone()).or_insert_with(|| (order, Detail::new(target, stage)));
            if order >= *at {
                *at = order;
                detail.stage = stage.to_string();
            }
            detail.push_passed(passed);
            if let Some(r) = reject {
                detail.push_reject(r);
            }
        };
        for (target, rules) in pass_rules {
            let reject = rejected.remove(&target);
            touch(target, rules.into_iter().collect(), reject);
        }
        for (target, reject) in rejected {
            touch(target, Vec::new(), Some(reject));
        }
    }

    /// Canonical form: rule lists sorted so completion order never shows.
    pub fn finish(self) -> MergedResult {
        let mut rule_states = self.rule_states;
        rule_states.sort();
        let details = self
            .details
            .into_iter()
            .map(|(name, (_, mut d))| {
                d.passed_rules.sort();
                d.passed_rules.dedup();
                d.reject_info.sort();
                d.passed = d.reject_info.is_empty();
                (name, d)
            })
            .collect();
        MergedResult { interval: self.interval, retry: self.retry, rule_states, details }
    }
}

/// Evaluate every stage against `targets` concurrently and merge the results.
pub async fn run_stages(
    evaluator: Arc<dyn RuleEvaluator>,
    stages: &[String],
    rule_set: Arc<RuleSet>,
    targets: Arc<Vec<Pod>>,
) -> MergedResult {
    let agg = Arc::new(Mutex::new(Aggregate::default()));
    let mut tasks = JoinSet::new();
    for (order, stage) in stages.iter().enumerate() {
        let evaluator = Arc::clone(&evaluator);
        let rule_set = Arc::clone(&rule_set);
        let targets = Arc::clone(&targets);
        let agg = Arc::clone(&agg);
        let stage = stage.clone();
        tasks.spawn(async move {
            let res = evaluator.evaluate(&stage, &rule_set, &targets).await;
            debug!(stage = %stage, passed = res.pass_rules.len(), rejected = res.rejected.len(), "stage evaluated");
            agg.lock().unwrap_or_else(|p| p.into_inner()).merge(order, &stage, res);
        });
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "stage task failed");
        }
    }
    let agg = match Arc::try_unwrap(agg) {
        Ok(m) => m.into_inner().unwrap_or_else(|p| p.into_inner()),
        Err(shared) => std::mem::take(&mut *shared.lock().unwrap_or_else(|p| p.into_inner())),
    };
    agg.finish()
}
